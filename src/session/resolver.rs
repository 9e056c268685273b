//! Session lifecycle on top of the state store: new, attach, use, ensure, list, clear,
//! and post-run target activity.
//!
//! Probes and process management never run inside a state mutation; the mutation may be
//! retried and must stay free of side effects.

use serde::Serialize;

use std::path::PathBuf;
use std::time::Duration;

use crate::{
    BrowserLauncher, CdpProbe, Config, LaunchRequest, Session, SessionKind, SessionPolicy,
    StateHandle, SurfError, SurfResult, SurfwrightState, Target, TargetTouch, is_sanitized_id,
    normalize_cdp_origin, parse_iso_ms, pick_free_port, terminate_process,
    wait_until_reachable, wall_time_iso_utc,
};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub headless: bool,
    pub default_lease_ttl_ms: u64,
    pub start_timeout: Duration,
    pub start_poll: Duration,
}

impl ResolverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            headless: config.headless,
            default_lease_ttl_ms: config.default_lease_ttl_ms,
            start_timeout: Duration::from_millis(config.browser_start_timeout_ms),
            start_poll: Duration::from_millis(100),
        }
    }
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewSessionRequest {
    pub session_id: Option<String>,
    pub policy: Option<SessionPolicy>,
    pub lease_ttl_ms: Option<u64>,
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AttachRequest {
    pub cdp_origin: String,
    pub session_id: Option<String>,
    pub policy: Option<SessionPolicy>,
    pub lease_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSession {
    pub session: Session,
    pub created: bool,
    /// The previously active session that could not be reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    pub active_session_id: Option<String>,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearReport {
    pub removed_sessions: Vec<String>,
    pub removed_targets: usize,
    pub terminated_pids: Vec<u32>,
    pub removed_profiles: Vec<String>,
}

pub struct SessionResolver<'a> {
    handle: &'a StateHandle,
    probe: &'a dyn CdpProbe,
    launcher: &'a dyn BrowserLauncher,
    settings: ResolverSettings,
}

impl<'a> SessionResolver<'a> {
    pub fn new(
        handle: &'a StateHandle,
        probe: &'a dyn CdpProbe,
        launcher: &'a dyn BrowserLauncher,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            handle,
            probe,
            launcher,
            settings,
        }
    }

    /// Launches a managed browser and makes it the active session.
    pub fn new_managed(&self, request: &NewSessionRequest) -> SurfResult<ResolvedSession> {
        if let Some(id) = &request.session_id {
            validate_session_id(id)?;
        }
        if let Some(profile) = &request.profile {
            validate_session_id(profile)?;
        }
        let profiles_dir = self.handle.profiles_dir();
        let requested = request.session_id.clone();
        let session_id = self.handle.update(|state| match &requested {
            Some(id) if state.sessions.contains_key(id) => Err(SurfError::SessionExists {
                session_id: id.clone(),
            }),
            Some(id) => Ok(id.clone()),
            None => Ok(state.allocate_session_id(&profiles_dir)),
        })?;

        let policy = request.policy.unwrap_or(SessionKind::Managed.default_policy());
        let user_data_dir = profiles_dir.join(request.profile.as_deref().unwrap_or(&session_id));
        let debug_port = pick_free_port()?;
        let cdp_origin = format!("http://127.0.0.1:{debug_port}");
        let launched = self.launcher.launch(&LaunchRequest {
            debug_port,
            user_data_dir: user_data_dir.clone(),
            headless: self.settings.headless,
        })?;
        if let Err(err) = wait_until_reachable(
            self.probe,
            &cdp_origin,
            self.settings.start_timeout,
            self.settings.start_poll,
        ) {
            terminate_process(launched.pid);
            return Err(err);
        }

        let now = wall_time_iso_utc();
        let session = Session {
            session_id: session_id.clone(),
            kind: SessionKind::Managed,
            cdp_origin,
            debug_port: Some(debug_port),
            user_data_dir: Some(user_data_dir.display().to_string()),
            browser_pid: Some(launched.pid),
            policy,
            lease_ttl_ms: self.lease_for(policy, request.lease_ttl_ms),
            profile: request.profile.clone(),
            created_at: now.clone(),
            last_seen_at: now,
            managed_unreachable_since: None,
            managed_unreachable_count: 0,
        };
        let committed = self.handle.update(|state| {
            if state.sessions.contains_key(&session.session_id) {
                return Err(SurfError::SessionExists {
                    session_id: session.session_id.clone(),
                });
            }
            state.sessions.insert(session.session_id.clone(), session.clone());
            state.active_session_id = Some(session.session_id.clone());
            Ok(())
        });
        if let Err(err) = committed {
            terminate_process(launched.pid);
            return Err(err);
        }
        tracing::info!(session = %session.session_id, pid = launched.pid, "created managed session");
        Ok(ResolvedSession {
            session,
            created: true,
            fallback_from: None,
        })
    }

    /// Probes first; an origin already attached under the requested (or no) id is reused.
    pub fn attach(&self, request: &AttachRequest) -> SurfResult<ResolvedSession> {
        let cdp_origin = normalize_cdp_origin(&request.cdp_origin)?;
        if let Some(id) = &request.session_id {
            validate_session_id(id)?;
        }
        if !self.probe.reachable(&cdp_origin) {
            return Err(SurfError::CdpUnreachable { cdp_origin });
        }
        let profiles_dir = self.handle.profiles_dir();
        let policy = request.policy.unwrap_or(SessionKind::Attached.default_policy());
        let lease_ttl_ms = self.lease_for(policy, request.lease_ttl_ms);
        let now = wall_time_iso_utc();

        let resolved = self.handle.update(|state| {
            let owner = state
                .sessions
                .values()
                .find(|s| s.cdp_origin == cdp_origin)
                .map(|s| s.session_id.clone());
            if let Some(owner) = owner {
                if request.session_id.as_ref().is_some_and(|id| *id != owner) {
                    return Err(SurfError::SessionConflict(format!(
                        "cdp origin {cdp_origin} is already attached as session {owner}"
                    )));
                }
                let session = state
                    .sessions
                    .get_mut(&owner)
                    .ok_or_else(|| SurfError::Internal(format!("session {owner} vanished mid-update")))?;
                session.heartbeat(&now);
                let session = session.clone();
                state.active_session_id = Some(owner);
                return Ok(ResolvedSession {
                    session,
                    created: false,
                    fallback_from: None,
                });
            }

            let session_id = match &request.session_id {
                Some(id) if state.sessions.contains_key(id) => {
                    return Err(SurfError::SessionExists {
                        session_id: id.clone(),
                    });
                }
                Some(id) => id.clone(),
                None => state.allocate_session_id(&profiles_dir),
            };
            let session = Session {
                session_id: session_id.clone(),
                kind: SessionKind::Attached,
                cdp_origin: cdp_origin.clone(),
                debug_port: origin_port(&cdp_origin),
                user_data_dir: None,
                browser_pid: None,
                policy,
                lease_ttl_ms,
                profile: None,
                created_at: now.clone(),
                last_seen_at: now.clone(),
                managed_unreachable_since: None,
                managed_unreachable_count: 0,
            };
            state.sessions.insert(session_id.clone(), session.clone());
            state.active_session_id = Some(session_id);
            Ok(ResolvedSession {
                session,
                created: true,
                fallback_from: None,
            })
        })?;
        if resolved.created {
            tracing::info!(session = %resolved.session.session_id, origin = %cdp_origin, "attached session");
        }
        Ok(resolved)
    }

    /// Switches the active pointer after checking existence and reachability.
    pub fn use_session(&self, session_id: &str) -> SurfResult<Session> {
        let session = self.reachable_session(session_id)?;
        let now = wall_time_iso_utc();
        self.handle.update(|state| {
            let s = state.sessions.get_mut(&session.session_id).ok_or_else(|| {
                SurfError::SessionNotFound {
                    session_id: session.session_id.clone(),
                }
            })?;
            s.heartbeat(&now);
            let s = s.clone();
            state.active_session_id = Some(s.session_id.clone());
            Ok(s)
        })
    }

    /// Reuses the reachable active session; otherwise falls back to a reachable managed
    /// session, and finally launches a new managed one. Never attaches elsewhere.
    pub fn ensure(&self) -> SurfResult<ResolvedSession> {
        let state = self.handle.read()?;
        let mut fallback_from = None;
        if let Some(active) = state
            .active_session_id
            .as_ref()
            .and_then(|id| state.sessions.get(id))
        {
            if self.probe.reachable(&active.cdp_origin) {
                let session = self.activate(&active.session_id)?;
                return Ok(ResolvedSession {
                    session,
                    created: false,
                    fallback_from: None,
                });
            }
            tracing::info!(session = %active.session_id, kind = ?active.kind, "active session unreachable; falling back to a managed session");
            fallback_from = Some(active.session_id.clone());
        }

        for candidate in managed_candidates(&state, fallback_from.as_deref()) {
            if self.probe.reachable(&candidate.cdp_origin) {
                let session = self.activate(&candidate.session_id)?;
                return Ok(ResolvedSession {
                    session,
                    created: false,
                    fallback_from,
                });
            }
        }

        let mut resolved = self.new_managed(&NewSessionRequest::default())?;
        resolved.fallback_from = fallback_from;
        Ok(resolved)
    }

    /// A pinned session must exist and answer; it is heartbeated but not made active.
    pub fn resolve_for_run(&self, pinned: Option<&str>) -> SurfResult<ResolvedSession> {
        let Some(session_id) = pinned else {
            return self.ensure();
        };
        let session = self.reachable_session(session_id)?;
        let now = wall_time_iso_utc();
        let session = self.handle.update(|state| {
            let s = state.sessions.get_mut(&session.session_id).ok_or_else(|| {
                SurfError::SessionNotFound {
                    session_id: session.session_id.clone(),
                }
            })?;
            s.heartbeat(&now);
            Ok(s.clone())
        })?;
        Ok(ResolvedSession {
            session,
            created: false,
            fallback_from: None,
        })
    }

    pub fn list(&self) -> SurfResult<SessionListing> {
        let state = self.handle.read()?;
        Ok(SessionListing {
            active_session_id: state.active_session_id.clone(),
            sessions: state.sessions.into_values().collect(),
        })
    }

    /// Drops every session and its targets; managed browsers are stopped unless
    /// `keep_processes`, and ephemeral managed profiles under the state root are deleted.
    pub fn clear(&self, keep_processes: bool) -> SurfResult<ClearReport> {
        let (sessions, removed_targets) = self.handle.update(|state| {
            let sessions: Vec<Session> = std::mem::take(&mut state.sessions).into_values().collect();
            let removed_targets = state.targets.len();
            state.targets.clear();
            state.active_session_id = None;
            Ok((sessions, removed_targets))
        })?;

        let profiles_dir = self.handle.profiles_dir();
        let mut report = ClearReport {
            removed_targets,
            ..ClearReport::default()
        };
        for session in sessions {
            report.removed_sessions.push(session.session_id.clone());
            if session.kind != SessionKind::Managed {
                continue;
            }
            if !keep_processes
                && let Some(pid) = session.browser_pid
                && terminate_process(pid)
            {
                report.terminated_pids.push(pid);
            }
            if session.policy == SessionPolicy::Ephemeral
                && let Some(dir) = session.user_data_dir.as_deref().map(PathBuf::from)
                && dir.starts_with(&profiles_dir)
                && dir.is_dir()
            {
                // Best-effort: a browser still shutting down may hold files open.
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => report.removed_profiles.push(dir.display().to_string()),
                    Err(err) => tracing::warn!(dir = %dir.display(), "failed to remove profile: {err}"),
                }
            }
        }
        Ok(report)
    }

    /// Upserts the targets a run acted on and heartbeats their sessions in one update.
    /// Touches for sessions that no longer exist are skipped.
    pub fn record_activity(&self, touches: &[TargetTouch]) -> SurfResult<usize> {
        if touches.is_empty() {
            return Ok(0);
        }
        let now = wall_time_iso_utc();
        self.handle.update(|state| Ok(apply_target_touches(state, touches, &now)))
    }

    fn reachable_session(&self, session_id: &str) -> SurfResult<Session> {
        let state = self.handle.read()?;
        let session = state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SurfError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if !self.probe.reachable(&session.cdp_origin) {
            return Err(SurfError::SessionUnreachable {
                session_id: session.session_id,
                cdp_origin: session.cdp_origin,
            });
        }
        Ok(session)
    }

    fn activate(&self, session_id: &str) -> SurfResult<Session> {
        let now = wall_time_iso_utc();
        self.handle.update(|state| {
            let s = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SurfError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            s.heartbeat(&now);
            let s = s.clone();
            state.active_session_id = Some(s.session_id.clone());
            Ok(s)
        })
    }

    fn lease_for(&self, policy: SessionPolicy, explicit: Option<u64>) -> Option<u64> {
        match (explicit, policy) {
            (Some(0), _) => None,
            (Some(ttl), _) => Some(ttl),
            (None, SessionPolicy::Ephemeral) => Some(self.settings.default_lease_ttl_ms),
            (None, SessionPolicy::Persistent) => None,
        }
    }
}

pub fn apply_target_touches(state: &mut SurfwrightState, touches: &[TargetTouch], now: &str) -> usize {
    let mut applied = 0;
    for touch in touches {
        if !state.sessions.contains_key(&touch.session_id) {
            continue;
        }
        let target = state
            .targets
            .entry(touch.target_id.clone())
            .or_insert_with(|| Target {
                target_id: touch.target_id.clone(),
                session_id: touch.session_id.clone(),
                url: None,
                title: None,
                status: None,
                last_action_kind: None,
                last_action_at: None,
                updated_at: now.to_string(),
            });
        target.session_id = touch.session_id.clone();
        if touch.url.is_some() {
            target.url = touch.url.clone();
        }
        if touch.title.is_some() {
            target.title = touch.title.clone();
        }
        if touch.status.is_some() {
            target.status = touch.status.clone();
        }
        target.last_action_kind = Some(touch.action_kind.clone());
        target.last_action_at = Some(touch.at.clone());
        target.updated_at = now.to_string();
        if let Some(session) = state.sessions.get_mut(&touch.session_id) {
            session.heartbeat(now);
        }
        applied += 1;
    }
    applied
}

/// Managed sessions other than `exclude`, most recently seen first.
fn managed_candidates<'s>(state: &'s SurfwrightState, exclude: Option<&str>) -> Vec<&'s Session> {
    let mut out: Vec<&Session> = state
        .sessions
        .values()
        .filter(|s| s.kind == SessionKind::Managed && Some(s.session_id.as_str()) != exclude)
        .collect();
    out.sort_by(|a, b| {
        let seen = |s: &Session| parse_iso_ms(&s.last_seen_at).unwrap_or(0);
        seen(b).cmp(&seen(a)).then_with(|| a.session_id.cmp(&b.session_id))
    });
    out
}

fn validate_session_id(id: &str) -> SurfResult<()> {
    if is_sanitized_id(id) && id.len() <= 64 {
        Ok(())
    } else {
        Err(SurfError::query(format!(
            "invalid session id {id:?}: use 1-64 characters from [A-Za-z0-9._-]"
        )))
    }
}

fn origin_port(cdp_origin: &str) -> Option<u16> {
    cdp_origin.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
}
