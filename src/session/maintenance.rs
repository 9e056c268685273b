//! Maintenance jobs: session pruning, target pruning and full reconciliation.
//!
//! Each job probes outside the state mutation, then applies a pure function of
//! (state, probe results, options) inside one update, then stops processes.

use serde::Serialize;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{
    CaptureStatus, CdpProbe, Config, SessionKind, StateHandle, SurfResult, SurfwrightState,
    now_unix_ms, parse_iso_ms, terminate_process, wall_time_iso_utc,
};

/// Consecutive failed probes after which a managed session is evicted.
pub const MANAGED_UNREACHABLE_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPruneOptions {
    /// Remove attached sessions that fail their probe.
    pub drop_unreachable_attached: bool,
    /// Remove managed sessions on their first failed probe instead of the second.
    pub drop_unreachable_managed_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPruneOptions {
    pub max_age: Duration,
    pub max_per_session: usize,
}

impl TargetPruneOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_age: config.target_max_age.into(),
            max_per_session: config.target_max_per_session,
        }
    }
}

impl Default for TargetPruneOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(168 * 60 * 60),
            max_per_session: 200,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPruneReport {
    pub scanned: usize,
    pub removed_expired: Vec<String>,
    pub removed_unreachable: Vec<String>,
    /// Unreachable sessions kept for now, with their consecutive failure count.
    pub retained_unreachable: BTreeMap<String, u32>,
    pub heartbeated: Vec<String>,
    pub terminated_pids: Vec<u32>,
    pub remaining: usize,
    #[serde(skip)]
    pids_to_stop: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetPruneReport {
    pub scanned: usize,
    pub removed_orphaned: usize,
    pub removed_aged: usize,
    pub removed_capped: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub sessions: SessionPruneReport,
    pub targets: TargetPruneReport,
    pub failed_captures: Vec<String>,
}

/// Probe results keyed by session id: `true` when the CDP endpoint answered.
pub type Reachability = BTreeMap<String, bool>;

/// Probes every session whose lease is still live.
pub fn probe_sessions(state: &SurfwrightState, probe: &dyn CdpProbe, now_ms: u64) -> Reachability {
    state
        .sessions
        .values()
        .filter(|s| !s.lease_expired(now_ms))
        .map(|s| (s.session_id.clone(), probe.reachable(&s.cdp_origin)))
        .collect()
}

/// Lease expiry first, then the probe verdict. Sessions created after the probe pass
/// (absent from `reach`) are left alone.
pub fn apply_session_prune(
    state: &mut SurfwrightState,
    reach: &Reachability,
    opts: SessionPruneOptions,
    now_ms: u64,
    now_iso: &str,
) -> SessionPruneReport {
    let mut report = SessionPruneReport {
        scanned: state.sessions.len(),
        ..SessionPruneReport::default()
    };
    let ids: Vec<String> = state.sessions.keys().cloned().collect();
    for id in ids {
        let Some(session) = state.sessions.get_mut(&id) else {
            continue;
        };
        let stop_pid = (session.kind == SessionKind::Managed)
            .then_some(session.browser_pid)
            .flatten();

        if session.lease_expired(now_ms) {
            report.removed_expired.push(id.clone());
            report.pids_to_stop.extend(stop_pid);
            state.remove_session(&id);
            continue;
        }

        let remove = match reach.get(&id) {
            None => false,
            Some(true) => {
                session.heartbeat(now_iso);
                report.heartbeated.push(id.clone());
                false
            }
            Some(false) => match session.kind {
                SessionKind::Attached => {
                    if !opts.drop_unreachable_attached {
                        report.retained_unreachable.insert(id.clone(), 0);
                    }
                    opts.drop_unreachable_attached
                }
                SessionKind::Managed => {
                    session.managed_unreachable_count += 1;
                    if session.managed_unreachable_since.is_none() {
                        session.managed_unreachable_since = Some(now_iso.to_string());
                    }
                    let count = session.managed_unreachable_count;
                    let evict = opts.drop_unreachable_managed_now || count >= MANAGED_UNREACHABLE_LIMIT;
                    if !evict {
                        report.retained_unreachable.insert(id.clone(), count);
                    }
                    evict
                }
            },
        };
        if remove {
            report.removed_unreachable.push(id.clone());
            report.pids_to_stop.extend(stop_pid);
            state.remove_session(&id);
        }
    }
    report.remaining = state.sessions.len();
    report
}

/// Orphans, then age, then the per-session cap (most recently updated kept, ties by id).
/// Unparsable `updatedAt` values count as the epoch.
pub fn apply_target_prune(
    state: &mut SurfwrightState,
    opts: &TargetPruneOptions,
    now_ms: u64,
) -> TargetPruneReport {
    let mut report = TargetPruneReport {
        scanned: state.targets.len(),
        ..TargetPruneReport::default()
    };

    let before = state.targets.len();
    let sessions = &state.sessions;
    state.targets.retain(|_, t| sessions.contains_key(&t.session_id));
    report.removed_orphaned = before - state.targets.len();

    let max_age_ms = opts.max_age.as_millis().min(u128::from(u64::MAX)) as u64;
    let cutoff = now_ms.saturating_sub(max_age_ms);
    let before = state.targets.len();
    state
        .targets
        .retain(|_, t| parse_iso_ms(&t.updated_at).unwrap_or(0) >= cutoff);
    report.removed_aged = before - state.targets.len();

    let mut by_session: BTreeMap<&str, Vec<(u64, &str)>> = BTreeMap::new();
    for t in state.targets.values() {
        by_session
            .entry(t.session_id.as_str())
            .or_default()
            .push((parse_iso_ms(&t.updated_at).unwrap_or(0), t.target_id.as_str()));
    }
    let mut capped: Vec<String> = Vec::new();
    for mut targets in by_session.into_values() {
        if targets.len() <= opts.max_per_session {
            continue;
        }
        targets.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        capped.extend(targets[opts.max_per_session..].iter().map(|(_, id)| id.to_string()));
    }
    for id in &capped {
        state.targets.remove(id);
    }
    report.removed_capped = capped.len();
    report.remaining = state.targets.len();
    report
}

/// Recording captures whose session is gone are marked failed.
pub fn fail_orphaned_captures(state: &mut SurfwrightState, now_iso: &str) -> Vec<String> {
    let mut failed = Vec::new();
    for capture in state.network_captures.values_mut() {
        if capture.status == CaptureStatus::Recording && !state.sessions.contains_key(&capture.session_id) {
            capture.status = CaptureStatus::Failed;
            capture.ended_at = Some(now_iso.to_string());
            failed.push(capture.capture_id.clone());
        }
    }
    failed
}

pub fn session_prune(
    handle: &StateHandle,
    probe: &dyn CdpProbe,
    opts: SessionPruneOptions,
) -> SurfResult<SessionPruneReport> {
    let now_ms = now_unix_ms();
    let reach = probe_sessions(&handle.read()?, probe, now_ms);
    let now_iso = wall_time_iso_utc();
    let mut report = handle.update(|state| Ok(apply_session_prune(state, &reach, opts, now_ms, &now_iso)))?;
    stop_processes(&mut report);
    Ok(report)
}

pub fn target_prune(handle: &StateHandle, opts: &TargetPruneOptions) -> SurfResult<TargetPruneReport> {
    let now_ms = now_unix_ms();
    handle.update(|state| Ok(apply_target_prune(state, opts, now_ms)))
}

/// Session prune and target prune in one update.
pub fn state_reconcile(
    handle: &StateHandle,
    probe: &dyn CdpProbe,
    session_opts: SessionPruneOptions,
    target_opts: &TargetPruneOptions,
) -> SurfResult<ReconcileReport> {
    let now_ms = now_unix_ms();
    let reach = probe_sessions(&handle.read()?, probe, now_ms);
    let now_iso = wall_time_iso_utc();
    let mut report = handle.update(|state| {
        let sessions = apply_session_prune(state, &reach, session_opts, now_ms, &now_iso);
        let targets = apply_target_prune(state, target_opts, now_ms);
        let failed_captures = fail_orphaned_captures(state, &now_iso);
        Ok(ReconcileReport {
            sessions,
            targets,
            failed_captures,
        })
    })?;
    stop_processes(&mut report.sessions);
    Ok(report)
}

fn stop_processes(report: &mut SessionPruneReport) {
    for pid in std::mem::take(&mut report.pids_to_stop) {
        // Best-effort: the browser may already be gone.
        if terminate_process(pid) {
            report.terminated_pids.push(pid);
        }
    }
}
