//! Persisted state: sessions, targets, network captures and artifacts.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::Path;

use crate::{SurfError, SurfResult, parse_iso_ms};

pub const CURRENT_STATE_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Managed,
    Attached,
}

impl SessionKind {
    pub fn default_policy(self) -> SessionPolicy {
        match self {
            SessionKind::Managed => SessionPolicy::Ephemeral,
            SessionKind::Attached => SessionPolicy::Persistent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    Ephemeral,
    Persistent,
}

impl clap::ValueEnum for SessionPolicy {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Ephemeral, Self::Persistent]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(match self {
            Self::Ephemeral => clap::builder::PossibleValue::new("ephemeral"),
            Self::Persistent => clap::builder::PossibleValue::new("persistent"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub kind: SessionKind,
    pub cdp_origin: String,
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default)]
    pub user_data_dir: Option<String>,
    #[serde(default)]
    pub browser_pid: Option<u32>,
    pub policy: SessionPolicy,
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
    #[serde(default)]
    pub profile: Option<String>,
    pub created_at: String,
    pub last_seen_at: String,
    #[serde(default)]
    pub managed_unreachable_since: Option<String>,
    #[serde(default)]
    pub managed_unreachable_count: u32,
}

impl Session {
    /// Unparsable heartbeats count as the epoch, so such leases read as expired.
    pub fn lease_expired(&self, now_ms: u64) -> bool {
        let Some(ttl) = self.lease_ttl_ms else {
            return false;
        };
        let seen = parse_iso_ms(&self.last_seen_at).unwrap_or(0);
        now_ms.saturating_sub(seen) > ttl
    }

    pub fn heartbeat(&mut self, now_iso: &str) {
        self.last_seen_at = now_iso.to_string();
        self.managed_unreachable_since = None;
        self.managed_unreachable_count = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub target_id: String,
    pub session_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_action_kind: Option<String>,
    #[serde(default)]
    pub last_action_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Recording,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkCapture {
    pub capture_id: String,
    pub session_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
    pub status: CaptureStatus,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkArtifact {
    pub artifact_id: String,
    #[serde(default)]
    pub capture_id: Option<String>,
    pub format: String,
    pub path: String,
    #[serde(default)]
    pub bytes: Option<u64>,
    /// blake3 of the file contents at registration time.
    #[serde(default)]
    pub checksum: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfwrightState {
    pub version: u32,
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default = "first_ordinal")]
    pub next_session_ordinal: u64,
    #[serde(default = "first_ordinal")]
    pub next_capture_ordinal: u64,
    #[serde(default = "first_ordinal")]
    pub next_artifact_ordinal: u64,
    #[serde(default)]
    pub sessions: BTreeMap<String, Session>,
    #[serde(default)]
    pub targets: BTreeMap<String, Target>,
    #[serde(default)]
    pub network_captures: BTreeMap<String, NetworkCapture>,
    #[serde(default)]
    pub network_artifacts: BTreeMap<String, NetworkArtifact>,
}

fn first_ordinal() -> u64 {
    1
}

impl Default for SurfwrightState {
    fn default() -> Self {
        Self {
            version: CURRENT_STATE_VERSION,
            active_session_id: None,
            next_session_ordinal: 1,
            next_capture_ordinal: 1,
            next_artifact_ordinal: 1,
            sessions: BTreeMap::new(),
            targets: BTreeMap::new(),
            network_captures: BTreeMap::new(),
            network_artifacts: BTreeMap::new(),
        }
    }
}

impl SurfwrightState {
    /// Next `s-N` id whose record and profile directory are both free.
    pub fn allocate_session_id(&mut self, profiles_dir: &Path) -> String {
        loop {
            let id = format!("s-{}", self.next_session_ordinal);
            self.next_session_ordinal += 1;
            if !self.sessions.contains_key(&id) && !profiles_dir.join(&id).exists() {
                return id;
            }
        }
    }

    pub fn allocate_capture_id(&mut self) -> String {
        loop {
            let id = format!("c-{}", self.next_capture_ordinal);
            self.next_capture_ordinal += 1;
            if !self.network_captures.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn allocate_artifact_id(&mut self) -> String {
        loop {
            let id = format!("a-{}", self.next_artifact_ordinal);
            self.next_artifact_ordinal += 1;
            if !self.network_artifacts.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn begin_capture(
        &mut self,
        session_id: &str,
        target_id: Option<&str>,
        now_iso: &str,
    ) -> SurfResult<String> {
        if !self.sessions.contains_key(session_id) {
            return Err(SurfError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let capture_id = self.allocate_capture_id();
        self.network_captures.insert(
            capture_id.clone(),
            NetworkCapture {
                capture_id: capture_id.clone(),
                session_id: session_id.to_string(),
                target_id: target_id.map(str::to_string),
                status: CaptureStatus::Recording,
                started_at: now_iso.to_string(),
                ended_at: None,
                artifact_id: None,
            },
        );
        Ok(capture_id)
    }

    pub fn finish_capture(
        &mut self,
        capture_id: &str,
        status: CaptureStatus,
        now_iso: &str,
    ) -> SurfResult<()> {
        let capture = self
            .network_captures
            .get_mut(capture_id)
            .ok_or_else(|| SurfError::query(format!("capture not found: {capture_id}")))?;
        if capture.status != CaptureStatus::Recording {
            return Err(SurfError::query(format!(
                "capture {capture_id} is not recording"
            )));
        }
        capture.status = status;
        capture.ended_at = Some(now_iso.to_string());
        Ok(())
    }

    pub fn register_artifact(&mut self, new: NewArtifact<'_>, now_iso: &str) -> SurfResult<String> {
        if let Some(capture_id) = new.capture_id
            && !self.network_captures.contains_key(capture_id)
        {
            return Err(SurfError::query(format!("capture not found: {capture_id}")));
        }
        let artifact_id = self.allocate_artifact_id();
        self.network_artifacts.insert(
            artifact_id.clone(),
            NetworkArtifact {
                artifact_id: artifact_id.clone(),
                capture_id: new.capture_id.map(str::to_string),
                format: new.format.to_string(),
                path: new.path.to_string(),
                bytes: new.bytes,
                checksum: new.checksum,
                created_at: now_iso.to_string(),
            },
        );
        if let Some(capture_id) = new.capture_id
            && let Some(capture) = self.network_captures.get_mut(capture_id)
        {
            capture.artifact_id = Some(artifact_id.clone());
        }
        Ok(artifact_id)
    }

    /// Removes a session and everything keyed to it.
    pub fn remove_session(&mut self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id)?;
        self.targets.retain(|_, t| t.session_id != session_id);
        if self.active_session_id.as_deref() == Some(session_id) {
            self.active_session_id = None;
        }
        Some(removed)
    }
}

#[derive(Debug, Clone)]
pub struct NewArtifact<'a> {
    pub capture_id: Option<&'a str>,
    pub format: &'a str,
    pub path: &'a str,
    pub bytes: Option<u64>,
    pub checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, seen: &str, ttl: Option<u64>) -> Session {
        Session {
            session_id: id.to_string(),
            kind: SessionKind::Managed,
            cdp_origin: "http://127.0.0.1:9222".to_string(),
            debug_port: Some(9222),
            user_data_dir: None,
            browser_pid: None,
            policy: SessionPolicy::Ephemeral,
            lease_ttl_ms: ttl,
            profile: None,
            created_at: seen.to_string(),
            last_seen_at: seen.to_string(),
            managed_unreachable_since: None,
            managed_unreachable_count: 0,
        }
    }

    #[test]
    fn session_ids_skip_existing_profile_dirs() {
        let dir = std::env::temp_dir().join(format!("sw-profiles-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("s-1")).expect("mkdir");
        let mut state = SurfwrightState::default();
        assert_eq!(state.allocate_session_id(&dir), "s-2");
        assert_eq!(state.allocate_session_id(&dir), "s-3");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn lease_expiry_uses_last_heartbeat() {
        let s = session("s-1", "2026-01-01T00:00:00Z", Some(1_000));
        let seen = parse_iso_ms("2026-01-01T00:00:00Z").expect("ts");
        assert!(!s.lease_expired(seen + 1_000));
        assert!(s.lease_expired(seen + 1_001));
        assert!(!session("s-2", "garbage", None).lease_expired(u64::MAX));
        assert!(session("s-3", "garbage", Some(5)).lease_expired(10));
    }

    #[test]
    fn capture_lifecycle_links_artifacts() {
        let mut state = SurfwrightState::default();
        state
            .sessions
            .insert("s-1".into(), session("s-1", "2026-01-01T00:00:00Z", None));
        assert!(state.begin_capture("s-9", None, "t").is_err());

        let cid = state.begin_capture("s-1", Some("T1"), "t0").expect("begin");
        assert_eq!(cid, "c-1");
        state
            .finish_capture(&cid, CaptureStatus::Stopped, "t1")
            .expect("finish");
        assert!(state.finish_capture(&cid, CaptureStatus::Stopped, "t2").is_err());

        let aid = state
            .register_artifact(
                NewArtifact {
                    capture_id: Some(&cid),
                    format: "har",
                    path: "/tmp/x.har",
                    bytes: Some(10),
                    checksum: None,
                },
                "t3",
            )
            .expect("artifact");
        assert_eq!(aid, "a-1");
        assert_eq!(state.network_captures[&cid].artifact_id.as_deref(), Some("a-1"));
    }

    #[test]
    fn removing_a_session_drops_its_targets_and_active_pointer() {
        let mut state = SurfwrightState::default();
        state
            .sessions
            .insert("s-1".into(), session("s-1", "2026-01-01T00:00:00Z", None));
        state.active_session_id = Some("s-1".into());
        state.targets.insert(
            "T1".into(),
            Target {
                target_id: "T1".into(),
                session_id: "s-1".into(),
                url: None,
                title: None,
                status: None,
                last_action_kind: None,
                last_action_at: None,
                updated_at: "2026-01-01T00:00:00Z".into(),
            },
        );
        assert!(state.remove_session("s-1").is_some());
        assert!(state.targets.is_empty());
        assert_eq!(state.active_session_id, None);
    }
}
