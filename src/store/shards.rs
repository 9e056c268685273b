//! On-disk layout: a manifest naming one versioned file per collection.
//!
//! Shard files are immutable once written (`sessions-r7.json`); the manifest rename
//! is the single commit point, so readers never observe a half-applied update.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{
    CURRENT_STATE_VERSION, SurfError, SurfResult, SurfwrightState, migrate_state_value,
    wall_time_iso_utc, write_json_atomic,
};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Reads retry when a shard named by the manifest was swapped out underneath them.
const READ_RETRIES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKind {
    Sessions,
    Targets,
    NetworkCaptures,
    NetworkArtifacts,
}

impl ShardKind {
    pub const ALL: [ShardKind; 4] = [
        ShardKind::Sessions,
        ShardKind::Targets,
        ShardKind::NetworkCaptures,
        ShardKind::NetworkArtifacts,
    ];

    pub fn file_stem(self) -> &'static str {
        match self {
            ShardKind::Sessions => "sessions",
            ShardKind::Targets => "targets",
            ShardKind::NetworkCaptures => "network-captures",
            ShardKind::NetworkArtifacts => "network-artifacts",
        }
    }

    /// Key of the collection in the assembled state document.
    pub fn state_key(self) -> &'static str {
        match self {
            ShardKind::Sessions => "sessions",
            ShardKind::Targets => "targets",
            ShardKind::NetworkCaptures => "networkCaptures",
            ShardKind::NetworkArtifacts => "networkArtifacts",
        }
    }

    pub fn file_name(self, revision: u64) -> String {
        format!("{}-r{revision}.json", self.file_stem())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardFiles {
    #[serde(default)]
    pub sessions: Option<String>,
    #[serde(default)]
    pub targets: Option<String>,
    #[serde(default)]
    pub network_captures: Option<String>,
    #[serde(default)]
    pub network_artifacts: Option<String>,
}

impl ShardFiles {
    pub fn get(&self, kind: ShardKind) -> Option<&str> {
        match kind {
            ShardKind::Sessions => self.sessions.as_deref(),
            ShardKind::Targets => self.targets.as_deref(),
            ShardKind::NetworkCaptures => self.network_captures.as_deref(),
            ShardKind::NetworkArtifacts => self.network_artifacts.as_deref(),
        }
    }

    fn set(&mut self, kind: ShardKind, name: String) {
        let slot = match kind {
            ShardKind::Sessions => &mut self.sessions,
            ShardKind::Targets => &mut self.targets,
            ShardKind::NetworkCaptures => &mut self.network_captures,
            ShardKind::NetworkArtifacts => &mut self.network_artifacts,
        };
        *slot = Some(name);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateManifest {
    pub version: u32,
    pub revision: u64,
    #[serde(default)]
    pub active_session_id: Option<String>,
    #[serde(default = "first_ordinal")]
    pub next_session_ordinal: u64,
    #[serde(default = "first_ordinal")]
    pub next_capture_ordinal: u64,
    #[serde(default = "first_ordinal")]
    pub next_artifact_ordinal: u64,
    #[serde(default)]
    pub shards: ShardFiles,
    #[serde(default)]
    pub updated_at: Option<String>,
}

fn first_ordinal() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct RevisionProbe {
    revision: u64,
}

/// A consistent view of the store as of `revision`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: u64,
    pub state: SurfwrightState,
    pub manifest: Option<StateManifest>,
    /// The on-disk form differs from the current schema and must be rewritten.
    pub needs_rewrite: bool,
}

pub fn manifest_path(state_dir: &Path) -> PathBuf {
    state_dir.join(MANIFEST_FILE)
}

/// 0 when no manifest has been committed yet.
pub fn read_revision(state_dir: &Path) -> SurfResult<u64> {
    match std::fs::read(manifest_path(state_dir)) {
        Ok(bytes) => {
            let probe: RevisionProbe = serde_json::from_slice(&bytes).map_err(|e| {
                SurfError::Internal(format!("state manifest is corrupt: {e}"))
            })?;
            Ok(probe.revision)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err.into()),
    }
}

fn read_manifest(state_dir: &Path) -> SurfResult<Option<StateManifest>> {
    match std::fs::read(manifest_path(state_dir)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SurfError::Internal(format!("state manifest is corrupt: {e}"))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// `Ok(None)` when the named shard no longer exists.
fn read_shard(state_dir: &Path, name: &str) -> SurfResult<Option<Value>> {
    match std::fs::read(state_dir.join(name)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SurfError::Internal(format!("state shard {name} is corrupt: {e}"))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn read_snapshot(state_dir: &Path, legacy_file: &Path) -> SurfResult<Snapshot> {
    for attempt in 1..=READ_RETRIES {
        let Some(manifest) = read_manifest(state_dir)? else {
            return import_or_empty(legacy_file);
        };

        let mut doc = Map::new();
        doc.insert("version".to_string(), json!(manifest.version));
        doc.insert("activeSessionId".to_string(), json!(manifest.active_session_id));
        doc.insert("nextSessionOrdinal".to_string(), json!(manifest.next_session_ordinal));
        doc.insert("nextCaptureOrdinal".to_string(), json!(manifest.next_capture_ordinal));
        doc.insert("nextArtifactOrdinal".to_string(), json!(manifest.next_artifact_ordinal));

        let mut torn = false;
        for kind in ShardKind::ALL {
            let entries = match manifest.shards.get(kind) {
                Some(name) => match read_shard(state_dir, name)? {
                    Some(v) => v,
                    None => {
                        torn = true;
                        break;
                    }
                },
                None => json!({}),
            };
            doc.insert(kind.state_key().to_string(), entries);
        }
        if torn {
            tracing::debug!(attempt, "state shard replaced during read; retrying");
            continue;
        }

        let migrated = migrate_state_value(&Value::Object(doc))?;
        let state: SurfwrightState = serde_json::from_value(migrated)
            .map_err(|e| SurfError::Internal(format!("state does not match schema: {e}")))?;
        return Ok(Snapshot {
            revision: manifest.revision,
            needs_rewrite: manifest.version != CURRENT_STATE_VERSION,
            state,
            manifest: Some(manifest),
        });
    }
    Err(SurfError::Internal(format!(
        "state kept changing during {READ_RETRIES} read attempts"
    )))
}

/// First run with the sharded layout: pick up a legacy `state.json` if one exists.
fn import_or_empty(legacy_file: &Path) -> SurfResult<Snapshot> {
    match read_legacy(legacy_file)? {
        Some(state) => {
            tracing::info!(path = %legacy_file.display(), "importing legacy state file");
            Ok(Snapshot {
                revision: 0,
                state,
                manifest: None,
                needs_rewrite: true,
            })
        }
        None => Ok(Snapshot {
            revision: 0,
            state: SurfwrightState::default(),
            manifest: None,
            needs_rewrite: false,
        }),
    }
}

/// Writes changed collections as new shard files, then publishes the manifest.
pub fn commit_snapshot(
    state_dir: &Path,
    base: &Snapshot,
    next: &SurfwrightState,
    revision: u64,
) -> SurfResult<()> {
    std::fs::create_dir_all(state_dir)?;
    let force_all = base.manifest.is_none() || base.needs_rewrite;
    let previous = base.manifest.as_ref().map(|m| m.shards.clone()).unwrap_or_default();

    let mut shards = previous.clone();
    let mut replaced = Vec::new();
    for kind in ShardKind::ALL {
        let changed = force_all
            || previous.get(kind).is_none()
            || shard_value(&base.state, kind)? != shard_value(next, kind)?;
        if !changed {
            continue;
        }
        let name = kind.file_name(revision);
        write_json_atomic(&state_dir.join(&name), &shard_value(next, kind)?)?;
        if let Some(old) = previous.get(kind) {
            replaced.push(old.to_string());
        }
        shards.set(kind, name);
    }

    let manifest = StateManifest {
        version: CURRENT_STATE_VERSION,
        revision,
        active_session_id: next.active_session_id.clone(),
        next_session_ordinal: next.next_session_ordinal,
        next_capture_ordinal: next.next_capture_ordinal,
        next_artifact_ordinal: next.next_artifact_ordinal,
        shards,
        updated_at: Some(wall_time_iso_utc()),
    };
    write_json_atomic(&manifest_path(state_dir), &manifest)?;

    for old in replaced {
        if let Err(err) = std::fs::remove_file(state_dir.join(&old))
            && err.kind() != ErrorKind::NotFound
        {
            tracing::debug!(shard = %old, "failed to remove superseded shard: {err}");
        }
    }
    Ok(())
}

fn shard_value(state: &SurfwrightState, kind: ShardKind) -> SurfResult<Value> {
    Ok(match kind {
        ShardKind::Sessions => serde_json::to_value(&state.sessions)?,
        ShardKind::Targets => serde_json::to_value(&state.targets)?,
        ShardKind::NetworkCaptures => serde_json::to_value(&state.network_captures)?,
        ShardKind::NetworkArtifacts => serde_json::to_value(&state.network_artifacts)?,
    })
}

pub fn read_legacy(path: &Path) -> SurfResult<Option<SurfwrightState>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let doc: Value = serde_json::from_slice(&bytes)
        .map_err(|e| SurfError::Internal(format!("legacy state file is corrupt: {e}")))?;
    let migrated = migrate_state_value(&doc)?;
    serde_json::from_value(migrated)
        .map(Some)
        .map_err(|e| SurfError::Internal(format!("legacy state does not match schema: {e}")))
}

pub fn write_legacy(path: &Path, state: &SurfwrightState) -> SurfResult<()> {
    write_json_atomic(path, state)
}
