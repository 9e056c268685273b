//! Run artifacts: the plan and report of a run, replayable with `run --replay`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use std::path::{Path, PathBuf};

use crate::{
    LogMode, ReplayOrigin, SurfError, SurfResult, file_stamp_utc, iso_from_unix_ms, sanitize_id,
    write_atomic,
};

/// How the recorded run was configured, so a replay can be compared against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayDescriptor {
    pub timeout_ms: u64,
    pub log_mode: LogMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_from: Option<ReplayOrigin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub created_at: String,
    #[serde(default)]
    pub label: Option<String>,
    pub source: String,
    #[serde(default)]
    pub replay: Option<ReplayDescriptor>,
    pub plan: Value,
    pub report: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl RunArtifact {
    pub fn new(
        created_at_ms: u64,
        label: Option<String>,
        source: impl Into<String>,
        replay: Option<ReplayDescriptor>,
        plan: Value,
        report: Value,
    ) -> Self {
        Self {
            created_at: iso_from_unix_ms(created_at_ms),
            label,
            source: source.into(),
            replay,
            plan,
            report,
            checksum: None,
        }
    }

    pub fn write_json(&self, path: &Path) -> SurfResult<()> {
        let mut with_checksum = self.clone();
        with_checksum.checksum = None;
        let canonical = serde_json::to_vec(&with_checksum)?;
        with_checksum.checksum = Some(blake3::hash(&canonical).to_hex().to_string());
        let bytes = serde_json::to_vec_pretty(&with_checksum)?;
        write_atomic(path, &bytes)
    }

    pub fn read_json(path: &Path) -> SurfResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            SurfError::query(format!("failed to read run artifact {}: {e}", path.display()))
        })?;
        let artifact: RunArtifact = serde_json::from_slice(&bytes).map_err(|e| {
            SurfError::query(format!("failed to parse run artifact {}: {e}", path.display()))
        })?;
        verify_checksum(&artifact, path)?;
        Ok(artifact)
    }
}

fn verify_checksum(artifact: &RunArtifact, path: &Path) -> SurfResult<()> {
    let Some(expected) = artifact.checksum.as_ref() else {
        return Ok(());
    };
    let mut canonical = artifact.clone();
    canonical.checksum = None;
    let bytes = serde_json::to_vec(&canonical)?;
    let got = blake3::hash(&bytes).to_hex().to_string();
    if &got != expected {
        return Err(SurfError::query(format!(
            "run artifact checksum mismatch for {} (expected {expected}, got {got})",
            path.display()
        )));
    }
    Ok(())
}

/// `<utc-stamp>-<label>-<8 hex>.json`
pub fn artifact_file_name(now_ms: u64, label: Option<&str>) -> String {
    let label = label
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(sanitize_id)
        .unwrap_or_else(|| "run".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{label}-{}.json", file_stamp_utc(now_ms), &suffix[..8])
}

/// An explicit path that names a directory gets a generated file name inside it.
pub fn resolve_record_path(
    explicit: Option<&Path>,
    runs_dir: &Path,
    label: Option<&str>,
    now_ms: u64,
) -> PathBuf {
    match explicit {
        Some(path) if path.is_dir() || path.to_string_lossy().ends_with('/') => {
            path.join(artifact_file_name(now_ms, label))
        }
        Some(path) => path.to_path_buf(),
        None => runs_dir.join(artifact_file_name(now_ms, label)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sw-record-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn file_names_carry_stamp_label_and_suffix() {
        let name = artifact_file_name(1_767_323_045_123, Some("smoke test"));
        assert!(name.starts_with("20260102T030405Z-smoke-test-"), "{name}");
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "20260102T030405Z-smoke-test-".len() + 8 + 5);
        assert!(artifact_file_name(0, None).contains("-run-"));
    }

    #[test]
    fn artifacts_round_trip_and_detect_tampering() {
        let dir = temp_dir();
        let path = resolve_record_path(None, &dir, Some("x"), 1_767_323_045_123);
        let artifact = RunArtifact::new(
            1_767_323_045_123,
            Some("x".into()),
            "plan-json",
            None,
            json!({"steps": [{"id": "list"}]}),
            json!({"ok": true, "weight": 0.1}),
        );
        artifact.write_json(&path).expect("write");
        let back = RunArtifact::read_json(&path).expect("read");
        assert_eq!(back.plan, artifact.plan);
        assert!(back.checksum.is_some());

        let text = std::fs::read_to_string(&path).expect("read text");
        std::fs::write(&path, text.replace("\"list\"", "\"open\"")).expect("tamper");
        let err = RunArtifact::read_json(&path).unwrap_err();
        assert_eq!(err.code(), "E_QUERY_INVALID");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn explicit_directory_gets_generated_name() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = resolve_record_path(Some(&dir), Path::new("/unused"), None, 0);
        assert_eq!(path.parent(), Some(dir.as_path()));
        let file = dir.join("exact.json");
        assert_eq!(resolve_record_path(Some(&file), Path::new("/unused"), None, 0), file);
        let _ = std::fs::remove_dir_all(dir);
    }
}
