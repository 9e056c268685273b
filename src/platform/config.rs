//! `surfwright.toml` config loading and state-root resolution.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{SurfDuration, sanitize_id};

pub const STATE_DIR_ENV: &str = "SURFWRIGHT_STATE_DIR";
pub const AGENT_ID_ENV: &str = "SURFWRIGHT_AGENT_ID";
pub const LEGACY_STATE_ENV: &str = "SURFWRIGHT_STATE_LEGACY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Explicit state root. The environment override still wins.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Run-level step timeout when a step declares none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,

    /// A lock file older than this is treated as abandoned.
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_browser_start_timeout_ms")]
    pub browser_start_timeout_ms: u64,

    #[serde(default = "default_headless")]
    pub headless: bool,

    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    /// Lease applied to ephemeral sessions created without an explicit TTL.
    #[serde(default = "default_lease_ttl_ms")]
    pub default_lease_ttl_ms: u64,

    /// Targets untouched for longer than this are pruned, e.g. `"168h"` or `"7d"`.
    #[serde(default = "default_target_max_age")]
    pub target_max_age: SurfDuration,

    #[serde(default = "default_target_max_per_session")]
    pub target_max_per_session: usize,

    /// Deprecated single-file state layout.
    #[serde(default)]
    pub legacy_state_file: bool,
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_lock_timeout_ms() -> u64 {
    8_000
}

fn default_lock_poll_ms() -> u64 {
    25
}

fn default_lock_stale_ms() -> u64 {
    20_000
}

fn default_probe_timeout_ms() -> u64 {
    1_500
}

fn default_browser_start_timeout_ms() -> u64 {
    15_000
}

fn default_headless() -> bool {
    true
}

fn default_lease_ttl_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_target_max_age() -> SurfDuration {
    SurfDuration::from_hours(168)
}

fn default_target_max_per_session() -> usize {
    200
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: None,
            default_timeout_ms: default_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_ms: default_lock_poll_ms(),
            lock_stale_ms: default_lock_stale_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            browser_start_timeout_ms: default_browser_start_timeout_ms(),
            headless: default_headless(),
            chrome_path: None,
            default_lease_ttl_ms: default_lease_ttl_ms(),
            target_max_age: default_target_max_age(),
            target_max_per_session: default_target_max_per_session(),
            legacy_state_file: false,
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Resolution order: env override, config `state_dir`, per-agent home dir, home dir.
    pub fn state_root(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STATE_DIR_ENV)
            && !dir.trim().is_empty()
        {
            return PathBuf::from(dir);
        }
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let base = home.join(".surfwright");
        match std::env::var(AGENT_ID_ENV) {
            Ok(agent) if !agent.trim().is_empty() => {
                base.join("agents").join(sanitize_id(agent.trim()))
            }
            _ => base,
        }
    }

    pub fn legacy_layout(&self) -> bool {
        if self.legacy_state_file {
            return true;
        }
        std::env::var(LEGACY_STATE_ENV)
            .ok()
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
