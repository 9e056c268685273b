//! Typed errors shared by the library and the CLI.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type SurfResult<T> = Result<T, SurfError>;

#[derive(Debug, Error)]
pub enum SurfError {
    /// Malformed plan, bad step shape, unresolved template, bad CLI args.
    #[error("{0}")]
    QueryInvalid(String),

    #[error("{0}")]
    AssertFailed(String),

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("session {session_id} is unreachable at {cdp_origin}")]
    SessionUnreachable {
        session_id: String,
        cdp_origin: String,
    },

    #[error("{0}")]
    SessionConflict(String),

    #[error("state update did not commit after {attempts} attempt(s); retry the operation")]
    StateLockTimeout { attempts: u32 },

    #[error("timed out after {waited:?} waiting for state lock {path:?}")]
    StateLockWait { path: PathBuf, waited: Duration },

    #[error("state lock i/o error at {path:?}: {source}")]
    StateLockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    StateVersionMismatch(String),

    #[error("CDP endpoint unreachable at {cdp_origin}")]
    CdpUnreachable { cdp_origin: String },

    #[error("{0}")]
    BrowserNotFound(String),

    #[error("{0}")]
    BrowserStartFailed(String),

    #[error("browser did not expose {cdp_origin} within {waited:?}")]
    BrowserStartTimeout { cdp_origin: String, waited: Duration },

    #[error("step kind '{kind}' is not served by the configured browser binding")]
    OpsUnavailable { kind: String },

    #[error("{0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SurfError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueryInvalid(_) => "E_QUERY_INVALID",
            Self::AssertFailed(_) => "E_ASSERT_FAILED",
            Self::SessionNotFound { .. } => "E_SESSION_NOT_FOUND",
            Self::SessionExists { .. } => "E_SESSION_EXISTS",
            Self::SessionUnreachable { .. } => "E_SESSION_UNREACHABLE",
            Self::SessionConflict(_) => "E_SESSION_CONFLICT",
            Self::StateLockTimeout { .. } | Self::StateLockWait { .. } => "E_STATE_LOCK_TIMEOUT",
            Self::StateLockIo { .. } => "E_STATE_LOCK_IO",
            Self::StateVersionMismatch(_) => "E_STATE_VERSION_MISMATCH",
            Self::CdpUnreachable { .. } => "E_CDP_UNREACHABLE",
            Self::BrowserNotFound(_) => "E_BROWSER_NOT_FOUND",
            Self::BrowserStartFailed(_) => "E_BROWSER_START_FAILED",
            Self::BrowserStartTimeout { .. } => "E_BROWSER_START_TIMEOUT",
            Self::OpsUnavailable { .. } => "E_OPS_UNAVAILABLE",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "E_INTERNAL",
        }
    }

    /// Whether re-invoking the whole operation may succeed without operator action.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::SessionUnreachable { .. }
                | Self::StateLockTimeout { .. }
                | Self::StateLockWait { .. }
                | Self::StateLockIo { .. }
                | Self::CdpUnreachable { .. }
                | Self::BrowserStartTimeout { .. }
        )
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryInvalid(msg.into())
    }
}
