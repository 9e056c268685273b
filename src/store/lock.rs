//! Cross-process advisory lock guarding state commits.
//!
//! The lock is a file created with `create_new`, holding `{pid, token, acquiredAtMs}`.
//! Abandoned locks are reclaimed under a `<lock>.reclaim` guard file: the reclaimer re-reads
//! the lock and removes it only if it still carries the token that was observed as stale.

use serde::{Deserialize, Serialize};

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use crate::{Config, SurfError, SurfResult, now_unix_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LockOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.lock_timeout_ms),
            poll: Duration::from_millis(config.lock_poll_ms.max(1)),
            stale_after: Duration::from_millis(config.lock_stale_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateLockMeta {
    pub pid: u32,
    pub token: String,
    pub acquired_at_ms: u64,
}

#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    meta: StateLockMeta,
    released: bool,
}

impl StateLock {
    pub fn acquire(path: &Path, opts: &LockOptions) -> SurfResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SurfError::StateLockIo {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let meta = StateLockMeta {
                        pid: std::process::id(),
                        token: uuid::Uuid::new_v4().to_string(),
                        acquired_at_ms: now_unix_ms(),
                    };
                    let written = serde_json::to_vec(&meta)
                        .map_err(std::io::Error::other)
                        .and_then(|bytes| {
                            file.write_all(&bytes)?;
                            file.sync_all()
                        });
                    if let Err(source) = written {
                        let _ = fs::remove_file(path);
                        return Err(SurfError::StateLockIo {
                            path: path.to_path_buf(),
                            source,
                        });
                    }
                    tracing::trace!(path = %path.display(), token = %meta.token, "state lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        meta,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match inspect_holder(path)? {
                        // holder released between create and inspect
                        None => continue,
                        Some(holder) if holder.age >= opts.stale_after => {
                            if reclaim_stale(path, &holder, opts.stale_after)? {
                                tracing::warn!(
                                    path = %path.display(),
                                    age_ms = holder.age.as_millis() as u64,
                                    pid = ?holder.meta.as_ref().map(|m| m.pid),
                                    "reclaimed stale state lock"
                                );
                                continue;
                            }
                        }
                        Some(_) => {}
                    }

                    let waited = started.elapsed();
                    if waited >= opts.timeout {
                        return Err(SurfError::StateLockWait {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    std::thread::sleep(opts.poll.min(opts.timeout - waited));
                }
                Err(source) => {
                    return Err(SurfError::StateLockIo {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
    }

    pub fn meta(&self) -> &StateLockMeta {
        &self.meta
    }

    pub fn release(mut self) -> SurfResult<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> SurfResult<()> {
        match read_meta(&self.path) {
            Ok(Some(meta)) if meta.token == self.meta.token => match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(source) => Err(SurfError::StateLockIo {
                    path: self.path.clone(),
                    source,
                }),
            },
            Ok(_) => {
                tracing::warn!(path = %self.path.display(), "state lock was reclaimed by another process before release");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SurfError::StateLockIo {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released
            && let Err(err) = self.remove_if_owned()
        {
            tracing::warn!("failed to release state lock: {err}");
        }
    }
}

#[derive(Debug)]
struct LockHolder {
    meta: Option<StateLockMeta>,
    age: Duration,
}

/// `Ok(None)` when the lock file vanished.
fn inspect_holder(path: &Path) -> SurfResult<Option<LockHolder>> {
    let io_err = |source| SurfError::StateLockIo {
        path: path.to_path_buf(),
        source,
    };
    match read_meta(path) {
        Ok(Some(meta)) => {
            let age = Duration::from_millis(now_unix_ms().saturating_sub(meta.acquired_at_ms));
            Ok(Some(LockHolder {
                meta: Some(meta),
                age,
            }))
        }
        // Unparsable: the holder may still be writing metadata. Fall back to mtime.
        Ok(None) => match file_age(path) {
            Ok(Some(age)) => Ok(Some(LockHolder { meta: None, age })),
            Ok(None) => Ok(None),
            Err(err) => Err(io_err(err)),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(err)),
    }
}

/// Time since last modification; `Ok(None)` when the file is gone.
fn file_age(path: &Path) -> std::io::Result<Option<Duration>> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => Ok(Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn read_meta(path: &Path) -> std::io::Result<Option<StateLockMeta>> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes).ok())
}

fn reclaim_guard_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("state.lock");
    path.with_file_name(format!("{file_name}.reclaim"))
}

/// Serializes reclaimers. Removed on drop.
#[derive(Debug)]
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    /// `Ok(None)` while another reclaimer holds the guard. A guard older than `stale_after`
    /// belongs to a reclaimer that died and is cleared for the next attempt.
    fn try_acquire(path: &Path, stale_after: Duration) -> SurfResult<Option<Self>> {
        let io_err = |source| SurfError::StateLockIo {
            path: path.to_path_buf(),
            source,
        };
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if file_age(path).map_err(io_err)?.is_some_and(|age| age >= stale_after) {
                    tracing::warn!(path = %path.display(), "clearing abandoned state lock reclaim guard");
                    let _ = fs::remove_file(path);
                }
                Ok(None)
            }
            Err(err) => Err(io_err(err)),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            tracing::warn!("failed to remove state lock reclaim guard: {err}");
        }
    }
}

/// Returns `true` when the stale holder is gone and acquisition can be retried at once.
/// The lock file is only removed after the holder it carries is confirmed to be `observed`.
fn reclaim_stale(path: &Path, observed: &LockHolder, stale_after: Duration) -> SurfResult<bool> {
    let Some(_guard) = ReclaimGuard::try_acquire(&reclaim_guard_path(path), stale_after)? else {
        return Ok(false);
    };

    let Some(current) = inspect_holder(path)? else {
        return Ok(true);
    };
    let same_holder = match (&observed.meta, &current.meta) {
        (Some(observed), Some(current)) => observed.token == current.token,
        (None, None) => current.age >= stale_after,
        _ => false,
    };
    if !same_holder {
        tracing::debug!(path = %path.display(), "state lock changed hands before reclaim");
        return Ok(false);
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(source) => Err(SurfError::StateLockIo {
            path: path.to_path_buf(),
            source,
        }),
    }
}
