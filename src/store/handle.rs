//! Handle over a state root: optimistic read-mutate-commit transactions.

use std::path::{Path, PathBuf};

use crate::{
    Config, LockOptions, StateLock, SurfError, SurfResult, SurfwrightState,
    commit_snapshot, read_legacy, read_revision, read_snapshot, write_legacy,
};

/// Attempts per update before giving up with `E_STATE_LOCK_TIMEOUT`.
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 4;

const STATE_DIR: &str = "state";
const LOCK_FILE: &str = "state.lock";
const LEGACY_FILE: &str = "state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLayout {
    Sharded,
    /// Deprecated single `state.json`, rewritten whole under the lock.
    LegacyFile,
}

#[derive(Debug, Clone)]
pub struct StateHandle {
    root: PathBuf,
    lock: LockOptions,
    layout: StateLayout,
}

impl StateHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: LockOptions::default(),
            layout: StateLayout::Sharded,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let layout = if config.legacy_layout() {
            StateLayout::LegacyFile
        } else {
            StateLayout::Sharded
        };
        Self::new(config.state_root())
            .with_lock_options(LockOptions::from_config(config))
            .with_layout(layout)
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_layout(mut self, layout: StateLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn legacy_file(&self) -> PathBuf {
        self.root.join(LEGACY_FILE)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn layout(&self) -> StateLayout {
        self.layout
    }

    pub fn read(&self) -> SurfResult<SurfwrightState> {
        match self.layout {
            StateLayout::Sharded => Ok(read_snapshot(&self.state_dir(), &self.legacy_file())?.state),
            StateLayout::LegacyFile => Ok(read_legacy(&self.legacy_file())?.unwrap_or_default()),
        }
    }

    pub fn revision(&self) -> SurfResult<u64> {
        read_revision(&self.state_dir())
    }

    pub fn update<T, F>(&self, mutate: F) -> SurfResult<T>
    where
        F: FnMut(&mut SurfwrightState) -> SurfResult<T>,
    {
        self.transaction().run(mutate).map(|c| c.value)
    }

    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            handle: self,
            attempts: DEFAULT_COMMIT_ATTEMPTS,
        }
    }
}

/// One logical update. The mutation may run several times and must be free of external
/// side effects; do probes and process management before or after.
#[derive(Debug)]
pub struct Transaction<'a> {
    handle: &'a StateHandle,
    attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub revision: u64,
    pub attempts: u32,
    pub wrote: bool,
}

impl Transaction<'_> {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn run<T, F>(self, mut mutate: F) -> SurfResult<Committed<T>>
    where
        F: FnMut(&mut SurfwrightState) -> SurfResult<T>,
    {
        match self.handle.layout {
            StateLayout::Sharded => self.run_sharded(&mut mutate),
            StateLayout::LegacyFile => self.run_legacy(&mut mutate),
        }
    }

    fn run_sharded<T, F>(&self, mutate: &mut F) -> SurfResult<Committed<T>>
    where
        F: FnMut(&mut SurfwrightState) -> SurfResult<T>,
    {
        let h = self.handle;
        let state_dir = h.state_dir();
        for attempt in 1..=self.attempts {
            let snapshot = read_snapshot(&state_dir, &h.legacy_file())?;
            let mut next = snapshot.state.clone();
            let value = mutate(&mut next)?;

            if next == snapshot.state && !snapshot.needs_rewrite {
                return Ok(Committed {
                    value,
                    revision: snapshot.revision,
                    attempts: attempt,
                    wrote: false,
                });
            }

            let lock = StateLock::acquire(&h.lock_path(), &h.lock)?;
            let current = read_revision(&state_dir)?;
            if current != snapshot.revision {
                tracing::debug!(
                    attempt,
                    expected = snapshot.revision,
                    found = current,
                    "state revision moved during update; retrying"
                );
                lock.release()?;
                continue;
            }

            let revision = snapshot.revision + 1;
            commit_snapshot(&state_dir, &snapshot, &next, revision)?;
            lock.release()?;
            tracing::trace!(revision, attempt, "state committed");
            return Ok(Committed {
                value,
                revision,
                attempts: attempt,
                wrote: true,
            });
        }
        Err(SurfError::StateLockTimeout {
            attempts: self.attempts,
        })
    }

    fn run_legacy<T, F>(&self, mutate: &mut F) -> SurfResult<Committed<T>>
    where
        F: FnMut(&mut SurfwrightState) -> SurfResult<T>,
    {
        let h = self.handle;
        tracing::warn!("single-file state layout is deprecated; unset SURFWRIGHT_STATE_LEGACY to use sharded state");
        let lock = StateLock::acquire(&h.lock_path(), &h.lock)?;
        let current = read_legacy(&h.legacy_file())?;
        let base = current.clone().unwrap_or_default();
        let mut next = base.clone();
        let value = mutate(&mut next)?;
        let wrote = current.is_none() || next != base;
        if wrote {
            write_legacy(&h.legacy_file(), &next)?;
        }
        lock.release()?;
        Ok(Committed {
            value,
            revision: 0,
            attempts: 1,
            wrote,
        })
    }
}
