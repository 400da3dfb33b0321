//! Single-flight run lock.
//!
//! A lock file records which run holds the pipeline and under which process
//! id. A lock whose pid no longer corresponds to a live process is stale and
//! reclaimable; `force_clear` is the operator escape hatch and is surfaced as
//! an event by the orchestrator because misuse can violate the single-flight
//! invariant.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::ids::RunId;

/// Liveness oracle for lock-holder pids. A trait so tests can simulate dead
/// holders without forking processes.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with `pid` currently exists.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Default)]
pub struct SystemProcessProbe;

impl ProcessProbe for SystemProcessProbe {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        // kill(pid, 0) probes existence without delivering a signal.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        // No portable probe here; treat the lock as live and rely on the
        // operator escape hatch.
        true
    }
}

/// Contents of the lock file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Run that acquired the lock.
    pub holder_run_id: RunId,
    /// Process id of the orchestrator that acquired it.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// Mutual-exclusion guard ensuring at most one pipeline run at a time.
pub struct RunLock {
    path: PathBuf,
    probe: Arc<dyn ProcessProbe>,
    // Serializes in-process acquire/release/clear so two local callers cannot
    // interleave read-then-write on the lock file.
    guard: Mutex<()>,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl RunLock {
    /// Lock backed by the file at `path`, using `probe` for holder liveness.
    pub fn new(path: impl Into<PathBuf>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            path: path.into(),
            probe,
            guard: Mutex::new(()),
        }
    }

    /// Attempt to take the lock for `run_id`. Returns `false` when a valid
    /// lock is held by a different run; stale locks are reclaimed on the way.
    pub async fn try_acquire(&self, run_id: RunId) -> Result<bool> {
        let _guard = self.guard.lock().await;

        if let Some(meta) = self.read().await? {
            if meta.holder_run_id == run_id {
                return Ok(true);
            }
            if self.probe.is_alive(meta.pid) {
                return Ok(false);
            }
            tracing::warn!(
                target: "conveyor::lock",
                holder = %meta.holder_run_id,
                pid = meta.pid,
                "reclaiming stale run lock from dead process"
            );
        }

        self.write(run_id).await?;
        Ok(true)
    }

    /// Release the lock if `run_id` still holds it.
    pub async fn release(&self, run_id: RunId) -> Result<()> {
        let _guard = self.guard.lock().await;

        match self.read().await? {
            Some(meta) if meta.holder_run_id == run_id => {
                tokio::fs::remove_file(&self.path).await?;
                Ok(())
            }
            Some(meta) => {
                tracing::debug!(
                    target: "conveyor::lock",
                    holder = %meta.holder_run_id,
                    releasing = %run_id,
                    "release skipped, lock held by a different run"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Whether the current lock, if any, belongs to a dead process.
    pub async fn is_stale(&self) -> Result<bool> {
        let _guard = self.guard.lock().await;
        Ok(match self.read().await? {
            Some(meta) => !self.probe.is_alive(meta.pid),
            None => false,
        })
    }

    /// Current lock metadata, if a lock file exists and parses.
    pub async fn current(&self) -> Result<Option<LockMetadata>> {
        let _guard = self.guard.lock().await;
        self.read().await
    }

    /// Remove the lock unconditionally, returning what it held. Operator
    /// escape hatch; callers must log it.
    pub async fn force_clear(&self) -> Result<Option<LockMetadata>> {
        let _guard = self.guard.lock().await;

        let meta = self.read().await?;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(meta)
    }

    async fn read(&self) -> Result<Option<LockMetadata>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str::<LockMetadata>(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(err) => {
                // A torn or corrupt lock file cannot name a live holder;
                // treat it as reclaimable.
                tracing::warn!(
                    target: "conveyor::lock",
                    error = %err,
                    "lock file unreadable, treating as absent"
                );
                Ok(None)
            }
        }
    }

    async fn write(&self, run_id: RunId) -> Result<()> {
        let meta = LockMetadata {
            holder_run_id: run_id,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let raw = serde_json::to_vec(&meta)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Probe whose answer the test controls.
    #[derive(Debug)]
    struct FakeProbe {
        alive: AtomicBool,
    }

    impl FakeProbe {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
            })
        }

        fn set_alive(&self, alive: bool) {
            self.alive.store(alive, Ordering::SeqCst);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn lock_in(dir: &tempfile::TempDir, probe: Arc<dyn ProcessProbe>) -> RunLock {
        RunLock::new(dir.path().join("run.lock"), probe)
    }

    #[tokio::test]
    async fn second_acquire_fails_while_holder_is_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(&dir, FakeProbe::new(true));

        let first = RunId::new();
        let second = RunId::new();
        assert!(lock.try_acquire(first).await.expect("acquire"));
        assert!(!lock.try_acquire(second).await.expect("acquire"));

        // Re-acquire by the holder is idempotent.
        assert!(lock.try_acquire(first).await.expect("acquire"));

        lock.release(first).await.expect("release");
        assert!(lock.try_acquire(second).await.expect("acquire"));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = FakeProbe::new(true);
        let lock = lock_in(&dir, probe.clone());

        let dead_run = RunId::new();
        assert!(lock.try_acquire(dead_run).await.expect("acquire"));

        probe.set_alive(false);
        assert!(lock.is_stale().await.expect("is_stale"));

        let next = RunId::new();
        assert!(lock.try_acquire(next).await.expect("reclaim"));
        let meta = lock.current().await.expect("current").expect("metadata");
        assert_eq!(meta.holder_run_id, next);
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(&dir, FakeProbe::new(true));

        let holder = RunId::new();
        assert!(lock.try_acquire(holder).await.expect("acquire"));
        lock.release(RunId::new()).await.expect("release");
        assert_eq!(
            lock.current()
                .await
                .expect("current")
                .expect("metadata")
                .holder_run_id,
            holder
        );
    }

    #[tokio::test]
    async fn force_clear_removes_a_live_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = lock_in(&dir, FakeProbe::new(true));

        let holder = RunId::new();
        assert!(lock.try_acquire(holder).await.expect("acquire"));

        let cleared = lock.force_clear().await.expect("force_clear");
        assert_eq!(cleared.expect("metadata").holder_run_id, holder);
        assert!(lock.try_acquire(RunId::new()).await.expect("acquire"));
    }

    #[tokio::test]
    async fn corrupt_lock_file_is_reclaimable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        tokio::fs::write(&path, b"not json").await.expect("write");

        let lock = RunLock::new(&path, FakeProbe::new(true));
        assert!(lock.try_acquire(RunId::new()).await.expect("acquire"));
    }
}
