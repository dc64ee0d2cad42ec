//! Per-file read/write arbitration
//!
//! This module provides:
//! - A controller that arbitrates reads and writes per archive file
//! - Fail-fast reader admission with strict writer priority
//! - Cancellation of pending reader acquisitions when a writer arrives
//! - Multi-path atomic write acquisition in a fixed order
//! - Stale lock-state sweeping and lock statistics
//!
//! Readers never wait for a writer: once a writer has signalled intent on a
//! path, new reader acquisitions fail with `LockedForWriting` until the
//! writer releases. Readers admitted before the writer's intent run to
//! completion; the writer waits for them but admits no newcomers.

use crate::config::FileAccessConfig;
use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Lock state for one normalized path
#[derive(Debug)]
struct PathLock {
    path: PathBuf,
    /// The underlying reader-writer primitive. Tokio's lock is
    /// write-preferring: a pending writer blocks further reader admission.
    rw: Arc<RwLock<()>>,
    active_readers: AtomicUsize,
    writers_waiting: AtomicUsize,
    writer_active: AtomicBool,
    last_access: Mutex<Instant>,
    /// Fired when a writer arrives, kicking readers pending on the read
    /// side; replaced with a fresh token when the writer releases.
    cancel: Mutex<CancellationToken>,
}

impl PathLock {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            rw: Arc::new(RwLock::new(())),
            active_readers: AtomicUsize::new(0),
            writers_waiting: AtomicUsize::new(0),
            writer_active: AtomicBool::new(false),
            last_access: Mutex::new(Instant::now()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn locked_for_writing(&self) -> bool {
        self.writers_waiting.load(Ordering::Acquire) > 0
            || self.writer_active.load(Ordering::Acquire)
    }

    fn idle(&self) -> bool {
        self.active_readers.load(Ordering::Acquire) == 0 && !self.locked_for_writing()
    }

    fn reset_cancel(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }
}

/// Scope token for an acquired read side; releases on drop.
#[derive(Debug)]
pub struct ReadToken {
    state: Arc<PathLock>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ReadToken {
    /// Path this token grants read access to.
    pub fn path(&self) -> &Path {
        &self.state.path
    }
}

impl Drop for ReadToken {
    fn drop(&mut self) {
        self.state.active_readers.fetch_sub(1, Ordering::AcqRel);
        self.state.touch();
    }
}

/// Scope token for an acquired write side; releases on drop.
#[derive(Debug)]
pub struct WriteToken {
    state: Arc<PathLock>,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl WriteToken {
    /// Path this token grants exclusive access to.
    pub fn path(&self) -> &Path {
        &self.state.path
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.state.writer_active.store(false, Ordering::Release);
        // Fresh token so subsequent readers are not born cancelled; with
        // another writer still waiting the cancelled token must stand.
        if self.state.writers_waiting.load(Ordering::Acquire) == 0 {
            self.state.reset_cancel();
        }
        self.state.touch();
    }
}

/// Write access over several paths, acquired in a fixed order.
#[derive(Debug)]
pub struct MultiWriteToken {
    tokens: Vec<WriteToken>,
}

impl MultiWriteToken {
    /// Paths covered by this token.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.tokens.iter().map(|t| t.path())
    }
}

/// Controller statistics
#[derive(Debug, Clone, Serialize)]
pub struct FileAccessStats {
    /// Lock states currently tracked
    pub tracked_paths: usize,
    /// Paths currently locked or awaited by a writer
    pub write_locked_paths: usize,
    /// Total granted read scopes
    pub read_grants: u64,
    /// Reads refused because a writer was waiting or active
    pub rejected_reads: u64,
    /// Total granted write scopes
    pub write_grants: u64,
    /// Writer acquisitions that ran out of budget
    pub write_timeouts: u64,
}

/// Arbitrates read and write access to archive files across concurrent
/// operations within this process.
pub struct FileAccessController {
    locks: DashMap<PathBuf, Arc<PathLock>>,
    config: FileAccessConfig,
    disposed: AtomicBool,
    read_grants: AtomicU64,
    rejected_reads: AtomicU64,
    write_grants: AtomicU64,
    write_timeouts: AtomicU64,
}

impl FileAccessController {
    /// Create a controller with default configuration.
    pub fn new() -> Self {
        Self::with_config(FileAccessConfig::default())
    }

    /// Create a controller with explicit configuration.
    pub fn with_config(config: FileAccessConfig) -> Self {
        Self {
            locks: DashMap::new(),
            config,
            disposed: AtomicBool::new(false),
            read_grants: AtomicU64::new(0),
            rejected_reads: AtomicU64::new(0),
            write_grants: AtomicU64::new(0),
            write_timeouts: AtomicU64::new(0),
        }
    }

    /// Normalize a path for use as a lock key: separators become forward
    /// slashes so the same file locks identically however it was spelled.
    pub fn normalize(path: &Path) -> PathBuf {
        let s = path.to_string_lossy();
        if s.contains('\\') {
            PathBuf::from(s.replace('\\', "/"))
        } else {
            PathBuf::from(s.as_ref())
        }
    }

    fn lock_state(&self, path: &Path) -> Arc<PathLock> {
        let key = Self::normalize(path);
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PathLock::new(key)))
            .clone()
    }

    fn check_disposed(&self) -> CoreResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CoreError::Disposed);
        }
        Ok(())
    }

    /// Acquire read access, failing fast if a writer is waiting or active.
    pub async fn acquire_read(&self, path: impl AsRef<Path>) -> CoreResult<ReadToken> {
        self.check_disposed()?;
        let state = self.lock_state(path.as_ref());

        if state.locked_for_writing() {
            self.rejected_reads.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::LockedForWriting {
                path: state.path.clone(),
            });
        }

        // Race the read acquisition against the per-lock cancellation
        // source; a writer arriving mid-wait kicks us out.
        let cancel = state.cancel.lock().clone();
        let guard = tokio::select! {
            guard = Arc::clone(&state.rw).read_owned() => guard,
            _ = cancel.cancelled() => {
                self.rejected_reads.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::LockedForWriting {
                    path: state.path.clone(),
                });
            }
        };

        // A writer may have signalled intent between the flag check and the
        // read grant; honor writer priority and back out.
        if state.writers_waiting.load(Ordering::Acquire) > 0 {
            drop(guard);
            self.rejected_reads.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::LockedForWriting {
                path: state.path.clone(),
            });
        }

        state.active_readers.fetch_add(1, Ordering::AcqRel);
        state.touch();
        self.read_grants.fetch_add(1, Ordering::Relaxed);
        Ok(ReadToken {
            state,
            _guard: guard,
        })
    }

    /// Acquire read access, swallowing `LockedForWriting` into `None`.
    pub async fn try_acquire_read(&self, path: impl AsRef<Path>) -> Option<ReadToken> {
        match self.acquire_read(path).await {
            Ok(token) => Some(token),
            Err(CoreError::LockedForWriting { .. }) => None,
            Err(_) => None,
        }
    }

    /// Acquire exclusive write access within `timeout`.
    ///
    /// Signals writer intent immediately (no new readers succeed from that
    /// point) and kicks readers pending on the read side. On timeout the
    /// intent is withdrawn and `WriteTimeout` carries the count of readers
    /// that were still holding the path.
    pub async fn acquire_write(
        &self,
        path: impl AsRef<Path>,
        timeout: Duration,
    ) -> CoreResult<WriteToken> {
        self.check_disposed()?;
        let state = self.lock_state(path.as_ref());

        state.writers_waiting.fetch_add(1, Ordering::AcqRel);
        state.cancel.lock().cancel();

        match tokio::time::timeout(timeout, Arc::clone(&state.rw).write_owned()).await {
            Ok(guard) => {
                state.writer_active.store(true, Ordering::Release);
                state.writers_waiting.fetch_sub(1, Ordering::AcqRel);
                state.touch();
                self.write_grants.fetch_add(1, Ordering::Relaxed);
                Ok(WriteToken {
                    state,
                    _guard: guard,
                })
            }
            Err(_) => {
                state.writers_waiting.fetch_sub(1, Ordering::AcqRel);
                if state.writers_waiting.load(Ordering::Acquire) == 0
                    && !state.writer_active.load(Ordering::Acquire)
                {
                    state.reset_cancel();
                }
                self.write_timeouts.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "write acquisition timed out on {} with {} active readers",
                    state.path.display(),
                    state.active_readers.load(Ordering::Acquire)
                );
                Err(CoreError::WriteTimeout {
                    path: state.path.clone(),
                    active_readers: state.active_readers.load(Ordering::Acquire),
                })
            }
        }
    }

    /// Acquire write access over several paths atomically.
    ///
    /// Paths are deduplicated and acquired in sorted order so concurrent
    /// multi-path writers cannot deadlock against each other; any failure
    /// releases everything acquired so far.
    pub async fn acquire_write_many(
        &self,
        paths: &[PathBuf],
        timeout: Duration,
    ) -> CoreResult<MultiWriteToken> {
        self.check_disposed()?;

        let mut normalized: Vec<PathBuf> = paths.iter().map(|p| Self::normalize(p)).collect();
        normalized.sort();
        normalized.dedup();

        let deadline = Instant::now() + timeout;
        let mut tokens = Vec::with_capacity(normalized.len());
        for path in normalized {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.acquire_write(&path, remaining).await {
                Ok(token) => tokens.push(token),
                Err(e) => {
                    // Tokens drop here, releasing everything in reverse.
                    return Err(e);
                }
            }
        }
        Ok(MultiWriteToken { tokens })
    }

    /// Whether a writer is waiting on or holding the path.
    pub fn is_locked_for_writing(&self, path: impl AsRef<Path>) -> bool {
        let key = Self::normalize(path.as_ref());
        self.locks
            .get(&key)
            .map(|s| s.locked_for_writing())
            .unwrap_or(false)
    }

    /// Number of readers currently holding the path.
    pub fn reader_count(&self, path: impl AsRef<Path>) -> usize {
        let key = Self::normalize(path.as_ref());
        self.locks
            .get(&key)
            .map(|s| s.active_readers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Drop the lock state for a path. Outstanding tokens keep their state
    /// alive; future acquisitions start fresh.
    pub fn invalidate(&self, path: impl AsRef<Path>) {
        let key = Self::normalize(path.as_ref());
        self.locks.remove(&key);
    }

    /// Drop all tracked lock states.
    pub fn invalidate_all(&self) {
        self.locks.clear();
    }

    /// Mark the controller disposed; subsequent acquisitions fail.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.locks.clear();
    }

    /// Current controller statistics.
    pub fn stats(&self) -> FileAccessStats {
        let write_locked_paths = self
            .locks
            .iter()
            .filter(|e| e.value().locked_for_writing())
            .count();
        FileAccessStats {
            tracked_paths: self.locks.len(),
            write_locked_paths,
            read_grants: self.read_grants.load(Ordering::Relaxed),
            rejected_reads: self.rejected_reads.load(Ordering::Relaxed),
            write_grants: self.write_grants.load(Ordering::Relaxed),
            write_timeouts: self.write_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Remove lock states that are idle beyond the configured stale window.
    pub fn sweep_stale(&self) -> usize {
        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        let before = self.locks.len();
        self.locks
            .retain(|_, state| !(state.idle() && state.last_access.lock().elapsed() > stale_after));
        before - self.locks.len()
    }

    /// Spawn the periodic stale sweep. The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = controller.sweep_stale();
                if removed > 0 {
                    log::debug!("file access sweep removed {} stale lock states", removed);
                }
            }
        })
    }
}

impl Default for FileAccessController {
    fn default() -> Self {
        Self::new()
    }
}
