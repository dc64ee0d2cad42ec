//! Virtual archive cache
//!
//! This module provides:
//! - A lock-free map of open virtual archives keyed by path
//! - Entry reads that go through the file access controller
//! - A background sweep enforcing idle eviction and the global strong cap
//!
//! Reads are speculative: every failure path returns `None` and never
//! propagates an error to the caller.

pub mod fingerprint;
pub mod virtual_archive;

pub use fingerprint::Fingerprint;
pub use virtual_archive::{ArchiveEntry, VirtualArchive};

use crate::config::ArchiveCacheConfig;
use crate::fileaccess::FileAccessController;
use crate::memory::StringPool;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveCacheStats {
    /// Archives currently cached
    pub archive_count: usize,
    /// Directory entries across all archives
    pub entry_count: usize,
    /// Strong-tier bytes across all archives
    pub cached_bytes: u64,
    /// Payload reads served from memory
    pub hits: u64,
    /// Payload reads that went to disk or failed
    pub misses: u64,
}

/// Cache of virtual archives with on-demand entry loading
pub struct ArchiveCache {
    archives: DashMap<PathBuf, Arc<VirtualArchive>>,
    controller: Arc<FileAccessController>,
    strings: Arc<StringPool>,
    config: ArchiveCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ArchiveCache {
    /// Create a cache backed by the given controller and string pool.
    pub fn new(
        controller: Arc<FileAccessController>,
        strings: Arc<StringPool>,
        config: ArchiveCacheConfig,
    ) -> Self {
        Self {
            archives: DashMap::new(),
            controller,
            strings,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get the virtual archive for `path`, initializing it on first use.
    ///
    /// An archive previously marked invalid is discarded and re-opened.
    /// Returns `None` when the file cannot be opened or is not a valid
    /// container.
    pub async fn get_or_create(&self, path: impl AsRef<Path>) -> Option<Arc<VirtualArchive>> {
        let key = FileAccessController::normalize(path.as_ref());

        if let Some(existing) = self.archives.get(&key) {
            let archive = Arc::clone(existing.value());
            drop(existing);
            if archive.is_invalid() {
                self.archives.remove(&key);
            } else {
                archive.touch();
                return Some(archive);
            }
        }

        // Directory read happens under a fail-fast read scope; a writer on
        // the path simply means no archive view right now.
        let _read = self.controller.try_acquire_read(&key).await?;
        let opened = {
            let strings = Arc::clone(&self.strings);
            let open_path = key.clone();
            tokio::task::spawn_blocking(move || VirtualArchive::open(&open_path, &strings))
                .await
                .ok()?
        };

        match opened {
            Ok(archive) => {
                let archive = Arc::new(archive);
                self.archives.insert(key, Arc::clone(&archive));
                Some(archive)
            }
            Err(e) => {
                log::warn!("failed to open archive {}: {}", key.display(), e);
                None
            }
        }
    }

    /// Read one entry payload, loading from disk on a memory miss.
    pub async fn read_entry(
        &self,
        archive: &Arc<VirtualArchive>,
        entry_path: &str,
    ) -> Option<Arc<Vec<u8>>> {
        if let Some(payload) = archive.cached_payload(entry_path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(payload);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Fail-fast read scope: a waiting writer turns this read into a miss.
        let _read = self.controller.try_acquire_read(archive.path()).await?;
        let result = archive
            .read_entry_from_disk(entry_path, &self.config)
            .await;
        if archive.is_invalid() {
            self.evict(archive.path());
        }
        result
    }

    /// Read several entries, opening the container at most once.
    pub async fn read_entries_batch(
        &self,
        archive: &Arc<VirtualArchive>,
        entry_paths: &[String],
    ) -> HashMap<String, Arc<Vec<u8>>> {
        let Some(_read) = self.controller.try_acquire_read(archive.path()).await else {
            return HashMap::new();
        };
        let found = archive
            .read_entries_from_disk(entry_paths, &self.config)
            .await;
        if archive.is_invalid() {
            self.evict(archive.path());
        }
        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses
            .fetch_add((entry_paths.len() - found.len()) as u64, Ordering::Relaxed);
        found
    }

    /// Drop one archive from the cache.
    pub fn evict(&self, path: &Path) {
        let key = FileAccessController::normalize(path);
        self.archives.remove(&key);
    }

    /// Drop every payload in every archive, keeping the directory views.
    pub fn release_memory(&self) {
        for entry in self.archives.iter() {
            entry.value().release_payloads();
        }
    }

    /// Demote every strong payload in every archive.
    pub fn demote_all(&self) {
        for entry in self.archives.iter() {
            entry.value().demote_to_weak();
        }
    }

    /// Strong-tier bytes across all archives.
    pub fn cached_bytes(&self) -> u64 {
        self.archives.iter().map(|e| e.value().cached_bytes()).sum()
    }

    /// Current cache statistics.
    pub fn stats(&self) -> ArchiveCacheStats {
        ArchiveCacheStats {
            archive_count: self.archives.len(),
            entry_count: self.archives.iter().map(|e| e.value().entry_count()).sum(),
            cached_bytes: self.cached_bytes(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// One maintenance pass: evict idle archives, then demote
    /// oldest-accessed archives while the global strong cap is exceeded.
    pub fn sweep(&self) {
        let idle_cutoff = Duration::from_secs(self.config.idle_evict_secs);
        let mut evicted = 0usize;
        self.archives.retain(|_, archive| {
            let stale = archive.idle_for() > idle_cutoff || archive.is_invalid();
            if stale {
                archive.release_payloads();
                evicted += 1;
            }
            !stale
        });

        let target = (self.config.global_cap as f64 * self.config.demote_to_fraction) as u64;
        if self.cached_bytes() > self.config.global_cap {
            // Oldest-accessed first until below the demotion target.
            let mut by_age: Vec<Arc<VirtualArchive>> = self
                .archives
                .iter()
                .map(|e| Arc::clone(e.value()))
                .collect();
            by_age.sort_by_key(|a| std::cmp::Reverse(a.idle_for()));
            for archive in by_age {
                if self.cached_bytes() <= target {
                    break;
                }
                archive.demote_to_weak();
            }
        }

        if evicted > 0 {
            log::debug!("archive sweep evicted {} idle archives", evicted);
        }
    }

    /// Spawn the periodic sweep. The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}
