//! Virtual view of a single compressed archive
//!
//! This module provides:
//! - Directory-only initialization: the container is opened once, its
//!   central directory captured, and the file closed again
//! - On-demand decompression of individual entries into fresh buffers
//! - Strong/weak payload tiering under a per-archive byte cap
//!
//! Entries never own the archive; the archive owns its entries, and a
//! payload is either strong (pinned) or weak (reclaimable). Readers must
//! treat a missing weak payload as "reload needed".

use crate::archive::fingerprint::Fingerprint;
use crate::config::ArchiveCacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::memory::StringPool;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use zip::ZipArchive;

/// Payload slot of one entry
enum PayloadSlot {
    Empty,
    /// Pinned in memory; counts against the per-archive cap
    Strong(Arc<Vec<u8>>),
    /// Reclaimable; alive only while some reader still holds it
    Weak(Weak<Vec<u8>>),
}

/// One entry of the archive directory
pub struct ArchiveEntry {
    /// Path within the archive, forward-slash normalized, original casing
    pub path: Arc<str>,
    /// Compressed size in the container
    pub compressed_size: u64,
    /// Uncompressed size
    pub uncompressed_size: u64,
    /// Directory marker; directories never hold payloads
    pub is_dir: bool,
    payload: Mutex<PayloadSlot>,
}

impl ArchiveEntry {
    fn new(path: Arc<str>, compressed_size: u64, uncompressed_size: u64, is_dir: bool) -> Self {
        Self {
            path,
            compressed_size,
            uncompressed_size,
            is_dir,
            payload: Mutex::new(PayloadSlot::Empty),
        }
    }

    /// Live payload, if any tier still holds one.
    fn cached(&self) -> Option<Arc<Vec<u8>>> {
        match &*self.payload.lock() {
            PayloadSlot::Empty => None,
            PayloadSlot::Strong(data) => Some(Arc::clone(data)),
            PayloadSlot::Weak(weak) => weak.upgrade(),
        }
    }
}

/// Normalize an entry path for case-insensitive lookup.
pub(crate) fn entry_key(path: &str) -> String {
    if path.contains('\\') {
        path.replace('\\', "/").to_lowercase()
    } else {
        path.to_lowercase()
    }
}

/// Cached directory view of one archive on disk
pub struct VirtualArchive {
    path: PathBuf,
    fingerprint: Fingerprint,
    /// Directory snapshot, keyed case-insensitively. Immutable after
    /// initialization, so batched reads observe a consistent view.
    entries: HashMap<String, ArchiveEntry>,
    /// Bytes currently held in the strong tier
    cached_bytes: AtomicU64,
    last_access: Mutex<Instant>,
    invalid: AtomicBool,
    /// Internal write side taken while refreshing payloads from disk
    refresh: RwLock<()>,
}

impl VirtualArchive {
    /// Open `path`, read the container directory, and close the file.
    ///
    /// The caller is expected to hold a read scope from the file access
    /// controller for the duration of this call.
    pub fn open(path: &Path, strings: &StringPool) -> CoreResult<Self> {
        let fingerprint = Fingerprint::of_file(path)?;
        let file = File::open(path)?;
        let mut container = ZipArchive::new(file)
            .map_err(|e| CoreError::Corrupt(format!("{}: {}", path.display(), e)))?;

        let mut entries = HashMap::with_capacity(container.len());
        for index in 0..container.len() {
            let entry = container
                .by_index_raw(index)
                .map_err(|e| CoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
            let name = strings.intern_path(entry.name());
            let key = entry_key(&name);
            entries.insert(
                key,
                ArchiveEntry::new(name, entry.compressed_size(), entry.size(), entry.is_dir()),
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            fingerprint,
            entries,
            cached_bytes: AtomicU64::new(0),
            last_access: Mutex::new(Instant::now()),
            invalid: AtomicBool::new(false),
            refresh: RwLock::new(()),
        })
    }

    /// Archive path on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fingerprint captured at initialization.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Whether the archive has been marked invalid.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark the archive invalid; the cache evicts it on observation.
    pub fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    /// Whether the on-disk file still matches the captured fingerprint.
    pub fn is_current(&self) -> bool {
        matches!(Fingerprint::of_file(&self.path), Ok(fp) if fp == self.fingerprint)
    }

    /// Number of directory entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Strong-tier bytes currently cached.
    pub fn cached_bytes(&self) -> u64 {
        self.cached_bytes.load(Ordering::Acquire)
    }

    /// Seconds since the archive was last touched.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_access.lock().elapsed()
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Look up an entry by archive-internal path (case-insensitive).
    pub fn entry(&self, entry_path: &str) -> Option<&ArchiveEntry> {
        self.entries.get(&entry_key(entry_path))
    }

    /// Iterate the directory snapshot.
    pub fn entries(&self) -> impl Iterator<Item = &ArchiveEntry> {
        self.entries.values()
    }

    /// Serve an entry payload from memory, if a live tier holds it.
    pub fn cached_payload(&self, entry_path: &str) -> Option<Arc<Vec<u8>>> {
        let entry = self.entry(entry_path)?;
        if entry.is_dir {
            return None;
        }
        let payload = entry.cached()?;
        self.touch();
        Some(payload)
    }

    /// Decompress one entry from an already-open container into a fresh
    /// buffer. Synchronous; callers wrap in `spawn_blocking`.
    fn extract(container: &mut ZipArchive<File>, name: &str) -> CoreResult<Vec<u8>> {
        let mut file = container
            .by_name(name)
            .map_err(|e| CoreError::Corrupt(format!("{name}: {e}")))?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Store a freshly decompressed payload, deciding its tier.
    ///
    /// Large payloads and payloads that would push the archive past its
    /// strong cap go to the weak tier; everything else is pinned strong.
    fn store_payload(
        &self,
        entry: &ArchiveEntry,
        data: Vec<u8>,
        config: &ArchiveCacheConfig,
    ) -> Arc<Vec<u8>> {
        let size = data.len() as u64;
        let data = Arc::new(data);
        let strong_total = self.cached_bytes.load(Ordering::Acquire);

        let mut slot = entry.payload.lock();
        // Replacing a strong payload gives its bytes back first.
        if let PayloadSlot::Strong(old) = &*slot {
            self.cached_bytes
                .fetch_sub(old.len() as u64, Ordering::AcqRel);
        }
        if size > config.weak_threshold || strong_total + size > config.per_archive_cap {
            *slot = PayloadSlot::Weak(Arc::downgrade(&data));
        } else {
            self.cached_bytes.fetch_add(size, Ordering::AcqRel);
            *slot = PayloadSlot::Strong(Arc::clone(&data));
        }
        data
    }

    /// Read one entry from disk under the archive's internal write side,
    /// re-checking the fingerprint first.
    ///
    /// Returns `None` (after marking the archive invalid) on fingerprint
    /// mismatch or container errors; the caller holds a controller read
    /// scope for the whole call.
    pub async fn read_entry_from_disk(
        &self,
        entry_path: &str,
        config: &ArchiveCacheConfig,
    ) -> Option<Arc<Vec<u8>>> {
        let entry = self.entry(entry_path)?;
        if entry.is_dir {
            return None;
        }

        let _refresh = self.refresh.write().await;

        // Another reader may have populated the slot while we waited.
        if let Some(payload) = entry.cached() {
            self.touch();
            return Some(payload);
        }

        if !self.is_current() {
            log::debug!(
                "fingerprint changed under {}, invalidating",
                self.path.display()
            );
            self.mark_invalid();
            return None;
        }

        let path = self.path.clone();
        let name = entry.path.to_string();
        let result = tokio::task::spawn_blocking(move || -> CoreResult<Vec<u8>> {
            let file = File::open(&path)?;
            let mut container = ZipArchive::new(file)
                .map_err(|e| CoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
            Self::extract(&mut container, &name)
        })
        .await;

        match result {
            Ok(Ok(data)) => {
                self.touch();
                Some(self.store_payload(entry, data, config))
            }
            Ok(Err(e)) => {
                log::warn!("entry read failed on {}: {}", self.path.display(), e);
                if matches!(e, CoreError::Corrupt(_)) {
                    self.mark_invalid();
                }
                None
            }
            Err(_) => None,
        }
    }

    /// Read several entries with a single container open.
    ///
    /// Entries already live in memory never touch the file. Returns the
    /// payloads found, keyed by the requested path strings.
    pub async fn read_entries_from_disk(
        &self,
        entry_paths: &[String],
        config: &ArchiveCacheConfig,
    ) -> HashMap<String, Arc<Vec<u8>>> {
        let mut found = HashMap::new();
        let mut missing: Vec<String> = Vec::new();

        for requested in entry_paths {
            match self.entry(requested) {
                Some(entry) if !entry.is_dir => {
                    if let Some(payload) = entry.cached() {
                        found.insert(requested.clone(), payload);
                    } else {
                        missing.push(requested.clone());
                    }
                }
                _ => {}
            }
        }

        if missing.is_empty() {
            if !found.is_empty() {
                self.touch();
            }
            return found;
        }

        let _refresh = self.refresh.write().await;

        if !self.is_current() {
            self.mark_invalid();
            return found;
        }

        let path = self.path.clone();
        let names: Vec<(String, String)> = missing
            .iter()
            .filter_map(|req| self.entry(req).map(|e| (req.clone(), e.path.to_string())))
            .collect();

        let extracted = tokio::task::spawn_blocking(
            move || -> CoreResult<Vec<(String, Vec<u8>)>> {
                let file = File::open(&path)?;
                let mut container = ZipArchive::new(file)
                    .map_err(|e| CoreError::Corrupt(format!("{}: {}", path.display(), e)))?;
                let mut out = Vec::with_capacity(names.len());
                for (requested, name) in names {
                    // Individual bad entries are skipped, not fatal.
                    if let Ok(data) = Self::extract(&mut container, &name) {
                        out.push((requested, data));
                    }
                }
                Ok(out)
            },
        )
        .await;

        if let Ok(Ok(loaded)) = extracted {
            for (requested, data) in loaded {
                if let Some(entry) = self.entry(&requested) {
                    let payload = self.store_payload(entry, data, config);
                    found.insert(requested, payload);
                }
            }
            self.touch();
        }

        found
    }

    /// Drop every payload, both tiers.
    pub fn release_payloads(&self) {
        for entry in self.entries.values() {
            let mut slot = entry.payload.lock();
            if let PayloadSlot::Strong(data) = &*slot {
                self.cached_bytes
                    .fetch_sub(data.len() as u64, Ordering::AcqRel);
            }
            *slot = PayloadSlot::Empty;
        }
    }

    /// Demote every strong payload to the weak tier.
    pub fn demote_to_weak(&self) {
        for entry in self.entries.values() {
            let mut slot = entry.payload.lock();
            if let PayloadSlot::Strong(data) = &*slot {
                let weak = Arc::downgrade(data);
                self.cached_bytes
                    .fetch_sub(data.len() as u64, Ordering::AcqRel);
                *slot = PayloadSlot::Weak(weak);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn write_test_archive(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (entry_name, data) in files {
            writer
                .start_file(*entry_name, FileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn test_config() -> ArchiveCacheConfig {
        ArchiveCacheConfig::default()
    }

    #[test]
    fn test_open_reads_directory_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(
            dir.path(),
            "pack.var",
            &[("meta.json", b"{}"), ("Custom/Hair/a.vam", b"hair")],
        );
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();
        assert_eq!(archive.entry_count(), 2);
        assert_eq!(archive.cached_bytes(), 0);
        assert!(archive.entry("meta.json").is_some());
    }

    #[test]
    fn test_entry_lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), "pack.var", &[("Custom/Hair/A.vam", b"x")]);
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();
        assert!(archive.entry("custom/hair/a.vam").is_some());
        assert!(archive.entry("Custom\\Hair\\A.vam").is_some());
    }

    #[tokio::test]
    async fn test_read_entry_populates_strong_tier() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), "pack.var", &[("meta.json", b"{\"a\":1}")]);
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();

        let payload = archive
            .read_entry_from_disk("meta.json", &test_config())
            .await
            .unwrap();
        assert_eq!(&**payload, b"{\"a\":1}");
        assert_eq!(archive.cached_bytes(), 7);

        // Second read is served from memory.
        let again = archive.cached_payload("meta.json").unwrap();
        assert!(Arc::ptr_eq(&payload, &again));
    }

    #[tokio::test]
    async fn test_large_payload_goes_weak() {
        let dir = tempfile::tempdir().unwrap();
        let big = vec![0u8; 2048];
        let path = write_test_archive(dir.path(), "pack.var", &[("big.bin", big.as_slice())]);
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();

        let config = ArchiveCacheConfig {
            weak_threshold: 1024,
            ..Default::default()
        };
        let payload = archive
            .read_entry_from_disk("big.bin", &config)
            .await
            .unwrap();
        // Weak tier does not count against the strong byte counter.
        assert_eq!(archive.cached_bytes(), 0);

        // Alive while we hold it...
        assert!(archive.cached_payload("big.bin").is_some());
        drop(payload);
        // ...gone once the last strong reference drops.
        assert!(archive.cached_payload("big.bin").is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), "pack.var", &[("a.json", b"one")]);
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();

        // Replace the file with different content (and size).
        write_test_archive(dir.path(), "pack.var", &[("a.json", b"different-longer")]);

        let result = archive.read_entry_from_disk("a.json", &test_config()).await;
        assert!(result.is_none());
        assert!(archive.is_invalid());
    }

    #[tokio::test]
    async fn test_directory_entries_never_hold_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.var");
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .add_directory("Custom/", FileOptions::default())
            .unwrap();
        writer.finish().unwrap();

        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();
        assert!(archive
            .read_entry_from_disk("Custom/", &test_config())
            .await
            .is_none());
        assert!(archive.cached_payload("Custom/").is_none());
    }

    #[tokio::test]
    async fn test_release_and_demote() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(dir.path(), "pack.var", &[("a.json", b"payload")]);
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();

        let held = archive
            .read_entry_from_disk("a.json", &test_config())
            .await
            .unwrap();
        assert!(archive.cached_bytes() > 0);

        archive.demote_to_weak();
        assert_eq!(archive.cached_bytes(), 0);
        // Still reachable while held.
        assert!(archive.cached_payload("a.json").is_some());

        archive.release_payloads();
        assert!(archive.cached_payload("a.json").is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_batch_read_single_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_test_archive(
            dir.path(),
            "pack.var",
            &[("a.json", b"aa"), ("b.json", b"bb"), ("c.json", b"cc")],
        );
        let strings = StringPool::new();
        let archive = VirtualArchive::open(&path, &strings).unwrap();

        // Prime one entry so the batch mixes memory and disk hits.
        archive
            .read_entry_from_disk("a.json", &test_config())
            .await
            .unwrap();

        let requested = vec![
            "a.json".to_string(),
            "b.json".to_string(),
            "c.json".to_string(),
            "absent.json".to_string(),
        ];
        let found = archive
            .read_entries_from_disk(&requested, &test_config())
            .await;
        assert_eq!(found.len(), 3);
        assert_eq!(&**found.get("b.json").unwrap(), b"bb");
        assert!(!found.contains_key("absent.json"));
    }
}
