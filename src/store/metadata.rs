//! Binary metadata cache
//!
//! This module provides:
//! - A versioned on-disk map of package key -> (record, fingerprint)
//! - Atomic replace on save (temp file + rename)
//! - Defensive load: version mismatch discards the file, per-entry errors
//!   skip the remainder without failing the load
//! - Clone-on-get and clone-on-insert so callers never alias cache state
//!
//! The on-disk file is held open only inside `load` and `save`; all other
//! operations run against the in-memory index under a reader-writer lock.

use crate::archive::Fingerprint;
use crate::error::{CoreError, CoreResult};
use crate::memory::StringPool;
use crate::store::codec::{CacheReader, CacheWriter};
use crate::store::record::PackageRecord;
use crate::store::ContentCounters;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Current on-disk format version.
pub const METADATA_CACHE_VERSION: u32 = 14;

/// Default cache file name under the application data directory.
pub const METADATA_CACHE_FILE: &str = "PackageMetadata.cache";

/// Entry-count sanity cap applied while loading.
const MAX_ENTRIES: u32 = 100_000;

struct CacheSlot {
    record: PackageRecord,
    fingerprint: Fingerprint,
}

/// Metadata cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct MetadataCacheStats {
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Versioned on-disk store of package metadata records
pub struct MetadataCache {
    path: PathBuf,
    strings: std::sync::Arc<StringPool>,
    index: RwLock<HashMap<String, CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataCache {
    /// Create a cache persisting to `dir/PackageMetadata.cache`.
    pub fn new(dir: &Path, strings: std::sync::Arc<StringPool>) -> Self {
        Self {
            path: dir.join(METADATA_CACHE_FILE),
            strings,
            index: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// On-disk path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key_of(filename: &str) -> String {
        filename.to_lowercase()
    }

    /// Load the cache file into memory.
    ///
    /// Returns `Ok(true)` when entries were loaded, `Ok(false)` when no
    /// usable file exists (absent, wrong version, or empty after defensive
    /// parsing). Never fails on a corrupt file: corruption discards.
    pub fn load(&self) -> CoreResult<bool> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut reader = CacheReader::new(BufReader::new(file));

        let version = match reader.read_u32() {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };
        if version != METADATA_CACHE_VERSION {
            log::warn!(
                "metadata cache version {} != {}, discarding",
                version,
                METADATA_CACHE_VERSION
            );
            return Ok(false);
        }

        let count = match reader.read_u32() {
            Ok(c) if c <= MAX_ENTRIES => c,
            Ok(c) => {
                log::warn!("metadata cache entry count {} exceeds cap, discarding", c);
                return Ok(false);
            }
            Err(_) => return Ok(false),
        };

        let mut loaded = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            // One bad entry abandons the remainder: framing cannot be
            // recovered mid-stream. Everything read so far is kept.
            let entry = (|| -> CoreResult<(String, CacheSlot)> {
                let key = reader.read_string()?;
                let size = reader.read_u64()?;
                let ticks = reader.read_i64()?;
                let record = PackageRecord::read(&mut reader, &self.strings)?;
                Ok((
                    Self::key_of(&key),
                    CacheSlot {
                        record,
                        fingerprint: Fingerprint::new(size, ticks),
                    },
                ))
            })();
            match entry {
                Ok((key, slot)) => {
                    loaded.insert(key, slot);
                }
                Err(e) => {
                    log::warn!("skipping bad metadata cache entry: {}", e);
                    break;
                }
            }
        }

        let any = !loaded.is_empty();
        *self.index.write() = loaded;
        Ok(any)
    }

    /// Write the cache atomically: temp file, flush, rename over target.
    pub fn save(&self) -> CoreResult<()> {
        let tmp = self.path.with_extension("cache.tmp");
        let result = (|| -> CoreResult<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&tmp)?;
            let mut writer = CacheWriter::new(BufWriter::new(file));

            let index = self.index.read();
            writer.write_u32(METADATA_CACHE_VERSION)?;
            writer.write_u32(index.len() as u32)?;
            for (key, slot) in index.iter() {
                writer.write_string(key)?;
                writer.write_u64(slot.fingerprint.size)?;
                writer.write_i64(slot.fingerprint.ticks)?;
                slot.record.write(&mut writer)?;
            }
            drop(index);

            let mut buffered = writer.into_inner();
            buffered.flush()?;
            buffered.get_ref().sync_all()?;
            drop(buffered);

            // Rename replaces the destination atomically; the prior file
            // stays intact until this succeeds.
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Fetch a record if the stored fingerprint matches the current one.
    ///
    /// Returns a clone; mutating it never affects cache state.
    pub fn try_get(&self, filename: &str, fingerprint: Fingerprint) -> Option<PackageRecord> {
        let index = self.index.read();
        match index.get(&Self::key_of(filename)) {
            Some(slot) if slot.fingerprint == fingerprint => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.record.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a record under the given fingerprint.
    pub fn put(&self, filename: &str, record: PackageRecord, fingerprint: Fingerprint) {
        self.index.write().insert(
            Self::key_of(filename),
            CacheSlot {
                record,
                fingerprint,
            },
        );
    }

    /// Remove one entry.
    pub fn remove(&self, filename: &str) {
        self.index.write().remove(&Self::key_of(filename));
    }

    /// Whether a key is present regardless of fingerprint.
    pub fn contains(&self, filename: &str) -> bool {
        self.index.read().contains_key(&Self::key_of(filename))
    }

    /// Mutate the content counters of a cached record in place.
    ///
    /// A no-op when the key is absent; only the cached copy changes, never
    /// records previously handed out.
    pub fn update_content_counters(&self, filename: &str, counters: ContentCounters) {
        if let Some(slot) = self.index.write().get_mut(&Self::key_of(filename)) {
            slot.record.counters = counters;
        }
    }

    /// Replace the whole in-memory index from an external map.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = (String, PackageRecord, Fingerprint)>) {
        let mut fresh = HashMap::new();
        for (key, record, fingerprint) in entries {
            fresh.insert(
                Self::key_of(&key),
                CacheSlot {
                    record,
                    fingerprint,
                },
            );
        }
        *self.index.write() = fresh;
    }

    /// Clear the in-memory index and reset statistics.
    pub fn clear(&self) {
        self.clear_memory();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Drop every in-memory entry; the on-disk file is untouched.
    pub fn clear_memory(&self) {
        self.index.write().clear();
    }

    /// Drop everything in memory and delete the on-disk file.
    pub fn clear_completely(&self) -> CoreResult<()> {
        self.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> MetadataCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        MetadataCacheStats {
            entry_count: self.index.read().len(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}
