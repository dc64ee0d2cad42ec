//! Search response cache
//!
//! This module provides:
//! - A keyed store of JSON UTF-8 search responses (`HubSearch.cache`)
//! - The same on-disk family as the other caches: magic, version, count,
//!   then keyed entries
//! - Time-based expiry of stale responses

use crate::error::{CoreError, CoreResult};
use crate::store::codec::{CacheReader, CacheWriter};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Magic prefix of the cache file: "VPMS" little-endian.
pub const SEARCH_CACHE_MAGIC: u32 = 0x5650_4D53;

/// Current on-disk format version.
pub const SEARCH_CACHE_VERSION: u32 = 1;

/// Default cache file name under the application data directory.
pub const SEARCH_CACHE_FILE: &str = "HubSearch.cache";

struct CachedResponse {
    /// Unix milliseconds at which the response was stored
    stored_at_ms: i64,
    /// Raw JSON UTF-8 payload
    payload: Vec<u8>,
}

/// Search cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct SearchCacheStats {
    pub entry_count: usize,
    pub payload_bytes: usize,
}

/// On-disk cache of hub search responses
pub struct SearchCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, CachedResponse>>,
}

impl SearchCache {
    /// Create a cache persisting to `dir/HubSearch.cache`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SEARCH_CACHE_FILE),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// On-disk path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key_of(query: &str) -> String {
        query.to_lowercase()
    }

    /// Load the cache file; bad magic or version discards it.
    pub fn load(&self) -> CoreResult<bool> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut reader = CacheReader::new(BufReader::new(file));

        let header = (|| -> CoreResult<(u32, u32, u32)> {
            Ok((reader.read_u32()?, reader.read_u32()?, reader.read_u32()?))
        })();
        let (magic, version, count) = match header {
            Ok(h) => h,
            Err(_) => return Ok(false),
        };
        if magic != SEARCH_CACHE_MAGIC || version != SEARCH_CACHE_VERSION {
            log::warn!("search cache header mismatch, discarding");
            return Ok(false);
        }

        let mut loaded = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let entry = (|| -> CoreResult<(String, CachedResponse)> {
                let key = reader.read_string()?;
                let stored_at_ms = reader.read_i64()?;
                let payload = reader.read_bytes()?;
                Ok((
                    key,
                    CachedResponse {
                        stored_at_ms,
                        payload,
                    },
                ))
            })();
            match entry {
                Ok((key, response)) => {
                    loaded.insert(key, response);
                }
                Err(_) => break,
            }
        }

        let any = !loaded.is_empty();
        *self.entries.write() = loaded;
        Ok(any)
    }

    /// Write the cache atomically.
    pub fn save(&self) -> CoreResult<()> {
        let tmp = self.path.with_extension("cache.tmp");
        let result = (|| -> CoreResult<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&tmp)?;
            let mut writer = CacheWriter::new(BufWriter::new(file));

            let entries = self.entries.read();
            writer.write_u32(SEARCH_CACHE_MAGIC)?;
            writer.write_u32(SEARCH_CACHE_VERSION)?;
            writer.write_u32(entries.len() as u32)?;
            for (key, response) in entries.iter() {
                writer.write_string(key)?;
                writer.write_i64(response.stored_at_ms)?;
                writer.write_bytes(&response.payload)?;
            }
            drop(entries);

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

    /// Fetch a cached response no older than `max_age`.
    pub fn get(&self, query: &str, max_age: Duration) -> Option<serde_json::Value> {
        let entries = self.entries.read();
        let response = entries.get(&Self::key_of(query))?;
        let age_ms = Utc::now().timestamp_millis() - response.stored_at_ms;
        if age_ms < 0 || age_ms as u128 >= max_age.as_millis() {
            return None;
        }
        serde_json::from_slice(&response.payload).ok()
    }

    /// Store a response for a query.
    pub fn put(&self, query: &str, response: &serde_json::Value) {
        let payload = serde_json::to_vec(response).unwrap_or_default();
        self.entries.write().insert(
            Self::key_of(query),
            CachedResponse {
                stored_at_ms: Utc::now().timestamp_millis(),
                payload,
            },
        );
    }

    /// Drop entries older than `max_age`; returns how many were removed.
    pub fn purge_expired(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, r| r.stored_at_ms > cutoff);
        before - entries.len()
    }

    /// Drop everything in memory and delete the file.
    pub fn clear(&self) -> CoreResult<()> {
        self.entries.write().clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> SearchCacheStats {
        let entries = self.entries.read();
        SearchCacheStats {
            entry_count: entries.len(),
            payload_bytes: entries.values().map(|r| r.payload.len()).sum(),
        }
    }
}
