//! Image disk cache
//!
//! This module provides:
//! - A versioned blob store (`PackageImages.cache`) with an in-memory
//!   offset index and payloads left on disk until read
//! - AES-CBC encrypted payloads keyed by package key + internal path
//! - A bounded LRU of recently used encrypted blobs
//! - Pending-writes staging with a coalesced single-flight async save
//! - Legacy v1 (inline payloads) migration into the current v2 layout
//!
//! Save protocol: index payloads are read back from disk and merged with
//! pending writes, the index is written with placeholder offsets, payloads
//! are streamed while their real offsets are recorded, the placeholders are
//! patched, and the file is atomically renamed over the old one.

use crate::archive::Fingerprint;
use crate::config::ImageCacheConfig;
use crate::error::{CoreError, CoreResult};
use crate::memory::BufferPool;
use crate::store::codec::{CacheReader, CacheWriter};
use crate::store::crypto::{package_key, PayloadCipher};
use image::DynamicImage;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Magic prefix of the cache file: "VPMI" little-endian.
pub const IMAGE_CACHE_MAGIC: u32 = 0x5650_4D49;

/// Current on-disk format version.
pub const IMAGE_CACHE_VERSION: u32 = 2;

/// Legacy version with inline payloads, migrated on load.
const IMAGE_CACHE_VERSION_LEGACY: u32 = 1;

/// Default cache file name under the application data directory.
pub const IMAGE_CACHE_FILE: &str = "PackageImages.cache";

type BlobKey = (String, String);

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    length: u32,
}

/// Outcome of loading the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLoad {
    /// No usable file on disk; index is empty
    Absent,
    /// Current-version index loaded
    Loaded,
    /// Legacy file staged into pending writes; a save should follow
    LegacyMigrated,
}

struct Inner {
    /// package key -> internal path -> (offset, length) on disk
    index: HashMap<String, HashMap<String, IndexEntry>>,
    /// Encrypted blobs touched recently
    lru: LruCache<BlobKey, Arc<Vec<u8>>>,
    /// Encrypted blobs not yet persisted
    pending: HashMap<String, HashMap<String, Vec<u8>>>,
    /// Entries that decoded to garbage once; never decoded again
    invalid: HashSet<BlobKey>,
    save_running: bool,
    save_requested: bool,
}

/// Image cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct ImageCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Entries across the on-disk index and pending writes
    pub image_count: usize,
}

enum Source {
    Disk(IndexEntry),
    Mem(Vec<u8>),
}

/// Encrypted on-disk store for package thumbnail images
pub struct ImageCache {
    path: PathBuf,
    cipher: PayloadCipher,
    config: ImageCacheConfig,
    buffers: Arc<BufferPool>,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

fn normalize_internal(path: &str) -> String {
    if path.contains('\\') {
        path.replace('\\', "/")
    } else {
        path.to_string()
    }
}

impl ImageCache {
    /// Create a cache persisting to `dir/PackageImages.cache`.
    pub fn new(dir: &Path, buffers: Arc<BufferPool>, config: ImageCacheConfig) -> Self {
        Self::with_cipher(dir, PayloadCipher::from_machine_identity(), buffers, config)
    }

    /// Create a cache with an explicit cipher (tests use a fixed identity).
    pub fn with_cipher(
        dir: &Path,
        cipher: PayloadCipher,
        buffers: Arc<BufferPool>,
        config: ImageCacheConfig,
    ) -> Self {
        let lru_capacity =
            NonZeroUsize::new(config.lru_capacity.max(1)).expect("non-zero LRU capacity");
        Self {
            path: dir.join(IMAGE_CACHE_FILE),
            cipher,
            config,
            buffers,
            inner: Mutex::new(Inner {
                index: HashMap::new(),
                lru: LruCache::new(lru_capacity),
                pending: HashMap::new(),
                invalid: HashSet::new(),
                save_running: false,
                save_requested: false,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// On-disk path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the offset index from disk (payloads stay on disk).
    ///
    /// A missing file, wrong magic, or unknown version leaves the index
    /// empty. A legacy v1 file is staged into pending writes; the caller
    /// should follow with a save to produce the v2 layout. The v1 file
    /// itself stays intact until that save's atomic rename succeeds.
    pub fn load_index(&self) -> CoreResult<IndexLoad> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexLoad::Absent),
            Err(e) => return Err(e.into()),
        };
        let mut reader = CacheReader::new(BufReader::new(file));

        let magic = match reader.read_u32() {
            Ok(m) => m,
            Err(_) => return Ok(IndexLoad::Absent),
        };
        if magic != IMAGE_CACHE_MAGIC {
            log::warn!("image cache has bad magic {magic:#x}, discarding");
            return Ok(IndexLoad::Absent);
        }
        let version = match reader.read_u32() {
            Ok(v) => v,
            Err(_) => return Ok(IndexLoad::Absent),
        };
        match version {
            IMAGE_CACHE_VERSION => match Self::read_v2_index(&mut reader) {
                Ok(index) => {
                    self.inner.lock().index = index;
                    Ok(IndexLoad::Loaded)
                }
                Err(e) => {
                    log::warn!("image cache index unreadable ({e}), discarding");
                    Ok(IndexLoad::Absent)
                }
            },
            IMAGE_CACHE_VERSION_LEGACY => match Self::read_v1_payloads(&mut reader) {
                Ok(staged) => {
                    let mut inner = self.inner.lock();
                    for (key, blobs) in staged {
                        inner.pending.entry(key).or_default().extend(blobs);
                    }
                    log::info!("migrating legacy image cache to current layout");
                    Ok(IndexLoad::LegacyMigrated)
                }
                Err(e) => {
                    log::warn!("legacy image cache unreadable ({e}), discarding");
                    Ok(IndexLoad::Absent)
                }
            },
            other => {
                log::warn!("image cache version {other} is unknown, discarding");
                Ok(IndexLoad::Absent)
            }
        }
    }

    /// Async wrapper for `load_index`; a legacy file schedules the
    /// migration save immediately.
    pub async fn load_index_async(self: &Arc<Self>) -> CoreResult<IndexLoad> {
        let cache = Arc::clone(self);
        let outcome = tokio::task::spawn_blocking(move || cache.load_index())
            .await
            .map_err(|_| CoreError::Cancelled)??;
        if outcome == IndexLoad::LegacyMigrated {
            self.schedule_save();
        }
        Ok(outcome)
    }

    fn read_v2_index<R: Read>(
        reader: &mut CacheReader<R>,
    ) -> CoreResult<HashMap<String, HashMap<String, IndexEntry>>> {
        let package_count = reader.read_u32()?;
        let mut index = HashMap::with_capacity(package_count as usize);
        for _ in 0..package_count {
            let key = reader.read_string()?;
            let image_count = reader.read_u32()?;
            let mut images = HashMap::with_capacity(image_count as usize);
            for _ in 0..image_count {
                let path = reader.read_string()?;
                let offset = reader.read_i64()? as u64;
                let length = reader.read_i32()? as u32;
                images.insert(path, IndexEntry { offset, length });
            }
            index.insert(key, images);
        }
        Ok(index)
    }

    fn read_v1_payloads<R: Read>(
        reader: &mut CacheReader<R>,
    ) -> CoreResult<HashMap<String, HashMap<String, Vec<u8>>>> {
        let package_count = reader.read_u32()?;
        let mut staged = HashMap::with_capacity(package_count as usize);
        for _ in 0..package_count {
            let key = reader.read_string()?;
            let image_count = reader.read_u32()?;
            let mut blobs = HashMap::with_capacity(image_count as usize);
            for _ in 0..image_count {
                let path = reader.read_string()?;
                let payload = reader.read_bytes()?;
                blobs.insert(path, payload);
            }
            staged.insert(key, blobs);
        }
        Ok(staged)
    }

    /// Fetch the encrypted blob for a key: LRU, then pending, then disk.
    fn fetch_blob(&self, pkg: &str, internal: &str) -> Option<Arc<Vec<u8>>> {
        let disk_entry = {
            let mut inner = self.inner.lock();
            let blob_key = (pkg.to_string(), internal.to_string());
            if let Some(blob) = inner.lru.get(&blob_key) {
                return Some(Arc::clone(blob));
            }
            if let Some(blob) = inner.pending.get(pkg).and_then(|m| m.get(internal)) {
                return Some(Arc::new(blob.clone()));
            }
            inner.index.get(pkg).and_then(|m| m.get(internal)).copied()?
        };

        // Disk read happens outside the lock.
        let mut file = File::open(&self.path).ok()?;
        file.seek(SeekFrom::Start(disk_entry.offset)).ok()?;
        let mut payload = vec![0u8; disk_entry.length as usize];
        file.read_exact(&mut payload).ok()?;
        self.bytes_read
            .fetch_add(disk_entry.length as u64, Ordering::Relaxed);

        let payload = Arc::new(payload);
        self.inner.lock().lru.put(
            (pkg.to_string(), internal.to_string()),
            Arc::clone(&payload),
        );
        Some(payload)
    }

    /// Decrypt, decode and dimension-check a blob.
    fn decode_blob(&self, pkg: &str, internal: &str, blob: &[u8]) -> Option<DynamicImage> {
        let decrypted = self.cipher.decrypt(blob).ok()?;
        let decoded = image::load_from_memory(&decrypted).ok()?;
        if decoded.width() < self.config.min_dimension
            || decoded.height() < self.config.min_dimension
        {
            let mut inner = self.inner.lock();
            let blob_key = (pkg.to_string(), internal.to_string());
            inner.lru.pop(&blob_key);
            inner.invalid.insert(blob_key);
            return None;
        }
        Some(decoded)
    }

    /// Fetch a cached image, if present and decodable.
    pub fn try_get(
        &self,
        archive_path: &str,
        internal_path: &str,
        fingerprint: Fingerprint,
    ) -> Option<DynamicImage> {
        let pkg = package_key(archive_path, fingerprint);
        let internal = normalize_internal(internal_path);

        if self
            .inner
            .lock()
            .invalid
            .contains(&(pkg.clone(), internal.clone()))
        {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let result = self
            .fetch_blob(&pkg, &internal)
            .and_then(|blob| self.decode_blob(&pkg, &internal, &blob));

        match &result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    /// Batch fetch: returns decoded images and the paths that missed.
    pub fn try_get_batch(
        &self,
        archive_path: &str,
        internal_paths: &[String],
        fingerprint: Fingerprint,
    ) -> (Vec<(String, DynamicImage)>, Vec<String>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for path in internal_paths {
            match self.try_get(archive_path, path, fingerprint) {
                Some(img) => found.push((path.clone(), img)),
                None => missing.push(path.clone()),
            }
        }
        (found, missing)
    }

    /// Stage an image for persistence.
    ///
    /// Rejects images under the minimum dimension. Encodes as JPEG,
    /// encrypts, stages in pending writes and the LRU, and schedules a
    /// coalesced asynchronous save. Returns whether the image was accepted.
    pub fn try_save(
        self: &Arc<Self>,
        archive_path: &str,
        internal_path: &str,
        fingerprint: Fingerprint,
        image: &DynamicImage,
    ) -> bool {
        if !self.stage(archive_path, internal_path, fingerprint, image) {
            return false;
        }
        self.schedule_save();
        true
    }

    /// Encode, encrypt and stage without scheduling a save. The synchronous
    /// save path (`save_sync`) and tests use this directly.
    pub fn stage(
        &self,
        archive_path: &str,
        internal_path: &str,
        fingerprint: Fingerprint,
        image: &DynamicImage,
    ) -> bool {
        if image.width() < self.config.min_dimension
            || image.height() < self.config.min_dimension
        {
            return false;
        }

        let mut encoded = Vec::new();
        if image
            .write_to(
                &mut Cursor::new(&mut encoded),
                image::ImageOutputFormat::Jpeg(self.config.jpeg_quality),
            )
            .is_err()
        {
            return false;
        }
        let payload = self.cipher.encrypt(&encoded);

        let pkg = package_key(archive_path, fingerprint);
        let internal = normalize_internal(internal_path);
        let mut inner = self.inner.lock();
        inner.invalid.remove(&(pkg.clone(), internal.clone()));
        inner
            .lru
            .put((pkg.clone(), internal.clone()), Arc::new(payload.clone()));
        inner.pending.entry(pkg).or_default().insert(internal, payload);
        true
    }

    /// Schedule an asynchronous save. While one is running, further
    /// requests coalesce into a single follow-up save.
    pub fn schedule_save(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.save_running {
                inner.save_requested = true;
                return;
            }
            inner.save_running = true;
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let for_save = Arc::clone(&cache);
                let result =
                    tokio::task::spawn_blocking(move || for_save.save_sync_inner()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("image cache save failed: {}", e),
                    Err(_) => log::warn!("image cache save task aborted"),
                }

                let mut inner = cache.inner.lock();
                if inner.save_requested {
                    inner.save_requested = false;
                    drop(inner);
                    // Loop for the coalesced follow-up save.
                } else {
                    inner.save_running = false;
                    return;
                }
            }
        });
    }

    /// Save synchronously (shutdown path).
    ///
    /// Takes the single save slot, waiting out any in-flight async save so
    /// two writers never race on the temp file.
    pub fn save_sync(&self) -> CoreResult<()> {
        loop {
            {
                let mut inner = self.inner.lock();
                if !inner.save_running {
                    inner.save_running = true;
                    break;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let result = self.save_sync_inner();
        let mut inner = self.inner.lock();
        inner.save_running = false;
        inner.save_requested = false;
        result
    }

    /// Snapshot + two-pass write + atomic rename.
    fn save_sync_inner(&self) -> CoreResult<()> {
        // Snapshot the save plan under the lock; payload bytes for entries
        // already on disk are read back outside it. Pending writes shadow
        // disk entries at the same path.
        let plan: Vec<(String, Vec<(String, Source)>)> = {
            let inner = self.inner.lock();
            let mut merged: HashMap<String, HashMap<String, Source>> = HashMap::new();
            for (pkg, images) in &inner.index {
                for (path, entry) in images {
                    merged
                        .entry(pkg.clone())
                        .or_default()
                        .insert(path.clone(), Source::Disk(*entry));
                }
            }
            for (pkg, blobs) in &inner.pending {
                for (path, blob) in blobs {
                    merged
                        .entry(pkg.clone())
                        .or_default()
                        .insert(path.clone(), Source::Mem(blob.clone()));
                }
            }
            merged
                .into_iter()
                .map(|(pkg, images)| (pkg, images.into_iter().collect()))
                .collect()
        };

        let mut old_file = File::open(&self.path).ok();
        let tmp = self.path.with_extension("cache.tmp");

        let written = (|| -> CoreResult<(HashMap<String, HashMap<String, IndexEntry>>, u64)> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&tmp)?;
            let mut writer = CacheWriter::new(BufWriter::new(file));

            // First pass: the index with placeholder offsets, remembering
            // where each placeholder sits.
            writer.write_u32(IMAGE_CACHE_MAGIC)?;
            writer.write_u32(IMAGE_CACHE_VERSION)?;
            writer.write_u32(plan.len() as u32)?;
            let mut patch_positions = Vec::new();
            for (pkg, images) in &plan {
                writer.write_string(pkg)?;
                writer.write_u32(images.len() as u32)?;
                for (path, source) in images {
                    writer.write_string(path)?;
                    patch_positions.push(writer.bytes_written());
                    writer.write_i64(0)?;
                    let length = match source {
                        Source::Disk(entry) => entry.length,
                        Source::Mem(blob) => blob.len() as u32,
                    };
                    writer.write_i32(length as i32)?;
                }
            }

            // Second pass: stream the payloads, recording real offsets.
            let mut offsets = Vec::with_capacity(patch_positions.len());
            let mut payload_bytes = 0u64;
            let mut new_index: HashMap<String, HashMap<String, IndexEntry>> = HashMap::new();
            let mut copy_buf = self.buffers.rent(256 * 1024);
            for (pkg, images) in &plan {
                for (path, source) in images {
                    let offset = writer.bytes_written();
                    let length = match source {
                        Source::Mem(blob) => {
                            writer.write_raw(blob)?;
                            blob.len() as u32
                        }
                        Source::Disk(entry) => {
                            let src = old_file.as_mut().ok_or_else(|| {
                                CoreError::Corrupt(
                                    "index references a missing cache file".to_string(),
                                )
                            })?;
                            src.seek(SeekFrom::Start(entry.offset))?;
                            let mut remaining = entry.length as usize;
                            while remaining > 0 {
                                let chunk = remaining.min(copy_buf.capacity());
                                copy_buf.resize(chunk, 0);
                                src.read_exact(&mut copy_buf)?;
                                writer.write_raw(&copy_buf)?;
                                remaining -= chunk;
                            }
                            entry.length
                        }
                    };
                    offsets.push(offset);
                    payload_bytes += length as u64;
                    new_index
                        .entry(pkg.clone())
                        .or_default()
                        .insert(path.clone(), IndexEntry { offset, length });
                }
            }
            drop(copy_buf);

            // Patch the placeholders with the recorded offsets.
            let mut buffered = writer.into_inner();
            buffered.flush()?;
            let mut file = buffered
                .into_inner()
                .map_err(|e| CoreError::Io(e.into_error()))?;
            for (position, offset) in patch_positions.iter().zip(&offsets) {
                file.seek(SeekFrom::Start(*position))?;
                file.write_all(&(*offset as i64).to_le_bytes())?;
            }
            file.sync_all()?;
            Ok((new_index, payload_bytes))
        })();

        let (new_index, payload_bytes) = match written {
            Ok(done) => done,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        };

        drop(old_file);
        // Rename replaces the destination atomically; the prior file stays
        // intact until this succeeds.
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        self.bytes_written.fetch_add(payload_bytes, Ordering::Relaxed);

        // Swap in the fresh index and drop the pending entries this save
        // persisted. A blob restaged mid-save stays pending for the
        // coalesced follow-up.
        let mut inner = self.inner.lock();
        inner.index = new_index;
        for (pkg, images) in &plan {
            for (path, source) in images {
                if let Source::Mem(saved) = source {
                    let mut lane_empty = false;
                    if let Some(blobs) = inner.pending.get_mut(pkg) {
                        if blobs.get(path).map(|b| b == saved).unwrap_or(false) {
                            blobs.remove(path);
                        }
                        lane_empty = blobs.is_empty();
                    }
                    if lane_empty {
                        inner.pending.remove(pkg);
                    }
                }
            }
        }
        Ok(())
    }

    /// Wipe memory and delete the on-disk file.
    pub fn clear(&self) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.index.clear();
            inner.lru.clear();
            inner.pending.clear();
            inner.invalid.clear();
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> ImageCacheStats {
        let inner = self.inner.lock();
        let index_count: usize = inner.index.values().map(|m| m.len()).sum();
        let pending_count: usize = inner
            .pending
            .iter()
            .map(|(pkg, blobs)| {
                blobs
                    .keys()
                    .filter(|path| {
                        !inner
                            .index
                            .get(pkg)
                            .map(|m| m.contains_key(*path))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        ImageCacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            image_count: index_count + pending_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn test_image(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x % 256) as u8, (y % 256) as u8, 128]);
        }
        DynamicImage::ImageRgb8(img)
    }

    fn cache_in(dir: &Path) -> Arc<ImageCache> {
        Arc::new(ImageCache::with_cipher(
            dir,
            PayloadCipher::derive("test-host", "test-user"),
            Arc::new(BufferPool::new()),
            ImageCacheConfig::default(),
        ))
    }

    const FP: Fingerprint = Fingerprint {
        size: 1000,
        ticks: 100,
    };

    #[test]
    fn test_stage_and_get_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128)));

        let got = cache.try_get("/packs/a.var", "thumbs/a.jpg", FP).unwrap();
        assert_eq!(got.width(), 128);
        assert_eq!(got.height(), 128);
        assert_eq!(cache.stats().image_count, 1);
    }

    #[test]
    fn test_small_image_rejected_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(!cache.stage("/packs/a.var", "thumbs/tiny.jpg", FP, &test_image(80, 80)));
        assert_eq!(cache.stats().image_count, 0);
        assert!(!cache.path().exists());

        // The subsequent get misses without reaching a decode.
        assert!(cache.try_get("/packs/a.var", "thumbs/tiny.jpg", FP).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = cache_in(dir.path());
            cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(160, 120));
            cache.stage("/packs/b.var", "thumbs/b.jpg", FP, &test_image(200, 200));
            cache.save_sync().unwrap();
            assert_eq!(cache.stats().image_count, 2);
        }

        let cache = cache_in(dir.path());
        assert_eq!(cache.load_index().unwrap(), IndexLoad::Loaded);
        let got = cache.try_get("/packs/a.var", "thumbs/a.jpg", FP).unwrap();
        assert_eq!((got.width(), got.height()), (160, 120));
        assert!(cache.stats().bytes_read > 0);
    }

    #[test]
    fn test_on_disk_layout_starts_with_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128));
        cache.save_sync().unwrap();

        let data = std::fs::read(cache.path()).unwrap();
        assert_eq!(
            u32::from_le_bytes(data[0..4].try_into().unwrap()),
            IMAGE_CACHE_MAGIC
        );
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 2);
        assert_eq!(&data[0..4], b"IMPV");
    }

    #[test]
    fn test_bad_magic_leaves_index_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        std::fs::write(cache.path(), b"not an image cache at all").unwrap();
        assert_eq!(cache.load_index().unwrap(), IndexLoad::Absent);
        assert_eq!(cache.stats().image_count, 0);
    }

    #[test]
    fn test_fingerprint_mismatch_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128));
        assert!(cache
            .try_get("/packs/a.var", "thumbs/a.jpg", Fingerprint::new(1000, 999))
            .is_none());
    }

    #[test]
    fn test_resave_shadows_older_disk_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128));
        cache.save_sync().unwrap();

        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(256, 256));
        cache.save_sync().unwrap();

        // Reload fresh to prove the on-disk copy is the newer image.
        let fresh = cache_in(dir.path());
        fresh.load_index().unwrap();
        let got = fresh.try_get("/packs/a.var", "thumbs/a.jpg", FP).unwrap();
        assert_eq!(got.width(), 256);
    }

    #[test]
    fn test_legacy_v1_migrates_through_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = PayloadCipher::derive("test-host", "test-user");

        // Hand-write a v1 file: inline payload after each entry.
        let mut encoded = Vec::new();
        test_image(128, 128)
            .write_to(
                &mut Cursor::new(&mut encoded),
                image::ImageOutputFormat::Jpeg(90),
            )
            .unwrap();
        let payload = cipher.encrypt(&encoded);
        let pkg = package_key("/packs/a.var", FP);

        let mut buf = Vec::new();
        let mut w = CacheWriter::new(&mut buf);
        w.write_u32(IMAGE_CACHE_MAGIC).unwrap();
        w.write_u32(1).unwrap();
        w.write_u32(1).unwrap(); // package count
        w.write_string(&pkg).unwrap();
        w.write_u32(1).unwrap(); // image count
        w.write_string("thumbs/a.jpg").unwrap();
        w.write_bytes(&payload).unwrap();
        std::fs::write(dir.path().join(IMAGE_CACHE_FILE), &buf).unwrap();

        let cache = cache_in(dir.path());
        assert_eq!(cache.load_index().unwrap(), IndexLoad::LegacyMigrated);
        // Migrated data is readable before any save.
        assert!(cache.try_get("/packs/a.var", "thumbs/a.jpg", FP).is_some());

        // The save rewrites to v2.
        cache.save_sync().unwrap();
        let data = std::fs::read(cache.path()).unwrap();
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 2);

        let fresh = cache_in(dir.path());
        assert_eq!(fresh.load_index().unwrap(), IndexLoad::Loaded);
        assert!(fresh.try_get("/packs/a.var", "thumbs/a.jpg", FP).is_some());
    }

    #[test]
    fn test_clear_removes_file_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128));
        cache.save_sync().unwrap();
        assert!(cache.path().exists());

        cache.clear().unwrap();
        assert!(!cache.path().exists());
        assert_eq!(cache.stats().image_count, 0);
        assert!(cache.try_get("/packs/a.var", "thumbs/a.jpg", FP).is_none());
    }

    #[tokio::test]
    async fn test_try_save_schedules_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        assert!(cache.try_save("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128)));

        // Wait for the background save to land.
        for _ in 0..100 {
            if cache.path().exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(cache.path().exists());
    }

    #[test]
    fn test_batch_get_partitions_found_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.stage("/packs/a.var", "thumbs/a.jpg", FP, &test_image(128, 128));

        let (found, missing) = cache.try_get_batch(
            "/packs/a.var",
            &["thumbs/a.jpg".to_string(), "thumbs/other.jpg".to_string()],
            FP,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "thumbs/a.jpg");
        assert_eq!(missing, vec!["thumbs/other.jpg".to_string()]);
    }
}
