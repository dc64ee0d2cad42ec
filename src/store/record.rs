//! Package metadata record
//!
//! This module provides:
//! - The flat `PackageRecord` persisted by the metadata cache
//! - Its fixed binary layout: primitives first, then count-prefixed
//!   string sequences
//!
//! The content-list and all-files sequences are recomputed on demand and
//! deliberately not persisted; they are written as zero-count placeholders
//! to keep the layout aligned with records produced by older builds.

use crate::memory::StringPool;
use crate::store::codec::{CacheReader, CacheWriter};
use crate::error::CoreResult;
use std::io::{Read, Write};
use std::sync::Arc;

/// Per-package content counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentCounters {
    pub morphs: i32,
    pub hair: i32,
    pub clothing: i32,
    pub scenes: i32,
    pub looks: i32,
    pub poses: i32,
    pub assets: i32,
    pub scripts: i32,
    pub plugins: i32,
    pub subscenes: i32,
    pub skins: i32,
}

impl ContentCounters {
    fn write<W: Write>(&self, w: &mut CacheWriter<W>) -> CoreResult<()> {
        for v in [
            self.morphs,
            self.hair,
            self.clothing,
            self.scenes,
            self.looks,
            self.poses,
            self.assets,
            self.scripts,
            self.plugins,
            self.subscenes,
            self.skins,
        ] {
            w.write_i32(v)?;
        }
        Ok(())
    }

    fn read<R: Read>(r: &mut CacheReader<R>) -> CoreResult<Self> {
        Ok(Self {
            morphs: r.read_i32()?,
            hair: r.read_i32()?,
            clothing: r.read_i32()?,
            scenes: r.read_i32()?,
            looks: r.read_i32()?,
            poses: r.read_i32()?,
            assets: r.read_i32()?,
            scripts: r.read_i32()?,
            plugins: r.read_i32()?,
            subscenes: r.read_i32()?,
            skins: r.read_i32()?,
        })
    }
}

/// Flat metadata record for one content package
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub filename: Arc<str>,
    pub package_name: Arc<str>,
    pub creator: Arc<str>,
    pub description: String,
    pub version: i32,
    /// License kind; compared case-insensitively
    pub license: Arc<str>,
    pub file_count: i32,
    pub corrupted: bool,
    pub preload: bool,
    /// Status kind; compared case-insensitively
    pub status: Arc<str>,
    pub stored_path: Arc<str>,
    pub size: i64,
    pub images_optimized: bool,
    pub json_minified: bool,
    pub recompressed: bool,
    pub trimmed: bool,
    /// Variant role kind; compared case-insensitively
    pub variant_role: Arc<str>,
    pub duplicate_count: i32,
    pub counters: ContentCounters,
    pub created_ticks: Option<i64>,
    pub last_checked_ticks: Option<i64>,
    pub dependencies: Vec<Arc<str>>,
    pub content_types: Vec<Arc<str>>,
    pub categories: Vec<Arc<str>>,
    pub user_tags: Vec<Arc<str>>,
    pub missing_dependencies: Vec<Arc<str>>,
    pub clothing_tags: Vec<Arc<str>>,
    pub hair_tags: Vec<Arc<str>>,
}

impl Default for PackageRecord {
    fn default() -> Self {
        let empty: Arc<str> = Arc::from("");
        Self {
            filename: Arc::clone(&empty),
            package_name: Arc::clone(&empty),
            creator: Arc::clone(&empty),
            description: String::new(),
            version: 0,
            license: Arc::clone(&empty),
            file_count: 0,
            corrupted: false,
            preload: false,
            status: Arc::clone(&empty),
            stored_path: Arc::clone(&empty),
            size: 0,
            images_optimized: false,
            json_minified: false,
            recompressed: false,
            trimmed: false,
            variant_role: empty,
            duplicate_count: 0,
            counters: ContentCounters::default(),
            created_ticks: None,
            last_checked_ticks: None,
            dependencies: Vec::new(),
            content_types: Vec::new(),
            categories: Vec::new(),
            user_tags: Vec::new(),
            missing_dependencies: Vec::new(),
            clothing_tags: Vec::new(),
            hair_tags: Vec::new(),
        }
    }
}

impl PackageRecord {
    /// Case-insensitive status comparison.
    pub fn has_status(&self, status: &str) -> bool {
        self.status.eq_ignore_ascii_case(status)
    }

    /// Case-insensitive license comparison.
    pub fn has_license(&self, license: &str) -> bool {
        self.license.eq_ignore_ascii_case(license)
    }

    /// Case-insensitive membership test over a kind-like sequence.
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Serialize into the fixed record layout.
    pub fn write<W: Write>(&self, w: &mut CacheWriter<W>) -> CoreResult<()> {
        w.write_string(&self.filename)?;
        w.write_string(&self.package_name)?;
        w.write_string(&self.creator)?;
        w.write_string(&self.description)?;
        w.write_i32(self.version)?;
        w.write_string(&self.license)?;
        w.write_i32(self.file_count)?;
        w.write_bool(self.corrupted)?;
        w.write_bool(self.preload)?;
        w.write_string(&self.status)?;
        w.write_string(&self.stored_path)?;
        w.write_i64(self.size)?;
        w.write_bool(self.images_optimized)?;
        w.write_bool(self.json_minified)?;
        w.write_bool(self.recompressed)?;
        w.write_bool(self.trimmed)?;
        w.write_string(&self.variant_role)?;
        w.write_i32(self.duplicate_count)?;
        self.counters.write(w)?;
        w.write_opt_ticks(self.created_ticks)?;
        w.write_opt_ticks(self.last_checked_ticks)?;
        w.write_string_seq(&self.dependencies)?;
        w.write_string_seq(&self.content_types)?;
        w.write_string_seq(&self.categories)?;
        w.write_string_seq(&self.user_tags)?;
        w.write_string_seq(&self.missing_dependencies)?;
        w.write_string_seq(&self.clothing_tags)?;
        w.write_string_seq(&self.hair_tags)?;
        // content-list and all-files: recomputed on demand, persisted as
        // empty placeholders for layout alignment.
        w.write_u32(0)?;
        w.write_u32(0)?;
        Ok(())
    }

    /// Deserialize one record, passing strings through the interning pool.
    pub fn read<R: Read>(r: &mut CacheReader<R>, strings: &StringPool) -> CoreResult<Self> {
        let intern_seq = |strings: &StringPool, seq: Vec<String>| -> Vec<Arc<str>> {
            seq.iter().map(|s| strings.intern(s)).collect()
        };
        let intern_seq_ci = |strings: &StringPool, seq: Vec<String>| -> Vec<Arc<str>> {
            seq.iter().map(|s| strings.intern_ci(s)).collect()
        };

        let filename = strings.intern(&r.read_string()?);
        let package_name = strings.intern(&r.read_string()?);
        let creator = strings.intern(&r.read_string()?);
        let description = r.read_string()?;
        let version = r.read_i32()?;
        let license = strings.intern_ci(&r.read_string()?);
        let file_count = r.read_i32()?;
        let corrupted = r.read_bool()?;
        let preload = r.read_bool()?;
        let status = strings.intern_ci(&r.read_string()?);
        let stored_path = strings.intern_path(&r.read_string()?);
        let size = r.read_i64()?;
        let images_optimized = r.read_bool()?;
        let json_minified = r.read_bool()?;
        let recompressed = r.read_bool()?;
        let trimmed = r.read_bool()?;
        let variant_role = strings.intern_ci(&r.read_string()?);
        let duplicate_count = r.read_i32()?;
        let counters = ContentCounters::read(r)?;
        let created_ticks = r.read_opt_ticks()?;
        let last_checked_ticks = r.read_opt_ticks()?;
        let dependencies = intern_seq(strings, r.read_string_seq()?);
        let content_types = intern_seq_ci(strings, r.read_string_seq()?);
        let categories = intern_seq_ci(strings, r.read_string_seq()?);
        let user_tags = intern_seq_ci(strings, r.read_string_seq()?);
        let missing_dependencies = intern_seq(strings, r.read_string_seq()?);
        let clothing_tags = intern_seq_ci(strings, r.read_string_seq()?);
        let hair_tags = intern_seq_ci(strings, r.read_string_seq()?);
        // Skip the content-list and all-files placeholders.
        let _ = r.read_string_seq()?;
        let _ = r.read_string_seq()?;

        Ok(Self {
            filename,
            package_name,
            creator,
            description,
            version,
            license,
            file_count,
            corrupted,
            preload,
            status,
            stored_path,
            size,
            images_optimized,
            json_minified,
            recompressed,
            trimmed,
            variant_role,
            duplicate_count,
            counters,
            created_ticks,
            last_checked_ticks,
            dependencies,
            content_types,
            categories,
            user_tags,
            missing_dependencies,
            clothing_tags,
            hair_tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) fn sample_record(strings: &StringPool) -> PackageRecord {
        PackageRecord {
            filename: strings.intern("Creator.Pack.3.var"),
            package_name: strings.intern("Pack"),
            creator: strings.intern("Creator"),
            description: "A test pack".to_string(),
            version: 3,
            license: strings.intern_ci("CC BY"),
            file_count: 42,
            corrupted: false,
            preload: true,
            status: strings.intern_ci("Active"),
            stored_path: strings.intern_path("D:\\packs\\Creator.Pack.3.var"),
            size: 1234,
            images_optimized: true,
            json_minified: false,
            recompressed: false,
            trimmed: true,
            variant_role: strings.intern_ci("Primary"),
            duplicate_count: 1,
            counters: ContentCounters {
                morphs: 2,
                clothing: 5,
                ..Default::default()
            },
            created_ticks: Some(638_000_000_000_000_000),
            last_checked_ticks: None,
            dependencies: vec![strings.intern("Other.Pack.1")],
            content_types: vec![strings.intern_ci("clothing")],
            categories: vec![strings.intern_ci("clothing"), strings.intern_ci("hair")],
            user_tags: vec![strings.intern_ci("favorite")],
            missing_dependencies: Vec::new(),
            clothing_tags: vec![strings.intern_ci("dress")],
            hair_tags: Vec::new(),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let strings = StringPool::new();
        let record = sample_record(&strings);

        let mut buf = Vec::new();
        record.write(&mut CacheWriter::new(&mut buf)).unwrap();

        let mut reader = CacheReader::new(Cursor::new(buf));
        let loaded = PackageRecord::read(&mut reader, &strings).unwrap();

        assert_eq!(&*loaded.filename, "Creator.Pack.3.var");
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.size, 1234);
        assert_eq!(loaded.counters.clothing, 5);
        assert_eq!(loaded.created_ticks, Some(638_000_000_000_000_000));
        assert_eq!(loaded.last_checked_ticks, None);
        assert_eq!(loaded.dependencies.len(), 1);
        assert_eq!(&*loaded.stored_path, "D:/packs/Creator.Pack.3.var");
        assert!(loaded.preload);
        assert!(loaded.trimmed);
    }

    #[test]
    fn test_kind_comparisons_ignore_case() {
        let strings = StringPool::new();
        let record = sample_record(&strings);
        assert!(record.has_status("ACTIVE"));
        assert!(record.has_license("cc by"));
        assert!(record.has_category("CLOTHING"));
        assert!(!record.has_status("Disabled"));
    }

    #[test]
    fn test_interning_dedups_on_load() {
        let strings = StringPool::new();
        let record = sample_record(&strings);
        let mut buf = Vec::new();
        record.write(&mut CacheWriter::new(&mut buf)).unwrap();

        let a = PackageRecord::read(&mut CacheReader::new(Cursor::new(buf.clone())), &strings)
            .unwrap();
        let b =
            PackageRecord::read(&mut CacheReader::new(Cursor::new(buf)), &strings).unwrap();
        assert!(Arc::ptr_eq(&a.creator, &b.creator));
        assert!(Arc::ptr_eq(&a.license, &b.license));
    }
}
