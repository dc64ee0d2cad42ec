//! Archive identity
//!
//! An archive is identified by its filesystem path; its fingerprint is the
//! pair (byte length, last-modified ticks). Fingerprint equality is the
//! cache-validity contract: equal fingerprints are treated as same content.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Number of 100 ns ticks per second.
const TICKS_PER_SEC: i64 = 10_000_000;

/// (size, mtime-ticks) pair used for cache validity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// File length in bytes
    pub size: u64,
    /// Last-modified time in 100 ns ticks since the Unix epoch
    pub ticks: i64,
}

impl Fingerprint {
    /// Build a fingerprint from explicit parts.
    pub fn new(size: u64, ticks: i64) -> Self {
        Self { size, ticks }
    }

    /// Read the fingerprint of a file on disk.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let ticks = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64 * TICKS_PER_SEC + (d.subsec_nanos() / 100) as i64)
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_equality_is_pairwise() {
        assert_eq!(Fingerprint::new(1000, 100), Fingerprint::new(1000, 100));
        assert_ne!(Fingerprint::new(1000, 100), Fingerprint::new(1200, 100));
        assert_ne!(Fingerprint::new(1000, 100), Fingerprint::new(1000, 200));
    }

    #[test]
    fn test_of_file_reflects_size() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"0123456789").unwrap();
        f.flush().unwrap();
        let fp = Fingerprint::of_file(f.path()).unwrap();
        assert_eq!(fp.size, 10);
        assert!(fp.ticks > 0);
    }
}
