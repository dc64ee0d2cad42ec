//! Little-endian binary codec for the cache files
//!
//! This module provides:
//! - A reader and writer for the length-prefixed primitives the cache
//!   files are built from
//! - Defensive decoding: every read is bounds-checked and length-capped
//!
//! The on-disk layouts are fixed by the cache format versions, so the
//! codec writes exactly those bytes rather than delegating to a
//! serialization framework.

use crate::error::{CoreError, CoreResult};
use std::io::{Read, Write};

/// Cap on any single length prefix read from disk. A prefix beyond this is
/// treated as corruption rather than honored with an allocation.
const MAX_PREFIXED_LEN: u32 = 64 * 1024 * 1024;

/// Binary reader over any `Read` source
pub struct CacheReader<R: Read> {
    inner: R,
    bytes_read: u64,
}

impl<R: Read> CacheReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Total bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn fill(&mut self, buf: &mut [u8]) -> CoreResult<()> {
        self.inner.read_exact(buf)?;
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> CoreResult<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_bool(&mut self) -> CoreResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> CoreResult<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> CoreResult<i32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> CoreResult<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> CoreResult<i64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }

    /// Length-prefixed UTF-8 string (`u32` length, then bytes).
    pub fn read_string(&mut self) -> CoreResult<String> {
        let len = self.read_u32()?;
        if len > MAX_PREFIXED_LEN {
            return Err(CoreError::Corrupt(format!(
                "string length {len} exceeds cap"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        String::from_utf8(buf).map_err(|e| CoreError::Corrupt(format!("invalid UTF-8: {e}")))
    }

    /// Length-prefixed raw bytes (`u32` length, then bytes).
    pub fn read_bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_PREFIXED_LEN {
            return Err(CoreError::Corrupt(format!(
                "byte length {len} exceeds cap"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    /// Count-prefixed sequence of strings.
    pub fn read_string_seq(&mut self) -> CoreResult<Vec<String>> {
        let count = self.read_u32()?;
        if count > MAX_PREFIXED_LEN {
            return Err(CoreError::Corrupt(format!(
                "sequence count {count} exceeds cap"
            )));
        }
        let mut out = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }

    /// An optional tick timestamp: `i64::MIN` encodes absence.
    pub fn read_opt_ticks(&mut self) -> CoreResult<Option<i64>> {
        let raw = self.read_i64()?;
        Ok(if raw == i64::MIN { None } else { Some(raw) })
    }
}

/// Binary writer over any `Write` sink
pub struct CacheWriter<W: Write> {
    inner: W,
    bytes_written: u64,
}

impl<W: Write> CacheWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    /// Total bytes emitted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Unwrap the sink, e.g. to flush or sync it.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn put(&mut self, buf: &[u8]) -> CoreResult<()> {
        self.inner.write_all(buf)?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> CoreResult<()> {
        self.put(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> CoreResult<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u32(&mut self, v: u32) -> CoreResult<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> CoreResult<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> CoreResult<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> CoreResult<()> {
        self.put(&v.to_le_bytes())
    }

    pub fn write_string(&mut self, s: &str) -> CoreResult<()> {
        self.write_u32(s.len() as u32)?;
        self.put(s.as_bytes())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> CoreResult<()> {
        self.write_u32(data.len() as u32)?;
        self.put(data)
    }

    /// Raw bytes with no length prefix (payload streaming).
    pub fn write_raw(&mut self, data: &[u8]) -> CoreResult<()> {
        self.put(data)
    }

    pub fn write_string_seq<S: AsRef<str>>(&mut self, seq: &[S]) -> CoreResult<()> {
        self.write_u32(seq.len() as u32)?;
        for s in seq {
            self.write_string(s.as_ref())?;
        }
        Ok(())
    }

    pub fn write_opt_ticks(&mut self, v: Option<i64>) -> CoreResult<()> {
        self.write_i64(v.unwrap_or(i64::MIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_primitive_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut w = CacheWriter::new(&mut buf);
            w.write_u32(14).unwrap();
            w.write_i64(-7).unwrap();
            w.write_bool(true).unwrap();
            w.write_string("Creator.Pack.3").unwrap();
            w.write_string_seq(&["a", "b"]).unwrap();
            w.write_opt_ticks(None).unwrap();
            w.write_opt_ticks(Some(42)).unwrap();
        }

        let mut r = CacheReader::new(Cursor::new(buf));
        assert_eq!(r.read_u32().unwrap(), 14);
        assert_eq!(r.read_i64().unwrap(), -7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_string().unwrap(), "Creator.Pack.3");
        assert_eq!(r.read_string_seq().unwrap(), vec!["a", "b"]);
        assert_eq!(r.read_opt_ticks().unwrap(), None);
        assert_eq!(r.read_opt_ticks().unwrap(), Some(42));
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = Vec::new();
        CacheWriter::new(&mut buf).write_u32(0x56504D49).unwrap();
        assert_eq!(buf, [0x49, 0x4D, 0x50, 0x56]);
    }

    #[test]
    fn test_insane_length_is_corrupt() {
        let mut buf = Vec::new();
        CacheWriter::new(&mut buf).write_u32(u32::MAX).unwrap();
        let err = CacheReader::new(Cursor::new(buf)).read_string().unwrap_err();
        assert!(matches!(err, CoreError::Corrupt(_)));
    }

    #[test]
    fn test_truncated_input_is_io_error() {
        let buf = vec![0x05, 0x00, 0x00, 0x00, b'a'];
        let err = CacheReader::new(Cursor::new(buf)).read_string().unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
