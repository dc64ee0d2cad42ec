//! Pooled byte buffers for streaming reads
//!
//! This module provides:
//! - Size-classed buffer rental with return-on-drop guards
//! - Non-blocking rents: an empty bucket allocates a fresh buffer
//!
//! Entry decompression and cache file I/O churn through short-lived
//! buffers; the pool keeps a bounded number of them warm per size class.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Size classes, smallest first. A rent request is served from the first
/// class at least as large as the request; oversized requests are
/// allocated exactly and still returned to the largest class if they fit.
const SIZE_CLASSES: &[usize] = &[
    16 * 1024,        // directory listings, small JSON entries
    256 * 1024,       // typical compressed entries
    4 * 1024 * 1024,  // large textures
    32 * 1024 * 1024, // whole-archive streaming
];

/// Maximum buffers retained per class; extra returns are dropped.
const MAX_PER_CLASS: usize = 8;

struct Shelf {
    capacity: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

/// Thread-safe pool of reusable byte buffers
pub struct BufferPool {
    shelves: Arc<Vec<Shelf>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        let shelves = SIZE_CLASSES
            .iter()
            .map(|&capacity| Shelf {
                capacity,
                buffers: Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            shelves: Arc::new(shelves),
        }
    }

    /// Rent a buffer with capacity of at least `min_size` bytes.
    ///
    /// Never blocks on pool capacity: a miss allocates. The returned guard
    /// hands the buffer back on drop. The buffer arrives empty (`len == 0`)
    /// with at least the requested capacity.
    pub fn rent(&self, min_size: usize) -> PooledBuf {
        let class = self
            .shelves
            .iter()
            .position(|s| s.capacity >= min_size);

        let buffer = match class {
            Some(idx) => {
                let mut shelf = self.shelves[idx].buffers.lock();
                shelf
                    .pop()
                    .unwrap_or_else(|| Vec::with_capacity(self.shelves[idx].capacity))
            }
            // Larger than the largest class: allocate exactly.
            None => Vec::with_capacity(min_size),
        };

        PooledBuf {
            buffer: Some(buffer),
            shelves: Arc::clone(&self.shelves),
        }
    }

    /// Number of buffers currently parked in the pool.
    pub fn pooled_count(&self) -> usize {
        self.shelves.iter().map(|s| s.buffers.lock().len()).sum()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented buffer; returns itself to the pool on drop.
pub struct PooledBuf {
    buffer: Option<Vec<u8>>,
    shelves: Arc<Vec<Shelf>>,
}

impl PooledBuf {
    /// Detach the buffer from the pool, keeping it permanently.
    pub fn into_inner(mut self) -> Vec<u8> {
        self.buffer.take().unwrap_or_default()
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buffer.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(mut buffer) = self.buffer.take() else {
            return;
        };
        buffer.clear();
        // Park it in the largest class it fits; drop it if the shelf is full.
        for shelf in self.shelves.iter().rev() {
            if buffer.capacity() >= shelf.capacity {
                let mut parked = shelf.buffers.lock();
                if parked.len() < MAX_PER_CLASS {
                    parked.push(buffer);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_meets_capacity() {
        let pool = BufferPool::new();
        let buf = pool.rent(100 * 1024);
        assert!(buf.capacity() >= 100 * 1024);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_return_on_drop_and_reuse() {
        let pool = BufferPool::new();
        {
            let _buf = pool.rent(1024);
        }
        assert_eq!(pool.pooled_count(), 1);
        let buf = pool.rent(1024);
        assert_eq!(pool.pooled_count(), 0);
        drop(buf);
        assert_eq!(pool.pooled_count(), 1);
    }

    #[test]
    fn test_oversized_rent_allocates() {
        let pool = BufferPool::new();
        let buf = pool.rent(64 * 1024 * 1024);
        assert!(buf.capacity() >= 64 * 1024 * 1024);
    }

    #[test]
    fn test_into_inner_detaches() {
        let pool = BufferPool::new();
        let buf = pool.rent(1024);
        let v = buf.into_inner();
        assert!(v.capacity() >= 1024);
        assert_eq!(pool.pooled_count(), 0);
    }
}
