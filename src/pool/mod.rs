//! Buffer pool for the relay hot path
//!
//! A bounded cache of fixed-size byte buffers. Relay loops borrow one buffer
//! per copy direction and hand it back automatically when the guard drops,
//! on every exit path.

mod guard;

pub use guard::PooledBuf;

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::helper::DEFAULT_BUFFER_SIZE;

/// Default number of idle buffers kept around
pub const DEFAULT_MAX_CACHED: usize = 256;

/// Pool of reusable fixed-capacity buffers
#[derive(Debug)]
pub struct BufferPool {
    buf_size: usize,
    max_cached: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CACHED)
    }
}

impl BufferPool {
    /// Create a pool handing out buffers of `buf_size` bytes, keeping at most
    /// `max_cached` idle buffers
    pub fn new(buf_size: usize, max_cached: usize) -> Self {
        BufferPool {
            buf_size,
            max_cached,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Size of every buffer handed out
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Borrow a buffer, allocating when the pool is empty
    pub fn get(&self) -> PooledBuf<'_> {
        let cached = self.free().pop();
        let buf = cached.unwrap_or_else(|| vec![0u8; self.buf_size].into_boxed_slice());
        PooledBuf::new(buf, self)
    }

    /// Number of idle buffers currently cached
    pub fn cached(&self) -> usize {
        self.free().len()
    }

    fn put(&self, buf: Box<[u8]>) {
        if buf.len() != self.buf_size {
            return;
        }
        let mut free = self.free();
        if free.len() < self.max_cached {
            free.push(buf);
        }
    }

    /// The free list is a plain Vec, so a panic while holding the lock
    /// cannot leave it half-updated
    fn free(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
