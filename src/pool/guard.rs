//! RAII guard for pooled buffers
//!
//! Provides automatic return of buffers to the pool when dropped.

use std::ops::{Deref, DerefMut};

use super::BufferPool;

/// RAII guard that returns the buffer to the pool on drop
///
/// The borrower owns the buffer exclusively until the guard is dropped.
pub struct PooledBuf<'a> {
    /// The borrowed buffer
    buf: Box<[u8]>,
    /// Pool to return the buffer to
    pool: &'a BufferPool,
}

impl<'a> PooledBuf<'a> {
    pub(super) fn new(buf: Box<[u8]>, pool: &'a BufferPool) -> Self {
        PooledBuf { buf, pool }
    }
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_drop_returns_to_pool() {
        let pool = BufferPool::new(32, 4);
        {
            let _buf = pool.get();
            assert_eq!(pool.cached(), 0);
        }
        assert_eq!(pool.cached(), 1);
    }

    #[test]
    fn test_guard_deref_mut() {
        let pool = BufferPool::new(8, 1);
        let mut buf = pool.get();
        buf[..3].copy_from_slice(b"abc");
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(buf.len(), 8);
    }
}
