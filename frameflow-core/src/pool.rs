use std::sync::{Arc, Weak};

use crossbeam::queue::ArrayQueue;

pub const BYTES_PER_PIXEL: usize = 4;

/// Bounded pool of reusable BGRA pixel buffers of one fixed geometry.
///
/// Rented buffers return on drop; returns above capacity and buffers whose
/// length no longer matches the pool geometry are dropped instead of
/// recycled. Rent/return are lock-free and safe from any thread.
#[derive(Clone)]
pub struct BitmapPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    width: u32,
    height: u32,
    free: ArrayQueue<Vec<u8>>,
}

impl PoolInner {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

impl BitmapPool {
    pub fn new(width: u32, height: u32, capacity: usize) -> BitmapPool {
        assert!(width > 0 && height > 0, "empty pool geometry");
        assert!(capacity > 0, "pool capacity must be positive");
        BitmapPool {
            inner: Arc::new(PoolInner {
                width,
                height,
                free: ArrayQueue::new(capacity),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Bytes per frame: `width · height · 4`.
    pub fn frame_len(&self) -> usize {
        self.inner.frame_len()
    }

    /// Number of buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.free.len()
    }

    pub fn rent(&self) -> Bitmap {
        let data = self
            .inner
            .free
            .pop()
            .unwrap_or_else(|| vec![0; self.inner.frame_len()]);
        Bitmap {
            data,
            pool: Arc::downgrade(&self.inner),
        }
    }
}

/// One rented BGRA buffer. Returns itself to the owning pool on drop, at
/// most once; if the pool is gone or full the allocation is simply freed.
pub struct Bitmap {
    data: Vec<u8>,
    pool: Weak<PoolInner>,
}

impl Bitmap {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let data = std::mem::take(&mut self.data);
        if data.len() == pool.frame_len() {
            // push fails when the pool is at capacity; the buffer is freed.
            let _ = pool.free.push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_and_return() {
        let pool = BitmapPool::new(4, 2, 2);
        assert_eq!(pool.frame_len(), 32);
        assert_eq!(pool.idle(), 0);

        let a = pool.rent();
        assert_eq!(a.len(), 32);
        drop(a);
        assert_eq!(pool.idle(), 1);

        // The returned buffer is handed out again.
        let b = pool.rent();
        assert_eq!(pool.idle(), 0);
        drop(b);
    }

    #[test]
    fn test_returns_above_capacity_are_dropped() {
        let pool = BitmapPool::new(2, 2, 2);
        let a = pool.rent();
        let b = pool.rent();
        let c = pool.rent();
        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_mismatched_buffer_not_recycled() {
        let pool = BitmapPool::new(2, 2, 2);
        let mut a = pool.rent();
        // Simulate a geometry mismatch by shrinking the allocation.
        a.data.truncate(3);
        drop(a);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_orphan_buffer_outlives_pool() {
        let pool = BitmapPool::new(2, 2, 1);
        let a = pool.rent();
        drop(pool);
        drop(a);
    }
}
