//! Recycling pool for connection buffers.
//!
//! Connections allocate several staging buffers each. The pool hands cleared
//! buffers back out so a busy server does not churn the allocator on every
//! accept/close. When the pool is full, returned buffers are dropped so a
//! burst of connections does not pin memory forever.

use crossbeam_queue::ArrayQueue;

use crate::ByteBuffer;

/// Bounded lock-free pool of [`ByteBuffer`]s.
pub struct BufferPool {
    pool: ArrayQueue<ByteBuffer>,
    default_capacity: usize,
}

impl BufferPool {
    /// # Panics
    ///
    /// Panics if `pool_size` or `default_capacity` is 0.
    pub fn new(pool_size: usize, default_capacity: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be positive");
        assert!(default_capacity > 0, "default_capacity must be positive");
        Self {
            pool: ArrayQueue::new(pool_size),
            default_capacity,
        }
    }

    /// Pops a recycled buffer, or allocates one with the default capacity.
    pub fn get(&self) -> ByteBuffer {
        self.pool
            .pop()
            .unwrap_or_else(|| ByteBuffer::with_capacity(self.default_capacity))
    }

    /// Returns a buffer for reuse. It is unlocked and cleared first.
    pub fn put(&self, mut buffer: ByteBuffer) {
        buffer.unlock();
        buffer.clear();
        let _ = self.pool.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.pool.len()
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_allocates_default_capacity_when_empty() {
        let pool = BufferPool::new(2, 512);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 512);
    }

    #[test]
    fn put_recycles_cleared_buffer_with_its_capacity() {
        let pool = BufferPool::new(2, 64);
        let mut buf = pool.get();
        buf.append(&[0xAB; 200]);
        let grown = buf.capacity();

        pool.put(buf);
        assert_eq!(pool.available(), 1);

        let recycled = pool.get();
        assert!(recycled.is_empty());
        assert_eq!(recycled.capacity(), grown);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn put_unlocks_buffer() {
        let pool = BufferPool::new(1, 16);
        let mut buf = pool.get();
        buf.lock();
        pool.put(buf);
        assert!(!pool.get().is_locked());
    }

    #[test]
    fn full_pool_drops_extra_buffers() {
        let pool = BufferPool::new(1, 16);
        pool.put(ByteBuffer::with_capacity(16));
        pool.put(ByteBuffer::with_capacity(16));
        assert_eq!(pool.available(), 1);
    }
}
