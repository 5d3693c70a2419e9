//! # Buffer Pool
//!
//! Object pool for the byte buffers that carry inbound messages from producer
//! threads to the consumer tick, outbound frames to the send loop, and the
//! threaded transport's receive buffer.
//!
//! A [`PooledBuffer`] goes back to its pool when dropped, so a buffer is returned
//! exactly once on every exit path: after its handler ran, after an error, after a
//! panic unwound through the handler, or when its queue is torn down.
//!
//! ## Usage
//! ```rust
//! use framelink::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4);
//! let buffer = pool.rent_copy(b"message");
//! assert_eq!(&buffer[..], b"message");
//! assert_eq!(pool.outstanding(), 1);
//! drop(buffer);
//! assert_eq!(pool.outstanding(), 0);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Maximum buffer capacity kept for reuse (64KB)
const MAX_POOLED_BUFFER_SIZE: usize = 64 * 1024;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
    rented: AtomicU64,
    returned: AtomicU64,
}

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<PoolShared>,
    detached: bool,
}

impl PooledBuffer {
    /// Get a mutable reference to the underlying buffer
    #[allow(clippy::should_implement_trait)]
    pub fn as_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Get an immutable reference to the underlying buffer
    #[allow(clippy::should_implement_trait)]
    pub fn as_ref(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the underlying buffer out of the pool's accounting
    pub fn into_inner(mut self) -> Vec<u8> {
        self.detached = true;
        self.pool.returned.fetch_add(1, Ordering::AcqRel);
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        self.pool.returned.fetch_add(1, Ordering::AcqRel);

        // Oversized buffers are released to the allocator instead of being kept
        if self.buffer.capacity() <= MAX_POOLED_BUFFER_SIZE {
            self.buffer.clear();
            if let Ok(mut free) = self.pool.free.lock() {
                if free.len() < self.pool.max_idle {
                    free.push(std::mem::take(&mut self.buffer));
                }
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .finish()
    }
}

/// Thread-safe pool of reusable byte buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
    initial_capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool holding `pool_size` pre-allocated buffers
    pub fn new(pool_size: usize) -> Self {
        let mut free = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            free.push(Vec::with_capacity(DEFAULT_BUFFER_CAPACITY));
        }

        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                max_idle: pool_size.max(1),
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
            initial_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Acquire an empty buffer (or allocate a new one if the pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        self.rent(self.initial_capacity)
    }

    /// Acquire an empty buffer with at least `capacity` bytes reserved
    pub fn rent(&self, capacity: usize) -> PooledBuffer {
        let mut buffer = self
            .shared
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_default();
        buffer.reserve(capacity);
        self.shared.rented.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            buffer,
            pool: self.shared.clone(),
            detached: false,
        }
    }

    /// Rent a buffer holding a copy of `data`, its length exactly the message length
    pub fn rent_copy(&self, data: &[u8]) -> PooledBuffer {
        let mut buffer = self.rent(data.len());
        buffer.extend_from_slice(data);
        buffer
    }

    /// Number of idle buffers ready for reuse
    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Total buffers handed out since creation
    pub fn rented(&self) -> u64 {
        self.shared.rented.load(Ordering::Acquire)
    }

    /// Total buffers handed back since creation
    pub fn returned(&self) -> u64 {
        self.shared.returned.load(Ordering::Acquire)
    }

    /// Buffers currently rented and not yet returned
    pub fn outstanding(&self) -> u64 {
        self.rented().saturating_sub(self.returned())
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("available", &self.available())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(10);
        assert_eq!(pool.available(), 10);

        let mut buf = pool.acquire();
        assert_eq!(pool.available(), 9);

        buf.push(42);
        assert_eq!(buf[0], 42);

        drop(buf);
        assert_eq!(pool.available(), 10);
        assert_eq!(pool.rented(), 1);
        assert_eq!(pool.returned(), 1);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(1);

        {
            let mut buf1 = pool.acquire();
            buf1.extend_from_slice(b"test");
            assert_eq!(buf1.len(), 4);
        }

        // Buffer should be returned and cleared
        let buf2 = pool.acquire();
        assert_eq!(buf2.len(), 0);
        assert!(buf2.capacity() >= 4);
    }

    #[test]
    fn test_rent_copy_is_exact() {
        let pool = BufferPool::new(1);
        let buf = pool.rent_copy(&[9u8; 300]);
        assert_eq!(buf.len(), 300);
        assert!(buf.iter().all(|b| *b == 9));
    }

    #[test]
    fn test_buffer_size_limit() {
        let pool = BufferPool::new(1);

        {
            let mut buf = pool.acquire();
            buf.extend_from_slice(&vec![0u8; MAX_POOLED_BUFFER_SIZE + 1]);
        }

        // Large buffer is released, but still counted as returned
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_into_inner_counts_once() {
        let pool = BufferPool::new(1);
        let buf = pool.rent_copy(b"abc");
        let raw = buf.into_inner();
        assert_eq!(raw, b"abc");
        assert_eq!(pool.returned(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = BufferPool::new(2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.outstanding(), 0);
    }
}
