//! Fixed-size buffer pool for sample stream transfers.
//!
//! A stream session owns exactly one [`BufferPool`]. Buffers are handed to the
//! transport by value while a transfer is in flight and return to the pool
//! automatically when the [`PooledBuffer`] is dropped, wherever that happens
//! (in the stream engine, in a caller callback, or inside a transport worker
//! that is cancelling outstanding transfers).
//!
//! Because ownership of the memory travels with the transfer, a pool can
//! never be freed while the transport still writes into one of its buffers:
//! the caller simply waits for [`BufferPool::wait_all_returned`].
//!
//! # Example
//!
//! ```
//! use sdr_pool::BufferPool;
//! use std::time::Duration;
//!
//! let pool = BufferPool::try_new(4, 4096)?;
//!
//! let mut buf = pool.try_acquire().expect("pool has free buffers");
//! buf[0] = 0x7f;
//! buf.set_valid_len(1);
//! assert_eq!(pool.available(), 3);
//!
//! drop(buf);
//! assert!(pool.wait_all_returned(Duration::from_millis(10)));
//! # Ok::<(), sdr_pool::PoolError>(())
//! ```

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Upper bound on the total memory a single pool may pre-allocate.
pub const MAX_POOL_BYTES: usize = 1 << 30;

/// Errors raised while building a pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Zero buffers or zero-length buffers were requested.
    #[error("Invalid pool geometry: {pool_size} buffers of {buffer_len} bytes")]
    InvalidGeometry { pool_size: usize, buffer_len: usize },

    /// The requested geometry exceeds [`MAX_POOL_BYTES`] or overflows `usize`.
    #[error("Pool of {pool_size} x {buffer_len} bytes exceeds the {max_bytes} byte limit")]
    TooLarge {
        pool_size: usize,
        buffer_len: usize,
        max_bytes: usize,
    },

    /// The allocator refused the memory.
    #[error("Allocation of {bytes} bytes for the buffer pool failed")]
    AllocationFailed { bytes: usize },
}

struct PoolInner {
    /// Lock-free queue of free buffers.
    free: SegQueue<Vec<u8>>,
    /// Waiters for `acquire_timeout` / `wait_all_returned`.
    waiters: Mutex<()>,
    returned: Condvar,
    buffer_len: usize,
    pool_size: usize,
    available: AtomicUsize,
    total_acquires: AtomicU64,
    total_returns: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, mut buffer: Vec<u8>) {
        // Buffers always keep their full fixed length.
        buffer.resize(self.buffer_len, 0);
        self.free.push(buffer);
        self.available.fetch_add(1, Ordering::AcqRel);
        self.total_returns.fetch_add(1, Ordering::Relaxed);

        let _guard = self.waiters.lock();
        self.returned.notify_all();
    }
}

/// Pool of pre-allocated, fixed-length byte buffers.
///
/// Cloning a `BufferPool` clones a handle to the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("pool_size", &self.inner.pool_size)
            .field("buffer_len", &self.inner.buffer_len)
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    /// Pre-allocate `pool_size` buffers of `buffer_len` bytes each.
    ///
    /// Allocation is all-or-nothing: on failure every buffer allocated so far
    /// is released before the error is returned.
    pub fn try_new(pool_size: usize, buffer_len: usize) -> Result<Self, PoolError> {
        if pool_size == 0 || buffer_len == 0 {
            return Err(PoolError::InvalidGeometry {
                pool_size,
                buffer_len,
            });
        }

        let total = pool_size
            .checked_mul(buffer_len)
            .filter(|total| *total <= MAX_POOL_BYTES)
            .ok_or(PoolError::TooLarge {
                pool_size,
                buffer_len,
                max_bytes: MAX_POOL_BYTES,
            })?;

        let mut staged: Vec<Vec<u8>> = Vec::new();
        staged
            .try_reserve_exact(pool_size)
            .map_err(|_| PoolError::AllocationFailed { bytes: total })?;

        for _ in 0..pool_size {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(buffer_len)
                .map_err(|_| PoolError::AllocationFailed { bytes: total })?;
            buffer.resize(buffer_len, 0);
            staged.push(buffer);
        }

        let free = SegQueue::new();
        for buffer in staged {
            free.push(buffer);
        }

        debug!(pool_size, buffer_len, total_bytes = total, "BufferPool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                free,
                waiters: Mutex::new(()),
                returned: Condvar::new(),
                buffer_len,
                pool_size,
                available: AtomicUsize::new(pool_size),
                total_acquires: AtomicU64::new(0),
                total_returns: AtomicU64::new(0),
            }),
        })
    }

    /// Take a free buffer without blocking.
    ///
    /// Returns `None` when every buffer is loaned out.
    #[must_use]
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let buffer = self.inner.free.pop()?;
        self.inner.available.fetch_sub(1, Ordering::AcqRel);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        trace!(available = self.available(), "Buffer acquired");

        Some(PooledBuffer {
            buffer: Some(buffer),
            valid_len: 0,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Take a free buffer, waiting up to `timeout` for one to be returned.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PooledBuffer> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(buffer) = self.try_acquire() {
                return Some(buffer);
            }

            let mut guard = self.inner.waiters.lock();
            // Re-check under the lock so a concurrent return cannot be missed.
            if let Some(buffer) = self.try_acquire() {
                return Some(buffer);
            }
            if self
                .inner
                .returned
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                drop(guard);
                return self.try_acquire();
            }
        }
    }

    /// Block until every buffer is back in the pool or `timeout` elapses.
    ///
    /// Returns `true` when the pool is full again.
    pub fn wait_all_returned(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.waiters.lock();
        while self.available() < self.inner.pool_size {
            if self
                .inner
                .returned
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.available() == self.inner.pool_size;
            }
        }
        true
    }

    /// Number of buffers currently in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }

    /// Number of buffers currently loaned out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.pool_size - self.available()
    }

    /// Total number of buffers owned by the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.pool_size
    }

    /// Length of every buffer in bytes.
    #[must_use]
    pub fn buffer_len(&self) -> usize {
        self.inner.buffer_len
    }

    /// Acquisitions since creation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    /// Returns since creation.
    #[must_use]
    pub fn total_returns(&self) -> u64 {
        self.inner.total_returns.load(Ordering::Relaxed)
    }
}

/// A buffer loaned from a [`BufferPool`].
///
/// Dereferences to the full fixed-length byte slice. `valid_len` records how
/// many leading bytes carry samples (set by whoever filled the buffer).
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    valid_len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Bytes holding valid samples.
    #[must_use]
    pub fn valid(&self) -> &[u8] {
        &self[..self.valid_len]
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    /// Record how many leading bytes are valid, clamped to the buffer length.
    pub fn set_valid_len(&mut self, len: usize) {
        self.valid_len = len.min(self.capacity());
    }

    /// Fixed length of the buffer in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("valid_len", &self.valid_len)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pool_creation() {
        let pool = BufferPool::try_new(4, 1024).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.buffer_len(), 1024);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(matches!(
            BufferPool::try_new(0, 1024),
            Err(PoolError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            BufferPool::try_new(4, 0),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_too_large_is_rejected_without_allocating() {
        let err = BufferPool::try_new(usize::MAX / 2, 4).unwrap_err();
        assert!(matches!(err, PoolError::TooLarge { .. }));

        let err = BufferPool::try_new(1024, MAX_POOL_BYTES).unwrap_err();
        assert!(matches!(err, PoolError::TooLarge { .. }));
    }

    #[test]
    fn test_try_acquire_exhaustion() {
        let pool = BufferPool::try_new(2, 64).unwrap();

        let buf1 = pool.try_acquire();
        assert!(buf1.is_some());
        let buf2 = pool.try_acquire();
        assert!(buf2.is_some());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.outstanding(), 2);

        drop(buf1);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn test_buffers_keep_fixed_length() {
        let pool = BufferPool::try_new(1, 32).unwrap();
        let mut buf = pool.try_acquire().unwrap();
        assert_eq!(buf.len(), 32);
        buf[31] = 9;
        buf.set_valid_len(100);
        assert_eq!(buf.valid_len(), 32);
        drop(buf);

        let buf = pool.try_acquire().unwrap();
        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.valid_len(), 0);
    }

    #[test]
    fn test_acquire_timeout_expires() {
        let pool = BufferPool::try_new(1, 64).unwrap();
        let _held = pool.try_acquire().unwrap();

        let start = Instant::now();
        assert!(pool.acquire_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_acquire_timeout_wakes_on_return() {
        let pool = BufferPool::try_new(1, 64).unwrap();
        let held = pool.try_acquire().unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            drop(held);
        });

        let buf = pool.acquire_timeout(Duration::from_secs(2));
        assert!(buf.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_wait_all_returned_across_threads() {
        let pool = BufferPool::try_new(3, 64).unwrap();
        let loans: Vec<_> = (0..3).map(|_| pool.try_acquire().unwrap()).collect();
        assert!(!pool.wait_all_returned(Duration::from_millis(5)));

        let worker = thread::spawn(move || {
            for loan in loans {
                thread::sleep(Duration::from_millis(2));
                drop(loan);
            }
        });

        assert!(pool.wait_all_returned(Duration::from_secs(2)));
        worker.join().unwrap();
        assert_eq!(pool.total_acquires(), 3);
        assert_eq!(pool.total_returns(), 3);
    }
}
