//! Reusable PCM buffer pool with a zero-on-reuse discipline.
//!
//! Every buffer leaving the pool is zero-filled at exactly the requested
//! size, and the pool is purged (buffers zeroed and discarded) between
//! responses. Stale tail bytes from a previous utterance must never reach
//! the output device.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Buffers shorter than this are cheaper to reallocate than to pool.
const MIN_POOLED_LEN: usize = 256;

/// Bounded pool of reusable byte buffers for audio chunks.
pub struct BufferPool {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    /// Create a pool holding at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Acquire a zero-filled buffer of exactly `size` bytes.
    ///
    /// A pooled buffer of a different length is discarded rather than
    /// resized, so callers can never observe stale tail bytes.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        match buffers.pop_front() {
            Some(mut buf) if buf.len() == size => {
                buf.fill(0);
                buf
            }
            _ => vec![0u8; size],
        }
    }

    /// Return a buffer to the pool for reuse.
    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() < MIN_POOLED_LEN {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.capacity {
            buffers.push_back(buf);
        }
    }

    /// Zero and discard every idle buffer. Called between responses so no
    /// residual audio can bleed into a new utterance.
    pub fn purge(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        for buf in buffers.iter_mut() {
            buf.fill(0);
        }
        buffers.clear();
        debug!("buffer pool purged between responses");
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_exact_size_zeroed() {
        let pool = BufferPool::new(4);
        let buf = pool.acquire(512);
        assert_eq!(buf.len(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn reused_buffer_is_zeroed() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire(512);
        buf.fill(0x7f);
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let again = pool.acquire(512);
        assert_eq!(again.len(), 512);
        assert!(again.iter().all(|&b| b == 0));
    }

    #[test]
    fn size_mismatch_allocates_fresh() {
        let pool = BufferPool::new(4);
        let mut buf = pool.acquire(512);
        buf.fill(0x7f);
        pool.release(buf);

        let other = pool.acquire(960);
        assert_eq!(other.len(), 960);
        assert!(other.iter().all(|&b| b == 0));
    }

    #[test]
    fn short_buffers_are_not_pooled() {
        let pool = BufferPool::new(4);
        pool.release(vec![1u8; 64]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn purge_empties_the_pool() {
        let pool = BufferPool::new(4);
        pool.release(vec![1u8; 512]);
        pool.release(vec![2u8; 512]);
        assert_eq!(pool.idle(), 2);
        pool.purge();
        assert_eq!(pool.idle(), 0);
    }
}
