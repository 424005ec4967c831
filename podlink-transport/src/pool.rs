//! Process-wide buffer pool (spec §4.2).
//!
//! Buffers are fixed-size, at least [`MIN_POOLED_BUFFER`] bytes so a
//! maximum-size framed UDP payload plus its two-byte header always
//! fits without a reallocation. `acquire` never blocks — under
//! contention the pool simply allocates a fresh buffer rather than
//! gating callers on a lock.

use crossbeam_queue::ArrayQueue;
use once_cell::sync::Lazy;
use podlink_core::types::MIN_POOLED_BUFFER;
use std::sync::Arc;

/// A buffer on loan from the pool. Returned automatically on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer taken before drop")
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer taken before drop")
    }

    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            if cfg!(debug_assertions) {
                // Poison released buffers in debug builds so a stray
                // reference to a buffer believed to still be on loan
                // is loud instead of silently reading stale bytes.
                buf.iter_mut().for_each(|b| *b = 0xAA);
            }
            self.pool.release_raw(buf);
        }
    }
}

/// A process-wide pool of fixed-capacity byte buffers.
pub struct BufferPool {
    capacity: usize,
    free: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    pub fn new(capacity: usize, max_pooled: usize) -> Arc<Self> {
        let capacity = capacity.max(MIN_POOLED_BUFFER);
        Arc::new(Self {
            capacity,
            free: ArrayQueue::new(max_pooled),
        })
    }

    /// Acquires a buffer of at least the configured capacity with
    /// unspecified contents. Non-blocking: grows the pool (allocates a
    /// fresh buffer) under contention rather than waiting.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.free.pop().unwrap_or_else(|| vec![0u8; self.capacity]);
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release_raw(&self, buf: Vec<u8>) {
        // If the free-list is at capacity the buffer is simply
        // dropped instead of growing an unbounded queue.
        let _ = self.free.push(buf);
    }
}

/// Default process-wide pool, sized for the maximum framed UDP
/// payload. Most callers should share this instance rather than
/// constructing their own.
pub static GLOBAL_POOL: Lazy<Arc<BufferPool>> = Lazy::new(|| BufferPool::new(MIN_POOLED_BUFFER, 4096));
