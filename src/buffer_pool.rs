//! Reusable chunk buffers
//!
//! Payload generation and upload draining both work in fixed-size chunks.
//! The server keeps a small shared pool so busy connections do not allocate
//! a fresh chunk per request.

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A thread-safe pool of equally sized byte buffers.
#[derive(Debug)]
pub struct BufferPool {
    pool: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pool_size: usize,
}

impl BufferPool {
    /// Creates a pool handing out `buffer_size`-byte buffers and retaining at
    /// most `max_pool_size` idle ones.
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(Vec::with_capacity(max_pool_size)),
            buffer_size,
            max_pool_size,
        })
    }

    /// Takes a buffer from the pool, allocating if none is idle.
    ///
    /// The buffer returns to the pool when the guard is dropped. Contents are
    /// whatever the previous user left behind.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }

        let mut pool = self.pool.lock();
        if pool.len() < self.max_pool_size {
            pool.push(buffer);
        }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.pool.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buffer));
    }
}
