//! Receive buffer pool shared by the sessions of one worker.
//! Every receive needs a full-size datagram buffer; reusing them keeps the
//! steady state allocation free.
use std::sync::{Arc, Mutex, PoisonError};

use crate::packet::MAX_PACKET_SIZE;

const POOL_SIZE: usize = 128;

#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(Vec::with_capacity(POOL_SIZE))),
            buffer_size,
        }
    }

    /// Pool of buffers large enough for any TFTP datagram
    pub fn for_datagrams() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }

    /// Acquire a buffer of exactly `buffer_size` bytes
    pub fn acquire(&self) -> Vec<u8> {
        let reused = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match reused {
            Some(buffer) => buffer,
            None => vec![0u8; self.buffer_size],
        }
    }

    /// Return a buffer to the pool
    pub fn release(&self, mut buffer: Vec<u8>) {
        // Buffers that came back resized are brought back to full size
        buffer.resize(self.buffer_size, 0);

        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < POOL_SIZE {
            pool.push(buffer);
        }
    }

    /// Number of buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
