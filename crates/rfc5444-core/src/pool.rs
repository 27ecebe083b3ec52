//! Fixed-size buffer pools with a minimum free reservoir.
//!
//! Packet handling allocates in two hot places: datagram buffers on the
//! receive path and message buffers on the assembly path. Both come from a
//! [`BufferPool`] that pre-allocates a reservoir of free buffers and never
//! shrinks below it, so nested parse/emit work during packet handling does
//! not hit the allocator. `outstanding()` tracks checked-out buffers; the
//! engine asserts it is zero after teardown.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

/// Reservoir kept pre-allocated per pool.
pub const MIN_FREE: usize = 32;

/// Free buffers retained beyond the reservoir before excess is released
/// back to the allocator.
const MAX_FREE: usize = MIN_FREE * 4;

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: &'static str,
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(name: &'static str, buf_size: usize) -> Self {
        let free = (0..MIN_FREE).map(|_| vec![0u8; buf_size]).collect();
        Self {
            inner: Arc::new(PoolInner {
                name,
                buf_size,
                free: Mutex::new(free),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Check out an empty buffer of the pool's size.
    pub fn acquire(&self) -> PooledBuf {
        let storage = self
            .inner
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buf_size]);
        self.inner.outstanding.fetch_add(1, Relaxed);
        PooledBuf { storage, len: 0, pool: self.inner.clone() }
    }

    /// Check out a buffer initialised with `data`. Content beyond the pool's
    /// buffer size is truncated.
    pub fn acquire_from(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.acquire();
        let len = data.len().min(buf.storage.len());
        buf.storage[..len].copy_from_slice(&data[..len]);
        buf.len = len;
        buf
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Relaxed)
    }

    /// Buffers sitting in the free list.
    pub fn free_count(&self) -> usize {
        self.inner.free.lock().unwrap().len()
    }
}

/// A checked-out buffer. Returns to its pool on drop.
pub struct PooledBuf {
    storage: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuf {
    /// Usable capacity (the pool's fixed buffer size).
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.storage.len());
        self.len = len.min(self.storage.len());
    }

    /// The whole backing buffer, for filling by `recv`-style calls.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..self.len]
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("pool", &self.pool.name)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.outstanding.fetch_sub(1, Relaxed);
        let mut free = self.pool.free.lock().unwrap();
        if free.len() < MAX_FREE {
            free.push(std::mem::take(&mut self.storage));
        }
    }
}
