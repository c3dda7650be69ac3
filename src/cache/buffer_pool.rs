//! Reusable block buffers and the handle type every block read returns.
//!
//! Blocks read for short-lived or one-pass work (opening a table, compactions) are
//! decoded into pooled buffers instead of being published to the shared cache. A
//! [`PooledBuf`] goes back to its pool when dropped.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A free list of byte buffers.
///
/// The pool is shared through an `Arc`; checked out buffers keep the pool alive.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_free: usize,
}

impl BufferPool {
    /// Creates a pool retaining at most `max_free` idle buffers.
    pub fn new(max_free: usize) -> Arc<Self> {
        Arc::new(Self { free: Mutex::new(Vec::with_capacity(max_free)), max_free })
    }

    /// Checks out a zeroed buffer of length `n`, reusing an idle one when it is
    /// large enough.
    pub fn alloc(self: &Arc<Self>, n: usize) -> PooledBuf {
        let mut buf = {
            let mut free = self.free.lock();
            match free.iter().position(|b| b.capacity() >= n) {
                Some(i) => free.swap_remove(i),
                None => Vec::with_capacity(n),
            }
        };
        buf.clear();
        buf.resize(n, 0);
        PooledBuf { buf, pool: Arc::clone(self) }
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`].
pub struct PooledBuf {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// Shrinks the visible length, keeping the allocation.
    pub fn truncate(&mut self, n: usize) {
        self.buf.truncate(n);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf").field("len", &self.buf.len()).finish()
    }
}

/// The decoded contents of a block.
///
/// Either a reference-counted `Bytes` (owned, or shared with the block cache) or a
/// pooled buffer. Dropping the handle releases it.
#[derive(Debug)]
pub enum BufferHandle {
    /// Shared or owned bytes.
    Shared(Bytes),
    /// A buffer that returns to its pool on drop.
    Pooled(PooledBuf),
}

impl BufferHandle {
    /// A handle holding no data.
    pub fn empty() -> Self {
        BufferHandle::Shared(Bytes::new())
    }

    /// The underlying `Bytes`, when the block is not pooled.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            BufferHandle::Shared(b) => Some(b),
            BufferHandle::Pooled(_) => None,
        }
    }

    /// Converts into `Bytes`, copying pooled contents.
    pub fn into_bytes(self) -> Bytes {
        match self {
            BufferHandle::Shared(b) => b,
            BufferHandle::Pooled(p) => Bytes::copy_from_slice(&p),
        }
    }

    /// Returns a zero-copy slice when possible, otherwise a copy.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Bytes {
        match self {
            BufferHandle::Shared(b) => b.slice(range),
            BufferHandle::Pooled(p) => Bytes::copy_from_slice(&p[range]),
        }
    }
}

impl Default for BufferHandle {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for BufferHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            BufferHandle::Shared(b) => b,
            BufferHandle::Pooled(p) => p,
        }
    }
}

impl From<Bytes> for BufferHandle {
    fn from(b: Bytes) -> Self {
        BufferHandle::Shared(b)
    }
}

impl From<Vec<u8>> for BufferHandle {
    fn from(v: Vec<u8>) -> Self {
        BufferHandle::Shared(Bytes::from(v))
    }
}

impl From<PooledBuf> for BufferHandle {
    fn from(p: PooledBuf) -> Self {
        BufferHandle::Pooled(p)
    }
}
