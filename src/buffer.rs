//! Pooled envelope buffers.
//!
//! Session readers take one buffer per envelope, sized to the envelope's
//! declared length. A [`PooledBuffer`] goes back to its pool when dropped,
//! so every exit path (delivered message, decode failure, aborted read)
//! returns it.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use object_pool::{Pool, ReusableOwned};

use crate::error::CommunicationError;

/// Default number of idle buffers retained.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Hands out envelope buffers no larger than a configured maximum.
#[derive(Clone)]
pub struct BufferManager {
    pool: Arc<Pool<Vec<u8>>>,
    max_buffer_size: usize,
    outstanding: Arc<AtomicUsize>,
}

impl BufferManager {
    /// Create a manager retaining up to `max_pool_size` idle buffers, each
    /// holding at most `max_buffer_size` bytes.
    #[must_use]
    pub fn new(max_pool_size: usize, max_buffer_size: usize) -> Self {
        Self {
            pool: Arc::new(Pool::new(max_pool_size, Vec::new)),
            max_buffer_size,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Largest buffer this manager will hand out.
    #[must_use]
    pub fn max_buffer_size(&self) -> usize { self.max_buffer_size }

    /// Buffers currently taken and not yet returned.
    #[must_use]
    pub fn outstanding(&self) -> usize { self.outstanding.load(Ordering::Acquire) }

    /// Take an empty buffer with room for `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CommunicationError::QuotaExceeded`] if `size` exceeds the
    /// configured maximum. Nothing is allocated in that case.
    pub fn take(&self, size: usize) -> Result<PooledBuffer, CommunicationError> {
        if size > self.max_buffer_size {
            return Err(CommunicationError::QuotaExceeded {
                size,
                max: self.max_buffer_size,
            });
        }
        let mut inner = self.pool.pull_owned(Vec::new);
        inner.clear();
        inner.reserve(size);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(PooledBuffer {
            inner,
            outstanding: Arc::clone(&self.outstanding),
        })
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, crate::config::DEFAULT_MAX_BUFFER_SIZE)
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("max_buffer_size", &self.max_buffer_size)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

/// A buffer that returns to its [`BufferManager`] when dropped.
pub struct PooledBuffer {
    inner: ReusableOwned<Vec<u8>>,
    outstanding: Arc<AtomicUsize>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) { self.outstanding.fetch_sub(1, Ordering::AcqRel); }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target { &self.inner }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target { &mut self.inner }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] { self.inner.as_slice() }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}
