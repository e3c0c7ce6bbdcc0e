//! Fixed-capacity pool of equally sized receive buffers.
//!
//! All segments are carved out of a single backing allocation made when the
//! pool is built. Free segments are tracked by offset on a [`LockFreeStack`],
//! so taking and returning a buffer never allocates and never locks.
//!
//! Running out of segments is treated as a sizing mistake rather than
//! back-pressure: the pool must be configured larger than the peak number of
//! live connections, and [`BufferPool::take`] reports [`PoolError::Exhausted`]
//! as soon as that assumption breaks.

use crate::sync::LockFreeStack;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("buffer pool exhausted: all {capacity} segments are in use")]
    Exhausted { capacity: usize },

    #[error("segment was not issued by this pool")]
    Foreign,

    #[error("invalid pool layout: {count} segments of {segment_len} bytes")]
    InvalidLayout { segment_len: usize, count: usize },
}

struct PoolInner {
    base: NonNull<u8>,
    total_len: usize,
    segment_len: usize,
    capacity: usize,
    free: LockFreeStack<usize>,
}

// SAFETY: the backing block is only reached through `Segment`, and the free list
// hands each offset to exactly one segment at a time.
unsafe impl Send for PoolInner {}
unsafe impl Sync for PoolInner {}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // SAFETY: every segment holds an `Arc<PoolInner>`, so none are alive here,
        // and `base`/`total_len` came from `Box::into_raw` in `BufferPool::new`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                self.total_len,
            )));
        }
    }
}

/// Cheaply cloneable handle to a shared pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(segment_len: usize, count: usize) -> Result<Self, PoolError> {
        let invalid = PoolError::InvalidLayout { segment_len, count };
        if segment_len == 0 || count == 0 {
            return Err(invalid);
        }
        let total_len = segment_len.checked_mul(count).ok_or(invalid)?;

        let backing = vec![0u8; total_len].into_boxed_slice();
        let base = NonNull::new(Box::into_raw(backing) as *mut u8).ok_or(invalid)?;

        let free = LockFreeStack::new();
        // Push in reverse so the first `take` hands out offset 0.
        for index in (0..count).rev() {
            free.push(index * segment_len);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                base,
                total_len,
                segment_len,
                capacity: count,
                free,
            }),
        })
    }

    pub fn take(&self) -> Result<Segment, PoolError> {
        match self.inner.free.pop() {
            Some(offset) => Ok(Segment {
                pool: Arc::clone(&self.inner),
                offset,
            }),
            None => Err(PoolError::Exhausted {
                capacity: self.inner.capacity,
            }),
        }
    }

    /// Hands a segment back explicitly. Dropping a segment has the same effect.
    pub fn put(&self, segment: Segment) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&self.inner, &segment.pool) {
            // Dropping it still returns it to the pool that issued it.
            return Err(PoolError::Foreign);
        }
        drop(segment);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn segment_len(&self) -> usize {
        self.inner.segment_len
    }

    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.capacity.saturating_sub(self.available())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("segment_len", &self.inner.segment_len)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive view of `segment_len` bytes inside a pool's backing block.
///
/// Returns itself to the pool on drop.
pub struct Segment {
    pool: Arc<PoolInner>,
    offset: usize,
}

impl Segment {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.pool.segment_len
    }

    pub fn is_empty(&self) -> bool {
        self.pool.segment_len == 0
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `offset` came off the free list, so this segment is the only live
        // view of `[offset, offset + segment_len)` until it is pushed back.
        unsafe {
            std::slice::from_raw_parts(
                self.pool.base.as_ptr().add(self.offset),
                self.pool.segment_len,
            )
        }
    }
}

impl DerefMut for Segment {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `deref`, plus `&mut self` rules out other borrows of this segment.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.base.as_ptr().add(self.offset),
                self.pool.segment_len,
            )
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.pool.free.push(self.offset);
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}
