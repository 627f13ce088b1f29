//! Pooled scratch buffers.
//!
//! Buffers come in three capacity tiers. Borrowing returns a [`PooledBuf`]
//! guard; dropping the guard hands the buffer back to its tier. Requests larger
//! than the biggest tier get a one-off heap allocation that is freed on drop.
//! Buffers are not zeroed on reuse.

use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use crate::error::WireError;

/// Capacity of the header tier
pub const HEADER_TIER: usize = 32;
/// Capacity of the actor tier
pub const ACTOR_TIER: usize = 256;
/// Capacity of the data tier
pub const DATA_TIER: usize = 64 * 1024;

/// Free buffers kept per tier
const MAX_FREE_PER_TIER: usize = 16;

/// Capacity class of a pooled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Up to [`HEADER_TIER`] bytes
    Header,
    /// Up to [`ACTOR_TIER`] bytes
    Actor,
    /// Up to [`DATA_TIER`] bytes
    Data,
    /// Larger than every tier; never pooled
    Oversize(usize),
}

impl SizeClass {
    /// Smallest class that holds `len` bytes
    pub fn for_len(len: usize) -> Self {
        if len <= HEADER_TIER {
            SizeClass::Header
        } else if len <= ACTOR_TIER {
            SizeClass::Actor
        } else if len <= DATA_TIER {
            SizeClass::Data
        } else {
            SizeClass::Oversize(len)
        }
    }

    /// Capacity allocated for this class
    pub fn capacity(self) -> usize {
        match self {
            SizeClass::Header => HEADER_TIER,
            SizeClass::Actor => ACTOR_TIER,
            SizeClass::Data => DATA_TIER,
            SizeClass::Oversize(len) => len,
        }
    }

    fn tier(self) -> Option<usize> {
        match self {
            SizeClass::Header => Some(0),
            SizeClass::Actor => Some(1),
            SizeClass::Data => Some(2),
            SizeClass::Oversize(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct Tiers {
    free: [Vec<Vec<u8>>; 3],
    allocated: usize,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers allocated from the heap so far
    pub allocated: usize,
    /// Buffers currently free, per tier
    pub free: [usize; 3],
}

/// Buffer pool shared by the connections of one engine.
///
/// Cloning yields another handle to the same pool. The pool is meant for a
/// single reactor thread and is deliberately `!Send`.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    inner: Rc<RefCell<Tiers>>,
}

impl BufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow a buffer of the given class. Never blocks; falls back to the heap
    /// when the tier is empty.
    pub fn acquire(&self, class: SizeClass) -> Result<PooledBuf, WireError> {
        let reused = class
            .tier()
            .and_then(|tier| self.inner.borrow_mut().free[tier].pop());

        let buf = match reused {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                let capacity = class.capacity();
                let mut buf = Vec::new();
                buf.try_reserve_exact(capacity)
                    .map_err(|_| WireError::OutOfMemory(capacity))?;
                self.inner.borrow_mut().allocated += 1;
                buf
            }
        };

        Ok(PooledBuf {
            buf: Some(buf),
            class,
            pool: self.clone(),
        })
    }

    /// Borrow a buffer big enough for `len` bytes
    pub fn acquire_for(&self, len: usize) -> Result<PooledBuf, WireError> {
        self.acquire(SizeClass::for_len(len))
    }

    /// Current statistics
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            allocated: inner.allocated,
            free: [
                inner.free[0].len(),
                inner.free[1].len(),
                inner.free[2].len(),
            ],
        }
    }

    fn release(&self, class: SizeClass, buf: Vec<u8>) {
        let Some(tier) = class.tier() else {
            return;
        };
        // A caller may have grown the buffer past its tier; keep the pool honest.
        if buf.capacity() < class.capacity() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        if inner.free[tier].len() < MAX_FREE_PER_TIER {
            inner.free[tier].push(buf);
        }
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop
#[derive(Debug)]
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    class: SizeClass,
    pool: BufferPool,
}

impl PooledBuf {
    /// Capacity class this buffer was borrowed under
    pub fn class(&self) -> SizeClass {
        self.class
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(self.class, buf);
        }
    }
}
