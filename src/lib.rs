//! Power-of-four buddy memory pools for bare-metal and RTOS kernels.
//!
//! A [`Pool`] manages a single fixed-size arena made of `n_max` blocks of
//! `max_block_size` bytes. Each block can be split into four children at the
//! next level, down to `LEVELS` levels, and four free siblings are merged
//! back into their parent as soon as they are all free again.
//!
//! Pools are shared by reference: every operation takes `&self` and
//! serializes itself with the pool's lock. The lock regime is chosen with the
//! `L` type parameter:
//!
//! - [`IrqLock`] masks interrupts via [`critical-section`], so the pool may be
//!   used from interrupt handlers.
//! - [`MutexLock`] uses any [`lock_api::RawMutex`], for thread context only.
//!
//! Locks are never held for more than one level's worth of bookkeeping; a
//! multi-level split or merge releases and reacquires the lock between
//! levels.
//!
//! [`Heap`] layers a conventional `alloc`/`free` interface on top of a pool
//! by storing a small header in front of each allocation.
//!
//! [`critical-section`]: https://docs.rs/critical-section

#![doc(html_root_url = "https://docs.rs/quad_pool/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]
#![cfg_attr(docs_rs, feature(doc_cfg))]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
mod core;
mod free_list;
pub mod geometry;
pub mod heap;
pub mod lock;
pub mod pool;

#[cfg(test)]
mod tests;

use crate::core::{
    alloc::Layout,
    fmt,
    ptr::NonNull,
};

pub use crate::{
    heap::Heap,
    lock::{IrqLock, MutexLock, PoolLock},
    pool::{Block, BlockId, Pool, PoolConfig, PoolStats},
};

/// The error type for allocator constructors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory for the pool's storage region, but the underlying allocator
    /// fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the pool is invalid.
    ///
    /// This variant is returned when a pool's configuration parameters are
    /// impossible to satisfy, e.g. a maximum block size that is not a
    /// multiple of the machine word, or a level count that shrinks blocks
    /// below one word.
    InvalidConfig,

    /// The location of the pool's storage region is invalid.
    ///
    /// This variant is returned when a region passed to a raw constructor is
    /// not aligned to a machine word, or extends past the end of the address
    /// space.
    InvalidLocation,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate pool storage (size {}, align {})",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid pool configuration"),
            AllocInitError::InvalidLocation => f.write_str("invalid pool storage location"),
        }
    }
}

/// Indicates an allocation failure: no free block is large enough to satisfy
/// the request.
///
/// This is also returned for requests larger than the pool's maximum block
/// size and for pools with no levels. The pool's state is never modified by
/// a failed allocation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory pool exhausted")
    }
}

/// Types which provide memory which backs a pool.
///
/// This is implemented by the following types:
/// - The `Raw` marker type indicates that a pool is not backed by another
///   allocator. This is the case when constructing the pool from a raw
///   pointer, e.g. to a static buffer. Memory used by the pool can be
///   reclaimed using `.into_raw_parts()`.
/// - The `Global` marker type indicates that a pool is backed by the global
///   allocator. The pool will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this
    ///   allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a pool is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

/// The global memory allocator.
#[cfg(any(feature = "alloc", test))]
#[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
