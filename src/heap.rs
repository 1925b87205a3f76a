//! A pointer-based allocation interface over a pool.
//!
//! [`Heap`] stores a small header at the start of every block it hands
//! out, so callers only need to keep the returned pointer. Heaps always use
//! the mutex regime and must not be used from interrupt context.

use crate::core::{
    alloc::{GlobalAlloc, Layout},
    fmt, mem,
    ptr::{self, NonNull, NonNullStrict},
};

use crate::{
    geometry::{self, WORD},
    lock::MutexLock,
    pool::{BlockId, Pool, PoolConfig},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The header stored in front of every heap allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
struct BlockHeader {
    /// The arena address of the owning pool.
    pool: usize,
    index: u32,
    level: u8,
}

/// The number of bytes reserved in front of each allocation.
///
/// This is a whole number of words, so data pointers keep word alignment.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % WORD == 0);

/// A heap-style allocator backed by a mutex-regime [`Pool`].
///
/// `R` is the raw mutex type protecting the pool, e.g.
/// `parking_lot::RawMutex` or a kernel mutex with priority inheritance.
///
/// Every allocation costs [`HEADER_SIZE`] bytes of its block, so the largest
/// possible allocation is `max_block_size - HEADER_SIZE` bytes. Data pointers
/// are aligned to the machine word.
pub struct Heap<const LEVELS: usize, R: lock_api::RawMutex, A: BackingAllocator> {
    pool: Pool<LEVELS, MutexLock<R>, A>,
}

impl<const LEVELS: usize, R: lock_api::RawMutex> Heap<LEVELS, R, Raw> {
    /// Constructs a new `Heap` from a raw pointer.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Pool::new_raw`].
    ///
    /// # Safety
    ///
    /// The same requirements apply as for [`Pool::new_raw`]; the region's
    /// layout is given by [`Self::region_layout`].
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        config: PoolConfig,
    ) -> Result<Heap<LEVELS, R, Raw>, AllocInitError> {
        let pool = unsafe { Pool::new_raw(region, config, MutexLock::new())? };

        Ok(Heap { pool })
    }

    /// Decomposes the heap into its storage region pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        unsafe { self.pool.into_raw_parts() }
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const LEVELS: usize, R: lock_api::RawMutex> Heap<LEVELS, R, Global> {
    /// Attempts to construct a new `Heap` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`Pool::try_new`].
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(config: PoolConfig) -> Result<Heap<LEVELS, R, Global>, AllocInitError> {
        let pool = Pool::try_new(config, MutexLock::new())?;

        Ok(Heap { pool })
    }
}

impl<const LEVELS: usize, R: lock_api::RawMutex, A: BackingAllocator> Heap<LEVELS, R, A> {
    /// Returns the layout requirements of the storage region of a heap of this
    /// type.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid for `LEVELS` levels.
    pub fn region_layout(config: PoolConfig) -> Result<Layout, AllocInitError> {
        Pool::<LEVELS, MutexLock<R>, A>::region_layout(config)
    }

    /// Returns the pool backing this heap.
    #[inline]
    pub fn pool(&self) -> &Pool<LEVELS, MutexLock<R>, A> {
        &self.pool
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// The returned memory is uninitialized and aligned to the machine word.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no free block can hold `size` bytes plus the header.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = size.checked_add(HEADER_SIZE).ok_or(AllocError)?;
        let block = self.pool.block_alloc(total)?;

        let header = BlockHeader {
            pool: self.pool.arena_addr().get(),
            // Block indices fit the free lists' `u32` links, and word
            // rounding keeps the level count far below 256.
            index: block.id.index as u32,
            level: block.id.level as u8,
        };

        let start = block.ptr.cast::<u8>();

        // SAFETY: the block is at least `total` bytes and word aligned, and is
        // exclusively owned by this allocation.
        unsafe {
            start.cast::<BlockHeader>().as_ptr().write(header);
            Ok(NonNull::new_unchecked(start.as_ptr().add(HEADER_SIZE)))
        }
    }

    /// Allocates zeroed memory for `count` values of `size` bytes each.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `count * size` overflows or the allocation fails.
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let bytes = count.checked_mul(size).ok_or(AllocError)?;
        let ptr = self.alloc(bytes)?;

        // SAFETY: the allocation is valid for `bytes` bytes.
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };

        Ok(ptr)
    }

    /// Reads the header of the allocation at `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not point into this heap's arena, or if its header
    /// names another pool.
    ///
    /// # Safety
    ///
    /// If `ptr` points into this heap's arena, it must have been returned by
    /// this heap and not yet freed.
    unsafe fn header(&self, ptr: NonNull<u8>) -> BlockHeader {
        let addr = NonNullStrict::addr(ptr);

        let inside = self
            .pool
            .arena_offset(addr)
            .map_or(false, |offset| offset >= HEADER_SIZE);
        assert!(inside, "{ptr:p} was not allocated by this heap");

        // SAFETY: the header lies inside the arena, directly before `ptr`.
        let header = unsafe { ptr.as_ptr().sub(HEADER_SIZE).cast::<BlockHeader>().read() };

        assert_eq!(
            header.pool,
            self.pool.arena_addr().get(),
            "{ptr:p} was not allocated by this heap"
        );

        header
    }

    /// Frees the allocation at `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if the allocation's header names a different pool, or if the
    /// block is not currently allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since, and
    /// must not be used afterward.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let header = unsafe { self.header(ptr) };

        let id = BlockId {
            level: usize::from(header.level),
            index: header.index as usize,
        };

        // SAFETY: the header was written when the block was allocated.
        unsafe { self.pool.block_free(id) };
    }

    /// Returns the number of bytes the allocation at `ptr` may use.
    ///
    /// This is the size of the underlying block less the header, and is never
    /// smaller than the size that was requested.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let header = unsafe { self.header(ptr) };

        // Block sizes are not stored; walk the levels down from the top.
        geometry::level_sizes(self.pool.max_block_size())
            .nth(usize::from(header.level))
            .map_or(0, |size| size - HEADER_SIZE)
    }

    /// Checks whether the allocation at `ptr` can grow to `new_size` bytes
    /// without moving.
    ///
    /// Returns `Ok` with the number of bytes to spare if the block already
    /// covers `new_size`, or `Err` with the usable size of the block if it
    /// does not. The allocation itself is never changed.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since.
    pub unsafe fn try_expand_in_place(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<usize, usize> {
        let usable = unsafe { self.usable_size(ptr) };

        usable.checked_sub(new_size).ok_or(usable)
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// If the block already covers `new_size`, `ptr` is returned unchanged.
    /// Otherwise a new allocation is made, the contents are copied, and the
    /// old allocation is freed.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a new allocation was needed and failed, in which case
    /// the original allocation is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not freed since. On
    /// success, `ptr` must no longer be used unless it was returned.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let usable = match unsafe { self.try_expand_in_place(ptr, new_size) } {
            Ok(_) => return Ok(ptr),
            Err(usable) => usable,
        };

        let new = self.alloc(new_size)?;

        // SAFETY: both allocations are valid for `usable` bytes, since
        // `usable < new_size`, and distinct allocations never overlap.
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), usable);
            self.free(ptr);
        }

        Ok(new)
    }
}

// SAFETY: allocations come from a pool that never hands out a block twice.
// Layouts aligned beyond a machine word are refused.
unsafe impl<const LEVELS: usize, R: lock_api::RawMutex, A: BackingAllocator> GlobalAlloc
    for Heap<LEVELS, R, A>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD {
            return ptr::null_mut();
        }

        Heap::alloc(self, layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD {
            return ptr::null_mut();
        }

        self.calloc(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(ptr) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };

        debug_assert!(layout.align() <= WORD);

        unsafe { Heap::realloc(self, ptr, new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

impl<const LEVELS: usize, R: lock_api::RawMutex, A: BackingAllocator> fmt::Debug
    for Heap<LEVELS, R, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap").field("pool", &self.pool).finish()
    }
}
