//! Power-of-four buddy pools.
//!
//! A pool divides a fixed arena into `n_max` blocks of `max_block_size`
//! bytes. Each of those can be split into four blocks at the next level, and
//! so on for `LEVELS` levels. A block is never represented by an object of
//! its own; it is named by its level and its index within that level, and its
//! address is derived from the level geometry.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case  |
//! |--------------------------|-----------|-------------|
//! | Allocate                 | O(1)      | O(levels)   |
//! | Deallocate               | O(1)      | O(levels)   |
//!
//! Each critical section covers a single level; the lock is released and
//! reacquired between levels.
//!
//! #### Fragmentation
//!
//! Block sizes shrink by a factor of four per level, so a request may receive
//! a block up to four times larger than it asked for. Neighbouring free blocks
//! are only merged when all four siblings of a parent are free.

use crate::core::{
    alloc::Layout,
    array, fmt,
    mem::{self, ManuallyDrop},
    num::NonZeroUsize,
    ptr::NonNull,
};

use crate::{
    base::BasePtr,
    bitmap::{Bitmap, LevelBits},
    free_list::{BlockNum, FreeList, Link},
    geometry::{self, WORD},
    lock::{Guard, Locked, PoolLock},
    AllocError, AllocInitError, BackingAllocator, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The shape of a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// The size in bytes of the largest (level 0) blocks.
    ///
    /// This must be a non-zero multiple of the machine word size.
    pub max_block_size: usize,
    /// The number of level 0 blocks in the arena.
    pub n_max: usize,
}

impl PoolConfig {
    /// Creates a new `PoolConfig`.
    pub const fn new(max_block_size: usize, n_max: usize) -> PoolConfig {
        PoolConfig {
            max_block_size,
            n_max,
        }
    }
}

/// Identifies a block by its level and its index within that level.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockId {
    /// The level of the block. Level 0 holds the largest blocks.
    pub level: usize,
    /// The index of the block within its level.
    pub index: usize,
}

impl BlockId {
    /// Returns the block this block was split from, if any.
    #[inline]
    pub fn parent(self) -> Option<BlockId> {
        let level = self.level.checked_sub(1)?;

        Some(BlockId {
            level,
            index: self.index / 4,
        })
    }

    /// Returns the first of the four blocks this block splits into.
    #[inline]
    pub fn first_child(self) -> BlockId {
        BlockId {
            level: self.level + 1,
            index: self.index * 4,
        }
    }

    /// Returns the index of the first block in this block's sibling group.
    #[inline]
    fn first_sibling(self) -> usize {
        self.index & !3
    }
}

/// A block allocated from a pool.
#[derive(Copy, Clone, Debug)]
pub struct Block {
    /// The identity of the block, needed to free it.
    pub id: BlockId,
    /// The memory of the block.
    ///
    /// The length of the slice is the full size of the block's level, which
    /// may exceed the size that was requested.
    pub ptr: NonNull<[u8]>,
}

/// Memory usage of a pool, in bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// The size of the arena.
    pub total: usize,
    /// Bytes in blocks that are currently free.
    pub free: usize,
    /// Bytes that are allocated, or lost to word rounding inside split
    /// blocks.
    pub used: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total bytes: 0x{:x}", self.total)?;
        writeln!(f, "Free bytes:  0x{:x}", self.free)?;
        writeln!(f, "Used bytes:  0x{:x}", self.used)
    }
}

/// The bookkeeping of one level.
struct PoolLevel {
    bits: LevelBits,
    free: FreeList,
}

// SAFETY: the bitmap words and link tables a `PoolLevel` points to belong to
// the pool's storage region and are only reached through the pool's lock.
unsafe impl Send for PoolLevel {}

impl PoolLevel {
    /// Takes a free block and marks it allocated.
    #[inline]
    fn take_free(&mut self) -> Option<usize> {
        let index = self.free.pop_any()?;

        debug_assert!(!self.bits.is_set(index));
        self.bits.set(index);

        Some(index)
    }

    /// Marks an allocated block free.
    ///
    /// # Panics
    ///
    /// Panics if the block is not allocated.
    #[inline]
    fn release(&mut self, level: usize, index: usize) {
        if !self.bits.is_set(index) {
            panic!("double free of block {index} at level {level}");
        }

        self.bits.clear(index);
        self.free.push(index);
    }
}

type Levels<const LEVELS: usize> = [PoolLevel; LEVELS];

/// Splits the allocated block `parent` into four children, returning the
/// first child, which stays allocated. The other three become free.
fn split<const LEVELS: usize>(levels: &mut Levels<LEVELS>, parent: BlockId) -> BlockId {
    let child = parent.first_child();
    let level = &mut levels[child.level];

    debug_assert_eq!(level.bits.partner_nibble(child.index), 0);
    level.bits.set(child.index);

    for index in child.index + 1..child.index + 4 {
        level.free.push(index);
    }

    child
}

/// Where each part of the storage region lives.
///
/// The arena comes first. The bitmap words of the levels too large to keep
/// their bits inline follow it directly, and the free list link tables come
/// last.
struct StoragePlan<const LEVELS: usize> {
    layout: Layout,
    arena_size: usize,
    num_blocks: [usize; LEVELS],
    bitmaps: [Option<usize>; LEVELS],
    link_tables: [usize; LEVELS],
}

impl<const LEVELS: usize> StoragePlan<LEVELS> {
    fn new(config: PoolConfig) -> Result<StoragePlan<LEVELS>, AllocInitError> {
        let PoolConfig {
            max_block_size,
            n_max,
        } = config;

        if n_max == 0 || max_block_size == 0 || max_block_size % WORD != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let sizes = geometry::size_table::<LEVELS>(max_block_size);
        if sizes.iter().any(|&size| size < WORD) {
            return Err(AllocInitError::InvalidConfig);
        }

        let arena_size = n_max
            .checked_mul(max_block_size)
            .ok_or(AllocInitError::InvalidConfig)?;

        let mut num_blocks = [0; LEVELS];
        for (level, n) in num_blocks.iter_mut().enumerate() {
            *n = geometry::blocks_at(n_max, level)
                .filter(|&n| n - 1 <= BlockNum::MAX_INDEX)
                .ok_or(AllocInitError::InvalidConfig)?;
        }

        let mut cursor = arena_size;

        let mut bitmaps = [None; LEVELS];
        for (bitmap, &n) in bitmaps.iter_mut().zip(num_blocks.iter()) {
            let words = LevelBits::external_words(n);
            if words > 0 {
                *bitmap = Some(cursor);
                cursor = words
                    .checked_mul(WORD)
                    .and_then(|bytes| cursor.checked_add(bytes))
                    .ok_or(AllocInitError::InvalidConfig)?;
            }
        }

        // The cursor is still word aligned, which satisfies `Link`.
        debug_assert!(mem::align_of::<Link>() <= WORD);

        let mut link_tables = [0; LEVELS];
        for (table, &n) in link_tables.iter_mut().zip(num_blocks.iter()) {
            *table = cursor;
            cursor = n
                .checked_mul(mem::size_of::<Link>())
                .and_then(|bytes| cursor.checked_add(bytes))
                .ok_or(AllocInitError::InvalidConfig)?;
        }

        let layout =
            Layout::from_size_align(cursor, WORD).map_err(|_| AllocInitError::InvalidConfig)?;

        Ok(StoragePlan {
            layout,
            arena_size,
            num_blocks,
            bitmaps,
            link_tables,
        })
    }
}

/// A power-of-four buddy pool.
///
/// This takes three type parameters:
/// - `LEVELS` is the number of block sizes the pool manages.
/// - `L` is the lock regime, either [`IrqLock`] or [`MutexLock`].
/// - `A` is the [`BackingAllocator`] that owns the pool's storage.
///
/// The block size of level 0 is given at runtime by
/// [`PoolConfig::max_block_size`]; each further level is a quarter of the one
/// above it, rounded down to a whole number of words. Every level must be at
/// least one word in size.
///
/// Block sizes are not stored; they are recomputed from `max_block_size` by
/// every operation that needs them.
///
/// For example, the type of an interrupt-safe pool which hands out blocks of
/// up to three sizes would be:
///
/// ```
/// use quad_pool::{IrqLock, Pool};
///
/// // With `max_block_size == 256`: 256, 64 and 16 byte blocks.
/// type SmallPool<A> = Pool<3, IrqLock, A>;
/// # fn main() {}
/// ```
///
/// [`IrqLock`]: crate::IrqLock
/// [`MutexLock`]: crate::MutexLock
pub struct Pool<const LEVELS: usize, L: PoolLock, A: BackingAllocator> {
    /// Pointer to the storage region: the arena, then the metadata.
    base: BasePtr,
    max_block_size: usize,
    n_max: usize,
    levels: Locked<L, Levels<LEVELS>>,
    backing_allocator: A,
}

// SAFETY: the pool owns its storage region, and all access to the metadata
// in it is serialized by the lock.
unsafe impl<const LEVELS: usize, L, A> Send for Pool<LEVELS, L, A>
where
    L: PoolLock + Send,
    A: BackingAllocator + Send,
{
}

// SAFETY: as above; shared access only reaches the metadata through the lock.
unsafe impl<const LEVELS: usize, L, A> Sync for Pool<LEVELS, L, A>
where
    L: PoolLock + Sync,
    A: BackingAllocator + Sync,
{
}

impl<const LEVELS: usize, L: PoolLock> Pool<LEVELS, L, Raw> {
    /// Constructs a new `Pool` from a raw pointer.
    ///
    /// All `n_max` level 0 blocks start out free.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid for `LEVELS` levels, or if
    /// `region` is not word aligned or the region would extend past the end
    /// of the address space.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for
    /// [`Self::region_layout(config)`]`.size()` bytes, and no other code may
    /// access that memory while the pool exists, except through blocks
    /// allocated from the pool.
    ///
    /// [`Self::region_layout(config)`]: Pool::region_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        config: PoolConfig,
        lock: L,
    ) -> Result<Pool<LEVELS, L, Raw>, AllocInitError> {
        let plan = StoragePlan::<LEVELS>::new(config)?;

        unsafe { Self::init(region, config, &plan, lock, Raw) }
    }

    /// Decomposes the pool into its storage region pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is called;
    /// the returned pointer becomes the sole owner of the region that was used
    /// to construct the pool.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let pool = ManuallyDrop::new(self);
        pool.base.ptr()
    }
}

#[cfg(any(feature = "alloc", test))]
impl<const LEVELS: usize, L: PoolLock> Pool<LEVELS, L, Global> {
    /// Attempts to construct a new `Pool` backed by the global allocator.
    ///
    /// The storage region is allocated from the global allocator according to
    /// [`Self::region_layout(config)`], and freed when the pool is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid for `LEVELS` levels, or if the
    /// storage region could not be allocated.
    ///
    /// [`Self::region_layout(config)`]: Pool::region_layout
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(
        config: PoolConfig,
        lock: L,
    ) -> Result<Pool<LEVELS, L, Global>, AllocInitError> {
        let plan = StoragePlan::<LEVELS>::new(config)?;

        unsafe {
            // SAFETY: the layout is never zero-sized, as `n_max` and
            // `max_block_size` are both non-zero.
            let raw = alloc::alloc::alloc(plan.layout);
            let region = NonNull::new(raw).ok_or(AllocInitError::AllocFailed(plan.layout))?;

            Self::init(region, config, &plan, lock, Global).map_err(|e| {
                alloc::alloc::dealloc(region.as_ptr(), plan.layout);
                e
            })
        }
    }
}

impl<const LEVELS: usize, L: PoolLock, A: BackingAllocator> Pool<LEVELS, L, A> {
    /// Returns the layout requirements of the storage region of a pool of
    /// this type.
    ///
    /// The region holds the arena, `config.n_max * config.max_block_size`
    /// bytes, followed by the pool's bitmaps and free list tables.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid for `LEVELS` levels.
    pub fn region_layout(config: PoolConfig) -> Result<Layout, AllocInitError> {
        StoragePlan::<LEVELS>::new(config).map(|plan| plan.layout)
    }

    /// Lays out the pool's metadata in `region` and places every level 0
    /// block on the level 0 free list.
    ///
    /// # Safety
    ///
    /// `region` must be valid for reads and writes for `plan.layout.size()`
    /// bytes and exclusively owned by the new pool.
    unsafe fn init(
        region: NonNull<u8>,
        config: PoolConfig,
        plan: &StoragePlan<LEVELS>,
        lock: L,
        backing_allocator: A,
    ) -> Result<Pool<LEVELS, L, A>, AllocInitError> {
        if region.as_ptr().align_offset(WORD) != 0 {
            return Err(AllocInitError::InvalidLocation);
        }

        let base =
            BasePtr::new(region, plan.layout.size()).ok_or(AllocInitError::InvalidLocation)?;

        let mut levels: Levels<LEVELS> = array::from_fn(|level| {
            let num_blocks = plan.num_blocks[level];

            let bits = match plan.bitmaps[level] {
                // SAFETY: the plan reserves `num_words(num_blocks)` words at
                // this offset for this level alone.
                Some(offset) => {
                    LevelBits::External(unsafe { Bitmap::new(num_blocks, base.table(offset)) })
                }
                None => LevelBits::inline(num_blocks),
            };

            // SAFETY: the plan reserves `num_blocks` links at this offset for
            // this level alone.
            let free = unsafe { FreeList::new(base.table(plan.link_tables[level]), num_blocks) };

            PoolLevel { bits, free }
        });

        if let Some(top) = levels.first_mut() {
            for index in (0..config.n_max).rev() {
                top.free.push(index);
            }
        }

        log::debug!(
            "pool at {:p}: {} x {} byte blocks, {} levels, {} bytes of metadata",
            region.as_ptr(),
            config.n_max,
            config.max_block_size,
            LEVELS,
            plan.layout.size() - plan.arena_size,
        );

        Ok(Pool {
            base,
            max_block_size: config.max_block_size,
            n_max: config.n_max,
            levels: Locked::new(lock, levels),
            backing_allocator,
        })
    }

    /// Returns the configuration the pool was created with.
    #[inline]
    pub fn config(&self) -> PoolConfig {
        PoolConfig::new(self.max_block_size, self.n_max)
    }

    /// Returns the size in bytes of the largest blocks.
    #[inline]
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Returns the number of level 0 blocks.
    #[inline]
    pub fn n_max(&self) -> usize {
        self.n_max
    }

    /// Returns the number of levels.
    #[inline]
    pub const fn levels(&self) -> usize {
        LEVELS
    }

    /// Returns the block size of `level`, or `None` if the pool has no such
    /// level.
    #[inline]
    pub fn level_size(&self, level: usize) -> Option<usize> {
        (level < LEVELS).then(|| geometry::level_size(self.max_block_size, level))
    }

    #[inline]
    fn sizes(&self) -> [usize; LEVELS] {
        geometry::size_table::<LEVELS>(self.max_block_size)
    }

    #[inline]
    fn arena_size(&self) -> usize {
        self.n_max * self.max_block_size
    }

    /// Returns the address of the first byte of the arena.
    ///
    /// This identifies the pool for as long as it exists, even if the `Pool`
    /// value itself is moved.
    #[inline]
    pub(crate) fn arena_addr(&self) -> NonZeroUsize {
        self.base.addr()
    }

    /// Returns the offset of `addr` into the arena, if it lies within it.
    #[inline]
    pub(crate) fn arena_offset(&self, addr: NonZeroUsize) -> Option<usize> {
        self.base
            .offset_to(addr)
            .filter(|&offset| offset < self.arena_size())
    }

    #[inline]
    fn lock(&self) -> Guard<'_, L, Levels<LEVELS>> {
        self.levels.lock()
    }

    fn check_id(&self, id: BlockId) {
        assert!(
            id.level < LEVELS,
            "level {} out of range for a {LEVELS}-level pool",
            id.level
        );

        let num_blocks = geometry::blocks_at(self.n_max, id.level).unwrap_or(usize::MAX);
        assert!(
            id.index < num_blocks,
            "block {} out of range for level {}",
            id.index,
            id.level
        );
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The block comes from the deepest level whose blocks are still at least
    /// `size` bytes. If that level has no free block, the nearest larger free
    /// block is split down to it, one level per critical section. A request
    /// for zero bytes is served from the deepest level.
    ///
    /// The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `size` exceeds the maximum block size, if the pool has
    /// no levels, or if no free block is large enough. A failed allocation
    /// does not modify the pool.
    pub fn block_alloc(&self, size: usize) -> Result<Block, AllocError> {
        // Sizing happens before any lock is taken.
        let sizes = self.sizes();
        let target_level = geometry::level_for(&sizes, size).ok_or_else(|| {
            log::trace!("pool at {:p}: {size} bytes exceeds every level", self.base.ptr());
            AllocError
        })?;

        let mut levels = self.lock();

        // Search toward larger blocks until a free one is found.
        let found = (0..=target_level).rev().find_map(|level| {
            levels[level]
                .take_free()
                .map(|index| BlockId { level, index })
        });

        let Some(mut block) = found else {
            drop(levels);
            log::trace!("pool at {:p}: no free block of {size} bytes", self.base.ptr());
            return Err(AllocError);
        };

        while block.level < target_level {
            block = split(&mut levels, block);
            levels = levels.relax();
        }

        drop(levels);

        let offset = geometry::block_offset(&sizes, block.level, block.index);

        Ok(Block {
            id: block,
            ptr: self.base.with_offset_and_size(offset, sizes[block.level]),
        })
    }

    /// Returns a block to the pool.
    ///
    /// Once the block is free, it is merged with its three siblings into
    /// their parent if they are all free as well, and so on up the levels
    /// for as long as whole sibling groups are free. The lock is released and
    /// reacquired once per level.
    ///
    /// # Panics
    ///
    /// Panics if `id` names a level or index outside the pool, or if the
    /// block is not currently allocated. The latter catches double frees in
    /// every build profile.
    ///
    /// # Safety
    ///
    /// `id` must identify a block currently allocated by [`block_alloc`] on
    /// this pool, and the block's memory must not be accessed afterward.
    ///
    /// [`block_alloc`]: Pool::block_alloc
    pub unsafe fn block_free(&self, id: BlockId) {
        self.check_id(id);

        let mut block = id;
        let mut levels = self.lock();
        levels[block.level].release(block.level, block.index);

        loop {
            levels = levels.relax();

            let Some(parent) = block.parent() else {
                break;
            };

            // Another context may have taken the block, or merged its group,
            // while the lock was released.
            let level = &mut levels[block.level];
            if !level.free.contains(block.index) || level.bits.partner_nibble(block.index) != 0 {
                break;
            }

            let first = block.first_sibling();
            for sibling in first..first + 4 {
                level.free.remove(sibling);
            }

            // The parent was allocated when it was split; free it in the same
            // critical section so the group is never seen half-merged.
            block = parent;
            levels[block.level].release(block.level, block.index);
        }
    }

    /// Returns whether the block `id` is allocated or split.
    ///
    /// # Panics
    ///
    /// Panics if `id` names a level or index outside the pool.
    pub fn is_allocated(&self, id: BlockId) -> bool {
        self.check_id(id);
        self.lock()[id.level].bits.is_set(id.index)
    }

    /// Returns the number of free blocks at `level`.
    ///
    /// # Panics
    ///
    /// Panics if the pool has no such level.
    pub fn free_blocks(&self, level: usize) -> usize {
        assert!(level < LEVELS, "level {level} out of range");
        self.lock()[level].free.len()
    }

    /// Returns the pool's memory usage.
    pub fn stats(&self) -> PoolStats {
        let sizes = self.sizes();
        let total = self.arena_size();

        let levels = self.lock();
        let free = levels
            .iter()
            .zip(sizes.iter())
            .map(|(level, size)| level.free.len() * size)
            .sum();
        drop(levels);

        PoolStats {
            total,
            free,
            used: total - free,
        }
    }

    /// Returns, for every level, the number of free blocks and the number of
    /// set allocation bits.
    #[cfg(test)]
    pub(crate) fn census(&mut self) -> [(usize, usize); LEVELS] {
        let levels = self.levels.get_mut();
        array::from_fn(|l| (levels[l].free.len(), levels[l].bits.count_set()))
    }
}

impl<const LEVELS: usize, L: PoolLock, A: BackingAllocator> fmt::Debug for Pool<LEVELS, L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("base", &self.base.ptr())
            .field("max_block_size", &self.max_block_size)
            .field("n_max", &self.n_max)
            .field("LEVELS", &LEVELS)
            .finish()
    }
}

impl<const LEVELS: usize, L: PoolLock, A: BackingAllocator> Drop for Pool<LEVELS, L, A> {
    fn drop(&mut self) {
        // This layout was checked when the pool was constructed.
        if let Ok(layout) = Self::region_layout(self.config()) {
            unsafe { self.backing_allocator.deallocate(self.base.ptr(), layout) };
        }
    }
}
