//! A small library for ~~hating on~~ evaluating the correctness of memory
//! pools.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of arbitrary
//! allocations and frees. Every block is painted with the id of the operation
//! that allocated it and checked before it is freed, so overlapping blocks
//! are caught as soon as one of them is released.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

use quad_pool::{BlockId, Global, Heap, IrqLock, MutexLock, Pool, PoolConfig};

/// A request size which implements `Arbitrary`.
///
/// Sizes are spread over powers of two up to 64 KiB, so both tiny and
/// oversized requests are common.
#[derive(Clone, Copy, Debug)]
pub struct ArbSize(pub usize);

/// Limit on request size, expressed in bits.
const SIZE_LIMIT_BITS: u8 = 16;

impl arbitrary::Arbitrary<'_> for ArbSize {
    fn arbitrary(u: &mut arbitrary::Unstructured<'_>) -> arbitrary::Result<Self> {
        let exp = u8::arbitrary(u)? % (SIZE_LIMIT_BITS + 1);
        let size = usize::arbitrary(u)? % (1 << exp);

        Ok(ArbSize(size))
    }
}

#[derive(Clone, Debug, arbitrary::Arbitrary)]
pub enum AllocatorOp {
    Alloc(ArbSize),
    /// Free an outstanding block.
    ///
    /// Given `n` outstanding blocks, the block to free is at index
    /// `index % n`.
    Dealloc(usize),
}

pub trait Subject {
    /// What the subject needs back to free a block.
    type Handle: Copy;

    /// Allocates a block of at least `size` bytes.
    fn allocate(&mut self, size: usize) -> Option<(Self::Handle, NonNull<[u8]>)>;

    /// Frees the block identified by `handle`.
    ///
    /// # Safety
    ///
    /// `handle` must identify a block currently allocated by this subject.
    unsafe fn deallocate(&mut self, handle: Self::Handle);

    /// Returns whether all memory has been returned and recombined.
    fn is_pristine(&self) -> bool;
}

/// An allocated block of memory.
pub struct Block<H> {
    handle: H,
    // A pointer to the allocated region.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

impl<H> Block<H> {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes for `ptr.len()` bytes, and no
    /// other access to that memory may happen while the `Block` exists.
    pub unsafe fn init(handle: H, ptr: NonNull<[u8]>, id: u64) -> Block<H> {
        let mut b = Block { handle, ptr, id };
        b.paint(id);
        b
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        // SAFETY: `self` is mutably borrowed, so no other references to the
        // slice can exist.
        let slice = unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) };
        let id_bytes = id.to_le_bytes().into_iter().cycle();

        for (byte, value) in slice.iter_mut().zip(id_bytes) {
            byte.write(value);
        }

        self.id = id;
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        // SAFETY: the block was fully painted when it was created.
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub enum Failed {
    /// A block's paint was overwritten before `failed_op` freed it.
    Overlap {
        completed: Vec<AllocatorOp>,
        failed_op: AllocatorOp,
    },
    /// A block was overwritten before it was freed at the end of the run.
    OverlapAtEnd { completed: Vec<AllocatorOp> },
    /// Memory was not fully recombined after every block was freed.
    Leaked { completed: Vec<AllocatorOp> },
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks: Vec<Block<S::Handle>> = Vec::new();

        for (op_id, op) in (0_u64..).zip(ops) {
            match op {
                AllocatorOp::Alloc(ArbSize(size)) => {
                    let Some((handle, ptr)) = self.subject.allocate(size) else {
                        completed.push(op);
                        continue;
                    };

                    assert!(ptr.len() >= size, "block smaller than requested");

                    blocks.push(unsafe { Block::init(handle, ptr, op_id) });
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    if blocks.is_empty() {
                        completed.push(op);
                        continue;
                    }

                    let mut block = blocks.swap_remove(raw_idx % blocks.len());

                    if !block.verify() {
                        return Err(Failed::Overlap {
                            completed,
                            failed_op: op,
                        });
                    }

                    block.paint(op_id);
                    unsafe { self.subject.deallocate(block.handle) };
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed::OverlapAtEnd { completed });
            }

            unsafe { self.subject.deallocate(block.handle) };
        }

        if !self.subject.is_pristine() {
            return Err(Failed::Leaked { completed });
        }

        Ok(())
    }
}

fn pool_is_pristine<const LEVELS: usize, L: quad_pool::PoolLock>(
    pool: &Pool<LEVELS, L, Global>,
) -> bool {
    let stats = pool.stats();
    stats.free == stats.total && pool.free_blocks(0) == pool.n_max()
}

/// Exercises [`Pool::block_alloc`] and [`Pool::block_free`] directly.
pub struct PoolSubject<const LEVELS: usize>(Pool<LEVELS, IrqLock, Global>);

impl<const LEVELS: usize> PoolSubject<LEVELS> {
    pub fn new(config: PoolConfig) -> Result<Self, quad_pool::AllocInitError> {
        Pool::try_new(config, IrqLock::new()).map(PoolSubject)
    }
}

impl<const LEVELS: usize> Subject for PoolSubject<LEVELS> {
    type Handle = BlockId;

    fn allocate(&mut self, size: usize) -> Option<(BlockId, NonNull<[u8]>)> {
        let block = self.0.block_alloc(size).ok()?;
        Some((block.id, block.ptr))
    }

    unsafe fn deallocate(&mut self, handle: BlockId) {
        unsafe { self.0.block_free(handle) };
    }

    fn is_pristine(&self) -> bool {
        pool_is_pristine(&self.0)
    }
}

/// Exercises the pointer interface of [`Heap`].
pub struct HeapSubject<const LEVELS: usize>(Heap<LEVELS, parking_lot::RawMutex, Global>);

impl<const LEVELS: usize> HeapSubject<LEVELS> {
    pub fn new(config: PoolConfig) -> Result<Self, quad_pool::AllocInitError> {
        Heap::try_new(config).map(HeapSubject)
    }
}

impl<const LEVELS: usize> Subject for HeapSubject<LEVELS> {
    type Handle = NonNull<u8>;

    fn allocate(&mut self, size: usize) -> Option<(NonNull<u8>, NonNull<[u8]>)> {
        let ptr = self.0.alloc(size).ok()?;

        // SAFETY: `ptr` was just allocated by this heap.
        let usable = unsafe { self.0.usable_size(ptr) };
        let slice = core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), usable);

        Some((ptr, NonNull::new(slice)?))
    }

    unsafe fn deallocate(&mut self, handle: NonNull<u8>) {
        unsafe { self.0.free(handle) };
    }

    fn is_pristine(&self) -> bool {
        pool_is_pristine(self.0.pool())
    }
}

/// A pool guarded by a mutex, for checking that both lock regimes behave
/// identically.
pub struct MutexPoolSubject<const LEVELS: usize>(
    Pool<LEVELS, MutexLock<parking_lot::RawMutex>, Global>,
);

impl<const LEVELS: usize> MutexPoolSubject<LEVELS> {
    pub fn new(config: PoolConfig) -> Result<Self, quad_pool::AllocInitError> {
        Pool::try_new(config, MutexLock::new()).map(MutexPoolSubject)
    }
}

impl<const LEVELS: usize> Subject for MutexPoolSubject<LEVELS> {
    type Handle = BlockId;

    fn allocate(&mut self, size: usize) -> Option<(BlockId, NonNull<[u8]>)> {
        let block = self.0.block_alloc(size).ok()?;
        Some((block.id, block.ptr))
    }

    unsafe fn deallocate(&mut self, handle: BlockId) {
        unsafe { self.0.block_free(handle) };
    }

    fn is_pristine(&self) -> bool {
        pool_is_pristine(&self.0)
    }
}
