#![cfg(test)]
extern crate std;

use core::{fmt::Debug, slice};

use crate::{
    core::ptr::NonNull,
    lock::PoolLock,
    AllocError, AllocInitError, BlockId, Global, Heap, IrqLock, MutexLock, Pool, PoolConfig,
};

use alloc::{sync::Arc, vec::Vec};
use quickcheck::{Arbitrary, Gen, QuickCheck};
use std::thread;

type ParkingMutex = parking_lot::RawMutex;

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    /// What the allocator needs back to free an allocation.
    type Handle: Copy;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&self, size: usize) -> Result<(Self::Handle, NonNull<u8>), AllocError>;

    unsafe fn deallocate(&self, handle: Self::Handle);

    /// Returns whether every byte of the arena is free and every level 0
    /// block is whole again.
    fn is_pristine(&self) -> bool;
}

// Pool =======================================================================

// The level 0 block size is a runtime value; these wrappers pin it to `MAX`.

struct PinnedPool<const MAX: usize, const LEVELS: usize, L: PoolLock>(Pool<LEVELS, L, Global>);

#[derive(Clone, Debug)]
struct PoolParams {
    n_max: usize,
}

impl Arbitrary for PoolParams {
    fn arbitrary(g: &mut Gen) -> Self {
        PoolParams {
            n_max: usize::arbitrary(g) % 4 + 1,
        }
    }
}

fn pool_is_pristine<const LEVELS: usize, L: PoolLock>(pool: &Pool<LEVELS, L, Global>) -> bool {
    let stats = pool.stats();
    stats.free == stats.total && pool.free_blocks(0) == pool.n_max()
}

impl<const MAX: usize, const LEVELS: usize, L> QcAllocator for PinnedPool<MAX, LEVELS, L>
where
    L: PoolLock + Default,
{
    type Params = PoolParams;
    type Handle = BlockId;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        Pool::try_new(PoolConfig::new(MAX, params.n_max), L::default()).map(PinnedPool)
    }

    fn allocate(&self, size: usize) -> Result<(Self::Handle, NonNull<u8>), AllocError> {
        self.0.block_alloc(size).map(|b| (b.id, b.ptr.cast()))
    }

    unsafe fn deallocate(&self, handle: Self::Handle) {
        unsafe { self.0.block_free(handle) }
    }

    fn is_pristine(&self) -> bool {
        pool_is_pristine(&self.0)
    }
}

// Heap =======================================================================

struct PinnedHeap<const MAX: usize, const LEVELS: usize>(Heap<LEVELS, ParkingMutex, Global>);

impl<const MAX: usize, const LEVELS: usize> QcAllocator for PinnedHeap<MAX, LEVELS> {
    type Params = PoolParams;
    type Handle = NonNull<u8>;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        Heap::try_new(PoolConfig::new(MAX, params.n_max)).map(PinnedHeap)
    }

    fn allocate(&self, size: usize) -> Result<(Self::Handle, NonNull<u8>), AllocError> {
        self.0.alloc(size).map(|ptr| (ptr, ptr))
    }

    unsafe fn deallocate(&self, handle: Self::Handle) {
        unsafe { self.0.free(handle) }
    }

    fn is_pristine(&self) -> bool {
        pool_is_pristine(self.0.pool())
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size in `u32`s, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 10;

fn limited_len(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                len: limited_len(g),
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

type OpId = u32;

struct Painted<H> {
    op_id: OpId,
    handle: H,
    ptr: NonNull<u32>,
    len: usize,
}

impl<H> Painted<H> {
    fn as_slice(&self) -> &[u32] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

/// Fills every allocation with the id of the operation that made it, and
/// checks the paint is intact when it is freed. Overlapping allocations
/// overwrite each other's paint.
struct AllocatorChecker<A: QcAllocator> {
    allocator: A,
    allocations: Vec<Painted<A::Handle>>,
    num_ops: u32,
}

impl<A: QcAllocator> AllocatorChecker<A> {
    fn new(params: A::Params, capacity: usize) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: A::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let Ok((handle, ptr)) = self.allocator.allocate(len * 4) else {
                    return true;
                };

                let ptr = ptr.cast::<u32>();
                unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }.fill(op_id);

                self.allocations.push(Painted {
                    op_id,
                    handle,
                    ptr,
                    len,
                });
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                if !a.as_slice().iter().all(|&elem| elem == a.op_id) {
                    return false;
                }

                unsafe { self.allocator.deallocate(a.handle) };
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in self.allocations.drain(..) {
            if !a.as_slice().iter().all(|&elem| elem == a.op_id) {
                return false;
            }

            unsafe { self.allocator.deallocate(a.handle) };
        }

        self.allocator.is_pristine()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

fn check<A: QcAllocator>(params: A::Params, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<A> = AllocatorChecker::new(params, ops.len()).unwrap();
    checker.run(ops)
}

#[test]
fn pool_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<PinnedPool<256, 3, IrqLock>> as fn(_, _) -> bool);
    qc.quickcheck(check::<PinnedPool<1024, 4, IrqLock>> as fn(_, _) -> bool);
    qc.quickcheck(check::<PinnedPool<4096, 5, IrqLock>> as fn(_, _) -> bool);
    qc.quickcheck(check::<PinnedPool<1024, 2, MutexLock<ParkingMutex>>> as fn(_, _) -> bool);
}

#[test]
fn heap_allocations_are_mutually_exclusive() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(check::<PinnedHeap<1024, 3>> as fn(_, _) -> bool);
    qc.quickcheck(check::<PinnedHeap<4096, 4>> as fn(_, _) -> bool);
}

// Round trips =================================================================

fn level_census<const LEVELS: usize, L: PoolLock>(pool: &Pool<LEVELS, L, Global>) -> Vec<usize> {
    (0..LEVELS).map(|level| pool.free_blocks(level)).collect()
}

fn alloc_free_restores_state(held: Vec<u16>, size: u16) -> bool {
    let pool = Pool::<4, _, Global>::try_new(PoolConfig::new(1024, 2), IrqLock::new()).unwrap();

    let held: Vec<_> = held
        .into_iter()
        .filter_map(|s| pool.block_alloc(usize::from(s) % 1025).ok())
        .collect();

    let before = level_census(&pool);
    let allocated: Vec<_> = held.iter().map(|b| pool.is_allocated(b.id)).collect();

    if let Ok(block) = pool.block_alloc(usize::from(size) % 1025) {
        unsafe { pool.block_free(block.id) };
    }

    let restored = level_census(&pool) == before
        && held
            .iter()
            .zip(allocated)
            .all(|(b, was)| pool.is_allocated(b.id) == was);

    for b in held {
        unsafe { pool.block_free(b.id) };
    }

    restored && pool.free_blocks(0) == 2
}

#[test]
fn alloc_then_free_is_idempotent() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(alloc_free_restores_state as fn(_, _) -> bool);
}

fn realloc_preserves_prefix(sizes: Vec<u16>) -> bool {
    let heap = Heap::<4, ParkingMutex, Global>::try_new(PoolConfig::new(4096, 1)).unwrap();

    let Ok(mut ptr) = heap.alloc(0) else {
        return false;
    };
    let mut len = 0;

    for size in sizes {
        let new_len = usize::from(size) % 4096;

        let Ok(new_ptr) = (unsafe { heap.realloc(ptr, new_len) }) else {
            continue;
        };

        let kept = len.min(new_len);
        let prefix = unsafe { slice::from_raw_parts(new_ptr.as_ptr(), kept) };
        if !prefix.iter().enumerate().all(|(i, &b)| b == i as u8) {
            return false;
        }

        let buf = unsafe { slice::from_raw_parts_mut(new_ptr.as_ptr(), new_len) };
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }

        ptr = new_ptr;
        len = new_len;
    }

    unsafe { heap.free(ptr) };
    heap.pool().free_blocks(0) == 1
}

#[test]
fn realloc_preserves_contents() {
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(realloc_preserves_prefix as fn(_) -> bool);
}

// Concurrency =================================================================

fn contend<L>(lock: L)
where
    L: PoolLock + Send + Sync + 'static,
{
    const THREADS: usize = 4;

    let pool = Arc::new(Pool::<3, L, Global>::try_new(PoolConfig::new(256, 2), lock).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let tag = t as u8 + 1;
                let mut held = Vec::new();

                for i in 0..2000_usize {
                    let size = [16, 64, 16, 256, 16][i % 5];

                    if let Ok(block) = pool.block_alloc(size) {
                        unsafe { block.ptr.cast::<u8>().as_ptr().write_bytes(tag, size) };
                        held.push((block, size));
                    }

                    if held.len() > 3 || i % 3 == 0 {
                        if let Some((block, size)) = held.pop() {
                            let start = block.ptr.cast::<u8>().as_ptr();
                            let bytes = unsafe { slice::from_raw_parts(start, size) };
                            assert!(bytes.iter().all(|&b| b == tag), "block overlapped");
                            unsafe { pool.block_free(block.id) };
                        }
                    }
                }

                for (block, _) in held {
                    unsafe { pool.block_free(block.id) };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.free, stats.total);
    assert_eq!(pool.free_blocks(0), 2);
    assert_eq!(pool.free_blocks(1), 0);
    assert_eq!(pool.free_blocks(2), 0);
}

#[test]
fn irq_pool_under_contention() {
    contend(IrqLock::new());
}

#[test]
fn mutex_pool_under_contention() {
    contend(MutexLock::<ParkingMutex>::new());
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
