//! Level geometry.
//!
//! A pool never stores its per-level block sizes. They are recomputed from
//! the maximum block size whenever an operation needs them: level 0 blocks
//! are `max_block_size` bytes, and every further level divides the previous
//! size by four and rounds down to a whole number of machine words.

use crate::core::mem;

/// The size of a machine word in bytes.
pub const WORD: usize = mem::size_of::<usize>();

/// Rounds `x` down to a multiple of [`WORD`].
#[inline]
pub const fn round_down_to_word(x: usize) -> usize {
    x & !(WORD - 1)
}

/// Rounds `x` up to a multiple of [`WORD`], or returns `None` on overflow.
#[inline]
pub const fn round_up_to_word(x: usize) -> Option<usize> {
    match x.checked_add(WORD - 1) {
        Some(y) => Some(round_down_to_word(y)),
        None => None,
    }
}

/// Returns the block size of the level after one of `size` bytes.
#[inline]
pub const fn next_level_size(size: usize) -> usize {
    round_down_to_word(size / 4)
}

/// An iterator over the block sizes of successive levels, starting at
/// level 0.
///
/// The iterator is unbounded; use [`Iterator::take`] to limit it to a pool's
/// level count.
#[derive(Clone, Debug)]
pub struct LevelSizes {
    next: usize,
}

impl Iterator for LevelSizes {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        let size = self.next;
        self.next = next_level_size(size);
        Some(size)
    }
}

/// Returns an iterator over the block sizes of each level of a pool whose
/// largest blocks are `max_block_size` bytes.
#[inline]
pub fn level_sizes(max_block_size: usize) -> LevelSizes {
    LevelSizes {
        next: max_block_size,
    }
}

/// Computes the block size of every level of a `LEVELS`-level pool.
#[inline]
pub fn size_table<const LEVELS: usize>(max_block_size: usize) -> [usize; LEVELS] {
    let mut sizes = level_sizes(max_block_size);
    // `LevelSizes` never ends.
    [(); LEVELS].map(|()| sizes.next().unwrap_or(0))
}

/// Returns the block size of `level`, walking down from `max_block_size`.
#[inline]
pub fn level_size(max_block_size: usize, level: usize) -> usize {
    level_sizes(max_block_size).nth(level).unwrap_or(0)
}

/// Returns the deepest level whose blocks can hold `size` bytes, or `None`
/// if not even level 0 is large enough.
pub fn level_for(sizes: &[usize], size: usize) -> Option<usize> {
    sizes.iter().take_while(|&&lsz| lsz >= size).count().checked_sub(1)
}

/// Returns the number of blocks at `level` in a pool of `n_max` level-0
/// blocks, `n_max * 4^level`, or `None` on overflow.
#[inline]
pub fn blocks_at(n_max: usize, level: usize) -> Option<usize> {
    let level: u32 = level.try_into().ok()?;
    4_usize.checked_pow(level)?.checked_mul(n_max)
}

/// Returns the offset of block `index` at `level` from the start of the
/// arena.
///
/// A child's offset is its parent's offset plus its position among its
/// siblings times its own size. When every level is exactly a quarter of the
/// one above, this equals `index * sizes[level]`; when word rounding makes a
/// level smaller, the children still lie within their parent.
pub fn block_offset(sizes: &[usize], level: usize, index: usize) -> usize {
    let mut offset = 0;
    let mut index = index;

    for lsz in sizes[1..=level].iter().rev() {
        offset += (index % 4) * lsz;
        index /= 4;
    }

    offset + index * sizes[0]
}
