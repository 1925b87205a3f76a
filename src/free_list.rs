use crate::core::{num::NonZeroU32, ptr::NonNull};

/// The index of a block within its level, encoded so that `Option<BlockNum>`
/// is the size of a `u32`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockNum(NonZeroU32);

impl BlockNum {
    /// The largest block index a free list can hold.
    pub const MAX_INDEX: usize = u32::MAX as usize - 1;

    #[inline]
    pub fn new(index: usize) -> BlockNum {
        assert!(index <= Self::MAX_INDEX, "block index {index} too large");

        // Cannot be zero or overflow: checked above.
        BlockNum(NonZeroU32::new(index as u32 + 1).unwrap())
    }

    #[inline]
    pub fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

// Links name blocks by index rather than by address, and live in a table
// outside of the arena. A free block's own bytes are never touched, so the
// pool never writes through memory a caller may still hold a pointer to.

/// A link in a doubly linked list of free blocks.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct Link {
    pub prev: Option<BlockNum>,
    pub next: Option<BlockNum>,
}

/// The free blocks of one pool level.
pub struct FreeList {
    head: Option<BlockNum>,
    len: usize,
    links: NonNull<Link>,
    num_blocks: usize,
}

impl FreeList {
    /// Creates an empty free list for a level of `num_blocks` blocks.
    ///
    /// # Safety
    ///
    /// `links` must be valid for reads and writes for `num_blocks` `Link`
    /// values, properly aligned, and not referred to by any other `FreeList`.
    pub unsafe fn new(links: NonNull<Link>, num_blocks: usize) -> FreeList {
        assert!(num_blocks == 0 || num_blocks - 1 <= BlockNum::MAX_INDEX);

        for i in 0..num_blocks {
            unsafe { links.as_ptr().add(i).write(Link::default()) };
        }

        FreeList {
            head: None,
            len: 0,
            links,
            num_blocks,
        }
    }

    /// Returns the number of blocks on the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn link(&self, num: BlockNum) -> Link {
        let index = num.index();
        assert!(index < self.num_blocks, "block {index} out of range");

        // SAFETY: `index` is in bounds of the table.
        unsafe { self.links.as_ptr().add(index).read() }
    }

    #[inline]
    fn link_mut(&mut self, num: BlockNum) -> &mut Link {
        let index = num.index();
        assert!(index < self.num_blocks, "block {index} out of range");

        // SAFETY: `index` is in bounds of the table, and `&mut self`
        // guarantees exclusive access to it.
        unsafe { &mut *self.links.as_ptr().add(index) }
    }

    /// Returns whether block `index` is on the list.
    ///
    /// Unlinked blocks have both links cleared, so a block is a member iff it
    /// is the head or has a predecessor.
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        let num = BlockNum::new(index);
        self.head == Some(num) || self.link(num).prev.is_some()
    }

    /// Pushes block `index` onto the list.
    pub fn push(&mut self, index: usize) {
        let new_head = BlockNum::new(index);
        let old_head = self.head;

        if let Some(old_head) = old_head {
            debug_assert_ne!(old_head, new_head, "block {index} pushed twice");
            self.link_mut(old_head).prev = Some(new_head);
        }

        *self.link_mut(new_head) = Link {
            prev: None,
            next: old_head,
        };

        self.head = Some(new_head);
        self.len += 1;
    }

    /// Removes and returns an arbitrary block from the list.
    pub fn pop_any(&mut self) -> Option<usize> {
        let head = self.head?;
        self.unlink(head);
        Some(head.index())
    }

    /// Removes block `index` from the list.
    ///
    /// The block must be on the list.
    pub fn remove(&mut self, index: usize) {
        self.unlink(BlockNum::new(index));
    }

    fn unlink(&mut self, num: BlockNum) {
        let removed = *self.link_mut(num);

        match removed.prev {
            // Link `prev` forward to `next`.
            Some(p) => self.link_mut(p).next = removed.next,

            // If there's no previous block, then `removed` is the head of
            // the list.
            None => {
                debug_assert_eq!(self.head, Some(num), "block not on free list");
                self.head = removed.next;
            }
        }

        if let Some(n) = removed.next {
            // Link `next` back to `prev`.
            self.link_mut(n).prev = removed.prev;
        }

        *self.link_mut(num) = Link::default();
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{vec, vec::Vec};

    use super::*;

    fn list(num_blocks: usize) -> (FreeList, Vec<Link>) {
        let mut links = vec![Link::default(); num_blocks];
        let ptr = NonNull::new(links.as_mut_ptr()).unwrap();
        (unsafe { FreeList::new(ptr, num_blocks) }, links)
    }

    #[test]
    fn link_is_two_u32s() {
        assert_eq!(crate::core::mem::size_of::<Link>(), 8);
    }

    #[test]
    fn push_then_pop_everything() {
        let (mut fl, _links) = list(16);
        assert_eq!(fl.len(), 0);

        for i in 0..16 {
            fl.push(i);
        }
        assert_eq!(fl.len(), 16);

        let mut seen: Vec<usize> = core::iter::from_fn(|| fl.pop_any()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        assert_eq!(fl.len(), 0);
    }

    #[test]
    fn remove_from_middle_head_and_tail() {
        let (mut fl, _links) = list(8);
        for i in 0..8 {
            fl.push(i);
        }

        // Head is 7, tail is 0.
        fl.remove(7);
        fl.remove(0);
        fl.remove(4);
        assert_eq!(fl.len(), 5);

        for i in [0, 4, 7] {
            assert!(!fl.contains(i));
        }
        for i in [1, 2, 3, 5, 6] {
            assert!(fl.contains(i));
        }

        let mut rest: Vec<usize> = core::iter::from_fn(|| fl.pop_any()).collect();
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 2, 3, 5, 6]);
    }

    #[test]
    fn sibling_group_removal() {
        let (mut fl, _links) = list(8);
        for i in [5, 0, 6, 1, 4, 7, 2] {
            fl.push(i);
        }

        for i in 4..8 {
            fl.remove(i);
        }

        let mut rest: Vec<usize> = core::iter::from_fn(|| fl.pop_any()).collect();
        rest.sort_unstable();
        assert_eq!(rest, vec![0, 1, 2]);
    }

    #[test]
    #[should_panic]
    fn out_of_range_push_panics() {
        let (mut fl, _links) = list(4);
        fl.push(4);
    }
}
