use crate::core::{
    num::NonZeroUsize,
    ptr::{self, NonNull, NonNullStrict},
};

/// A pointer to the base of the arena managed by a pool.
///
/// Blocks are never referred to by pointer inside the pool; they are named by
/// their offset from the base, and a pointer is only materialized, with the
/// base's provenance, when a block is handed to a caller.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr` covering `extent` bytes.
    ///
    /// The returned value assumes the provenance of `ptr`. Returns `None` if
    /// the region would wrap around the address space.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        NonNullStrict::addr(ptr).get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        NonNullStrict::addr(self.ptr)
    }

    #[inline]
    pub fn limit(self) -> usize {
        NonNullStrict::addr(self.ptr).get() + self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        NonNullStrict::addr(self.ptr) <= addr && addr.get() < self.limit()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// Returns `None` if `addr` lies outside the region.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        self.contains_addr(addr)
            .then(|| addr.get() - NonNullStrict::addr(self.ptr).get())
    }

    /// Creates a new pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.extent, "offset out of region");

        // Cannot overflow or be zero: the region was checked not to wrap.
        let addr = NonZeroUsize::new(NonNullStrict::addr(self.ptr).get() + offset).unwrap();

        NonNullStrict::with_addr(self.ptr, addr)
    }

    /// Creates a slice pointer of `len` bytes starting `offset` bytes past the
    /// base.
    #[inline]
    pub fn with_offset_and_size(self, offset: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(offset + len <= self.extent);

        let ptr = self.with_offset(offset).as_ptr();
        let raw_slice = ptr::slice_from_raw_parts_mut(ptr, len);

        // SAFETY: `ptr` was derived from a `NonNull`.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Returns a pointer to the `index`th `T` of a table starting `offset`
    /// bytes past the base.
    ///
    /// The table must be properly aligned for `T` and lie within the region.
    #[inline]
    pub fn table<T>(self, offset: usize) -> NonNull<T> {
        let table = self.with_offset(offset).cast::<T>();
        debug_assert_eq!(
            NonNullStrict::addr(table).get() % crate::core::mem::align_of::<T>(),
            0
        );
        table
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn offsets_stay_in_region() {
        let mut buf = std::vec![0u8; 64];
        let base = BasePtr::new(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()).unwrap();

        let p = base.with_offset(16);
        assert_eq!(base.offset_to(NonNullStrict::addr(p)), Some(16));

        let past_end = NonZeroUsize::new(base.limit()).unwrap();
        assert_eq!(base.offset_to(past_end), None);

        let s = base.with_offset_and_size(32, 32);
        assert_eq!(s.len(), 32);
    }

    #[test]
    fn with_addr_keeps_provenance() {
        let mut buf = std::vec![0u8; 16];
        let start = NonNull::new(buf.as_mut_ptr()).unwrap();
        let addr = NonNullStrict::addr(start);
        assert_eq!(addr.get(), buf.as_ptr() as usize);

        let third = NonZeroUsize::new(addr.get() + 3).unwrap();
        let p = NonNullStrict::with_addr(start, third);
        unsafe { p.as_ptr().write(0xa5) };
        assert_eq!(buf[3], 0xa5);
    }

    #[test]
    #[should_panic]
    fn offset_past_end_panics() {
        let mut buf = std::vec![0u8; 8];
        let base = BasePtr::new(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()).unwrap();
        base.with_offset(8);
    }
}
