//! Re-exports of `core`, plus strict-provenance polyfills.
//!
//! `NonNull::addr` and `NonNull::with_addr` are newer than the crate's minimum
//! supported Rust version, so address manipulation goes through
//! [`ptr::NonNullStrict`]. With the `sptr` feature it is implemented by the
//! `sptr` crate; without it, by integer casts and pointer offsets.

pub use core::{alloc, array, cell, fmt, mem, num, ops};

pub(crate) mod ptr {
    pub use core::ptr::*;

    use core::num::NonZeroUsize;

    /// Address inspection and replacement which preserve provenance.
    ///
    /// Call these as `NonNullStrict::addr(ptr)` so that the inherent methods
    /// of newer toolchains are never picked instead.
    pub trait NonNullStrict<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized;

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized;
    }

    #[cfg(feature = "sptr")]
    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null,
            // meaning that the address will be non-zero.
            unsafe { NonZeroUsize::new_unchecked(sptr::Strict::addr(self.as_ptr())) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // SAFETY: The result of `with_addr` is non-null because `addr` is
            // guaranteed to be non-zero.
            unsafe { NonNull::new_unchecked(sptr::Strict::with_addr(self.as_ptr(), addr.get())) }
        }
    }

    #[cfg(not(feature = "sptr"))]
    impl<T> NonNullStrict<T> for NonNull<T> {
        fn addr(self) -> NonZeroUsize
        where
            T: Sized,
        {
            // SAFETY: The pointer is guaranteed by the type to be non-null.
            unsafe { NonZeroUsize::new_unchecked(self.as_ptr() as usize) }
        }

        fn with_addr(self, addr: NonZeroUsize) -> Self
        where
            T: Sized,
        {
            // Offsetting from `self` keeps its provenance.
            let delta = addr.get().wrapping_sub(self.as_ptr() as usize);
            let ptr = self.as_ptr().cast::<u8>().wrapping_add(delta).cast::<T>();

            // SAFETY: `ptr` has address `addr`, which is non-zero.
            unsafe { NonNull::new_unchecked(ptr) }
        }
    }
}
