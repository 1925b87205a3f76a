//! Lock regimes.
//!
//! Every pool serializes access to its bookkeeping with a [`PoolLock`]. Two
//! regimes are provided:
//!
//! - [`IrqLock`] enters a [`critical_section`] for each step. On single-core
//!   targets this masks interrupts, so the pool can be used from interrupt
//!   handlers as well as threads.
//! - [`MutexLock`] wraps a [`lock_api::RawMutex`], which may block and, if the
//!   platform's mutex supports it, apply priority inheritance. It must not be
//!   used from interrupt context.
//!
//! Pool operations never hold a lock across more than one level of a split
//! or a merge: the lock is released and immediately reacquired in between,
//! so the worst-case time spent inside a critical section does not grow with
//! the number of levels.

use crate::core::{
    cell::UnsafeCell,
    fmt,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
};

/// A lock which can serialize access to a pool.
///
/// # Safety
///
/// Implementors must guarantee that between a call to `acquire` and the
/// matching call to `release`, no other call to `acquire` on the same lock
/// returns, in any thread or interrupt handler that may access the pool.
pub unsafe trait PoolLock {
    /// State returned by `acquire` and consumed by `release`.
    type State;

    /// Acquires the lock.
    fn acquire(&self) -> Self::State;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// `state` must have been returned by the most recent unmatched call to
    /// `acquire` on this lock in the current context.
    unsafe fn release(&self, state: Self::State);
}

/// The interrupt-lock regime.
///
/// Each critical section is a [`critical_section`] acquire/release pair, so a
/// `critical-section` implementation must be linked into the final binary.
#[derive(Copy, Clone, Debug, Default)]
pub struct IrqLock;

impl IrqLock {
    /// Creates a new `IrqLock`.
    pub const fn new() -> IrqLock {
        IrqLock
    }
}

// SAFETY: `critical_section::acquire` excludes every other context which
// might enter a critical section until the matching release.
unsafe impl PoolLock for IrqLock {
    type State = critical_section::RestoreState;

    #[inline]
    fn acquire(&self) -> Self::State {
        // SAFETY: every acquire is matched by a release in `Guard::drop`, in
        // reverse order of acquisition.
        unsafe { critical_section::acquire() }
    }

    #[inline]
    unsafe fn release(&self, state: Self::State) {
        unsafe { critical_section::release(state) }
    }
}

/// The mutex regime.
///
/// Operations on a pool using this lock may block waiting for the mutex.
pub struct MutexLock<R> {
    raw: R,
}

impl<R: lock_api::RawMutex> MutexLock<R> {
    /// Creates a new, unlocked `MutexLock`.
    pub const fn new() -> MutexLock<R> {
        MutexLock { raw: R::INIT }
    }
}

impl<R: lock_api::RawMutex> Default for MutexLock<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: lock_api::RawMutex> fmt::Debug for MutexLock<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexLock")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

// SAFETY: `RawMutex::lock` does not return while another context holds the
// mutex.
unsafe impl<R: lock_api::RawMutex> PoolLock for MutexLock<R> {
    type State = ();

    #[inline]
    fn acquire(&self) {
        self.raw.lock();
    }

    #[inline]
    unsafe fn release(&self, (): ()) {
        // SAFETY: the caller holds the mutex.
        unsafe { self.raw.unlock() }
    }
}

/// A value protected by a [`PoolLock`].
pub(crate) struct Locked<L, T> {
    lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a `Guard`, of which at most one
// exists at a time.
unsafe impl<L: PoolLock + Sync, T: Send> Sync for Locked<L, T> {}

impl<L: PoolLock, T> Locked<L, T> {
    pub(crate) const fn new(lock: L, data: T) -> Locked<L, T> {
        Locked {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, returning a guard which releases it on drop.
    #[inline]
    pub(crate) fn lock(&self) -> Guard<'_, L, T> {
        let state = self.lock.acquire();

        Guard {
            locked: self,
            state: ManuallyDrop::new(state),
        }
    }

    /// Returns a mutable reference to the protected value.
    ///
    /// No locking is needed, as `&mut self` proves exclusive access.
    #[cfg(test)]
    #[inline]
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// An RAII critical section over a [`Locked`] value.
pub(crate) struct Guard<'a, L: PoolLock, T> {
    locked: &'a Locked<L, T>,
    state: ManuallyDrop<L::State>,
}

impl<'a, L: PoolLock, T> Guard<'a, L, T> {
    /// Releases the lock and immediately reacquires it.
    ///
    /// This gives pending interrupts or waiting threads a chance to run.
    /// Anything observed under the previous critical section may have changed
    /// by the time this returns.
    #[inline]
    #[must_use = "dropping the relaxed guard releases the lock"]
    pub(crate) fn relax(self) -> Guard<'a, L, T> {
        let locked = self.locked;
        drop(self);
        locked.lock()
    }
}

impl<L: PoolLock, T> Deref for Guard<'_, L, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the lock is held for the lifetime of the guard.
        unsafe { &*self.locked.data.get() }
    }
}

impl<L: PoolLock, T> DerefMut for Guard<'_, L, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held for the lifetime of the guard, and the
        // guard is borrowed mutably.
        unsafe { &mut *self.locked.data.get() }
    }
}

impl<L: PoolLock, T> Drop for Guard<'_, L, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `state` is taken exactly once, here.
        let state = unsafe { ManuallyDrop::take(&mut self.state) };

        // SAFETY: `state` came from the acquire that created this guard.
        unsafe { self.locked.lock.release(state) };
    }
}
