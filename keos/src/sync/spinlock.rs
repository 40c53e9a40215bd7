//! A mutual exclusion primitive useful for protecting shared data.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A spinlock guarding a `T`. Unlike [`std::sync::Mutex`], the guard does not
/// release the lock on drop: callers must call [`SpinLockGuard::unlock`]
/// explicitly, so a held lock is always visible at the call site.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state.
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            data: UnsafeCell::new(t),
            locked: AtomicBool::new(false),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it becomes available.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self.locked.fetch_or(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
            released: false,
        }
    }

    /// Attempts to acquire the lock without blocking.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self.locked.fetch_or(true, Ordering::Acquire) {
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
                released: false,
            })
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the underlying data, bypassing the
    /// lock. Safe because `&mut self` already proves exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// Scoped access to the data guarded by a [`SpinLock`].
///
/// Must be released via [`unlock`](Self::unlock); dropping a held guard
/// panics, which catches forgotten unlocks instead of deadlocking silently.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
    released: bool,
}

impl<T: ?Sized> !Send for SpinLockGuard<'_, T> {}
unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(mut self) {
        self.released = true;
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if !self.released {
            panic!(
                "SpinLockGuard dropped without calling `.unlock()` (locked at {:?})",
                self.caller
            );
        }
    }
}
