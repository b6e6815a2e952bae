//! A mutex container similar to `std::sync::Mutex<T>` but parameterized over
//! any type `L` implementing the `LockingMechanism` trait, for better no-std
//! support.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A trait for providing mutual exclusion.
///
/// The allocators in this crate never allocate while holding a lock's
/// critical section open across a call back into themselves, so any
/// implementation that provides plain mutual exclusion will do.
///
/// If you do not need to use an allocator from multiple threads, use
/// [`SingleThreadedLockingMechanism`], which is the moral equivalent of a
/// `RefCell`. [`SpinLockingMechanism`] provides real mutual exclusion
/// without an operating system.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then an allocator using this
///   locking mechanism will be `Sync`, and therefore `lock` must provide
///   actual mutual exclusion and prevent unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent re-entering the lock when it is already
///   held. The prevention may be a panic, abort, infinite loop, or etc...
pub unsafe trait LockingMechanism {
    /// Lock this mutex.
    ///
    /// Must not return while another holder has the lock.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`LockingMechanism`].
///
/// This is effectively a `RefCell`: it panics on re-entry rather than
/// blocking, and is not `Sync`.
#[derive(Debug, Default)]
pub struct SingleThreadedLockingMechanism {
    locked: Cell<bool>,
}

impl SingleThreadedLockingMechanism {
    /// Construct a new `SingleThreadedLockingMechanism`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLockingMechanism {
            locked: Cell::new(false),
        }
    }
}

// Safety: not `Sync`, so the mutual-exclusion clause is vacuous; re-entry is
// prevented by the `locked` flag.
unsafe impl LockingMechanism for SingleThreadedLockingMechanism {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get());
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

/// A spin-lock implementation of [`LockingMechanism`].
///
/// Suitable for multi-threaded use without an operating system. The critical
/// sections in this crate are short (a few pointer writes on the fast path),
/// which is the regime where spinning is acceptable; if the inner allocator
/// can block for a long time, prefer a real OS mutex.
#[derive(Debug, Default)]
pub struct SpinLockingMechanism {
    locked: AtomicBool,
}

impl SpinLockingMechanism {
    /// Construct a new, unlocked `SpinLockingMechanism`.
    #[inline]
    pub const fn new() -> Self {
        SpinLockingMechanism {
            locked: AtomicBool::new(false),
        }
    }
}

// Safety: `compare_exchange(Acquire)` paired with `store(Release)` provides
// mutual exclusion and the necessary happens-before edges between critical
// sections; a thread that already holds the lock spins forever on re-entry.
unsafe impl LockingMechanism for SpinLockingMechanism {
    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[derive(Default)]
pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `LockingMechanism` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another
// thread and getting a mutex guard allows getting `&mut T`, which can be used
// to `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + LockingMechanism,
{
}

impl<T, L> Mutex<T, L>
where
    L: LockingMechanism,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: LockingMechanism,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: LockingMechanism,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: LockingMechanism,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}
