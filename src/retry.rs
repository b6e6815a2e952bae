//! The primary allocation tier: an adapter that retries failed allocations
//! through a user-installed out-of-memory handler.

use crate::{mutex::Mutex, AllocError, Allocator, LockingMechanism};
use core::{alloc::Layout, mem, ptr::NonNull};

/// An out-of-memory handler.
///
/// Invoked when the inner allocator fails to satisfy a request. The handler
/// is expected to remedy the situation, typically by releasing memory it
/// knows how to reclaim (dropping caches, flushing buffers, and so on); the
/// failed request is retried after every invocation.
///
/// The handler runs while the failing allocation is in progress, so it must
/// not call back into an allocator that is currently blocked on it; a
/// [`PoolAllocator`](crate::PoolAllocator) retrying a request still holds its
/// own lock.
pub type OomHandler = fn();

/// An allocator adapter that retries failed allocations.
///
/// `RetryAllocator` wraps an inner allocator of type `A`. Allocation requests
/// pass straight through; when one fails and an [`OomHandler`] is installed,
/// the handler is invoked and the request retried, repeating until either the
/// request succeeds or the handler has been uninstalled. With no handler
/// installed, inner-allocator failure is reported to the caller as
/// [`AllocError`] immediately.
///
/// The handler lives in an instance-owned, lock-guarded slot rather than
/// process-wide mutable state, so independent allocator instances can carry
/// independent handlers and installation is safe in the presence of
/// concurrent allocation. The handler is re-read on every retry: uninstalling
/// it from another thread (or from inside the handler itself) turns the next
/// failure into a hard error instead of looping forever.
#[derive(Default)]
pub struct RetryAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// The inner allocator.
    inner: A,

    /// The currently installed out-of-memory handler, if any.
    handler: Mutex<Option<OomHandler>, L>,
}

impl<A, L> RetryAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// Create a new `RetryAllocator` that wraps the given `inner` allocator,
    /// with no handler installed.
    #[inline]
    pub const fn new(inner: A, lock: L) -> Self {
        RetryAllocator {
            inner,
            handler: Mutex::new(None, lock),
        }
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Get an exclusive reference to the inner allocator.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut A {
        &mut self.inner
    }

    /// Install `handler` as the out-of-memory handler, returning the
    /// previously installed handler.
    ///
    /// Passing `None` uninstalls the current handler. Returning the previous
    /// handler lets callers compose handlers or restore an earlier one after
    /// a scoped override.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        mem::replace(&mut *self.handler.lock(), handler)
    }

    /// The currently installed out-of-memory handler, if any.
    pub fn oom_handler(&self) -> Option<OomHandler> {
        *self.handler.lock()
    }

    /// Run `attempt` until it succeeds or no handler is left to invoke.
    ///
    /// The handler is re-read each time around, so a handler uninstalled
    /// mid-loop stops the retrying.
    fn retry<T>(&self, mut attempt: impl FnMut() -> Result<T, AllocError>) -> Result<T, AllocError> {
        loop {
            if let Ok(value) = attempt() {
                return Ok(value);
            }
            let handler = match *self.handler.lock() {
                Some(handler) => handler,
                None => return Err(AllocError),
            };
            handler();
        }
    }
}

unsafe impl<A, L> Allocator for RetryAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.retry(|| self.inner.allocate(layout))
    }

    #[inline]
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.retry(|| self.inner.allocate_zeroed(layout))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.inner.deallocate(ptr, layout);
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // A failed `grow` leaves the original allocation intact, so retrying
        // with the same arguments is sound.
        self.retry(|| unsafe { self.inner.grow(ptr, old_layout, new_layout) })
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.retry(|| unsafe { self.inner.shrink(ptr, old_layout, new_layout) })
    }
}
