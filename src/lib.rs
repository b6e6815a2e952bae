#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

use cfg_if::cfg_if;
use core::ptr::NonNull;

mod mutex;
mod pool;
mod retry;
mod size_class;

pub use mutex::{LockingMechanism, SingleThreadedLockingMechanism, SpinLockingMechanism};
pub use pool::PoolAllocator;
pub use retry::{OomHandler, RetryAllocator};
pub use size_class::{class_size, free_list_index, round_up, ALIGN, MAX_CHUNK, NUM_SIZE_CLASSES};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}

/// Construct a value in place, in previously allocated memory.
///
/// Containers that store their elements in blocks obtained from an allocator
/// use this to initialize an element slot without creating an intermediate,
/// partially-initialized value.
///
/// # Safety
///
/// * `ptr` must be valid for writes of `T` and properly aligned for `T`.
///
/// * Any value previously constructed at `ptr` must have been destroyed (or
///   moved out) first, or its destructor will never run.
#[inline]
pub unsafe fn construct_in_place<T>(ptr: NonNull<T>, value: T) {
    ptr.write(value);
}

/// Destroy the value at `ptr` in place, without freeing its backing memory.
///
/// The inverse of [`construct_in_place`]: runs `T`'s destructor and leaves
/// the memory itself untouched, ready to be reused or deallocated.
///
/// # Safety
///
/// * `ptr` must point to a valid, initialized `T` that is not referenced by
///   anything else.
///
/// * The value at `ptr` must not be used again after this call.
#[inline]
pub unsafe fn destroy_in_place<T>(ptr: NonNull<T>) {
    ptr.drop_in_place();
}
