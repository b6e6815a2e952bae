//! Size classes for pooled allocations.
//!
//! Every pooled request is rounded up to a multiple of [`ALIGN`], and each
//! such multiple up to [`MAX_CHUNK`] gets its own free list. The mapping in
//! both directions is pure arithmetic; no table is needed.

/// The alignment unit of the pool. Every size class is a multiple of this,
/// and every block the pool hands out is aligned to it.
pub const ALIGN: usize = 8;

/// The largest request, in bytes, served from the pool's free lists. Anything
/// larger goes straight to the primary allocator.
pub const MAX_CHUNK: usize = 128;

/// The number of size classes, and therefore free lists: one per multiple of
/// [`ALIGN`] in `(0, MAX_CHUNK]`.
pub const NUM_SIZE_CLASSES: usize = MAX_CHUNK / ALIGN;

/// Round `bytes` up to the smallest multiple of [`ALIGN`] that is greater
/// than or equal to it.
#[inline]
pub const fn round_up(bytes: usize) -> usize {
    (bytes + ALIGN - 1) & !(ALIGN - 1)
}

/// The index of the free list that serves blocks of `bytes` bytes.
///
/// Valid for `bytes` in `(0, MAX_CHUNK]`. The result is the same whether or
/// not `bytes` has already been passed through [`round_up`].
#[inline]
pub const fn free_list_index(bytes: usize) -> usize {
    debug_assert!(bytes > 0 && bytes <= MAX_CHUNK);
    (bytes + ALIGN - 1) / ALIGN - 1
}

/// The block size served by the free list at `index`; the inverse of
/// [`free_list_index`] on rounded sizes.
#[inline]
pub const fn class_size(index: usize) -> usize {
    debug_assert!(index < NUM_SIZE_CLASSES);
    (index + 1) * ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_is_idempotent() {
        for n in 1..=1024 {
            assert_eq!(round_up(round_up(n)), round_up(n));
        }
    }

    #[test]
    fn round_up_is_the_next_multiple_of_align() {
        for n in 1..=1024 {
            let r = round_up(n);
            assert_eq!(r % ALIGN, 0);
            assert!(r >= n);
            assert!(r - n < ALIGN);
        }
    }

    #[test]
    fn index_is_in_range_for_every_pooled_size() {
        for n in 1..=MAX_CHUNK {
            let idx = free_list_index(round_up(n));
            assert!(idx < NUM_SIZE_CLASSES);
            assert_eq!(idx, free_list_index(n));
        }
    }

    #[test]
    fn class_size_inverts_index() {
        for n in 1..=MAX_CHUNK {
            assert_eq!(class_size(free_list_index(n)), round_up(n));
        }
        for idx in 0..NUM_SIZE_CLASSES {
            assert_eq!(free_list_index(class_size(idx)), idx);
        }
    }
}
