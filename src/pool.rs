//! The pool allocator.
//!
//! Small allocations are organized into size classes, one per multiple of
//! [`ALIGN`] up to [`MAX_CHUNK`], each with its own free list:
//!
//! 1. `allocate` pops the head of the matching free list when it can. This is
//!    the fast path: one pointer read and one pointer write under the lock.
//!
//! 2. When a free list is empty it is refilled in a batch: up to twenty
//!    blocks of the class size are carved off the front of a shared
//!    bump-pointer arena, the first going to the caller and the rest linked
//!    into the free list in address order.
//!
//! 3. When the arena cannot supply even one block, it grows. A fresh chunk is
//!    requested from the inner allocator, sized at roughly double the
//!    immediate need plus a fraction of all memory obtained so far, which
//!    amortizes future growth. Any unusable tail of the old arena is first
//!    donated to the free list of its own size so no memory is stranded.
//!
//! 4. If the inner allocator refuses, the pool cannibalizes: it removes one
//!    block from the smallest non-empty free list of at least the requested
//!    size and uses that block as a miniature arena. Sacrificing a pooled
//!    block from a less-pressured class keeps the starved class alive while
//!    the process is out of memory.
//!
//! 5. Only when every free list of sufficient size is empty does the pool
//!    fall back to the primary tier's out-of-memory retry protocol, whose
//!    failure is the sole error a caller can observe.
//!
//! Free-list links live in the free blocks themselves: the first word of an
//! unused block points at the next block of the same class, so the lists cost
//! no memory beyond the blocks they chain together. Freed blocks are recycled
//! through their class's list and never returned to the inner allocator;
//! whole chunks are handed back only when the pool itself is dropped.
//!
//! Requests that are larger than [`MAX_CHUNK`], over-aligned, or zero-sized
//! bypass all of the above and go straight to the primary tier.

use crate::{
    class_size, free_list_index,
    mutex::Mutex,
    retry::RetryAllocator,
    round_up, AllocError, Allocator, LockingMechanism, ALIGN, MAX_CHUNK, NUM_SIZE_CLASSES,
};
use core::{alloc::Layout, mem, ptr, ptr::NonNull};

/// How many blocks a free-list refill asks the arena for. The arena may
/// deliver fewer, down to a single block.
const REFILL_COUNT: usize = 20;

/// A two-tier pool allocator.
///
/// Wraps a [`RetryAllocator`] (the primary tier) and serves small requests
/// from per-size-class free lists backed by a bump-pointer arena, refilled
/// in batches, grown on demand, and recovered by cannibalizing a larger
/// class when the inner allocator itself is out of memory.
///
/// All pool state sits behind a single mutex, so one external call is one
/// critical section; locking is coarse-grained across all size classes.
///
/// Dropping the pool returns every chunk it obtained from the inner
/// allocator, which invalidates all blocks still allocated from the pool;
/// per the [`Allocator`] contract, callers must not outlive their allocator.
pub struct PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// The primary tier: serves non-pooled requests and is the pool's
    /// last-resort source of fresh arena chunks.
    primary: RetryAllocator<A, L>,

    /// The free lists, the arena, and the growth bookkeeping.
    pool: Mutex<Pool, L>,
}

/// Is this request served from the pool's free lists?
///
/// The pool only guarantees [`ALIGN`]-alignment and only stocks classes up to
/// [`MAX_CHUNK`]; everything else belongs to the primary tier. Zero-size
/// requests are also passed through, so the inner allocator decides what a
/// zero-size pointer looks like.
#[inline]
fn is_pooled(layout: Layout) -> bool {
    layout.size() != 0 && layout.size() <= MAX_CHUNK && layout.align() <= ALIGN
}

impl<A, L> PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    /// Create a new, empty `PoolAllocator` on top of the given primary tier.
    ///
    /// No memory is obtained until the first pooled allocation.
    #[inline]
    pub const fn new(primary: RetryAllocator<A, L>, lock: L) -> Self {
        PoolAllocator {
            primary,
            pool: Mutex::new(Pool::new(), lock),
        }
    }

    /// Get a shared reference to the primary tier.
    #[inline]
    pub fn primary(&self) -> &RetryAllocator<A, L> {
        &self.primary
    }

    /// Get a shared reference to the inner allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        self.primary.inner()
    }

    /// Install an out-of-memory handler on the primary tier, returning the
    /// previous one. See [`RetryAllocator::set_oom_handler`].
    pub fn set_oom_handler(&self, handler: Option<crate::OomHandler>) -> Option<crate::OomHandler> {
        self.primary.set_oom_handler(handler)
    }

    /// The total number of bytes of arena memory ever obtained from the inner
    /// allocator.
    ///
    /// Monotonically increasing; freed blocks are recycled, not returned, so
    /// this never goes down. Feeds the growth heuristic: a pool that has
    /// already grown large grows in larger steps.
    pub fn heap_size(&self) -> usize {
        self.pool.lock().heap_size
    }

    /// Refill the free list for `size` and return one block to the caller.
    ///
    /// `size` must be a rounded class size whose free list is empty. Asks the
    /// arena for a batch of [`REFILL_COUNT`] blocks; a batch of one is handed
    /// straight back without touching the list, and a batch of `k > 1` puts
    /// blocks `1..k` on the list in address order, which costs exactly `k-1`
    /// link writes.
    fn refill(&self, pool: &mut Pool, size: usize) -> Result<NonNull<u8>, AllocError> {
        debug_assert_eq!(size, round_up(size));
        debug_assert!(pool.free_lists[free_list_index(size)].head.is_none());

        let (chunk, got) = self.chunk_alloc(pool, size, REFILL_COUNT)?;
        if got == 1 {
            return Ok(chunk);
        }

        let list = &mut pool.free_lists[free_list_index(size)];

        // Safety: `chunk` is a fresh carve of `got * size` bytes that nothing
        // else references. Block 0 goes to the caller; blocks `1..got` are
        // unused and become free-list nodes, each linked to its neighbor.
        unsafe {
            let mut node = chunk.as_ptr().add(size).cast::<FreeNode>();
            list.head = Some(NonNull::new_unchecked(node));
            for _ in 2..got {
                let next = node.cast::<u8>().add(size).cast::<FreeNode>();
                (*node).next = Some(NonNull::new_unchecked(next));
                node = next;
            }
            (*node).next = None;
        }

        Ok(chunk)
    }

    /// Carve up to `count` contiguous blocks of `size` bytes out of the
    /// arena, growing it as needed. Returns the first block and the number of
    /// blocks actually carved, in `1..=count`.
    ///
    /// Each pass of the loop either returns, or strictly increases the arena
    /// capacity available to `size` before looping again, so a successful
    /// growth step lands in one of the two carve cases on the next pass and
    /// the loop terminates; the only exit without a carve is the primary
    /// tier's [`AllocError`].
    fn chunk_alloc(
        &self,
        pool: &mut Pool,
        size: usize,
        count: usize,
    ) -> Result<(NonNull<u8>, usize), AllocError> {
        debug_assert!(size >= ALIGN && size % ALIGN == 0);
        let total = size * count;

        loop {
            let bytes_left = pool.arena.bytes_left();

            if bytes_left >= total {
                // Safety: the arena has at least `total` bytes left.
                return Ok((unsafe { pool.arena.carve(total) }, count));
            }

            if bytes_left >= size {
                // Partial batch: hand over every whole block that is left.
                let got = bytes_left / size;
                // Safety: `got * size <= bytes_left`.
                return Ok((unsafe { pool.arena.carve(got * size) }, got));
            }

            // The arena cannot supply even one block. Grow it, asking for
            // double the whole batch plus a sixteenth of everything obtained
            // so far.
            let bytes_to_get = 2 * total + round_up(pool.heap_size >> 4);

            // Donate the unusable tail of the old arena to the free list of
            // its own size before abandoning it. The tail is always a whole
            // number of alignment units (every carve is), so a nonzero tail
            // is always a valid class; a tail shorter than one unit would not
            // be, and is skipped.
            if bytes_left >= ALIGN {
                debug_assert_eq!(bytes_left % ALIGN, 0);
                debug_assert!(bytes_left < size && size <= MAX_CHUNK);
                // Safety: taking everything that is left; the fragment is
                // unused, exclusive, and exactly one `bytes_left`-class
                // block.
                unsafe {
                    let fragment = pool.arena.carve(bytes_left);
                    pool.free_lists[free_list_index(bytes_left)].push(fragment);
                }
            }

            let layout = chunk_layout(bytes_to_get)?;

            // A fresh chunk from the inner allocator, not yet through the
            // out-of-memory retry protocol.
            if let Ok(raw) = self.primary.inner().allocate(layout) {
                // Safety: `raw` is a live allocation of `layout`, which has
                // room for the header plus `bytes_to_get` arena bytes.
                unsafe { pool.install_chunk(raw.cast(), layout, bytes_to_get) };
                continue;
            }

            // The inner allocator is out of memory. Sacrifice one pooled
            // block from the smallest class that can cover `size` and use it
            // as the arena; its own class is less starved than ours.
            if let Some((block, stolen_size)) = pool.steal_block(size) {
                pool.arena = Arena::new(block, stolen_size);
                continue;
            }

            // No class anywhere has a spare block. Give the request to the
            // retry tier; either an installed handler remedies the situation
            // or the error propagates to the caller as the one fatal outcome.
            pool.arena = Arena::empty();
            let raw = self.primary.allocate(layout)?;
            // Safety: as above.
            unsafe { pool.install_chunk(raw.cast(), layout, bytes_to_get) };
        }
    }

    /// Move an allocation to a new layout, one side of which is pooled.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Allocator::grow`], except that `new_layout` may
    /// also be smaller than `old_layout`.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // Both sides pooled and in the same size class: the block already
        // fits, and no bytes move.
        if is_pooled(old_layout)
            && is_pooled(new_layout)
            && round_up(old_layout.size()) == round_up(new_layout.size())
        {
            return Ok(NonNull::slice_from_raw_parts(ptr, round_up(old_layout.size())));
        }

        let new_block = self.allocate(new_layout)?;

        // Safety: the blocks are distinct allocations, and both are valid for
        // the copied prefix.
        ptr::copy_nonoverlapping(
            ptr.as_ptr().cast_const(),
            new_block.cast::<u8>().as_ptr(),
            old_layout.size().min(new_layout.size()),
        );

        self.deallocate(ptr, old_layout);
        Ok(new_block)
    }
}

unsafe impl<A, L> Allocator for PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if !is_pooled(layout) {
            return self.primary.allocate(layout);
        }

        let size = round_up(layout.size());
        let mut pool = self.pool.lock();
        let pool = &mut *pool;

        let block = match pool.free_lists[free_list_index(size)].pop() {
            Some(block) => block,
            None => self.refill(pool, size)?,
        };

        debug_assert_eq!(block.as_ptr() as usize % ALIGN, 0);
        Ok(NonNull::slice_from_raw_parts(block, size))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if !is_pooled(layout) {
            return self.primary.deallocate(ptr, layout);
        }

        let size = round_up(layout.size());
        let mut pool = self.pool.lock();
        // Safety: per this method's contract, `layout` is the layout the
        // block was allocated with, so `ptr` is an unused, exclusive block of
        // exactly this class.
        pool.free_lists[free_list_index(size)].push(ptr);
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        // Both sides outside the pool: let the inner allocator resize in
        // place or move, with the retry protocol on failure.
        if !is_pooled(old_layout) && !is_pooled(new_layout) {
            return self.primary.grow(ptr, old_layout, new_layout);
        }

        self.reallocate(ptr, old_layout, new_layout)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if !is_pooled(old_layout) && !is_pooled(new_layout) {
            return self.primary.shrink(ptr, old_layout, new_layout);
        }

        self.reallocate(ptr, old_layout, new_layout)
    }
}

impl<A, L> Drop for PoolAllocator<A, L>
where
    A: Allocator,
    L: LockingMechanism,
{
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        let pool = &mut *pool;

        // The arena and the free lists all point into the chunks about to be
        // released.
        pool.arena = Arena::empty();
        pool.free_lists = [const { FreeList::new() }; NUM_SIZE_CLASSES];

        while let Some(header) = pool.chunks {
            // Safety: `header` sits at the base of a live chunk allocation
            // made from the inner allocator with the recorded layout, and
            // nothing references the chunk anymore.
            unsafe {
                let ChunkHeader { next, layout } = header.read();
                pool.chunks = next;
                self.primary.inner().deallocate(header.cast(), layout);
            }
        }
    }
}

/// The shared state of a [`PoolAllocator`]: free lists, arena, growth
/// bookkeeping, and the chunk registry. Guarded by one mutex.
struct Pool {
    /// One free-list head per size class, indexed by `free_list_index`.
    free_lists: [FreeList; NUM_SIZE_CLASSES],

    /// The bump arena all classes refill from.
    arena: Arena,

    /// Total arena bytes ever obtained from the inner allocator. Input to the
    /// growth heuristic; never decremented.
    heap_size: usize,

    /// Intrusive list of every chunk obtained from the inner allocator, so
    /// `Drop` can hand them back.
    chunks: Option<NonNull<ChunkHeader>>,
}

// Safety: the pool owns every block its free lists, arena, and chunk registry
// point into; moving the `Pool` to another thread moves that ownership with
// it, and the guarding mutex prevents unsynchronized access.
unsafe impl Send for Pool {}

impl Pool {
    const fn new() -> Self {
        Pool {
            free_lists: [const { FreeList::new() }; NUM_SIZE_CLASSES],
            arena: Arena::empty(),
            heap_size: 0,
            chunks: None,
        }
    }

    /// Record a fresh chunk in the registry and make its body the arena.
    ///
    /// # Safety
    ///
    /// `base` must be a live, otherwise-unreferenced allocation of `layout`
    /// from the pool's inner allocator, with
    /// `layout.size() >= CHUNK_HEADER_SIZE + arena_len`.
    unsafe fn install_chunk(&mut self, base: NonNull<u8>, layout: Layout, arena_len: usize) {
        let header = base.cast::<ChunkHeader>();
        header.write(ChunkHeader {
            next: self.chunks,
            layout,
        });
        self.chunks = Some(header);

        let start = NonNull::new_unchecked(base.as_ptr().add(CHUNK_HEADER_SIZE));
        self.arena = Arena::new(start, arena_len);
        self.heap_size += arena_len;
    }

    /// Remove one block from the smallest non-empty free list whose class is
    /// at least `size` bytes, returning the block and its class size.
    ///
    /// Classes smaller than `size` are not considered: their blocks cannot
    /// cover even one requested block, and raiding them tends to make an
    /// out-of-memory situation worse.
    fn steal_block(&mut self, size: usize) -> Option<(NonNull<u8>, usize)> {
        for index in free_list_index(size)..NUM_SIZE_CLASSES {
            if let Some(block) = self.free_lists[index].pop() {
                return Some((block, class_size(index)));
            }
        }
        None
    }
}

/// A singly linked list of unused, same-class blocks.
///
/// The links are overlaid on the blocks themselves: an unused block's first
/// word holds the pointer to the next unused block. Handing a block to a
/// caller simply forgets the link; the caller's use of the bytes is
/// unconstrained.
struct FreeList {
    head: Option<NonNull<FreeNode>>,
}

/// The link word at the start of every unused pooled block.
struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

impl FreeList {
    const fn new() -> Self {
        FreeList { head: None }
    }

    /// Pop the most recently pushed block.
    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // Safety: every node on a free list is an unused block of this list's
        // class whose first word is a valid `FreeNode`.
        self.head = unsafe { node.as_ref().next };
        Some(node.cast())
    }

    /// Push an unused block onto the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must be an unused, exclusively owned block of this list's
    /// class: at least one word long, [`ALIGN`]-aligned, and referenced by
    /// nothing else.
    unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeNode>();
        node.write(FreeNode { next: self.head });
        self.head = Some(node);
    }
}

/// The bump arena: a span of raw memory consumed from the front, with no
/// per-object bookkeeping.
struct Arena {
    cursor: *mut u8,
    end: *mut u8,
}

impl Arena {
    /// An arena with nothing left to give.
    const fn empty() -> Self {
        Arena {
            cursor: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }

    /// An arena over `len` bytes starting at `start`.
    fn new(start: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(start.as_ptr() as usize % ALIGN, 0);
        debug_assert_eq!(len % ALIGN, 0);
        Arena {
            cursor: start.as_ptr(),
            end: start.as_ptr().wrapping_add(len),
        }
    }

    /// How many bytes remain.
    fn bytes_left(&self) -> usize {
        self.end as usize - self.cursor as usize
    }

    /// Take `bytes` bytes off the front.
    ///
    /// # Safety
    ///
    /// `bytes` must not exceed [`Arena::bytes_left`].
    unsafe fn carve(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(bytes <= self.bytes_left());
        let block = self.cursor;
        self.cursor = self.cursor.add(bytes);
        NonNull::new_unchecked(block)
    }
}

/// The registry entry written at the base of every chunk obtained from the
/// inner allocator. Records the layout to hand back on `Drop` and links the
/// chunks together; the arena proper starts [`CHUNK_HEADER_SIZE`] bytes in.
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    layout: Layout,
}

/// The header's footprint, padded so the arena behind it stays
/// [`ALIGN`]-aligned.
const CHUNK_HEADER_SIZE: usize = round_up(mem::size_of::<ChunkHeader>());

const CHUNK_ALIGN: usize = {
    let align = mem::align_of::<ChunkHeader>();
    if align > ALIGN {
        align
    } else {
        ALIGN
    }
};

/// The layout of a chunk with `bytes` bytes of arena behind the header.
fn chunk_layout(bytes: usize) -> Result<Layout, AllocError> {
    let size = CHUNK_HEADER_SIZE.checked_add(bytes).ok_or(AllocError)?;
    Layout::from_size_align(size, CHUNK_ALIGN).map_err(|_| AllocError)
}
