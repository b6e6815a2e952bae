//! Shared fuzzing and testing infrastructure for `pool-alloc`.

use bincode::{Decode, Encode};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use pool_alloc::{
    AllocError, Allocator, PoolAllocator, RetryAllocator, SingleThreadedLockingMechanism,
};
use std::{
    alloc::Layout,
    collections::BTreeMap,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    sync::Mutex,
};

/// The size and alignment of a test allocation.
//
// Note: it is easier to define our own request type here than to reuse
// `std::alloc::Layout` because we want to define a default mutator for it and
// trait orphan rules make that impossible. It also lets fuzz input decode to
// arbitrary, even invalid, size/align pairs, which the interpreter skips.
#[derive(Clone, Copy, Debug, Encode, Decode)]
pub struct AllocRequest {
    /// Requested size in bytes.
    pub size: usize,
    /// Requested alignment in bytes.
    pub align: usize,
}

impl Default for AllocRequest {
    fn default() -> Self {
        Self { size: 0, align: 1 }
    }
}

impl AllocRequest {
    /// Create a new `AllocRequest` from the given size and alignment.
    pub fn new(size: usize, align: usize) -> Self {
        AllocRequest { size, align }
    }

    /// The layout this request describes, if it is a valid one.
    ///
    /// Fuzz input can decode to any size/align pair; junk alignments and
    /// absurd sizes yield `None` and the op is skipped.
    fn layout(&self) -> Option<Layout> {
        if !self.align.is_power_of_two() || self.align > 4096 {
            return None;
        }
        Layout::from_size_align(self.size, self.align).ok()
    }
}

impl DefaultMutate for AllocRequest {
    type DefaultMutate = AllocRequestMutator;
}

/// A mutator for `AllocRequest`s with configurable maximums for size and
/// alignment.
///
/// The defaults keep sizes on both sides of the pool's 128-byte ceiling and
/// alignments on both sides of its 8-byte unit, so mutated op sequences
/// exercise the pooled and primary paths and the boundary between them.
#[derive(Debug)]
pub struct AllocRequestMutator {
    /// Largest size to generate.
    pub max_size: usize,
    /// Largest alignment to generate; must be a power of two.
    pub max_align: usize,
}

impl Default for AllocRequestMutator {
    fn default() -> Self {
        Self {
            max_size: 1024,
            max_align: 64,
        }
    }
}

impl Mutate<AllocRequest> for AllocRequestMutator {
    fn mutate(
        &mut self,
        c: &mut mutatis::Candidates<'_>,
        request: &mut AllocRequest,
    ) -> mutatis::Result<()> {
        // Mutate size.
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() {
                request.size
            } else {
                self.max_size
            };
            request.size = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        // Mutate alignment.
        c.mutation(|ctx| {
            let max_align_log2 = if ctx.shrink() {
                request.align.max(1).trailing_zeros() as usize
            } else {
                self.max_align.trailing_zeros() as usize
            };
            let align_log2 = ctx.rng().gen_index(max_align_log2 + 1).unwrap();
            request.align = 1 << align_log2;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<AllocRequest> for AllocRequestMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<AllocRequest> {
        let size = m::range(0..=self.max_size).generate(context)?;
        let align_log2 =
            m::range(0..=self.max_align.trailing_zeros() as usize).generate(context)?;
        Ok(AllocRequest {
            size,
            align: 1 << align_log2,
        })
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, Encode, Decode)]
pub enum Op {
    /// Allocate a block and remember it under `id`.
    Alloc {
        /// Identifier for the resulting allocation.
        id: u32,
        /// Requested size and alignment.
        request: AllocRequest,
    },
    /// Deallocate the block remembered under `id`, if any.
    Dealloc {
        /// Identifier of the allocation to free.
        id: u32,
    },
    /// Grow the block remembered under `id` to a new layout.
    Grow {
        /// Identifier of the allocation to grow.
        id: u32,
        /// The new size and alignment.
        request: AllocRequest,
    },
    /// Shrink the block remembered under `id` to a new layout.
    Shrink {
        /// Identifier of the allocation to shrink.
        id: u32,
        /// The new size and alignment.
        request: AllocRequest,
    },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    request: m::default::<AllocRequest>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Dealloc {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Grow {
                    id: ctx.rng().gen_u32(),
                    request: m::default::<AllocRequest>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Shrink {
                    id: ctx.rng().gen_u32(),
                    request: m::default::<AllocRequest>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, Encode, Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

/// The default mutator for [`Ops`].
#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::Dealloc { id }
                    | Op::Grow { id, .. }
                    | Op::Shrink { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Deallocate an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let dealloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(dealloc_index, Op::Dealloc { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let request = m::default::<AllocRequest>().generate(ctx)?;
                    let f: fn(u32, AllocRequest) -> Op = if ctx.rng().gen_bool() {
                        |id, request| Op::Grow { id, request }
                    } else {
                        |id, request| Op::Shrink { id, request }
                    };
                    let resize_op = f(id, request);
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, resize_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, if any. Returns whether one was removed.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations with the given allocation limit.
    pub fn run(&self, allocation_limit: usize) -> Result<(), String> {
        let primary = RetryAllocator::new(PlatformAlloc, SingleThreadedLockingMechanism::new());
        let allocator = PoolAllocator::new(primary, SingleThreadedLockingMechanism::new());
        self.run_with_allocator(allocator, allocation_limit)
    }

    /// Run these test operations with the given allocator and allocation
    /// limit.
    pub fn run_with_allocator<P>(&self, allocator: P, allocation_limit: usize) -> Result<(), String>
    where
        P: Allocator,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::new(allocation_limit);

        // Fill an allocation with the given byte pattern.
        let fill = |ptr: NonNull<[u8]>, byte: u8| unsafe {
            ptr.cast::<u8>().write_bytes(byte, ptr.len());
        };

        // Deallocate the allocation with the given id.
        let dealloc = |id: u32, alloc: LiveAlloc| {
            log::debug!("deallocating id{id} -> {alloc:?}");
            fill(alloc.ptr, FREE_POISON_PATTERN);
            unsafe {
                allocator.deallocate(alloc.ptr.cast(), alloc.layout);
            }
        };

        // Assert that the given allocation satisfies its requested layout.
        let assert_fits_layout = |ptr: NonNull<[u8]>, layout: Layout| -> Result<(), String> {
            ensure!(
                layout.size() <= ptr.len(),
                "actual allocated size is less than expected layout size",
            );
            ensure!(
                layout.align().trailing_zeros()
                    <= (ptr.cast::<u8>().as_ptr() as usize).trailing_zeros(),
                "actual allocated alignment is less than expected layout alignment",
            );
            Ok(())
        };

        // Assert that the given allocation is not overlapping with any other
        // live allocations.
        let assert_not_overlapping = |live: &LiveMap, ptr: NonNull<[u8]>| -> Result<(), String> {
            let ptr_start = ptr.cast::<u8>().as_ptr() as usize;
            let ptr_end = ptr_start + ptr.len();
            for other in live.map.values() {
                let other_start = other.ptr.cast::<u8>().as_ptr() as usize;
                let other_end = other_start + other.ptr.len();
                ensure!(
                    ptr_end <= other_start || other_end <= ptr_start,
                    "two distinct live allocations should never overlap",
                );
            }
            Ok(())
        };

        // Process a new allocation, checking properties and inserting it into
        // the live set.
        let new_alloc = |live: &mut LiveMap,
                         id: u32,
                         ptr: NonNull<[u8]>,
                         layout: Layout|
         -> Result<(), String> {
            if let Some(old_alloc) = live.remove(id) {
                dealloc(id, old_alloc);
            }

            log::debug!(
                "new allocation: id{id} -> {{ address: {ptr:p}, size: {}, layout: {layout:?} }}",
                ptr.len(),
            );

            assert_fits_layout(ptr, layout)?;
            assert_not_overlapping(&live, ptr)?;
            fill(ptr, LIVE_POISON_PATTERN);

            live.insert(id, LiveAlloc { ptr, layout });

            Ok(())
        };

        // Check that a resized allocation's surviving prefix still holds the
        // bytes the original block was filled with.
        let check_resized_bytes = |ptr: NonNull<[u8]>, size: usize| -> Result<(), String> {
            let slice = unsafe { ptr.as_ref() };
            let slice = &slice[..size];
            ensure!(
                slice.iter().all(|b| *b == LIVE_POISON_PATTERN),
                "original allocation's bytes not carried over by a resizing operation",
            );
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match op {
                Op::Alloc { id, request } => {
                    let Some(layout) = request.layout() else { continue };
                    if live.beyond_allocation_limit(layout.size()) {
                        continue;
                    }

                    if let Ok(ptr) = allocator.allocate(layout) {
                        new_alloc(&mut live, *id, ptr, layout)?;
                    }
                }

                Op::Dealloc { id } => {
                    if let Some(alloc) = live.remove(*id) {
                        dealloc(*id, alloc);
                    }
                }

                Op::Grow { id, request } => {
                    let Some(new_layout) = request.layout() else { continue };
                    if let Some(old_alloc) = live.remove(*id) {
                        if old_alloc.layout.size() <= new_layout.size()
                            && !live.beyond_allocation_limit(new_layout.size())
                        {
                            match unsafe {
                                allocator.grow(old_alloc.ptr.cast(), old_alloc.layout, new_layout)
                            } {
                                Ok(new_ptr) => {
                                    check_resized_bytes(new_ptr, old_alloc.layout.size())?;
                                    new_alloc(&mut live, *id, new_ptr, new_layout)?;
                                }
                                Err(_) => {
                                    // Growing failed; just put it back
                                    // unmodified.
                                    live.insert(*id, old_alloc);
                                }
                            }
                        } else {
                            // Cannot grow an allocation to a smaller size;
                            // just put it back unmodified.
                            live.insert(*id, old_alloc);
                        }
                    }
                }

                Op::Shrink { id, request } => {
                    let Some(new_layout) = request.layout() else { continue };
                    if let Some(old_alloc) = live.remove(*id) {
                        if old_alloc.layout.size() >= new_layout.size() {
                            match unsafe {
                                allocator.shrink(old_alloc.ptr.cast(), old_alloc.layout, new_layout)
                            } {
                                Ok(new_ptr) => {
                                    check_resized_bytes(new_ptr, new_layout.size())?;
                                    new_alloc(&mut live, *id, new_ptr, new_layout)?;
                                }
                                Err(_) => {
                                    // Shrinking failed; just put it back
                                    // unmodified.
                                    live.insert(*id, old_alloc);
                                }
                            }
                        } else {
                            // Cannot shrink an allocation to a larger size;
                            // just put it back unmodified.
                            live.insert(*id, old_alloc);
                        }
                    }
                }
            }
        }

        // Finally, deallocate any remaining live allocations.
        for (id, alloc) in live.map {
            dealloc(id, alloc);
        }

        Ok(())
    }
}

// We fill live memory with a poison pattern, both to catch resizing
// operations that lose bytes and to make sure handed-out blocks really are
// ours to scribble on.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    /// Pointer and actual allocated length.
    ptr: NonNull<[u8]>,
    /// Requested layout at allocation time.
    layout: Layout,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, layout } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &ptr.len())
            .field("layout", &layout)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
struct LiveMap {
    /// The live allocations themselves.
    map: BTreeMap<u32, LiveAlloc>,

    /// The total number of bytes that are currently allocated.
    ///
    /// Note: this is a sum of the requested allocation sizes, and does not
    /// include the size of any extra bytes that the allocator may have
    /// included.
    total_allocated_bytes: usize,

    /// The total allocated bytes should never surpass this limit.
    allocation_limit: usize,
}

impl LiveMap {
    fn new(allocation_limit: usize) -> Self {
        LiveMap {
            map: BTreeMap::default(),
            total_allocated_bytes: 0,
            allocation_limit,
        }
    }

    /// Would an allocation of the given size push us past our allocation
    /// limit?
    fn beyond_allocation_limit(&self, size: usize) -> bool {
        self.total_allocated_bytes + size > self.allocation_limit
    }

    /// Insert a new live allocation.
    ///
    /// It is the caller's responsibility to check that the given allocation
    /// fits within our configured limit.
    fn insert(&mut self, id: u32, alloc: LiveAlloc) {
        self.total_allocated_bytes += alloc.layout.size();
        assert!(self.total_allocated_bytes <= self.allocation_limit);

        let old = self.map.insert(id, alloc);
        assert!(
            old.is_none(),
            "should remove and deallocate old entries before adding new ones"
        );
    }

    /// Remove a live allocation for deallocation.
    fn remove(&mut self, id: u32) -> Option<LiveAlloc> {
        let alloc = self.map.remove(&id)?;
        self.total_allocated_bytes -= alloc.layout.size();
        Some(alloc)
    }
}

/// A stable, `std`-backed platform allocator for tests and fuzzing.
pub struct PlatformAlloc;

unsafe impl Allocator for PlatformAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            // A zero-size block needs no storage; any non-null, suitably
            // aligned address will do.
            let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            return Ok(NonNull::slice_from_raw_parts(dangling, 0));
        }
        // Safety: `layout` has a non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// A platform allocator that records every request and can be told to fail,
/// either permanently or for a set number of upcoming attempts.
#[derive(Default)]
pub struct InstrumentedAlloc {
    /// When true, every allocation attempt fails.
    pub fail_now: AtomicBool,

    /// Fail this many upcoming allocation attempts, then recover.
    pub fail_next: AtomicUsize,

    allocations: Mutex<Vec<Layout>>,
    deallocations: Mutex<Vec<Layout>>,
}

impl InstrumentedAlloc {
    /// Create a new `InstrumentedAlloc` in the always-succeed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every layout successfully allocated so far, in order.
    pub fn allocations(&self) -> Vec<Layout> {
        self.allocations.lock().unwrap().clone()
    }

    /// Every layout deallocated so far, in order.
    pub fn deallocations(&self) -> Vec<Layout> {
        self.deallocations.lock().unwrap().clone()
    }
}

unsafe impl Allocator for InstrumentedAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if self.fail_now.load(Ordering::SeqCst) {
            return Err(AllocError);
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AllocError);
        }
        let block = PlatformAlloc.allocate(layout)?;
        self.allocations.lock().unwrap().push(layout);
        Ok(block)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.deallocations.lock().unwrap().push(layout);
        PlatformAlloc.deallocate(ptr, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};
    use pool_alloc::{SpinLockingMechanism, ALIGN, MAX_CHUNK};
    use std::collections::HashSet;

    type TestPool = PoolAllocator<PlatformAlloc, SingleThreadedLockingMechanism>;

    fn new_pool() -> TestPool {
        PoolAllocator::new(
            RetryAllocator::new(PlatformAlloc, SingleThreadedLockingMechanism::new()),
            SingleThreadedLockingMechanism::new(),
        )
    }

    fn instrumented_pool(
        platform: &InstrumentedAlloc,
    ) -> PoolAllocator<&InstrumentedAlloc, SingleThreadedLockingMechanism> {
        PoolAllocator::new(
            RetryAllocator::new(platform, SingleThreadedLockingMechanism::new()),
            SingleThreadedLockingMechanism::new(),
        )
    }

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple alloc/dealloc pair.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    request: AllocRequest::new(8, 8),
                },
                Op::Dealloc { id: 0 },
            ]),
            // Free-list reuse.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    request: AllocRequest::new(16, 8),
                },
                Op::Alloc {
                    id: 1,
                    request: AllocRequest::new(16, 8),
                },
                Op::Dealloc { id: 0 },
                Op::Alloc {
                    id: 2,
                    request: AllocRequest::new(16, 8),
                },
                Op::Dealloc { id: 1 },
                Op::Dealloc { id: 2 },
            ]),
            // Straddle the pool's ceiling.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    request: AllocRequest::new(128, 8),
                },
                Op::Alloc {
                    id: 1,
                    request: AllocRequest::new(129, 8),
                },
                Op::Dealloc { id: 0 },
                Op::Dealloc { id: 1 },
            ]),
            // An over-aligned request bypasses the pool.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    request: AllocRequest::new(64, 64),
                },
                Op::Dealloc { id: 0 },
            ]),
            // Resize within a class, across classes, and out of the pool.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    request: AllocRequest::new(8, 1),
                },
                Op::Grow {
                    id: 0,
                    request: AllocRequest::new(16, 8),
                },
                Op::Grow {
                    id: 0,
                    request: AllocRequest::new(200, 8),
                },
                Op::Shrink {
                    id: 0,
                    request: AllocRequest::new(8, 8),
                },
                Op::Dealloc { id: 0 },
            ]),
        ];

        match Check::new().iters(100_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| {
                let megabyte = 1 << 20;
                ops.run(megabyte)
            },
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn freed_block_is_reused() {
        let pool = new_pool();
        let l = layout(16, 8);

        let a = pool.allocate(l).unwrap();
        assert_eq!(a.len(), 16);
        unsafe { pool.deallocate(a.cast(), l) };
        let b = pool.allocate(l).unwrap();

        assert_eq!(a.cast::<u8>(), b.cast::<u8>());
        assert_eq!(b.len(), 16);
    }

    #[test]
    fn reuse_is_lifo() {
        let pool = new_pool();
        let l = layout(16, 8);

        let a = pool.allocate(l).unwrap();
        let b = pool.allocate(l).unwrap();
        let c = pool.allocate(l).unwrap();
        assert_ne!(a.cast::<u8>(), b.cast::<u8>());
        assert_ne!(b.cast::<u8>(), c.cast::<u8>());

        unsafe { pool.deallocate(b.cast(), l) };
        let d = pool.allocate(l).unwrap();
        assert_eq!(d.cast::<u8>(), b.cast::<u8>());
    }

    #[test]
    fn refill_links_blocks_in_address_order() {
        let pool = new_pool();
        let l = layout(16, 8);

        // The first allocation refills the (empty) free list from the arena;
        // consecutive pops then walk the carved batch front to back.
        let first = pool.allocate(l).unwrap().cast::<u8>().as_ptr() as usize;
        for i in 1..10 {
            let next = pool.allocate(l).unwrap().cast::<u8>().as_ptr() as usize;
            assert_eq!(next, first + i * 16);
        }
    }

    #[test]
    fn rounded_size_is_handed_back() {
        let pool = new_pool();

        for size in 1..=MAX_CHUNK {
            let l = layout(size, 1);
            let block = pool.allocate(l).unwrap();
            assert_eq!(block.len(), pool_alloc::round_up(size));
            assert_eq!(block.cast::<u8>().as_ptr() as usize % ALIGN, 0);
            unsafe { pool.deallocate(block.cast(), l) };
        }
    }

    #[test]
    fn large_and_overaligned_requests_bypass_the_pool() {
        let platform = InstrumentedAlloc::new();
        let pool = instrumented_pool(&platform);

        // A request over the ceiling goes to the platform verbatim.
        let big = layout(256, 8);
        let p = pool.allocate(big).unwrap();
        assert!(platform.allocations().contains(&big));
        unsafe { pool.deallocate(p.cast(), big) };
        assert!(platform.deallocations().contains(&big));

        // An over-aligned small request does too, and comes back with its
        // alignment honored.
        let aligned = layout(64, 64);
        let p = pool.allocate(aligned).unwrap();
        assert_eq!(p.cast::<u8>().as_ptr() as usize % 64, 0);
        assert!(platform.allocations().contains(&aligned));
        unsafe { pool.deallocate(p.cast(), aligned) };

        // A pooled request never reaches the platform at its own size; only
        // batched chunk requests do.
        let small = layout(72, 8);
        let p = pool.allocate(small).unwrap();
        assert!(!platform.allocations().iter().any(|l| l.size() == 72));
        unsafe { pool.deallocate(p.cast(), small) };
    }

    #[test]
    fn zero_size_allocations_work() {
        let pool = new_pool();
        let l = layout(0, 1);
        let p = pool.allocate(l).unwrap();
        assert_eq!(p.len(), 0);
        unsafe { pool.deallocate(p.cast(), l) };
    }

    #[test]
    fn heap_size_grows_monotonically_without_deallocation() {
        let pool = new_pool();
        let l = layout(32, 8);

        assert_eq!(pool.heap_size(), 0);

        let mut prev = 0;
        for _ in 0..5000 {
            pool.allocate(l).unwrap();
            let now = pool.heap_size();
            assert!(now >= prev);
            prev = now;
        }

        // A long run with no deallocation must be fed by new platform
        // memory, well beyond the initial chunk.
        let after_first = 2 * 32 * 20;
        assert!(prev > after_first);
    }

    #[test]
    fn same_class_resize_returns_the_same_block() {
        let pool = new_pool();

        let old = layout(33, 8);
        let p = pool.allocate(old).unwrap();
        unsafe { p.cast::<u8>().write_bytes(0x5A, 33) };

        // 33 and 40 round to the same class, so no bytes move.
        let grown = unsafe { pool.grow(p.cast(), old, layout(40, 8)) }.unwrap();
        assert_eq!(grown.cast::<u8>(), p.cast::<u8>());

        let shrunk = unsafe { pool.shrink(grown.cast(), layout(40, 8), layout(36, 4)) }.unwrap();
        assert_eq!(shrunk.cast::<u8>(), p.cast::<u8>());

        let slice = unsafe { &shrunk.as_ref()[..33] };
        assert!(slice.iter().all(|b| *b == 0x5A));

        unsafe { pool.deallocate(shrunk.cast(), layout(36, 4)) };
    }

    #[test]
    fn cross_class_resize_copies_contents() {
        let pool = new_pool();

        let old = layout(16, 8);
        let p = pool.allocate(old).unwrap();
        unsafe { p.cast::<u8>().write_bytes(0xAB, 16) };

        let new = layout(64, 8);
        let q = unsafe { pool.grow(p.cast(), old, new) }.unwrap();
        assert_ne!(q.cast::<u8>(), p.cast::<u8>());
        let slice = unsafe { &q.as_ref()[..16] };
        assert!(slice.iter().all(|b| *b == 0xAB));

        // And across the pool's ceiling in both directions.
        let big = layout(300, 8);
        let r = unsafe { pool.grow(q.cast(), new, big) }.unwrap();
        let slice = unsafe { &r.as_ref()[..16] };
        assert!(slice.iter().all(|b| *b == 0xAB));

        let s = unsafe { pool.shrink(r.cast(), big, old) }.unwrap();
        let slice = unsafe { &s.as_ref()[..16] };
        assert!(slice.iter().all(|b| *b == 0xAB));

        unsafe { pool.deallocate(s.cast(), old) };
    }

    #[test]
    fn allocation_fails_when_the_platform_is_dead() {
        let platform = InstrumentedAlloc::new();
        platform.fail_now.store(true, Ordering::SeqCst);
        let pool = instrumented_pool(&platform);

        // Empty arena, empty free lists, dead platform, no handler: the only
        // possible outcome is the out-of-memory error, at every size.
        assert!(pool.allocate(layout(16, 8)).is_err());
        assert!(pool.allocate(layout(128, 8)).is_err());
        assert!(pool.allocate(layout(4096, 8)).is_err());
    }

    static HANDLER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn release_memory_handler() {
        HANDLER_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn oom_handler_is_invoked_until_the_platform_recovers() {
        let platform = InstrumentedAlloc::new();
        let pool = instrumented_pool(&platform);

        let previous = pool.set_oom_handler(Some(release_memory_handler));
        assert_eq!(previous, None);

        platform.fail_next.store(3, Ordering::SeqCst);
        let p = pool.allocate(layout(16, 8)).unwrap();
        assert!(HANDLER_CALLS.load(Ordering::SeqCst) >= 1);
        unsafe { pool.deallocate(p.cast(), layout(16, 8)) };

        let previous = pool.set_oom_handler(None);
        assert_eq!(previous, Some(release_memory_handler as pool_alloc::OomHandler));
    }

    #[test]
    fn cannibalization_keeps_a_starved_class_alive() {
        let platform = InstrumentedAlloc::new();
        let pool = instrumented_pool(&platform);

        // Stock the largest class's free list.
        let l128 = layout(128, 8);
        let big: Vec<_> = (0..3).map(|_| pool.allocate(l128).unwrap()).collect();
        for b in big {
            unsafe { pool.deallocate(b.cast(), l128) };
        }

        // Drain the arena through the smallest class.
        let l8 = layout(8, 8);
        let mut small = Vec::new();
        for _ in 0..320 {
            small.push(pool.allocate(l8).unwrap());
        }

        // Kill the platform. The pool can no longer grow, but it can still
        // sacrifice pooled 128-byte blocks to feed the 8-byte class.
        platform.fail_now.store(true, Ordering::SeqCst);

        let mut served = 0;
        for _ in 0..100_000 {
            match pool.allocate(l8) {
                Ok(p) => {
                    small.push(p);
                    served += 1;
                }
                Err(_) => break,
            }
        }

        // Every 128-byte block yields sixteen 8-byte blocks.
        assert!(served >= 320, "served only {served} blocks after platform death");

        // And every block handed out, before and after the recovery, is
        // distinct memory.
        let mut seen = HashSet::new();
        for p in &small {
            assert!(seen.insert(p.cast::<u8>().as_ptr() as usize));
        }
    }

    #[test]
    fn concurrent_use_never_duplicates_a_block() {
        let pool = PoolAllocator::new(
            RetryAllocator::new(PlatformAlloc, SpinLockingMechanism::new()),
            SpinLockingMechanism::new(),
        );
        let l = layout(16, 8);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut held = Vec::new();
                    for i in 0..1000 {
                        let p = pool.allocate(l).unwrap();
                        unsafe { p.cast::<u8>().write_bytes(0xCD, p.len()) };
                        held.push(p);
                        if i % 3 == 0 {
                            let q = held.swap_remove(held.len() / 2);
                            unsafe { pool.deallocate(q.cast(), l) };
                        }
                    }
                    for p in held {
                        unsafe { pool.deallocate(p.cast(), l) };
                    }
                });
            }
        });

        // A duplicate or cycle in the free list would now hand the same
        // address out twice.
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let p = pool.allocate(l).unwrap();
            assert!(seen.insert(p.cast::<u8>().as_ptr() as usize));
        }
    }
}
