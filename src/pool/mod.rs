//! Size-classed slab pool handing out opaque handles
//!
//! This is a thread-cooperative slab memory allocator in the family of
//! [Mimalloc](https://www.microsoft.com/en-us/research/uploads/prod/2019/06/mimalloc-tr-v1.pdf)
//! style sharded allocators: every thread owns private LIFO reuse lists
//! and a private bump-allocation block per size class, and only the
//! overflow traffic (spilled freelists, fresh slab indices) touches shared
//! atomics.
//!
//! Objects are identified by [Handle]s rather than machine addresses. A
//! handle names `(slab, chunk)`; the slab indexes a shared block table,
//! the chunk a fixed-stride slot inside that block. Conversion from
//! handle to address is two loads and a multiply, and an object never
//! moves for its lifetime, so handles can live in hash tables and graph
//! structures that outlast any particular borrow of the pool.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
    mem,
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
    sync::Arc,
};

use tracing::Level;

use crate::{
    access::{AccessTracker, NopTracker},
    backing::{default_backing, BackingAlloc},
    handle::{Handle, HandleRepr},
    loom_testing::*,
    util::align,
};

/// Largest allocatable object in bytes; the block header carries the item
/// size in 24 bits
pub const MAX_ITEM_SIZE: usize = (1 << 24) - 1;

/// The `total` header field carries the chunk count in 20 bits
const TOTAL_FIELD_MAX: usize = (1 << 20) - 1;

/// Sizes below this index a flat freelist directory; larger sizes go
/// through a lazily-installed second level keyed by `size / 4096`
const SIZE_DIR_SPLIT: usize = 4096;

/// A thread keeps at most this many chunks on its hot reuse list; the
/// cold list spills to the shared directory at the same bound
const SPILL_THRESHOLD: u32 = 4096;

/// Slab indices are claimed from the shared counter this many at a time
const SLAB_CLAIM: u32 = 16;

/// First block of a size class is at most this many bytes
const INITIAL_BLOCK_SIZE: usize = 4096;

/// Blocks never grow beyond this many bytes
const BLOCK_CEILING: usize = 1 << 24;

/// Chunk stride for an item size: padded to the handle width so the free
/// chain link always fits and stays aligned
#[inline]
fn alloc_size<R: HandleRepr>(itemsize: usize) -> usize {
    align(itemsize, size_of::<R::Raw>())
}

/// Bytes between a block's base and its first chunk
#[inline]
fn header_overhead<R: HandleRepr>() -> usize {
    align(size_of::<BlockHeader>(), size_of::<R::Raw>())
}

/// Exact byte count a block was requested with at creation
///
/// A sentinel block (`total == 0`) degenerates to the raw header floor.
#[inline]
fn block_bytes<R: HandleRepr>(itemsize: u32, total: u32) -> usize {
    header_overhead::<R>() + total as usize * alloc_size::<R>(itemsize as usize)
}

/// Header at the base of every block
///
/// `itemsize` and `total` are immutable after creation. `allocated` is the
/// bump high-water mark; it is only advanced by the thread that owns the
/// block as its active slab, but read cross-thread by stats, hence atomic.
#[repr(C)]
struct BlockHeader {
    itemsize: u32,
    total: u32,
    allocated: AtomicU32,
}

/// A reclaimed-chunk stack
///
/// `head` is the newest free handle; each free chunk stores the handle of
/// the previous head in its first handle-width bytes.
struct FreeList<R: HandleRepr> {
    head: Handle<R>,
    count: u32,
}

impl<R: HandleRepr> Default for FreeList<R> {
    fn default() -> Self {
        Self {
            head: Handle::null(),
            count: 0,
        }
    }
}

impl<R: HandleRepr> Clone for FreeList<R> {
    fn clone(&self) -> Self {
        Self {
            head: self.head,
            count: self.count,
        }
    }
}

/// A spilled [FreeList] living on the shared directory; nodes chain via
/// `next` under the Treiber CAS protocol
struct FreeNode<R: HandleRepr> {
    list: FreeList<R>,
    next: *mut FreeNode<R>,
}

/// Second level of the shared freelist directory (4096 slots, one per
/// `size % 4096` residue)
struct FreeLevel<R: HandleRepr> {
    slots: Box<[AtomicPtr<FreeNode<R>>]>,
}

/// Per-thread state of one size class
struct SizeClass<R: HandleRepr> {
    /// Hot list; allocations pop from here
    touse: FreeList<R>,
    /// Cold list; absorbs frees once `touse` is at the bound, spills to
    /// the shared directory when it fills
    tofree: FreeList<R>,
    /// Slab index where bump allocation continues; 0 = none
    active: u32,
    /// Adaptive byte size for the next block; 0 = not yet grown
    blocksize: usize,
}

impl<R: HandleRepr> Default for SizeClass<R> {
    fn default() -> Self {
        Self {
            touse: FreeList::default(),
            tofree: FreeList::default(),
            active: 0,
            blocksize: 0,
        }
    }
}

impl<R: HandleRepr> Clone for SizeClass<R> {
    fn clone(&self) -> Self {
        Self {
            touse: self.touse.clone(),
            tofree: self.tofree.clone(),
            active: self.active,
            blocksize: self.blocksize,
        }
    }
}

/// State shared by every [Pool] clone
///
/// Dropped when the last clone goes away; the finaliser walks the spilled
/// freelist chains and returns every published block to the backing
/// allocator with the byte count it was created with.
pub(crate) struct SharedState<R: HandleRepr> {
    backing: Arc<dyn BackingAlloc>,
    tracker: Box<dyn AccessTracker>,
    /// Block table; entry `slab` is published exactly once, with release
    /// ordering, by the thread that claimed the index
    blocks: Box<[AtomicPtr<u8>]>,
    /// Next unclaimed slab index; starts at 1, slab 0 is the null slab
    used_blocks: AtomicU32,
    free_small: Box<[AtomicPtr<FreeNode<R>>]>,
    free_large: Box<[AtomicPtr<FreeLevel<R>>]>,
}

pub(crate) fn atomic_ptr_row<T>(n: usize) -> Box<[AtomicPtr<T>]> {
    (0..n)
        .map(|_| AtomicPtr::new(ptr::null_mut()))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

impl<R: HandleRepr> SharedState<R> {
    fn new(backing: Arc<dyn BackingAlloc>, tracker: Box<dyn AccessTracker>) -> Self {
        Self {
            backing,
            tracker,
            blocks: atomic_ptr_row(1usize << R::SLAB_BITS),
            used_blocks: AtomicU32::new(1),
            free_small: atomic_ptr_row(SIZE_DIR_SPLIT),
            free_large: atomic_ptr_row(SIZE_DIR_SPLIT),
        }
    }

    #[inline]
    fn block_base(&self, slab: u32) -> *mut u8 {
        // order: pairs with the release store in new_block, so a handle
        // published to us by another thread finds initialized header and
        // payload memory
        self.blocks[slab as usize].load(Ordering::Acquire)
    }

    /// Block header for a slab; fatal on a slab with no published block
    #[inline]
    fn header(&self, slab: u32) -> &BlockHeader {
        let base = self.block_base(slab);
        assert!(!base.is_null(), "handle names unpublished slab {}", slab);
        unsafe { &*(base as *const BlockHeader) }
    }

    /// Chunk count of the block at `slab` (slave pools mirror this)
    pub(crate) fn block_total(&self, slab: u32) -> u32 {
        self.header(slab).total
    }

    pub(crate) fn backing(&self) -> &Arc<dyn BackingAlloc> {
        &self.backing
    }

    /// Machine address of the chunk a handle names
    #[inline]
    fn chunk_addr(&self, h: Handle<R>) -> *mut u8 {
        let base = self.block_base(h.slab());
        assert!(!base.is_null(), "handle names unpublished slab {}", h.slab());
        let hdr = unsafe { &*(base as *const BlockHeader) };
        assert!(hdr.total != 0, "handle names a sentinel block");
        let stride = alloc_size::<R>(hdr.itemsize as usize);
        unsafe { base.add(header_overhead::<R>() + h.chunk() as usize * stride) }
    }

    /// Shared freelist slot for a size, installing the second directory
    /// level on demand
    fn slot(&self, size: usize) -> &AtomicPtr<FreeNode<R>> {
        if size < SIZE_DIR_SPLIT {
            return &self.free_small[size];
        }
        let hi = size / SIZE_DIR_SPLIT;
        let mut lvl = self.free_large[hi].load(Ordering::Acquire);
        if lvl.is_null() {
            lvl = self.install_level(hi);
        }
        unsafe { &(*lvl).slots[size % SIZE_DIR_SPLIT] }
    }

    /// Read-only variant of [slot](Self::slot); never installs
    fn try_slot(&self, size: usize) -> Option<&AtomicPtr<FreeNode<R>>> {
        if size < SIZE_DIR_SPLIT {
            return Some(&self.free_small[size]);
        }
        let lvl = self.free_large[size / SIZE_DIR_SPLIT].load(Ordering::Acquire);
        if lvl.is_null() {
            return None;
        }
        Some(unsafe { &(*lvl).slots[size % SIZE_DIR_SPLIT] })
    }

    fn install_level(&self, hi: usize) -> *mut FreeLevel<R> {
        let fresh = Box::into_raw(Box::new(FreeLevel {
            slots: atomic_ptr_row(SIZE_DIR_SPLIT),
        }));
        // order: release publishes the empty slot row; the acquire side is
        // the load in slot()/try_slot()
        match self.free_large[hi].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // lost the install race; discard the speculative table
                unsafe { drop(Box::from_raw(fresh)) };
                winner
            }
        }
    }

    /// Prepend a spilled list to the shared directory for `size`
    fn push_spilled(&self, size: usize, list: FreeList<R>) {
        push_node(self.slot(size), list);
    }

    /// Detach the head node for `size`, if any
    fn pop_spilled(&self, size: usize) -> Option<FreeList<R>> {
        pop_node(self.try_slot(size)?)
    }

    /// Chunks currently parked on the shared directory for `size`
    ///
    /// Advisory: exact only while no other thread is pushing or popping.
    fn spilled_count(&self, size: usize) -> usize {
        let Some(slot) = self.try_slot(size) else {
            return 0;
        };
        let mut n = 0;
        let mut node = slot.load(Ordering::Acquire);
        while !node.is_null() {
            unsafe {
                n += (*node).list.count as usize;
                node = (*node).next;
            }
        }
        n
    }
}

/// Prepend one node onto a shared-freelist slot
fn push_node<R: HandleRepr>(slot: &AtomicPtr<FreeNode<R>>, list: FreeList<R>) {
    let node = Box::into_raw(Box::new(FreeNode {
        list,
        next: ptr::null_mut(),
    }));
    let mut head = slot.load(Ordering::Relaxed);
    loop {
        unsafe { (*node).next = head };
        // order: release so the node contents (and the chunk chain it
        // references) happen-before any thread that pops it
        match slot.compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(x) => {
                head = x;
                spin_hint();
            }
        }
    }
}

/// Detach the head node of a shared-freelist slot, if any
fn pop_node<R: HandleRepr>(slot: &AtomicPtr<FreeNode<R>>) -> Option<FreeList<R>> {
    // order: acquire so we see the pushed node's contents
    let mut head = slot.load(Ordering::Acquire);
    loop {
        if head.is_null() {
            return None;
        }
        let next = unsafe { (*head).next };
        match slot.compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => {
                let node = unsafe { Box::from_raw(head) };
                return Some(node.list);
            }
            Err(x) => {
                head = x;
                spin_hint();
            }
        }
    }
}

impl<R: HandleRepr> Drop for SharedState<R> {
    fn drop(&mut self) {
        // last reference: no other thread can touch the directory or the
        // block table any more, relaxed loads suffice
        fn drain<R: HandleRepr>(slot: &AtomicPtr<FreeNode<R>>) {
            let mut node = slot.load(Ordering::Relaxed);
            while !node.is_null() {
                let boxed = unsafe { Box::from_raw(node) };
                node = boxed.next;
            }
        }

        for slot in self.free_small.iter() {
            drain(slot);
        }
        for entry in self.free_large.iter() {
            let lvl = entry.load(Ordering::Relaxed);
            if !lvl.is_null() {
                unsafe {
                    for slot in (*lvl).slots.iter() {
                        drain(slot);
                    }
                    drop(Box::from_raw(lvl));
                }
            }
        }

        let cap = 1usize << R::SLAB_BITS;
        let used = (self.used_blocks.load(Ordering::Relaxed) as usize).min(cap);
        for slab in 1..used {
            let base = self.blocks[slab].load(Ordering::Relaxed);
            if base.is_null() {
                continue;
            }
            let (itemsize, total) = unsafe {
                let hdr = &*(base as *const BlockHeader);
                (hdr.itemsize, hdr.total)
            };
            let bytes = block_bytes::<R>(itemsize, total);
            unsafe {
                // safety: base came from this backing with exactly this
                // byte count, and nothing can reach the block after us
                self.backing.release(NonNull::new_unchecked(base), bytes);
            }
        }
    }
}

/// Per-class figures reported by [Pool::stats]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassStats {
    pub itemsize: usize,
    /// Chunks carved for this class (sum of block `total`s)
    pub held: usize,
    /// Chunks currently live (bumped minus parked on freelists)
    pub used: usize,
    pub held_bytes: usize,
    pub used_bytes: usize,
}

/// Snapshot of pool occupancy, one entry per size class in use
///
/// Exact when the pool is quiescent; advisory while other threads run.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub classes: Vec<ClassStats>,
}

impl PoolStats {
    pub fn class(&self, itemsize: usize) -> Option<&ClassStats> {
        self.classes.iter().find(|c| c.itemsize == itemsize)
    }
}

/// A thread's view of the slab pool
///
/// Cheap to clone: a clone shares the block table, slab counter and
/// shared freelist directory, but starts with fresh thread-local caches.
/// Hand each thread its own clone; a single `Pool` value must not be
/// shared mutably.
///
/// Allocation and free are `&mut self` (they touch the local caches);
/// [dereference](Pool::dereference), [size](Pool::size) and
/// [stats](Pool::stats) are `&self` and safe to call concurrently with
/// other threads' allocations.
pub struct Pool<R: HandleRepr = crate::handle::CompactRepr> {
    shared: Arc<SharedState<R>>,
    /// Size classes below [SIZE_DIR_SPLIT], indexed directly by size
    small: Vec<SizeClass<R>>,
    /// Second-level size classes, indexed by `size / 4096` then
    /// `size % 4096`; rows materialise on first use
    large: Vec<Option<Box<[SizeClass<R>]>>>,
    /// Slab indices claimed from the shared counter but not yet used
    empty_blocks: Vec<u32>,
}

impl<R: HandleRepr> Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("@shared", &Arc::as_ptr(&self.shared))
            .field(
                "used_blocks",
                &self.shared.used_blocks.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl<R: HandleRepr> Default for Pool<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: HandleRepr> Clone for Pool<R> {
    /// A new thread-local view onto the same shared state
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            small: vec![SizeClass::default(); SIZE_DIR_SPLIT],
            large: (0..SIZE_DIR_SPLIT).map(|_| None).collect(),
            empty_blocks: Vec::new(),
        }
    }
}

impl<R: HandleRepr> Pool<R> {
    pub fn new() -> Self {
        Self::with_parts(default_backing(), Box::new(NopTracker))
    }

    pub fn with_backing(backing: Arc<dyn BackingAlloc>) -> Self {
        Self::with_parts(backing, Box::new(NopTracker))
    }

    pub fn with_parts(backing: Arc<dyn BackingAlloc>, tracker: Box<dyn AccessTracker>) -> Self {
        Self {
            shared: Arc::new(SharedState::new(backing, tracker)),
            small: vec![SizeClass::default(); SIZE_DIR_SPLIT],
            large: (0..SIZE_DIR_SPLIT).map(|_| None).collect(),
            empty_blocks: Vec::new(),
        }
    }

    pub(crate) fn shared_state(&self) -> &Arc<SharedState<R>> {
        &self.shared
    }

    #[inline]
    fn class_mut(&mut self, size: usize) -> &mut SizeClass<R> {
        if size < SIZE_DIR_SPLIT {
            return &mut self.small[size];
        }
        let row = &mut self.large[size / SIZE_DIR_SPLIT];
        if row.is_none() {
            *row = Some(vec![SizeClass::default(); SIZE_DIR_SPLIT].into_boxed_slice());
        }
        match row {
            Some(row) => &mut row[size % SIZE_DIR_SPLIT],
            None => unreachable!(),
        }
    }

    fn class_ref(&self, size: usize) -> Option<&SizeClass<R>> {
        if size < SIZE_DIR_SPLIT {
            return self.small.get(size);
        }
        self.large
            .get(size / SIZE_DIR_SPLIT)?
            .as_ref()
            .map(|row| &row[size % SIZE_DIR_SPLIT])
    }

    /// Allocate `size` bytes; the returned handle points at zero-filled,
    /// exclusively-owned memory and carries a zero tag
    ///
    /// `size` must be in `1..=MAX_ITEM_SIZE`.
    pub fn allocate(&mut self, size: usize) -> Handle<R> {
        assert!(
            size > 0 && size <= MAX_ITEM_SIZE,
            "allocation size {} out of range",
            size
        );
        let trace_span = tracing::span!(Level::TRACE, "pool::allocate", size);
        let _span_enter = trace_span.enter();

        // promote the cold list wholesale once the hot list runs dry
        {
            let sc = self.class_mut(size);
            if sc.touse.head.is_null() && !sc.tofree.head.is_null() {
                mem::swap(&mut sc.touse, &mut sc.tofree);
            }
        }

        if let Some(h) = self.pop_reuse(size) {
            tracing::event!(Level::TRACE, slab = h.slab(), chunk = h.chunk(), path = "reuse");
            return h;
        }
        if let Some(h) = self.bump(size) {
            tracing::event!(Level::TRACE, slab = h.slab(), chunk = h.chunk(), path = "bump");
            return h;
        }
        if self.steal(size) {
            if let Some(h) = self.pop_reuse(size) {
                tracing::event!(Level::TRACE, slab = h.slab(), chunk = h.chunk(), path = "steal");
                return h;
            }
        }
        self.new_block(size);
        let h = self.bump(size).unwrap();
        tracing::event!(Level::TRACE, slab = h.slab(), chunk = h.chunk(), path = "fresh");
        h
    }

    /// Pop the head of the private hot list, zeroing the chunk
    fn pop_reuse(&mut self, size: usize) -> Option<Handle<R>> {
        let shared = Arc::clone(&self.shared);
        let sc = self.class_mut(size);
        let head = sc.touse.head;
        if head.is_null() {
            return None;
        }
        let p = shared.chunk_addr(head);
        // the first handle-width bytes of a free chunk hold the next link
        let next = unsafe { (p as *const R::Raw).read() };
        sc.touse.head = Handle::from_raw(next);
        sc.touse.count -= 1;
        unsafe { ptr::write_bytes(p, 0, alloc_size::<R>(size)) };
        shared.tracker.on_alloc(head.slab(), head.chunk(), p, size);
        Some(head)
    }

    /// Take the next never-used chunk of the active block, if any
    ///
    /// No zeroing here: backing regions arrive zero-filled and these
    /// chunks have never been live.
    fn bump(&mut self, size: usize) -> Option<Handle<R>> {
        let shared = Arc::clone(&self.shared);
        let sc = self.class_mut(size);
        let slab = sc.active;
        if slab == 0 {
            return None;
        }
        let hdr = shared.header(slab);
        // the active block is only ever advanced by its owning thread
        let a = hdr.allocated.load(Ordering::Relaxed);
        if a >= hdr.total {
            return None;
        }
        hdr.allocated.store(a + 1, Ordering::Relaxed);
        let h = Handle::new(slab, a);
        shared.tracker.on_alloc(slab, a, shared.chunk_addr(h), size);
        Some(h)
    }

    /// Graft one spilled list from the shared directory into `touse`
    fn steal(&mut self, size: usize) -> bool {
        let Some(list) = self.shared.pop_spilled(size) else {
            return false;
        };
        tracing::event!(Level::TRACE, size, count = list.count, "stole shared freelist");
        let sc = self.class_mut(size);
        debug_assert!(sc.touse.head.is_null());
        sc.touse = list;
        true
    }

    /// Create a block for `size`, publish it, and make it active
    fn new_block(&mut self, size: usize) {
        let slab = match self.empty_blocks.pop() {
            Some(s) => s,
            None => {
                // order: the counter only hands out ownership of fresh
                // indices; block contents synchronise via the table entry
                let base = self.shared.used_blocks.fetch_add(SLAB_CLAIM, Ordering::Relaxed);
                assert!(
                    (base as u64 + SLAB_CLAIM as u64) <= (1u64 << R::SLAB_BITS),
                    "out of slab indices"
                );
                for s in (base + 1..base + SLAB_CLAIM).rev() {
                    self.empty_blocks.push(s);
                }
                base
            }
        };

        let stride = alloc_size::<R>(size);
        let overhead = header_overhead::<R>();

        let mut blocksize = {
            let sc = self.class_mut(size);
            if sc.blocksize == 0 {
                INITIAL_BLOCK_SIZE
            } else {
                sc.blocksize
            }
        };
        while blocksize < overhead + stride {
            blocksize *= 2;
        }

        let total = if size == 0 {
            // sentinel block: fixed header-only footprint, no chunks
            0
        } else {
            ((blocksize - overhead) / stride)
                .min(TOTAL_FIELD_MAX)
                .min(1usize << R::CHUNK_BITS)
        } as u32;

        let bytes = overhead + total as usize * stride;
        let base = match self.shared.backing.alloc(bytes) {
            Ok(p) => p.as_ptr(),
            Err(e) => panic!("backing allocator failed: {}", e),
        };
        unsafe {
            ptr::write(
                base as *mut BlockHeader,
                BlockHeader {
                    itemsize: size as u32,
                    total,
                    allocated: AtomicU32::new(0),
                },
            );
        }
        self.shared.tracker.on_block(slab, base, bytes);
        // order: pairs with the acquire loads in block_base; after this
        // store any thread holding a handle into this slab sees a
        // fully-initialized block
        self.shared.blocks[slab as usize].store(base, Ordering::Release);

        tracing::event!(Level::TRACE, slab, itemsize = size, total, bytes, "new block");

        let sc = self.class_mut(size);
        sc.active = slab;
        sc.blocksize = (blocksize * 4).min(BLOCK_CEILING);
    }

    /// Return a chunk to the pool. Freeing the null handle is a no-op.
    ///
    /// The handle must be live and must not be dereferenced afterwards;
    /// the pool reuses the first word of the payload for freelist linkage.
    pub fn free(&mut self, handle: Handle<R>) {
        if handle.is_null() {
            return;
        }
        let trace_span = tracing::span!(
            Level::TRACE,
            "pool::free",
            slab = handle.slab(),
            chunk = handle.chunk()
        );
        let _span_enter = trace_span.enter();

        let shared = Arc::clone(&self.shared);
        let hdr = shared.header(handle.slab());
        assert!(hdr.total != 0, "free of a sentinel-block handle");
        let size = hdr.itemsize as usize;
        let p = shared.chunk_addr(handle);
        shared.tracker.on_free(handle.slab(), handle.chunk(), p, size);

        // freelist links carry no tag; reallocation hands out tag zero
        let handle = handle.without_tag();
        let sc = self.class_mut(size);
        let dest = if sc.touse.count < SPILL_THRESHOLD {
            &mut sc.touse
        } else {
            &mut sc.tofree
        };
        unsafe { (p as *mut R::Raw).write(dest.head.raw()) };
        dest.head = handle;
        dest.count += 1;

        if sc.tofree.count >= SPILL_THRESHOLD {
            let list = mem::take(&mut sc.tofree);
            tracing::event!(Level::TRACE, size, count = list.count, "spilled freelist");
            shared.push_spilled(size, list);
        }
    }

    /// Machine address of the chunk `handle` names
    ///
    /// O(1), lock-free, stable for the chunk's lifetime. The pointer is
    /// valid until the handle is freed or the pool is dropped; aliasing
    /// of the pointed-to bytes is the caller's business.
    #[inline]
    pub fn dereference(&self, handle: Handle<R>) -> *mut u8 {
        assert!(!handle.is_null(), "dereference of the null handle");
        self.shared.chunk_addr(handle)
    }

    /// The byte size `handle` was allocated with
    pub fn size(&self, handle: Handle<R>) -> usize {
        assert!(!handle.is_null(), "size of the null handle");
        let hdr = self.shared.header(handle.slab());
        assert!(hdr.total != 0, "size of a sentinel-block handle");
        hdr.itemsize as usize
    }

    /// Item sizes that have at least one block
    pub fn size_classes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self.per_block_figures().into_keys().collect();
        sizes.sort_unstable();
        sizes
    }

    /// Occupancy snapshot; see [PoolStats]
    pub fn stats(&self) -> PoolStats {
        let classes = self
            .per_block_figures()
            .into_iter()
            .map(|(size, (held, allocated))| {
                let parked = self.shared.spilled_count(size) + self.local_free_count(size);
                let used = allocated.saturating_sub(parked);
                let stride = alloc_size::<R>(size);
                ClassStats {
                    itemsize: size,
                    held,
                    used,
                    held_bytes: held * stride,
                    used_bytes: used * stride,
                }
            })
            .collect();
        PoolStats { classes }
    }

    /// size -> (held, allocated) over all published blocks
    fn per_block_figures(&self) -> BTreeMap<usize, (usize, usize)> {
        let mut per: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
        let cap = 1usize << R::SLAB_BITS;
        let used = (self.shared.used_blocks.load(Ordering::Acquire) as usize).min(cap);
        for slab in 1..used {
            let base = self.shared.blocks[slab].load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            let hdr = unsafe { &*(base as *const BlockHeader) };
            if hdr.total == 0 {
                continue;
            }
            let e = per.entry(hdr.itemsize as usize).or_insert((0, 0));
            e.0 += hdr.total as usize;
            e.1 += hdr.allocated.load(Ordering::Relaxed) as usize;
        }
        per
    }

    fn local_free_count(&self, size: usize) -> usize {
        match self.class_ref(size) {
            Some(sc) => (sc.touse.count + sc.tofree.count) as usize,
            None => 0,
        }
    }

    /// Hand one class's local lists back to the shared directory
    fn flush_class(&mut self, size: usize) {
        let taken = {
            let sc = if size < SIZE_DIR_SPLIT {
                match self.small.get_mut(size) {
                    Some(sc) => sc,
                    None => return,
                }
            } else {
                match self.large[size / SIZE_DIR_SPLIT].as_mut() {
                    Some(row) => &mut row[size % SIZE_DIR_SPLIT],
                    None => return,
                }
            };
            (mem::take(&mut sc.touse), mem::take(&mut sc.tofree))
        };
        if taken.0.count > 0 {
            self.shared.push_spilled(size, taken.0);
        }
        if taken.1.count > 0 {
            self.shared.push_spilled(size, taken.1);
        }
    }
}

impl<R: HandleRepr> Drop for Pool<R> {
    /// Thread-local teardown: every cached list goes back to the shared
    /// directory so sibling clones can keep using the chunks
    fn drop(&mut self) {
        for size in 0..SIZE_DIR_SPLIT {
            if self.small[size].touse.count > 0 || self.small[size].tofree.count > 0 {
                self.flush_class(size);
            }
        }
        for hi in 1..SIZE_DIR_SPLIT {
            if self.large[hi].is_some() {
                for lo in 0..SIZE_DIR_SPLIT {
                    self.flush_class(hi * SIZE_DIR_SPLIT + lo);
                }
            }
        }
    }
}
