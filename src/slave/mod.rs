//! Slave pool: shadow storage keyed by master handles
//!
//! A slave pool attaches extra per-object data to handles a master [Pool]
//! already handed out, without changing the handles. Shadow blocks mirror
//! the master's chunk geometry and materialise lazily: the first
//! [materialise](SlavePool::materialise) call for any handle in a slab
//! carves the whole mirror block, later calls only touch the addressed
//! slot. Slave payloads live until the slave pool is dropped, whether or
//! not the master handle is freed in the meantime.

use std::{
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::Ordering,
    sync::Arc,
};

use tracing::Level;

use crate::{
    handle::{CompactRepr, Handle, HandleRepr},
    loom_testing::*,
    pool::{atomic_ptr_row, Pool, SharedState, MAX_ITEM_SIZE},
    util::align,
};

/// Header at the base of every slave block; only the payload size, the
/// chunk count is the master's
#[repr(C)]
struct SlaveHeader {
    itemsize: u32,
}

#[inline]
fn slave_overhead<R: HandleRepr>() -> usize {
    align(size_of::<SlaveHeader>(), size_of::<R::Raw>())
}

/// Slot stride; byte-sized shadow state packs densely, everything else is
/// padded to the handle width like master chunks
#[inline]
fn slave_stride<R: HandleRepr>(itemsize: usize) -> usize {
    if itemsize == 1 {
        1
    } else {
        align(itemsize, size_of::<R::Raw>())
    }
}

#[inline]
fn slave_block_bytes<R: HandleRepr>(itemsize: u32, total: u32) -> usize {
    slave_overhead::<R>() + total as usize * slave_stride::<R>(itemsize as usize)
}

struct SlaveShared<R: HandleRepr> {
    /// Keeps the master's block table readable for geometry and teardown
    master: Arc<SharedState<R>>,
    /// Mirror block table; entry `slab` is CAS-installed exactly once
    blocks: Box<[AtomicPtr<u8>]>,
}

impl<R: HandleRepr> Drop for SlaveShared<R> {
    fn drop(&mut self) {
        // last reference; the master outlives us via the Arc above
        for slab in 1..self.blocks.len() {
            let base = self.blocks[slab].load(Ordering::Relaxed);
            if base.is_null() {
                continue;
            }
            let itemsize = unsafe { (*(base as *const SlaveHeader)).itemsize };
            let total = self.master.block_total(slab as u32);
            let bytes = slave_block_bytes::<R>(itemsize, total);
            unsafe {
                // safety: base came from the shared backing with exactly
                // this byte count
                self.master
                    .backing()
                    .release(NonNull::new_unchecked(base), bytes);
            }
        }
    }
}

/// Auxiliary pool reusing a master pool's handle space
///
/// Cheap to clone; clones share the shadow blocks. All operations take
/// `&self`: there are no thread-local caches, and concurrent
/// `materialise` calls race benignly on the install CAS.
pub struct SlavePool<R: HandleRepr = CompactRepr> {
    shared: Arc<SlaveShared<R>>,
}

impl<R: HandleRepr> Clone for SlavePool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R: HandleRepr> SlavePool<R> {
    /// Attach a slave pool to `master`'s handle space
    pub fn new(master: &Pool<R>) -> Self {
        Self {
            shared: Arc::new(SlaveShared {
                master: Arc::clone(master.shared_state()),
                blocks: atomic_ptr_row(1usize << R::SLAB_BITS),
            }),
        }
    }

    /// Ensure `handle`'s slab has a shadow block of `size`-byte slots and
    /// optionally zero the addressed slot
    ///
    /// Idempotent for block creation; every call with `clear` set zeroes
    /// the slot again. After the first call for a slab, the payload of
    /// every handle in that slab is live and addressable until the slave
    /// pool is dropped.
    pub fn materialise(&self, handle: Handle<R>, size: usize, clear: bool) {
        assert!(!handle.is_null(), "materialise of the null handle");
        assert!(
            size > 0 && size <= MAX_ITEM_SIZE,
            "slave payload size {} out of range",
            size
        );
        let slab = handle.slab();
        let mut base = self.shared.blocks[slab as usize].load(Ordering::Acquire);
        if base.is_null() {
            base = self.install_block(slab, size);
        }
        let itemsize = unsafe { (*(base as *const SlaveHeader)).itemsize } as usize;
        debug_assert_eq!(itemsize, size, "slave slab {} materialised at a different size", slab);
        if clear {
            let p = slot_addr::<R>(base, handle.chunk(), itemsize);
            unsafe { ptr::write_bytes(p, 0, itemsize) };
        }
    }

    /// Carve and publish the mirror block for `slab`
    fn install_block(&self, slab: u32, size: usize) -> *mut u8 {
        let total = self.shared.master.block_total(slab);
        let bytes = slave_block_bytes::<R>(size as u32, total);
        let base = match self.shared.master.backing().alloc(bytes) {
            Ok(p) => p.as_ptr(),
            Err(e) => panic!("backing allocator failed: {}", e),
        };
        unsafe {
            ptr::write(
                base as *mut SlaveHeader,
                SlaveHeader {
                    itemsize: size as u32,
                },
            );
        }
        // order: release publishes the header and zeroed payload; pairs
        // with the acquire loads in materialise/dereference
        match self.shared.blocks[slab as usize].compare_exchange(
            ptr::null_mut(),
            base,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::event!(
                    Level::TRACE,
                    slab,
                    itemsize = size,
                    total,
                    bytes,
                    "materialised slave block"
                );
                base
            }
            Err(winner) => {
                // lost the install race; discard the speculative block
                unsafe {
                    self.shared
                        .master
                        .backing()
                        .release(NonNull::new_unchecked(base), bytes);
                }
                winner
            }
        }
    }

    /// Machine address of `handle`'s shadow slot
    ///
    /// The slab must have been materialised. Same indexing math as the
    /// master, with the slave block's own item size.
    #[inline]
    pub fn dereference(&self, handle: Handle<R>) -> *mut u8 {
        assert!(!handle.is_null(), "dereference of the null handle");
        let base = self.shared.blocks[handle.slab() as usize].load(Ordering::Acquire);
        assert!(
            !base.is_null(),
            "slave dereference before materialise for slab {}",
            handle.slab()
        );
        let itemsize = unsafe { (*(base as *const SlaveHeader)).itemsize } as usize;
        slot_addr::<R>(base, handle.chunk(), itemsize)
    }

    /// Shadow payload size for `handle`'s slab
    pub fn size(&self, handle: Handle<R>) -> usize {
        assert!(!handle.is_null(), "size of the null handle");
        let base = self.shared.blocks[handle.slab() as usize].load(Ordering::Acquire);
        assert!(
            !base.is_null(),
            "slave size before materialise for slab {}",
            handle.slab()
        );
        unsafe { (*(base as *const SlaveHeader)).itemsize as usize }
    }
}

#[inline]
fn slot_addr<R: HandleRepr>(base: *mut u8, chunk: u32, itemsize: usize) -> *mut u8 {
    unsafe { base.add(slave_overhead::<R>() + chunk as usize * slave_stride::<R>(itemsize)) }
}

#[cfg(test)]
mod tests;
