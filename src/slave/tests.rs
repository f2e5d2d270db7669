use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    sync::{Arc, Mutex},
};

use crate::{
    backing::{BackingAlloc, BackingError, HeapBacking},
    handle::CompactRepr,
    pool::Pool,
};

use super::*;

struct CountingBacking {
    inner: HeapBacking,
    allocs: AtomicUsize,
    outstanding: Mutex<HashMap<usize, usize>>,
}

impl CountingBacking {
    fn new() -> Self {
        Self {
            inner: HeapBacking,
            allocs: AtomicUsize::new(0),
            outstanding: Mutex::new(HashMap::new()),
        }
    }
}

impl BackingAlloc for CountingBacking {
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        let p = self.inner.alloc(bytes)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        self.outstanding
            .lock()
            .unwrap()
            .insert(p.as_ptr() as usize, bytes);
        Ok(p)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        let recorded = self
            .outstanding
            .lock()
            .unwrap()
            .remove(&(ptr.as_ptr() as usize));
        assert_eq!(recorded, Some(bytes));
        self.inner.release(ptr, bytes);
    }
}

/// Scenario: 100 master chunks of size 8, a 4-byte shadow on each; both
/// views read back what was written through them
#[cfg(not(loom))]
#[test]
fn materialise_roundtrip() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);

    let mut hs = Vec::new();
    for i in 0..100u32 {
        let h = pool.allocate(8);
        unsafe { (pool.dereference(h) as *mut u32).write(i) };
        slave.materialise(h, 4, true);
        unsafe { (slave.dereference(h) as *mut u32).write(i) };
        hs.push(h);
    }

    for (i, h) in hs.iter().enumerate() {
        assert_eq!(unsafe { (pool.dereference(*h) as *const u32).read() }, i as u32);
        assert_eq!(unsafe { (slave.dereference(*h) as *const u32).read() }, i as u32);
    }

    for h in hs {
        pool.free(h);
    }
}

#[cfg(not(loom))]
#[test]
fn shadow_does_not_alias_master_payload() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);

    let h = pool.allocate(16);
    slave.materialise(h, 16, true);

    unsafe {
        std::ptr::write_bytes(pool.dereference(h), 0x11, 16);
        std::ptr::write_bytes(slave.dereference(h), 0x22, 16);
        for i in 0..16 {
            assert_eq!(*pool.dereference(h).add(i), 0x11);
            assert_eq!(*slave.dereference(h).add(i), 0x22);
        }
    }
    pool.free(h);
}

#[cfg(not(loom))]
#[test]
fn byte_sized_shadow_state_packs_densely() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);

    let a = pool.allocate(32);
    let b = pool.allocate(32);
    assert_eq!(a.slab(), b.slab());
    assert_eq!(b.chunk(), a.chunk() + 1);

    slave.materialise(a, 1, true);
    assert_eq!(slave.size(a), 1);
    // adjacent chunks sit one byte apart, no handle-width padding
    assert_eq!(
        slave.dereference(b) as usize,
        slave.dereference(a) as usize + 1
    );

    pool.free(b);
    pool.free(a);
}

#[cfg(not(loom))]
#[test]
fn materialise_is_idempotent_but_honours_clear() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);

    let h = pool.allocate(8);
    slave.materialise(h, 8, true);
    unsafe { (slave.dereference(h) as *mut u64).write(u64::MAX) };

    // no clear: block creation is a no-op and the slot survives
    slave.materialise(h, 8, false);
    assert_eq!(unsafe { (slave.dereference(h) as *const u64).read() }, u64::MAX);

    // a sibling handle in the same slab gets its own untouched slot
    let h2 = pool.allocate(8);
    assert_eq!(h2.slab(), h.slab());
    slave.materialise(h2, 8, false);
    assert_eq!(unsafe { (slave.dereference(h2) as *const u64).read() }, 0);

    // clear zeroes exactly the addressed slot
    slave.materialise(h, 8, true);
    assert_eq!(unsafe { (slave.dereference(h) as *const u64).read() }, 0);

    pool.free(h2);
    pool.free(h);
}

#[cfg(not(loom))]
#[test]
fn clones_share_shadow_blocks() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);
    let slave2 = slave.clone();

    let h = pool.allocate(8);
    slave.materialise(h, 4, true);
    unsafe { (slave.dereference(h) as *mut u32).write(77) };
    assert_eq!(unsafe { (slave2.dereference(h) as *const u32).read() }, 77);
    assert_eq!(slave2.size(h), 4);

    pool.free(h);
}

#[cfg(not(loom))]
#[test]
fn shadow_outlives_master_free() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);

    let h = pool.allocate(8);
    slave.materialise(h, 4, true);
    unsafe { (slave.dereference(h) as *mut u32).write(0xabcd) };

    pool.free(h);
    // the shadow slot stays live and addressable until the slave goes away
    assert_eq!(unsafe { (slave.dereference(h) as *const u32).read() }, 0xabcd);
}

#[cfg(not(loom))]
#[test]
fn concurrent_materialise_agrees_on_one_block() {
    let mut pool = Pool::<CompactRepr>::new();
    let h = pool.allocate(8);
    let slave = SlavePool::new(&pool);

    let mut joins = Vec::new();
    for _ in 0..4 {
        let slave = slave.clone();
        joins.push(std::thread::spawn(move || {
            slave.materialise(h, 16, false);
            slave.dereference(h) as usize
        }));
    }
    let addrs: Vec<usize> = joins.into_iter().map(|j| j.join().unwrap()).collect();
    assert!(addrs.windows(2).all(|w| w[0] == w[1]));

    pool.free(h);
}

#[cfg(not(loom))]
#[test]
fn slave_blocks_are_released_on_teardown() {
    let backing = Arc::new(CountingBacking::new());
    {
        let mut pool = Pool::<CompactRepr>::with_backing(backing.clone());
        let slave = SlavePool::new(&pool);

        let mut hs = Vec::new();
        for _ in 0..50 {
            let h = pool.allocate(8);
            slave.materialise(h, 12, true);
            hs.push(h);
        }
        for h in hs {
            pool.free(h);
        }
        // slave drops first, then the master's shared state
        drop(slave);
        drop(pool);
    }
    assert!(backing.allocs.load(Ordering::SeqCst) >= 2);
    assert_eq!(backing.outstanding.lock().unwrap().len(), 0);
}

#[cfg(not(loom))]
#[test]
#[should_panic]
fn dereference_before_materialise_is_fatal() {
    let mut pool = Pool::<CompactRepr>::new();
    let slave = SlavePool::new(&pool);
    let h = pool.allocate(8);
    let _ = slave.dereference(h);
}
