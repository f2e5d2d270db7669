//! Valgrind-style accessibility bookkeeping
//!
//! A side-channel over the allocator boundary: the pool reports every
//! block creation, allocation and free to an [AccessTracker], which can
//! maintain shadow accessibility state (no-access payloads, fresh
//! allocation marks, "deleted" tombstones). The default tracker does
//! nothing; all pool invariants hold with any tracker installed.

/// Observer of pool accessibility events
///
/// * a new block's payload is to be considered no-access;
/// * an allocation makes `size` bytes at `addr` a fresh allocation,
///   replacing any mark a previous tenant of the chunk left behind;
/// * a free makes the chunk no-access again and flips its identifier to
///   the deleted variant.
pub trait AccessTracker: Send + Sync + 'static {
    fn on_block(&self, slab: u32, base: *const u8, bytes: usize) {
        let _ = (slab, base, bytes);
    }

    fn on_alloc(&self, slab: u32, chunk: u32, addr: *const u8, size: usize) {
        let _ = (slab, chunk, addr, size);
    }

    fn on_free(&self, slab: u32, chunk: u32, addr: *const u8, size: usize) {
        let _ = (slab, chunk, addr, size);
    }
}

/// Human-readable identifier for a live chunk
pub fn identifier(slab: u32, chunk: u32, addr: *const u8) -> String {
    format!("chunk {}:{} @ {:?}", slab, chunk, addr)
}

/// Identifier variant for a freed chunk
pub fn deleted_identifier(slab: u32, chunk: u32, addr: *const u8) -> String {
    format!("deleted chunk {}:{} @ {:?}", slab, chunk, addr)
}

/// Tracker that ignores everything; the default
pub struct NopTracker;
impl AccessTracker for NopTracker {}
