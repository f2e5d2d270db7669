//! Thread-cooperative slab allocator with opaque handles
//!
//! `handlepool` hands out small, size-classified chunks of memory
//! identified by compact [Handle]s instead of raw addresses. It is built
//! for workloads that allocate millions of short objects and want
//! cache-friendly LIFO reuse, stable identity, and cheap handle-to-address
//! conversion: model checkers, graph explorers, interning tables.
//!
//! The two moving parts are the master [Pool] (size-classed slab
//! allocator with per-thread freelists over a lock-free shared overflow
//! directory) and the [SlavePool] (lazily-materialised shadow storage
//! keyed by the master's handles). Handle layout is a compile-time knob;
//! see [handle::HandleRepr].

pub mod access;
pub mod backing;
pub mod handle;
pub(crate) mod loom_testing;
pub mod pool;
pub mod slave;
pub mod util;

pub use access::{AccessTracker, NopTracker};
pub use backing::{BackingAlloc, BackingError, HeapBacking};
pub use handle::{CompactRepr, Handle, HandleRepr, WideRepr};
pub use pool::{ClassStats, Pool, PoolStats, MAX_ITEM_SIZE};
pub use slave::SlavePool;

#[cfg(unix)]
pub use backing::MmapBacking;
