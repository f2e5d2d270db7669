//! Backing page allocator
//!
//! The pool carves all of its blocks out of regions obtained here. The
//! contract is deliberately tiny: regions come back zero-filled and live
//! until released with the exact byte count they were requested with.
//! Everything else (how the pages are obtained, alignment beyond the
//! page-preferred hint) is the implementation's business.

use std::{alloc, ptr::NonNull};

use thiserror::Error;

/// Failure obtaining a region from the host
///
/// The pool treats this as unrecoverable; it surfaces only in the panic
/// message of the block-creation path.
#[derive(Debug, Error)]
pub enum BackingError {
    #[error("mmap of {bytes} bytes failed (errno {errno})")]
    MapFailed { bytes: usize, errno: i32 },
    #[error("heap allocation of {bytes} bytes failed")]
    HeapFailed { bytes: usize },
}

/// Source of zero-filled memory regions
///
/// Implementations must return regions of at least `bytes` bytes, filled
/// with zeroes, usable until passed back to [release](BackingAlloc::release)
/// with the same byte count. Page alignment is preferred but not required;
/// regions must be aligned at least as strictly as a `u64`.
pub trait BackingAlloc: Send + Sync + 'static {
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, BackingError>;

    /// Release a region previously returned by [alloc](BackingAlloc::alloc)
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `alloc` on this same instance, `bytes`
    /// must equal the originally requested size, and the region must not
    /// be accessed afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Anonymous-mmap backing; the default on unix
///
/// mmap hands back fresh zero pages and page-aligned addresses, which is
/// exactly the contract, and lets the bump-allocation path skip zeroing.
#[cfg(unix)]
pub struct MmapBacking;

#[cfg(unix)]
impl BackingAlloc for MmapBacking {
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(BackingError::MapFailed {
                bytes,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        NonNull::new(p as *mut u8).ok_or(BackingError::MapFailed { bytes, errno: 0 })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, bytes);
    }
}

/// Page size used for [HeapBacking] layout alignment
const HEAP_PAGE: usize = 4096;

/// Heap backing via `alloc_zeroed`; portable fallback and test double base
pub struct HeapBacking;

impl HeapBacking {
    fn layout(bytes: usize) -> alloc::Layout {
        // round the size up so Layout::from_size_align cannot fail
        let sz = crate::util::align(bytes.max(1), HEAP_PAGE);
        match alloc::Layout::from_size_align(sz, HEAP_PAGE) {
            Ok(x) => x,
            Err(_) => unreachable!(),
        }
    }
}

impl BackingAlloc for HeapBacking {
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, BackingError> {
        let p = unsafe { alloc::alloc_zeroed(Self::layout(bytes)) };
        NonNull::new(p).ok_or(BackingError::HeapFailed { bytes })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        alloc::dealloc(ptr.as_ptr(), Self::layout(bytes));
    }
}

/// The backing used by `Pool::new`
#[cfg(unix)]
pub(crate) fn default_backing() -> std::sync::Arc<dyn BackingAlloc> {
    std::sync::Arc::new(MmapBacking)
}
#[cfg(not(unix))]
pub(crate) fn default_backing() -> std::sync::Arc<dyn BackingAlloc> {
    std::sync::Arc::new(HeapBacking)
}
