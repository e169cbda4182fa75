//! The process-wide heap and its raw-pointer surface.
//!
//! These functions follow the C allocation conventions: failures come back
//! as null pointers (after a `tracing` warning), null is always accepted by
//! [`release`], and corruption aborts the process.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

use mapalloc_core::HeapStats;

use crate::failure;
use crate::heap::Heap;

static GLOBAL_HEAP: Heap = Heap::new();

/// The heap behind the free functions in this module.
#[must_use]
pub fn global_heap() -> &'static Heap {
    &GLOBAL_HEAP
}

/// Allocate `size` bytes aligned to 8. Returns null if the OS refuses memory.
#[must_use]
pub fn allocate(size: usize) -> *mut u8 {
    failure::surface(GLOBAL_HEAP.allocate(size))
}

/// Allocate `size` bytes aligned to `align`, a power of two below the page size.
///
/// Returns null for unsupported alignments and on exhaustion.
#[must_use]
pub fn allocate_aligned(size: usize, align: usize) -> *mut u8 {
    failure::surface(GLOBAL_HEAP.allocate_aligned(size, align))
}

/// Allocate `count * size` zeroed bytes. Returns null if the product overflows.
#[must_use]
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
    failure::surface(GLOBAL_HEAP.allocate_zeroed(count, size))
}

/// Release a pointer from this module's allocating functions. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this module and not
/// released since.
pub unsafe fn release(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        // SAFETY: forwarded caller contract.
        unsafe { GLOBAL_HEAP.release(ptr) };
    }
}

/// Resize an allocation. Null behaves like [`allocate`].
///
/// On failure the result is null and `ptr` remains valid.
///
/// # Safety
///
/// `ptr` must be null or live and returned by this module.
#[must_use]
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
    // SAFETY: forwarded caller contract.
    failure::surface(unsafe { GLOBAL_HEAP.reallocate(ptr, new_size) })
}

/// Bytes usable through `ptr`; zero for null.
///
/// # Safety
///
/// `ptr` must be null or live and returned by this module.
#[must_use]
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
        // SAFETY: forwarded caller contract.
        Some(ptr) => unsafe { GLOBAL_HEAP.usable_size(ptr) },
        None => 0,
    }
}

/// Regions currently mapped by the process-wide heap.
#[must_use]
pub fn outstanding_region_count() -> usize {
    GLOBAL_HEAP.outstanding_regions()
}

/// Unmap empty arenas retained by the process-wide heap.
pub fn trim() -> usize {
    GLOBAL_HEAP.trim()
}

#[must_use]
pub fn stats() -> HeapStats {
    GLOBAL_HEAP.stats()
}

/// Installs the process-wide heap as Rust's global allocator.
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: mapalloc::MapAlloc = mapalloc::MapAlloc;
/// ```
///
/// Allocations made through `Box`, `Vec` and friends then share one heap and
/// one region count with [`allocate`] and [`release`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MapAlloc;

// SAFETY: forwards to the process-wide heap, which upholds the contract.
unsafe impl GlobalAlloc for MapAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { GLOBAL_HEAP.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { GLOBAL_HEAP.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { GLOBAL_HEAP.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { GLOBAL_HEAP.realloc(ptr, layout, new_size) }
    }
}
