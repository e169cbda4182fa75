//! # mapalloc
//!
//! A general-purpose allocator built directly on anonymous page mappings.
//!
//! Layers, leaves first:
//! - [`region`]: maps and unmaps raw pages, each starting with a
//!   [`RegionHeader`](region::RegionHeader) that records its mapped size and item size.
//! - [`large`]: one mapped region per request above the largest size class.
//! - [`arena`]: a page of equal-size slots for one size class.
//! - [`heap`]: routes requests to a class chain or the large path.
//! - [`global`]: the process-wide heap behind `allocate`/`release`.

pub mod arena;
pub mod config;
pub mod failure;
pub mod global;
pub mod heap;
pub mod large;
pub mod region;

pub use global::{
    MapAlloc, allocate, allocate_aligned, allocate_zeroed, global_heap, outstanding_region_count,
    reallocate, release, stats, trim, usable_size,
};
pub use heap::Heap;
pub use mapalloc_core::size_class::{ALIGNMENT, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, PAGE_SIZE};
pub use mapalloc_core::{AllocError, HeapConfig, HeapStats, ReclaimPolicy};
