//! Size-class routing.
//!
//! A [`Heap`] owns a [`PageMapper`] and one arena chain per size class.
//! Requests up to 1024 bytes go to the chain for the smallest class that
//! holds them; anything larger becomes its own mapped region.
//!
//! Each chain has at most one *active* arena, the only one that takes new
//! allocations. When it fills, a fresh arena becomes active and the full one
//! moves to the chain's retired list, where it only receives frees. A retired
//! arena is unmapped as soon as its last slot comes back. What happens to an
//! active arena that empties depends on the [`ReclaimPolicy`].
//!
//! # Lock discipline
//!
//! Each size class has one `parking_lot::Mutex<ClassChain>`. Holding it grants
//! exclusive access to the chain and to the header of every arena in it,
//! for both the allocate and the release path. The large-block path takes no
//! lock. The outstanding-region counter is atomic and read without locks.
//! Region headers are immutable while mapped, so `release` reads the item
//! size through [`region::kind_of`] before it knows which lock to take.
//! Nothing here logs or unmaps while a class lock is held.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use mapalloc_core::size_class::{
    ALIGNMENT, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, bin_index, bin_size, exact_bin, size_classes,
};
use mapalloc_core::{AllocError, HeapConfig, HeapStats, ReclaimPolicy, Result};

use crate::arena::{ARENA_HEADER_SIZE, ARENA_SLOT_ALIGN, Arena, ArenaList};
use crate::region::{self, PageMapper, RegionKind};
use crate::{config, failure, large};

/// Arenas of one size class.
struct ClassChain {
    active: Option<NonNull<Arena>>,
    retired: ArenaList,
    live_slots: usize,
}

// SAFETY: the arena pointers are only dereferenced while the Mutex that owns
// this chain is held.
unsafe impl Send for ClassChain {}

impl ClassChain {
    const EMPTY: Self = Self {
        active: None,
        retired: ArenaList::EMPTY,
        live_slots: 0,
    };

    fn arenas(&self) -> usize {
        usize::from(self.active.is_some()) + self.retired.len()
    }

    fn allocate_from_active(&mut self) -> Option<NonNull<u8>> {
        let active = self.active?;
        // SAFETY: the active arena is live and the class lock is held.
        let slot = unsafe { active.as_ref() }.allocate()?;
        self.live_slots += 1;
        Some(slot)
    }

    /// Make `fresh` the allocation target; a full predecessor is retired.
    ///
    /// # Safety
    ///
    /// `fresh` must be a live arena of this class not linked anywhere.
    unsafe fn install_active(&mut self, fresh: NonNull<Arena>) {
        if let Some(full) = self.active.replace(fresh) {
            // SAFETY: the previous active arena is live and unlinked.
            unsafe { self.retired.push_front(full) };
        }
    }

    /// Detach an arena whose last slot was just freed, if the policy lets it go.
    ///
    /// Returns the arena the caller must unmap once the lock is released.
    ///
    /// # Safety
    ///
    /// `arena` must be a live, empty arena of this chain.
    unsafe fn detach_empty(
        &mut self,
        arena: NonNull<Arena>,
        policy: ReclaimPolicy,
    ) -> Option<NonNull<Arena>> {
        if self.active == Some(arena) {
            if policy.retains_active() {
                return None;
            }
            self.active = None;
        } else {
            // SAFETY: a non-active arena of this chain is on the retired list.
            unsafe { self.retired.unlink(arena) };
        }
        Some(arena)
    }

    /// Detach the active arena if it holds no live slots.
    fn take_empty_active(&mut self) -> Option<NonNull<Arena>> {
        let active = self.active?;
        // SAFETY: the active arena is live and the class lock is held.
        if unsafe { active.as_ref() }.is_empty() {
            self.active = None;
            Some(active)
        } else {
            None
        }
    }
}

/// Config byte meaning "ask the process configuration".
const CONFIG_FROM_PROCESS: u8 = 0;

/// A complete allocator instance.
///
/// The process-wide instance lives in [`crate::global`]; tests and embedders
/// can build private ones. Dropping a heap unmaps every arena it still owns,
/// which invalidates all small pointers it handed out. Large blocks belong to
/// their callers and are not touched.
pub struct Heap {
    mapper: PageMapper,
    classes: [Mutex<ClassChain>; NUM_SIZE_CLASSES],
    config: AtomicU8,
}

impl Heap {
    /// A heap configured from the process environment on first use.
    #[must_use]
    pub const fn new() -> Self {
        Self::build(CONFIG_FROM_PROCESS)
    }

    /// A heap with an explicit configuration.
    #[must_use]
    pub const fn with_config(config: HeapConfig) -> Self {
        Self::build(config.to_bits())
    }

    const fn build(config_bits: u8) -> Self {
        Self {
            mapper: PageMapper::new(),
            classes: [const { parking_lot::const_mutex(ClassChain::EMPTY) }; NUM_SIZE_CLASSES],
            config: AtomicU8::new(config_bits),
        }
    }

    #[must_use]
    pub fn config(&self) -> HeapConfig {
        match HeapConfig::from_bits(self.config.load(Ordering::Relaxed)) {
            Some(config) => config,
            None => config::process_config(),
        }
    }

    /// Regions this heap has mapped and not yet unmapped.
    #[must_use]
    pub fn outstanding_regions(&self) -> usize {
        self.mapper.outstanding_regions()
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// Zero-byte requests get a slot from the smallest class.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let index = bin_index(size);
        if index >= NUM_SIZE_CLASSES {
            return large::allocate(&self.mapper, size);
        }
        self.allocate_small(index)
    }

    fn allocate_small(&self, index: usize) -> Result<NonNull<u8>> {
        let config = self.config();
        let item_size = bin_size(index);
        let (slot, arenas) = {
            let mut chain = self.classes[index].lock();
            if let Some(slot) = chain.allocate_from_active() {
                return Ok(slot);
            }

            let fresh = Arena::create(&self.mapper, item_size, config.poison_freed)?;
            // SAFETY: fresh is live and not yet linked.
            unsafe { chain.install_active(fresh) };
            let slot = chain
                .allocate_from_active()
                .ok_or(AllocError::AccountingCorruption {
                    what: "fresh arena has no free slot",
                })?;
            (slot, chain.arenas())
        };

        failure::trace_quietly(|| tracing::debug!(item_size, arenas, "mapped new arena"));
        Ok(slot)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two below the page size).
    ///
    /// Alignments up to 64 bytes are served from arenas; larger ones map a
    /// dedicated region.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidRequest { size, align });
        }
        if align <= ALIGNMENT {
            return self.allocate(size);
        }
        let padded = size.max(align);
        if align <= ARENA_SLOT_ALIGN && padded <= MAX_SMALL_SIZE {
            return self.allocate_small(bin_index(padded));
        }
        large::allocate_aligned(&self.mapper, size, align)
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
        let total = count.checked_mul(size).ok_or(AllocError::InvalidRequest {
            size: usize::MAX,
            align: ALIGNMENT,
        })?;
        let ptr = self.allocate(total)?;
        // SAFETY: ptr is live and spans at least `total` bytes.
        unsafe { zero_recycled(ptr, total) };
        Ok(ptr)
    }

    /// Release a pointer obtained from this heap.
    ///
    /// Aborts if the pointer's page does not hold a recognizable region or the
    /// pointer is not a live slot of its arena.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap and not released since.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees the region is live; headers never change
        // while mapped.
        match unsafe { region::kind_of(ptr.as_ptr()) } {
            // SAFETY: a live large block is released exactly once.
            RegionKind::Large => unsafe { self.mapper.unmap(ptr.as_ptr()) },
            RegionKind::Arena { item_size } => {
                // SAFETY: forwarded caller contract.
                unsafe { self.release_slot(ptr, item_size) }
            }
        }
    }

    unsafe fn release_slot(&self, ptr: NonNull<u8>, item_size: usize) {
        let addr = ptr.as_ptr() as usize;
        let Some(index) = exact_bin(item_size) else {
            failure::die(&AllocError::InvalidPointer { addr });
        };
        let Some(arena) = NonNull::new(region::header_ptr(ptr.as_ptr()).cast::<Arena>()) else {
            failure::die(&AllocError::InvalidPointer { addr });
        };
        let policy = self.config().reclaim;

        let doomed = {
            let mut chain = self.classes[index].lock();
            // SAFETY: the arena is live (it holds ptr) and the class lock is held.
            let emptied = unsafe { arena.as_ref().free(ptr) };
            chain.live_slots -= 1;
            if emptied {
                // SAFETY: arena is an empty member of this chain.
                unsafe { chain.detach_empty(arena, policy) }
            } else {
                None
            }
        };

        if let Some(arena) = doomed {
            // SAFETY: detached under the lock, so no other thread can reach it.
            unsafe { self.mapper.unmap(arena.as_ptr().cast::<u8>()) };
        }
    }

    /// Bytes usable through `ptr`: the slot size, or the rest of a large region.
    ///
    /// # Safety
    ///
    /// `ptr` must be live and owned by this heap.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        // SAFETY: caller guarantees ptr is live.
        match unsafe { region::kind_of(ptr.as_ptr()) } {
            // SAFETY: as above.
            RegionKind::Large => unsafe { large::usable_size(ptr) },
            RegionKind::Arena { item_size } => item_size,
        }
    }

    /// Resize an allocation, moving it only when it no longer fits its class.
    ///
    /// A null `ptr` behaves like [`Heap::allocate`]. On failure the existing
    /// allocation is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or live and owned by this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { self.reallocate_aligned(ptr, new_size, ALIGNMENT) }
    }

    /// [`Heap::reallocate`] for allocations made with [`Heap::allocate_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or live, owned by this heap and aligned to `align`.
    pub unsafe fn reallocate_aligned(
        &self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
    ) -> Result<NonNull<u8>> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate_aligned(new_size, align);
        };
        // SAFETY: caller guarantees old is live.
        let old_usable = unsafe { self.usable_size(old) };
        // SAFETY: as above.
        let fits = match unsafe { region::kind_of(old.as_ptr()) } {
            RegionKind::Large => {
                new_size > MAX_SMALL_SIZE && new_size <= old_usable && new_size > old_usable / 2
            }
            RegionKind::Arena { item_size } => {
                bin_index(new_size.max(align)) == bin_index(item_size)
            }
        };
        if fits {
            return Ok(old);
        }

        let fresh = self.allocate_aligned(new_size, align)?;
        // SAFETY: both spans are live, disjoint and at least this long.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_usable.min(new_size));
            self.release(old);
        }
        Ok(fresh)
    }

    /// Unmap every empty arena kept resident by [`ReclaimPolicy::RetainActive`].
    ///
    /// Returns the number of regions released.
    pub fn trim(&self) -> usize {
        let mut released = 0;
        for class in &self.classes {
            let doomed = class.lock().take_empty_active();
            if let Some(arena) = doomed {
                // SAFETY: detached under the lock and empty.
                unsafe { self.mapper.unmap(arena.as_ptr().cast::<u8>()) };
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(released, "trimmed empty arenas");
        }
        released
    }

    /// Snapshot of per-class occupancy and outstanding regions.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::empty();
        let table = size_classes(ARENA_HEADER_SIZE);
        for ((class, entry), shape) in self.classes.iter().zip(&mut stats.classes).zip(table) {
            let chain = class.lock();
            entry.size = shape.size;
            entry.slots_per_arena = shape.slots_per_page;
            entry.arenas = chain.arenas();
            entry.live_slots = chain.live_slots;
        }
        stats.outstanding_regions = self.mapper.outstanding_regions();
        stats
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for class in &mut self.classes {
            let chain = class.get_mut();
            let active = chain.active.take();
            let retired = std::iter::from_fn(|| chain.retired.pop_front());
            for arena in active.into_iter().chain(retired) {
                // SAFETY: the heap is going away; every arena it owns is unmapped once.
                unsafe { self.mapper.unmap(arena.as_ptr().cast::<u8>()) };
            }
            chain.live_slots = 0;
        }
    }
}

/// Zero `len` bytes at `ptr` unless it heads a freshly mapped large block.
///
/// # Safety
///
/// `ptr` must be live and span at least `len` bytes.
unsafe fn zero_recycled(ptr: NonNull<u8>, len: usize) {
    // SAFETY: caller guarantees ptr is live.
    if unsafe { region::kind_of(ptr.as_ptr()) } != RegionKind::Large {
        // SAFETY: as above.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
    }
}

// SAFETY: every pointer returned honours the layout's size and alignment
// (see `allocate_aligned`), and dealloc/realloc accept exactly those pointers.
unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        failure::surface(self.allocate_aligned(layout.size(), layout.align()))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let result = self.allocate_aligned(layout.size(), layout.align());
        if let Ok(ptr) = result {
            // SAFETY: ptr is live and spans layout.size() bytes.
            unsafe { zero_recycled(ptr, layout.size()) };
        }
        failure::surface(result)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: GlobalAlloc callers only pass pointers from alloc/realloc.
            unsafe { self.release(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: ptr was allocated by this heap with `layout`.
        failure::surface(unsafe { self.reallocate_aligned(ptr, new_size, layout.align()) })
    }
}
