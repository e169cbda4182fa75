//! Size-class arenas.
//!
//! An arena is one mapped page: a 64-byte [`Arena`] header followed by
//! `capacity` equal-size slots. Slots that were never handed out are tracked
//! by a bump index; freed slots form a LIFO free list threaded through their
//! first word. Both allocate and free are O(1).
//!
//! With poisoning enabled, a freed slot's bytes after the free-list link are
//! filled with [`POISON_BYTE`] and checked before the slot is reused, which
//! turns a write-after-free into an immediate abort instead of silent heap
//! corruption.
//!
//! Arenas are not synchronized; the heap's per-class lock covers every
//! method here. The mutable bookkeeping sits in `Cell`s so that methods only
//! ever borrow the header shared: other threads read the embedded
//! [`RegionHeader`] without the lock while a release is in progress.

use std::cell::Cell;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use mapalloc_core::size_class::{ALIGNMENT, PAGE_SIZE, slots_per_page};
use mapalloc_core::{AllocError, Result};

use crate::failure;
use crate::region::{PageMapper, RegionHeader};

/// Byte pattern written into freed slots when poisoning is on.
pub const POISON_BYTE: u8 = 0xDF;

/// Free-list link stored in the first word of a freed slot.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

const LINK_SIZE: usize = size_of::<FreeSlot>();

/// Header of an arena page.
///
/// Starts with the shared [`RegionHeader`] so the release path can read the
/// item size before knowing it holds an arena.
#[repr(C, align(64))]
pub struct Arena {
    region: RegionHeader,
    /// First slot; derived from the mapping so slot pointers carry its provenance.
    slots: *mut u8,
    free_head: Cell<*mut FreeSlot>,
    bump: Cell<u32>,
    allocated: Cell<u32>,
    capacity: u32,
    poison: bool,
    prev: Cell<*mut Arena>,
    next: Cell<*mut Arena>,
}

/// Bytes occupied by an [`Arena`] header; slots start right after it.
pub const ARENA_HEADER_SIZE: usize = size_of::<Arena>();

/// Largest alignment an arena slot can guarantee.
///
/// A slot of size `s` is aligned to `min(s, ARENA_SLOT_ALIGN)`, since the
/// page, the header size and every class size are powers of two.
pub const ARENA_SLOT_ALIGN: usize = ARENA_HEADER_SIZE;

const _: () = assert!(ARENA_HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(ARENA_HEADER_SIZE.is_power_of_two());
const _: () = assert!(LINK_SIZE <= ALIGNMENT);

impl Arena {
    /// Map a fresh page and set it up as an arena of `item_size` slots.
    ///
    /// `item_size` must be a multiple of 8 that leaves room for at least one
    /// slot after the header.
    pub fn create(mapper: &PageMapper, item_size: usize, poison: bool) -> Result<NonNull<Arena>> {
        let capacity = slots_per_page(item_size, ARENA_HEADER_SIZE);
        if item_size % ALIGNMENT != 0 || capacity == 0 {
            return Err(AllocError::InvalidRequest {
                size: item_size,
                align: ALIGNMENT,
            });
        }

        let region = mapper.map(PAGE_SIZE, item_size)?;
        let arena = region.cast::<Arena>().as_ptr();
        // SAFETY: the page is freshly mapped, writable and exclusively ours;
        // the region header was already written by map().
        unsafe {
            let slots = arena.cast::<u8>().add(ARENA_HEADER_SIZE);
            (&raw mut (*arena).slots).write(slots);
            (&raw mut (*arena).free_head).write(Cell::new(ptr::null_mut()));
            (&raw mut (*arena).bump).write(Cell::new(0));
            (&raw mut (*arena).allocated).write(Cell::new(0));
            (&raw mut (*arena).capacity).write(capacity as u32);
            (&raw mut (*arena).poison).write(poison);
            (&raw mut (*arena).prev).write(Cell::new(ptr::null_mut()));
            (&raw mut (*arena).next).write(Cell::new(ptr::null_mut()));
            Ok(NonNull::new_unchecked(arena))
        }
    }

    #[must_use]
    pub fn item_size(&self) -> usize {
        self.region.item_size()
    }

    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.region.mapped_size()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Slots currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.get() as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated.get() == 0
    }

    /// Whether every slot is handed out.
    #[must_use]
    pub fn full(&self) -> bool {
        self.allocated.get() == self.capacity
    }

    #[must_use]
    pub fn poisons_freed_slots(&self) -> bool {
        self.poison
    }

    /// The slot the next [`Arena::allocate`] will return, or null when full.
    #[must_use]
    pub fn next(&self) -> *mut u8 {
        let head = self.free_head.get();
        let bump = self.bump.get();
        if !head.is_null() {
            head.cast()
        } else if bump < self.capacity {
            self.slot_at(bump as usize)
        } else {
            ptr::null_mut()
        }
    }

    fn slot_at(&self, index: usize) -> *mut u8 {
        self.slots.wrapping_add(index * self.item_size())
    }

    /// Index of the slot at `ptr`.
    ///
    /// Fails with `InvalidPointer` unless `ptr` is the start of a slot that
    /// this arena has handed out at least once.
    pub fn slot_index(&self, ptr: *const u8) -> Result<usize> {
        let addr = ptr as usize;
        let invalid = AllocError::InvalidPointer { addr };
        let offset = addr.checked_sub(self.slots as usize).ok_or(invalid)?;
        let item_size = self.item_size();
        if offset % item_size != 0 || offset / item_size >= self.bump.get() as usize {
            return Err(invalid);
        }
        Ok(offset / item_size)
    }

    /// Hand out one slot, or `None` if the arena is full.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        if self.full() {
            return None;
        }

        let slot = match NonNull::new(self.free_head.get()) {
            Some(head) => {
                // SAFETY: free-list entries are freed slots of this arena.
                let next = unsafe { head.as_ref().next };
                if self.poison {
                    let slot = head.cast::<u8>();
                    // SAFETY: slot belongs to this arena and is not handed out.
                    failure::or_die(unsafe { self.verify_poison(slot) });
                    if !next.is_null() {
                        failure::or_die(self.slot_index(next.cast::<u8>()));
                    }
                }
                self.free_head.set(next);
                head.cast::<u8>()
            }
            None => {
                let bump = self.bump.get();
                let slot = self.slot_at(bump as usize);
                self.bump.set(bump + 1);
                // SAFETY: slot_at offsets a non-null mapping pointer.
                unsafe { NonNull::new_unchecked(slot) }
            }
        };

        self.allocated.set(self.allocated.get() + 1);
        Some(slot)
    }

    /// Return `slot` to the arena. Returns true when the arena becomes empty.
    ///
    /// Aborts if `slot` is not a slot of this arena or if nothing is
    /// allocated. Freeing the same slot twice without an allocation in
    /// between is not detected here.
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by [`Arena::allocate`] on this arena and
    /// must not be used by the caller afterwards.
    pub unsafe fn free(&self, slot: NonNull<u8>) -> bool {
        failure::or_die(self.slot_index(slot.as_ptr()));
        let allocated = self.allocated.get();
        if allocated == 0 {
            failure::die(&AllocError::AccountingCorruption {
                what: "arena allocated count would drop below zero",
            });
        }

        if self.poison {
            // SAFETY: the slot spans item_size bytes inside this page.
            unsafe {
                ptr::write_bytes(
                    slot.as_ptr().add(LINK_SIZE),
                    POISON_BYTE,
                    self.item_size() - LINK_SIZE,
                );
            }
        }

        let node = slot.cast::<FreeSlot>().as_ptr();
        // SAFETY: slots are 8-byte aligned and at least LINK_SIZE bytes.
        unsafe {
            node.write(FreeSlot {
                next: self.free_head.get(),
            });
        }
        self.free_head.set(node);
        self.allocated.set(allocated - 1);
        allocated == 1
    }

    /// Check that a freed slot still carries the poison pattern.
    ///
    /// Returns `CorruptedSlot` with the offset of the first modified byte.
    ///
    /// # Safety
    ///
    /// `slot` must be a slot of this arena that is currently on the free list.
    pub unsafe fn verify_poison(&self, slot: NonNull<u8>) -> Result<()> {
        self.slot_index(slot.as_ptr())?;
        let len = self.item_size() - LINK_SIZE;
        // SAFETY: the slot spans item_size bytes inside this page.
        let payload = unsafe { std::slice::from_raw_parts(slot.as_ptr().add(LINK_SIZE), len) };
        match payload.iter().position(|&b| b != POISON_BYTE) {
            Some(pos) => Err(AllocError::CorruptedSlot {
                addr: slot.as_ptr() as usize,
                offset: LINK_SIZE + pos,
            }),
            None => Ok(()),
        }
    }
}

/// Intrusive doubly-linked list of arenas, threaded through their headers.
///
/// Holds the arenas of one size class that filled up and now only take frees.
pub(crate) struct ArenaList {
    head: *mut Arena,
    len: usize,
}

impl ArenaList {
    pub(crate) const EMPTY: Self = Self {
        head: ptr::null_mut(),
        len: 0,
    };

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// # Safety
    ///
    /// `arena` must be live and not linked into any list.
    pub(crate) unsafe fn push_front(&mut self, arena: NonNull<Arena>) {
        let node = arena.as_ptr();
        // SAFETY: node and the current head are live arenas guarded by the
        // caller's class lock.
        unsafe {
            (*node).prev.set(ptr::null_mut());
            (*node).next.set(self.head);
            if let Some(head) = self.head.as_ref() {
                head.prev.set(node);
            }
        }
        self.head = node;
        self.len += 1;
    }

    /// # Safety
    ///
    /// `arena` must be live and linked into this list.
    pub(crate) unsafe fn unlink(&mut self, arena: NonNull<Arena>) {
        let node = arena.as_ptr();
        // SAFETY: node and its neighbours are live arenas in this list.
        unsafe {
            let prev = (*node).prev.get();
            let next = (*node).next.get();
            match prev.as_ref() {
                Some(prev) => prev.next.set(next),
                None => self.head = next,
            }
            if let Some(next) = next.as_ref() {
                next.prev.set(prev);
            }
            (*node).prev.set(ptr::null_mut());
            (*node).next.set(ptr::null_mut());
        }
        self.len -= 1;
    }

    /// Detach and return the first arena.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Arena>> {
        let head = NonNull::new(self.head)?;
        // SAFETY: head is linked into this list.
        unsafe { self.unlink(head) };
        Some(head)
    }
}
