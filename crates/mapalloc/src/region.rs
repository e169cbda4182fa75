//! Raw page mapping.
//!
//! Every region this crate maps starts with a [`RegionHeader`] written by
//! [`PageMapper::map`] and is only ever released by [`PageMapper::unmap`].
//! Regions start on a page boundary and every pointer the allocator hands
//! out lies within the first page of its region, so rounding any such pointer
//! down to a page boundary recovers the header.

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use mapalloc_core::size_class::{ALIGNMENT, PAGE_SIZE};
use mapalloc_core::{AllocError, Result};

use crate::failure;

/// Metadata at the start of every mapped region.
///
/// Both fields are written once by the mapping call and read-only until the
/// region is unmapped.
#[repr(C, align(8))]
#[derive(Debug)]
pub struct RegionHeader {
    mapped_size: usize,
    item_size: usize,
}

/// Bytes occupied by a [`RegionHeader`].
pub const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();

const _: () = assert!(REGION_HEADER_SIZE % ALIGNMENT == 0);

/// What a region holds, read from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// A single oversized allocation.
    Large,
    /// A size-class arena with slots of `item_size` bytes.
    Arena { item_size: usize },
}

impl RegionKind {
    const fn from_item_size(item_size: usize) -> Self {
        match item_size {
            0 => Self::Large,
            item_size => Self::Arena { item_size },
        }
    }
}

impl RegionHeader {
    /// Total bytes passed to `mmap` for this region.
    #[must_use]
    pub fn mapped_size(&self) -> usize {
        self.mapped_size
    }

    /// Slot size for arenas, zero for large blocks.
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    #[must_use]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_item_size(self.item_size)
    }

    /// Address of the region start (the header itself).
    #[must_use]
    pub fn base(&self) -> *mut u8 {
        ptr::from_ref(self).cast_mut().cast()
    }
}

/// Address of the region header owning `ptr`.
#[must_use]
pub fn header_addr(ptr: *const u8) -> usize {
    (ptr as usize) & !(PAGE_SIZE - 1)
}

/// Pointer to the header of the region owning `ptr`.
#[must_use]
pub fn header_ptr(ptr: *const u8) -> *mut RegionHeader {
    ptr.wrapping_sub((ptr as usize) - header_addr(ptr))
        .cast_mut()
        .cast()
}

/// Borrow the header of the region owning `ptr`.
///
/// # Safety
///
/// `ptr` must point into the first page of a region mapped by a
/// [`PageMapper`] and not yet unmapped.
#[must_use]
pub unsafe fn header_of<'a>(ptr: *const u8) -> &'a RegionHeader {
    // SAFETY: caller guarantees the region is mapped and its header initialized.
    unsafe { &*header_ptr(ptr) }
}

/// Kind of the region owning `ptr`, read without borrowing its header.
///
/// The release path runs without any lock, while the owning arena may be
/// updated under its class lock on another thread; only the `item_size`
/// word is touched here.
///
/// # Safety
///
/// Same contract as [`header_of`].
#[must_use]
pub unsafe fn kind_of(ptr: *const u8) -> RegionKind {
    // SAFETY: caller guarantees the region is mapped; the field is written
    // once by map() and never again while mapped.
    let item_size = unsafe { (&raw const (*header_ptr(ptr)).item_size).read() };
    RegionKind::from_item_size(item_size)
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Maps and unmaps regions and counts how many are outstanding.
///
/// Each heap owns one mapper; the counter is atomic so diagnostics can read
/// it without holding any heap lock.
#[derive(Debug)]
pub struct PageMapper {
    outstanding: AtomicUsize,
}

impl PageMapper {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Map `size` bytes of zeroed read/write memory and stamp its header.
    ///
    /// Arena callers pass `PAGE_SIZE`; large-block callers pass any size that
    /// fits the header. Returns `ResourceExhausted` if the OS refuses.
    pub fn map(&self, size: usize, item_size: usize) -> Result<NonNull<RegionHeader>> {
        if size < REGION_HEADER_SIZE {
            return Err(AllocError::InvalidRequest {
                size,
                align: PAGE_SIZE,
            });
        }

        // SAFETY: anonymous private mapping with no address hint.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(AllocError::ResourceExhausted {
                size,
                errno: last_errno(),
            });
        }

        let header = raw.cast::<RegionHeader>();
        // SAFETY: mmap returned a writable, page-aligned span of at least
        // REGION_HEADER_SIZE bytes.
        unsafe {
            header.write(RegionHeader {
                mapped_size: size,
                item_size,
            });
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        // SAFETY: MAP_FAILED was ruled out and mmap never returns null here.
        Ok(unsafe { NonNull::new_unchecked(header) })
    }

    /// Unmap the region owning `ptr`.
    ///
    /// Aborts if more regions are released than were mapped, or if the OS
    /// rejects the unmap.
    ///
    /// # Safety
    ///
    /// `ptr` must point into the first page of a live region mapped by this
    /// mapper. Nothing may touch the region afterwards.
    pub unsafe fn unmap(&self, ptr: *const u8) {
        let header = header_ptr(ptr);
        // SAFETY: caller guarantees the region is live.
        let mapped_size = unsafe { (*header).mapped_size };

        if self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            failure::die(&AllocError::AccountingCorruption {
                what: "outstanding region count would drop below zero",
            });
        }

        // SAFETY: the span is exactly what map() obtained from mmap.
        let rc = unsafe { libc::munmap(header.cast(), mapped_size) };
        if rc != 0 {
            failure::die(&AllocError::AccountingCorruption {
                what: "munmap rejected a tracked region",
            });
        }
    }

    /// Regions mapped and not yet unmapped.
    #[must_use]
    pub fn outstanding_regions(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl Default for PageMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_two_words() {
        assert_eq!(REGION_HEADER_SIZE, 2 * size_of::<usize>());
        assert_eq!(REGION_HEADER_SIZE % ALIGNMENT, 0);
    }

    #[test]
    fn map_stamps_header_and_counts() {
        let mapper = PageMapper::new();
        let header = mapper.map(PAGE_SIZE, 32).unwrap();
        assert_eq!(mapper.outstanding_regions(), 1);

        // SAFETY: freshly mapped region.
        let header_ref = unsafe { header.as_ref() };
        assert_eq!(header_ref.mapped_size(), PAGE_SIZE);
        assert_eq!(header_ref.item_size(), 32);
        assert_eq!(header_ref.kind(), RegionKind::Arena { item_size: 32 });
        assert_eq!(header_ref.base() as usize % PAGE_SIZE, 0);

        // SAFETY: region is live and owned by this mapper.
        unsafe { mapper.unmap(header.as_ptr().cast::<u8>()) };
        assert_eq!(mapper.outstanding_regions(), 0);
    }

    #[test]
    fn mapped_memory_is_zeroed_after_header() {
        let mapper = PageMapper::new();
        let header = mapper.map(PAGE_SIZE * 2, 0).unwrap();
        let base = header.as_ptr().cast::<u8>();
        for offset in REGION_HEADER_SIZE..PAGE_SIZE * 2 {
            // SAFETY: offset is inside the mapping.
            assert_eq!(unsafe { *base.add(offset) }, 0);
        }
        // SAFETY: region is live and owned by this mapper.
        unsafe { mapper.unmap(base) };
    }

    #[test]
    fn unmap_accepts_interior_pointers() {
        let mapper = PageMapper::new();
        let header = mapper.map(PAGE_SIZE, 0).unwrap();
        let interior = header.as_ptr().cast::<u8>().wrapping_add(PAGE_SIZE - 1);

        assert_eq!(header_addr(interior), header.as_ptr() as usize);
        // SAFETY: interior points into the first page of a live region.
        unsafe {
            assert_eq!(header_of(interior).kind(), RegionKind::Large);
            mapper.unmap(interior);
        }
        assert_eq!(mapper.outstanding_regions(), 0);
    }

    #[test]
    fn kind_of_reads_arena_and_large_headers() {
        let mapper = PageMapper::new();
        let arena = mapper.map(PAGE_SIZE, 256).unwrap();
        let large = mapper.map(PAGE_SIZE * 3, 0).unwrap();
        let slot = arena.as_ptr().cast::<u8>().wrapping_add(PAGE_SIZE - 256);
        let payload = large.as_ptr().cast::<u8>().wrapping_add(REGION_HEADER_SIZE);

        // SAFETY: both regions are live and the pointers lie in their first page.
        unsafe {
            assert_eq!(kind_of(slot), RegionKind::Arena { item_size: 256 });
            assert_eq!(kind_of(payload), RegionKind::Large);
            assert_eq!(kind_of(slot), header_of(slot).kind());
            mapper.unmap(slot);
            mapper.unmap(payload);
        }
        assert_eq!(mapper.outstanding_regions(), 0);
    }

    #[test]
    fn header_addr_rounds_down_to_page() {
        assert_eq!(header_addr(0x1000 as *const u8), 0x1000);
        assert_eq!(header_addr(0x1010 as *const u8), 0x1000);
        assert_eq!(header_addr(0x1fff as *const u8), 0x1000);
        assert_eq!(header_addr(0x2000 as *const u8), 0x2000);
    }

    #[test]
    fn undersized_request_is_rejected_without_mapping() {
        let mapper = PageMapper::new();
        let err = mapper.map(REGION_HEADER_SIZE - 1, 0).unwrap_err();
        assert!(matches!(err, AllocError::InvalidRequest { .. }));
        assert_eq!(mapper.outstanding_regions(), 0);
    }

    #[test]
    fn impossible_mapping_reports_exhaustion() {
        let mapper = PageMapper::new();
        let err = mapper.map(usize::MAX & !(PAGE_SIZE - 1), 0).unwrap_err();
        assert!(matches!(err, AllocError::ResourceExhausted { .. }));
        assert!(!err.is_fatal());
        assert_eq!(mapper.outstanding_regions(), 0);
    }
}
