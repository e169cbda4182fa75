//! Large allocation handling (>1024 bytes).
//!
//! Each large allocation is its own mapped region: a [`RegionHeader`] with
//! `item_size == 0` followed directly by the caller's bytes. Release goes
//! straight to [`PageMapper::unmap`] through the header recovered from the
//! payload pointer.
//!
//! [`RegionHeader`]: crate::region::RegionHeader

use std::ptr::NonNull;

use mapalloc_core::size_class::{ALIGNMENT, PAGE_SIZE};
use mapalloc_core::{AllocError, Result};

use crate::region::{self, PageMapper, REGION_HEADER_SIZE};

/// Offset of the payload from the region start for a given alignment.
///
/// Always below `PAGE_SIZE`, which keeps the payload pointer inside the
/// first page so release can find the header by rounding down.
const fn payload_offset(align: usize) -> usize {
    if align > REGION_HEADER_SIZE {
        align
    } else {
        REGION_HEADER_SIZE
    }
}

/// Map a region holding `size` bytes and return the payload pointer.
///
/// The region is exactly `REGION_HEADER_SIZE + size` bytes and the payload is
/// 8-byte aligned.
pub fn allocate(mapper: &PageMapper, size: usize) -> Result<NonNull<u8>> {
    allocate_aligned(mapper, size, ALIGNMENT)
}

/// Map a region whose payload is aligned to `align`.
///
/// `align` must be a power of two below `PAGE_SIZE`.
pub fn allocate_aligned(mapper: &PageMapper, size: usize, align: usize) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() || align >= PAGE_SIZE {
        return Err(AllocError::InvalidRequest { size, align });
    }
    let offset = payload_offset(align);
    let total = offset
        .checked_add(size)
        .ok_or(AllocError::InvalidRequest { size, align })?;

    let header = mapper.map(total, 0)?;
    // SAFETY: offset < total, so the payload lies inside the mapping.
    Ok(unsafe { header.cast::<u8>().add(offset) })
}

/// Bytes usable through `ptr`, from the pointer to the end of its region.
///
/// # Safety
///
/// `ptr` must be a live large-block payload pointer.
#[must_use]
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    // SAFETY: caller guarantees the region is live.
    let header = unsafe { region::header_of(ptr.as_ptr()) };
    header.mapped_size() - (ptr.as_ptr() as usize - header.base() as usize)
}
