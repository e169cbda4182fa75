// Every export takes raw pointers from C callers under the usual malloc
// contracts, so per-function safety docs would only repeat them.
#![allow(clippy::missing_safety_doc)]
//! # mapalloc-abi
//!
//! C-callable malloc family backed by the process-wide mapalloc heap.
//!
//! Symbols are prefixed `mapalloc_` so the library links next to the host
//! libc without interposing on `malloc`/`free`:
//!
//! ```text
//! C caller -> mapalloc_* (this crate) -> mapalloc::global -> Heap
//! ```
//!
//! Recoverable failures return null (or 0) and set `errno`. Corruption
//! detected on release aborts the process.

use std::ffi::{c_int, c_void};
use std::ptr::NonNull;

use mapalloc::{AllocError, PAGE_SIZE, failure, global_heap};

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_slot() -> *mut c_int {
    // SAFETY: returns the calling thread's errno location.
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_slot() -> *mut c_int {
    // SAFETY: returns the calling thread's errno location.
    unsafe { libc::__error() }
}

fn set_errno(value: c_int) {
    // SAFETY: errno_slot points at thread-local storage owned by libc.
    unsafe { errno_slot().write(value) };
}

fn errno_for(err: &AllocError) -> c_int {
    match *err {
        AllocError::ResourceExhausted { errno, .. } if errno != 0 => errno,
        AllocError::InvalidRequest { align, .. }
            if !align.is_power_of_two() || align >= PAGE_SIZE =>
        {
            libc::EINVAL
        }
        _ => libc::ENOMEM,
    }
}

/// Hand a result to C: set `errno` on failure, abort on fatal errors.
fn deliver(result: Result<NonNull<u8>, AllocError>) -> *mut c_void {
    if let Err(err) = &result {
        if !err.is_fatal() {
            set_errno(errno_for(err));
        }
    }
    failure::surface(result).cast()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_malloc(size: usize) -> *mut c_void {
    deliver(global_heap().allocate(size))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_free(ptr: *mut c_void) {
    // SAFETY: C contract: ptr is null or live from this library.
    unsafe { mapalloc::release(ptr.cast()) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    deliver(global_heap().allocate_zeroed(nmemb, size))
}

/// `realloc` with glibc's conventions: a null pointer allocates, a zero size
/// frees and returns null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if size == 0 && !ptr.is_null() {
        // SAFETY: C contract: ptr is live from this library.
        unsafe { mapalloc::release(ptr.cast()) };
        return std::ptr::null_mut();
    }
    // SAFETY: C contract: ptr is null or live from this library.
    deliver(unsafe { global_heap().reallocate(ptr.cast(), size) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_malloc_usable_size(ptr: *mut c_void) -> usize {
    // SAFETY: C contract: ptr is null or live from this library.
    unsafe { mapalloc::usable_size(ptr.cast()) }
}

/// C11 `aligned_alloc`. Alignments must be powers of two below the page size;
/// anything else fails with `EINVAL`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mapalloc_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    deliver(global_heap().allocate_aligned(size, alignment))
}

#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_outstanding_regions() -> usize {
    mapalloc::outstanding_region_count()
}

/// Unmap empty arenas kept by the retaining reclaim policy. Returns how many
/// regions went back to the OS.
#[unsafe(no_mangle)]
pub extern "C" fn mapalloc_trim() -> usize {
    mapalloc::trim()
}
