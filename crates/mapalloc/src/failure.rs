//! Turning allocator errors into caller-visible outcomes.
//!
//! Recoverable errors become a null pointer plus a `tracing` warning.
//! Fatal errors print one line to stderr and abort: the message is rendered
//! into a stack buffer and written with `write(2)`, so reporting never
//! allocates and never takes a lock.

use std::cell::Cell;
use std::fmt::{self, Write};
use std::ptr::{self, NonNull};

use mapalloc_core::{AllocError, Result};

const FATAL_MESSAGE_CAPACITY: usize = 256;

/// Fixed-capacity `fmt::Write` sink that silently truncates.
struct StackBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl<const N: usize> Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Report `err` on stderr and abort the process.
#[cold]
pub fn die(err: &AllocError) -> ! {
    let mut buf = StackBuf::<FATAL_MESSAGE_CAPACITY>::new();
    let _ = writeln!(buf, "mapalloc: fatal: {err}");
    let bytes = buf.as_bytes();
    // SAFETY: `bytes` is a live stack buffer of the given length.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
    std::process::abort()
}

thread_local! {
    static REPORTING: Cell<bool> = const { Cell::new(false) };
}

/// Clears the reporting flag when the warning has been emitted.
struct ReportGuard;

impl Drop for ReportGuard {
    fn drop(&mut self) {
        let _ = REPORTING.try_with(|flag| flag.set(false));
    }
}

fn enter_report() -> Option<ReportGuard> {
    REPORTING
        .try_with(|flag| {
            if flag.replace(true) {
                None
            } else {
                Some(ReportGuard)
            }
        })
        .ok()
        .flatten()
}

/// Log a recoverable error unless this thread is already logging one.
pub fn warn_recoverable(err: &AllocError) {
    trace_quietly(|| tracing::warn!(error = %err, "allocation failed"));
}

/// Run a logging call unless this thread is already inside one.
///
/// Allocator events are emitted from the allocation path itself, so a
/// subscriber that allocates would otherwise log about its own allocations.
pub fn trace_quietly(emit: impl FnOnce()) {
    if let Some(_guard) = enter_report() {
        emit();
    }
}

/// Convert an allocation result into the raw-pointer convention.
///
/// Fatal errors abort; recoverable ones are logged and yield null.
pub fn surface(result: Result<NonNull<u8>>) -> *mut u8 {
    match result {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) if err.is_fatal() => die(&err),
        Err(err) => {
            warn_recoverable(&err);
            ptr::null_mut()
        }
    }
}

/// Unwrap a result whose error can only be fatal.
pub fn or_die<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => die(&err),
    }
}
