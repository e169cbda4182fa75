//! Allocator error taxonomy.
//!
//! Every variant is `Copy` and renders without touching the heap, so the
//! allocator can format one while it is itself the process allocator.

use thiserror::Error;

/// Failure raised by the page-mapping, arena or routing layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The OS refused to map `size` bytes.
    #[error("mmap of {size} bytes failed (errno {errno})")]
    ResourceExhausted { size: usize, errno: i32 },

    /// Bookkeeping would go negative or the OS rejected a tracked region.
    #[error("accounting corruption: {what}")]
    AccountingCorruption { what: &'static str },

    /// A released pointer is not a live slot of the arena owning its page.
    #[error("pointer {addr:#x} is not a live slot of its arena")]
    InvalidPointer { addr: usize },

    /// A freed slot was written to before it was handed out again.
    #[error("freed slot {addr:#x} was modified at byte offset {offset}")]
    CorruptedSlot { addr: usize, offset: usize },

    /// The request cannot be expressed (size overflow, unsupported alignment).
    #[error("unsupported request: {size} bytes aligned to {align}")]
    InvalidRequest { size: usize, align: usize },
}

impl AllocError {
    /// Returns true if the process must not continue after this error.
    ///
    /// Fatal errors mean heap metadata can no longer be trusted.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AccountingCorruption { .. } | Self::InvalidPointer { .. } | Self::CorruptedSlot { .. }
        )
    }
}

pub type Result<T, E = AllocError> = std::result::Result<T, E>;
