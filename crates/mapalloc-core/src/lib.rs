//! # mapalloc-core
//!
//! Safe building blocks shared by the mapalloc allocator crates: the
//! size-class ladder, the error taxonomy, configuration parsing and the
//! diagnostic snapshot types. No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod size_class;
pub mod stats;

pub use config::{HeapConfig, ReclaimPolicy};
pub use error::{AllocError, Result};
pub use stats::{ClassStats, HeapStats};
