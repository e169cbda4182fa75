//! # mapalloc-harness
//!
//! Stress scenarios for mapalloc, run against a private [`mapalloc::Heap`]
//! so the region counts in a report belong to the workload alone.

pub mod error;
pub mod report;
pub mod workload;

pub use error::{HarnessError, parse_seed};
pub use report::{RunReport, peak_rss_kb};
pub use workload::{ChurnParams, ThreadedParams, XorShift64};
