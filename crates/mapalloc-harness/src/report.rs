//! JSON run reports.

use mapalloc::{Heap, HeapConfig, HeapStats, NUM_SIZE_CLASSES};
use serde::Serialize;

/// Most regions a quiescent heap may still hold: one retained arena per
/// class plus slack for a single in-flight large block.
pub const REGION_BOUND: usize = NUM_SIZE_CLASSES + 1;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport<T: Serialize> {
    pub scenario: &'static str,
    pub seed: u64,
    pub config: HeapConfig,
    pub elapsed_ms: u64,
    pub outcome: T,
    /// Regions still mapped once every pointer was released.
    pub outstanding_after: usize,
    pub released_by_trim: usize,
    pub region_bound: usize,
    pub peak_rss_kb: u64,
    pub stats: HeapStats,
}

impl<T: Serialize> RunReport<T> {
    /// Capture the heap's end state, then trim it.
    pub fn finish(
        scenario: &'static str,
        seed: u64,
        heap: &Heap,
        elapsed_ms: u64,
        outcome: T,
    ) -> Self {
        let stats = heap.stats();
        let outstanding_after = stats.outstanding_regions;
        let released_by_trim = heap.trim();
        Self {
            scenario,
            seed,
            config: heap.config(),
            elapsed_ms,
            outcome,
            outstanding_after,
            released_by_trim,
            region_bound: REGION_BOUND,
            peak_rss_kb: peak_rss_kb(),
            stats,
        }
    }

    #[must_use]
    pub fn within_bound(&self) -> bool {
        self.outstanding_after <= self.region_bound
    }
}

/// Peak resident set size of this process in kilobytes, 0 if unavailable.
#[must_use]
pub fn peak_rss_kb() -> u64 {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage fills the struct on success.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return 0;
    }
    // SAFETY: rc == 0 means the struct was written.
    let max_rss = unsafe { usage.assume_init() }.ru_maxrss;
    // Linux reports kilobytes, macOS bytes.
    let kb = if cfg!(target_os = "macos") {
        max_rss / 1024
    } else {
        max_rss
    };
    u64::try_from(kb).unwrap_or(0)
}
