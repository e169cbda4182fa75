//! Diagnostic snapshots.
//!
//! Fixed-size so a snapshot can be taken without allocating.

use serde::Serialize;

use crate::size_class::{NUM_SIZE_CLASSES, bin_size};

/// Occupancy of one size class.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    /// Slot size of the class in bytes.
    pub size: usize,
    /// Arenas currently mapped for the class (active plus retired).
    pub arenas: usize,
    /// Slots currently handed out.
    pub live_slots: usize,
    /// Capacity of a single arena of this class.
    pub slots_per_arena: usize,
}

/// Point-in-time view of a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Mapped regions not yet unmapped (arenas and large blocks).
    pub outstanding_regions: usize,
    pub classes: [ClassStats; NUM_SIZE_CLASSES],
}

impl HeapStats {
    /// A snapshot with every class labelled and all counts zero.
    #[must_use]
    pub fn empty() -> Self {
        let mut classes = [ClassStats::default(); NUM_SIZE_CLASSES];
        for (index, class) in classes.iter_mut().enumerate() {
            class.size = bin_size(index);
        }
        Self {
            outstanding_regions: 0,
            classes,
        }
    }

    /// Total arenas mapped across all classes.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.classes.iter().map(|c| c.arenas).sum()
    }

    /// Regions that are not arenas, i.e. live large blocks.
    #[must_use]
    pub fn large_blocks(&self) -> usize {
        self.outstanding_regions.saturating_sub(self.arena_count())
    }

    /// Total slots handed out across all classes.
    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.classes.iter().map(|c| c.live_slots).sum()
    }
}
