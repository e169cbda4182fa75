//! Size class bins for small allocations.
//!
//! Small requests round up to one of eight power-of-two classes, 8 bytes
//! through 1024 bytes. Each class is served by arenas that occupy exactly
//! one page; anything above the largest class takes the large-block path.

/// Page size assumed for every mapped region.
///
/// Hosts with larger pages still return mappings aligned to this value, so
/// rounding a pointer down to a multiple of it always lands on a region start.
pub const PAGE_SIZE: usize = 4096;

/// Alignment guaranteed for every pointer handed out.
pub const ALIGNMENT: usize = 8;

/// Minimum allocation size (bytes).
pub const MIN_SIZE: usize = 8;

/// Maximum size for small allocations (bytes). Above this, use the large path.
pub const MAX_SMALL_SIZE: usize = 1024;

/// Number of size class bins.
pub const NUM_SIZE_CLASSES: usize = 8;

/// Describes a single size class bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// The slot size for this class (bytes).
    pub size: usize,
    /// Number of slots that fit in one arena page for this class.
    pub slots_per_page: usize,
}

impl SizeClass {
    /// Creates a new size class descriptor.
    pub const fn new(size: usize, slots_per_page: usize) -> Self {
        Self {
            size,
            slots_per_page,
        }
    }
}

const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [8, 16, 32, 64, 128, 256, 512, 1024];

/// Computes the bin index for a given allocation size.
///
/// Rounds `size` up to the smallest class that holds it. Zero-byte requests
/// share the 8-byte class. Sizes above `MAX_SMALL_SIZE` return
/// `NUM_SIZE_CLASSES` to signal the large-allocation path.
#[must_use]
pub const fn bin_index(size: usize) -> usize {
    if size <= MIN_SIZE {
        return 0;
    }
    if size > MAX_SMALL_SIZE {
        return NUM_SIZE_CLASSES;
    }
    (size.next_power_of_two().trailing_zeros() - MIN_SIZE.trailing_zeros()) as usize
}

/// Returns the slot size for a given bin index.
///
/// Returns 0 for out-of-range indices.
#[must_use]
pub const fn bin_size(index: usize) -> usize {
    if index < NUM_SIZE_CLASSES {
        SIZE_TABLE[index]
    } else {
        0
    }
}

/// Returns the bin index whose slot size is exactly `item_size`, if any.
///
/// Used to validate the item size read back from a region header.
#[must_use]
pub const fn exact_bin(item_size: usize) -> Option<usize> {
    let index = bin_index(item_size);
    if index < NUM_SIZE_CLASSES && SIZE_TABLE[index] == item_size {
        Some(index)
    } else {
        None
    }
}

/// Number of `item_size` slots that fit in a page after a `header_size` header.
#[must_use]
pub const fn slots_per_page(item_size: usize, header_size: usize) -> usize {
    if item_size == 0 || header_size >= PAGE_SIZE {
        return 0;
    }
    (PAGE_SIZE - header_size) / item_size
}

/// Builds the full table of size classes for arenas with the given header size.
#[must_use]
pub fn size_classes(header_size: usize) -> [SizeClass; NUM_SIZE_CLASSES] {
    SIZE_TABLE.map(|size| SizeClass::new(size, slots_per_page(size, header_size)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_index_min() {
        assert_eq!(bin_index(0), 0);
        assert_eq!(bin_index(1), 0);
        assert_eq!(bin_index(8), 0);
    }

    #[test]
    fn test_bin_index_exact() {
        assert_eq!(bin_index(16), 1);
        assert_eq!(bin_index(32), 2);
        assert_eq!(bin_index(64), 3);
        assert_eq!(bin_index(128), 4);
        assert_eq!(bin_index(1024), 7);
    }

    #[test]
    fn test_bin_index_round_up() {
        assert_eq!(bin_index(9), 1);
        assert_eq!(bin_index(17), 2);
        assert_eq!(bin_index(65), 4);
        assert_eq!(bin_index(513), 7);
    }

    #[test]
    fn test_bin_index_large() {
        assert_eq!(bin_index(MAX_SMALL_SIZE), NUM_SIZE_CLASSES - 1);
        assert_eq!(bin_index(MAX_SMALL_SIZE + 1), NUM_SIZE_CLASSES);
        assert_eq!(bin_index(usize::MAX), NUM_SIZE_CLASSES);
    }

    #[test]
    fn test_every_small_size_fits_its_class() {
        for size in 1..=MAX_SMALL_SIZE {
            let class = bin_size(bin_index(size));
            assert!(class >= size, "size {size} landed in class {class}");
            assert!(class == MIN_SIZE || class / 2 < size, "size {size} skipped a class");
        }
    }

    #[test]
    fn test_bin_size_roundtrip() {
        for i in 0..NUM_SIZE_CLASSES {
            let size = bin_size(i);
            assert!(size > 0);
            assert_eq!(bin_index(size), i);
            assert_eq!(exact_bin(size), Some(i));
        }
    }

    #[test]
    fn test_exact_bin_rejects_non_class_sizes() {
        assert_eq!(exact_bin(0), None);
        assert_eq!(exact_bin(24), None);
        assert_eq!(exact_bin(2048), None);
    }

    #[test]
    fn test_bin_size_out_of_range() {
        assert_eq!(bin_size(NUM_SIZE_CLASSES), 0);
        assert_eq!(bin_size(100), 0);
    }

    #[test]
    fn test_size_table_doubles() {
        for i in 1..NUM_SIZE_CLASSES {
            assert_eq!(SIZE_TABLE[i], SIZE_TABLE[i - 1] * 2);
            assert_eq!(SIZE_TABLE[i] % ALIGNMENT, 0);
        }
    }

    #[test]
    fn test_slots_per_page() {
        assert_eq!(slots_per_page(8, 64), 504);
        assert_eq!(slots_per_page(1024, 64), 3);
        assert_eq!(slots_per_page(16, 16), 255);
        assert_eq!(slots_per_page(0, 64), 0);
        assert_eq!(slots_per_page(8, PAGE_SIZE), 0);
    }

    #[test]
    fn test_size_classes() {
        let classes = size_classes(64);
        assert_eq!(classes.len(), NUM_SIZE_CLASSES);
        for class in &classes {
            assert!(class.size >= MIN_SIZE);
            assert!(class.slots_per_page >= 1);
            assert!(class.size * class.slots_per_page + 64 <= PAGE_SIZE);
        }
        assert_eq!(classes[0], SizeClass::new(8, 504));
        assert_eq!(classes[NUM_SIZE_CLASSES - 1], SizeClass::new(1024, 3));
    }
}
