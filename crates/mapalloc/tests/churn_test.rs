//! Single-threaded random churn against the process-wide heap.
//!
//! Two shapes of workload: an interleaved random walk over a bounded live
//! set, and a bulk phase that keeps every pointer live before releasing them
//! all, which fills and retires arenas in every class. The default tests run
//! a reduced count; the full million-operation runs are ignored by default:
//!
//! ```text
//! cargo test --release -p mapalloc --test churn_test -- --ignored
//! ```

use std::ptr::{self, NonNull};

use mapalloc::{
    Heap, HeapConfig, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, ReclaimPolicy, allocate,
    outstanding_region_count, release, stats, trim,
};
use parking_lot::{Mutex, MutexGuard};

const FULL_SCALE: usize = 1_000_000;
const WALK_OPS: usize = 200_000;
const BULK_COUNT: usize = 50_000;
const LIVE_SET: usize = 512;
const MAX_BYTES: usize = 10_000;
const FILL: u8 = 0xDE;

static SERIAL: Mutex<()> = Mutex::new(());

fn fresh_heap() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    trim();
    assert_eq!(outstanding_region_count(), 0, "a previous test leaked regions");
    guard
}

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Uniform over the eight classes plus the large path, then uniform within.
fn random_size(rng: &mut XorShift64) -> usize {
    let bucket = rng.gen_range(0, NUM_SIZE_CLASSES);
    if bucket == NUM_SIZE_CLASSES {
        return rng.gen_range(MAX_SMALL_SIZE + 1, 64 * 1024);
    }
    let high = 8_usize << bucket;
    let low = if bucket == 0 { 1 } else { (high >> 1) + 1 };
    rng.gen_range(low, high)
}

/// Eight in ten requests are "1 to N bytes" for a class ceiling N; the rest
/// take the large path.
fn mixed_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 9) {
        0 => rng.gen_range(1, 8),
        1 => rng.gen_range(1, 16),
        2 => rng.gen_range(1, 32),
        4 => rng.gen_range(1, 64),
        5 => rng.gen_range(1, 128),
        6 => rng.gen_range(1, 256),
        7 => rng.gen_range(1, 512),
        8 => rng.gen_range(1, 1024),
        _ => rng.gen_range(MAX_SMALL_SIZE, MAX_BYTES - 1),
    }
}

fn walk(ops: usize) {
    let mut rng = XorShift64::new(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::with_capacity(LIVE_SET);

    for op in 0..ops {
        if live.len() == LIVE_SET || (!live.is_empty() && rng.next_u64() % 2 == 0) {
            let victim = rng.gen_range(0, live.len() - 1);
            let (ptr, size, tag) = live.swap_remove(victim);
            // SAFETY: ptr is live for `size` bytes and released once.
            unsafe {
                assert_eq!(*ptr, tag, "first byte clobbered at op {op}");
                assert_eq!(*ptr.add(size - 1), tag, "last byte clobbered at op {op}");
                release(ptr);
            }
        } else {
            let size = random_size(&mut rng);
            let ptr = allocate(size);
            assert!(!ptr.is_null(), "allocate({size}) failed at op {op}");
            let tag = (op & 0xFF) as u8;
            // SAFETY: ptr spans `size` bytes.
            unsafe {
                ptr.write(tag);
                ptr.add(size - 1).write(tag);
            }
            live.push((ptr, size, tag));
        }
    }

    for (ptr, _, _) in live.drain(..) {
        // SAFETY: remaining live pointers, released once.
        unsafe { release(ptr) };
    }
}

/// Allocate `count` blocks and fill them, keeping every one live.
fn allocate_all(
    count: usize,
    seed: u64,
    mut alloc: impl FnMut(usize) -> *mut u8,
) -> Vec<(*mut u8, usize)> {
    let mut rng = XorShift64::new(seed);
    (0..count)
        .map(|i| {
            let size = mixed_size(&mut rng);
            let ptr = alloc(size);
            assert!(!ptr.is_null(), "allocate({size}) failed at block {i}");
            // SAFETY: ptr spans `size` bytes.
            unsafe { ptr::write_bytes(ptr, FILL, size) };
            (ptr, size)
        })
        .collect()
}

fn assert_filled(blocks: &[(*mut u8, usize)]) {
    for &(ptr, size) in blocks {
        // SAFETY: every block is live for `size` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
        assert!(bytes.iter().all(|&b| b == FILL), "block {ptr:p} was overwritten");
    }
}

fn assert_quiescent(context: &str) {
    let snapshot = stats();
    assert_eq!(snapshot.live_slots(), 0, "{context}");
    assert_eq!(snapshot.large_blocks(), 0, "{context}");
    assert!(
        snapshot.arena_count() <= NUM_SIZE_CLASSES,
        "{context}: {} arenas still mapped",
        snapshot.arena_count()
    );
    assert!(
        outstanding_region_count() <= NUM_SIZE_CLASSES + 1,
        "{context}: outstanding regions {}",
        outstanding_region_count()
    );
    trim();
    assert_eq!(outstanding_region_count(), 0, "{context}");
}

fn bulk(count: usize) {
    let blocks = allocate_all(count, 0xD1B5_4A32_D192_ED03, allocate);

    // Every class overflowed its first arena, so frees below land on
    // retired arenas as well as active ones.
    let peak = stats();
    for (index, class) in peak.classes.iter().enumerate() {
        assert!(
            class.arenas >= 2,
            "class {index} ({} bytes) never chained: {} arena(s)",
            class.size,
            class.arenas
        );
    }

    assert_filled(&blocks);
    for (ptr, _) in blocks {
        // SAFETY: live pointer released once.
        unsafe { release(ptr) };
    }
}

#[test]
fn random_walk_returns_every_region() {
    let _serial = fresh_heap();
    walk(WALK_OPS);
    assert_quiescent("random walk");
}

#[test]
fn bulk_allocate_then_release_returns_every_region() {
    let _serial = fresh_heap();
    bulk(BULK_COUNT);
    assert_quiescent("bulk release");
}

#[test]
fn retaining_heap_keeps_at_most_one_arena_per_class_after_bulk_release() {
    let heap = Heap::with_config(HeapConfig::DEFAULT.with_reclaim(ReclaimPolicy::RetainActive));
    let blocks = allocate_all(BULK_COUNT, 0x5851_F42D_4C95_7F2D, |size| {
        heap.allocate(size).map_or(ptr::null_mut(), NonNull::as_ptr)
    });
    assert_filled(&blocks);
    for (ptr, _) in blocks {
        // SAFETY: live pointer from this heap, released once.
        unsafe { heap.release(NonNull::new_unchecked(ptr)) };
    }

    let retained = heap.stats();
    assert_eq!(retained.live_slots(), 0);
    assert_eq!(retained.large_blocks(), 0);
    // Only each class's active arena survives.
    assert_eq!(retained.outstanding_regions, NUM_SIZE_CLASSES);
    assert_eq!(heap.trim(), retained.arena_count());
    assert_eq!(heap.outstanding_regions(), 0);
}

#[test]
#[ignore = "full scale; run with --release -- --ignored"]
fn full_scale_random_walk_returns_every_region() {
    let _serial = fresh_heap();
    walk(FULL_SCALE);
    assert_quiescent("full-scale random walk");
}

#[test]
#[ignore = "full scale; run with --release -- --ignored"]
fn full_scale_bulk_release_returns_every_region() {
    let _serial = fresh_heap();
    bulk(FULL_SCALE);
    assert_quiescent("full-scale bulk release");
}
