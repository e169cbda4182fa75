//! Deterministic allocation workloads.

use std::ptr::NonNull;
use std::sync::Barrier;
use std::thread;

use mapalloc::{Heap, MAX_SMALL_SIZE, NUM_SIZE_CLASSES};

use crate::HarnessError;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of the generator.
        Self { state: seed.max(1) }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// A request size drawn uniformly over the size classes plus the large path,
/// then uniformly within the chosen bucket.
pub fn random_size(rng: &mut XorShift64, max_large: usize) -> usize {
    let bucket = rng.gen_range(0, NUM_SIZE_CLASSES);
    if bucket == NUM_SIZE_CLASSES {
        return rng.gen_range(MAX_SMALL_SIZE + 1, max_large.max(MAX_SMALL_SIZE + 1));
    }
    let high = 8_usize << bucket;
    let low = if bucket == 0 { 1 } else { (high >> 1) + 1 };
    rng.gen_range(low, high)
}

#[derive(Debug, Clone, Copy)]
pub struct ChurnParams {
    pub ops: usize,
    pub seed: u64,
    /// Upper bound on simultaneously live allocations.
    pub live_cap: usize,
    /// Largest request on the large path.
    pub max_large: usize,
}

impl Default for ChurnParams {
    fn default() -> Self {
        Self {
            ops: 1_000_000,
            seed: 0x9E37_79B9_7F4A_7C15,
            live_cap: 512,
            max_large: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ChurnOutcome {
    pub allocations: usize,
    pub releases: usize,
    pub peak_live: usize,
    pub peak_regions: usize,
}

struct Live {
    ptr: NonNull<u8>,
    size: usize,
    tag: u8,
}

/// Release `live` after checking that its first and last byte kept their tag.
///
/// # Safety
///
/// `live.ptr` must be a live allocation of `heap` spanning `live.size` bytes.
unsafe fn check_and_release(heap: &Heap, live: Live, op: usize) -> Result<(), HarnessError> {
    let p = live.ptr.as_ptr();
    // SAFETY: caller guarantees p spans live.size >= 1 bytes.
    let intact = unsafe { *p == live.tag && *p.add(live.size - 1) == live.tag };
    if !intact {
        return Err(HarnessError::Clobbered {
            op,
            addr: p as usize,
        });
    }
    // SAFETY: caller guarantees p is live; released once here.
    unsafe { heap.release(live.ptr) };
    Ok(())
}

/// Single-threaded random allocate/release churn.
///
/// Every allocation is tagged at both ends and checked before release. All
/// pointers are released before returning.
pub fn churn(heap: &Heap, params: &ChurnParams) -> Result<ChurnOutcome, HarnessError> {
    let mut rng = XorShift64::new(params.seed);
    let live_cap = params.live_cap.max(1);
    let mut live: Vec<Live> = Vec::with_capacity(live_cap);
    let mut outcome = ChurnOutcome::default();

    for op in 0..params.ops {
        let release_now = live.len() == live_cap || (!live.is_empty() && rng.next_u64() & 1 == 0);
        if release_now {
            let victim = live.swap_remove(rng.gen_range(0, live.len() - 1));
            // SAFETY: every entry in `live` is a live allocation of `heap`.
            unsafe { check_and_release(heap, victim, op)? };
            outcome.releases += 1;
            continue;
        }

        let size = random_size(&mut rng, params.max_large);
        let ptr = heap
            .allocate(size)
            .map_err(|source| HarnessError::Allocation { op, size, source })?;
        let tag = (op & 0xFF) as u8;
        // SAFETY: ptr spans `size` >= 1 bytes.
        unsafe {
            ptr.as_ptr().write(tag);
            ptr.as_ptr().add(size - 1).write(tag);
        }
        live.push(Live { ptr, size, tag });
        outcome.allocations += 1;
        outcome.peak_live = outcome.peak_live.max(live.len());
        outcome.peak_regions = outcome.peak_regions.max(heap.outstanding_regions());
    }

    for entry in live.drain(..) {
        // SAFETY: as above.
        unsafe { check_and_release(heap, entry, params.ops)? };
        outcome.releases += 1;
    }
    tracing::debug!(
        allocations = outcome.allocations,
        peak_regions = outcome.peak_regions,
        "churn finished"
    );
    Ok(outcome)
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadedParams {
    pub threads: usize,
    pub per_thread: usize,
    pub main_rounds: usize,
    pub seed: u64,
}

impl Default for ThreadedParams {
    fn default() -> Self {
        Self {
            threads: 8,
            per_thread: 4_000,
            main_rounds: 20_000,
            seed: 0xDEAD_BEEF,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ThreadedOutcome {
    pub released_by_workers: usize,
    pub main_allocations: usize,
}

/// Worker threads release a pre-allocated shared set while the calling
/// thread keeps allocating and releasing its own batch.
pub fn threaded_release(
    heap: &Heap,
    params: &ThreadedParams,
) -> Result<ThreadedOutcome, HarnessError> {
    let mut rng = XorShift64::new(params.seed);
    let mut batches: Vec<Vec<usize>> = Vec::with_capacity(params.threads);
    let mut op = 0;
    for _ in 0..params.threads {
        let mut batch = Vec::with_capacity(params.per_thread);
        for _ in 0..params.per_thread {
            let size = random_size(&mut rng, 16 * 1024);
            let ptr = heap
                .allocate(size)
                .map_err(|source| HarnessError::Allocation { op, size, source })?;
            batch.push(ptr.as_ptr() as usize);
            op += 1;
        }
        batches.push(batch);
    }

    let start = Barrier::new(params.threads + 1);
    let mut outcome = ThreadedOutcome::default();

    thread::scope(|scope| -> Result<(), HarnessError> {
        let workers: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let start = &start;
                scope.spawn(move || {
                    start.wait();
                    let count = batch.len();
                    for addr in batch {
                        if let Some(ptr) = NonNull::new(addr as *mut u8) {
                            // SAFETY: each address is live and owned by this worker alone.
                            unsafe { heap.release(ptr) };
                        }
                    }
                    count
                })
            })
            .collect();

        start.wait();
        let mut mine: Vec<Live> = Vec::with_capacity(64);
        for round in 0..params.main_rounds {
            let size = random_size(&mut rng, 16 * 1024);
            let ptr = heap
                .allocate(size)
                .map_err(|source| HarnessError::Allocation { op, size, source })?;
            let tag = (round & 0xFF) as u8;
            // SAFETY: ptr spans `size` >= 1 bytes.
            unsafe {
                ptr.as_ptr().write(tag);
                ptr.as_ptr().add(size - 1).write(tag);
            }
            mine.push(Live { ptr, size, tag });
            outcome.main_allocations += 1;
            op += 1;
            if mine.len() == 64 {
                for entry in mine.drain(..) {
                    // SAFETY: live allocation owned by this thread.
                    unsafe { check_and_release(heap, entry, op)? };
                }
            }
        }
        for entry in mine.drain(..) {
            // SAFETY: live allocation owned by this thread.
            unsafe { check_and_release(heap, entry, op)? };
        }

        for worker in workers {
            outcome.released_by_workers += worker.join().map_err(|_| HarnessError::WorkerPanicked)?;
        }
        Ok(())
    })?;

    Ok(outcome)
}
