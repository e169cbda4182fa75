#![no_main]
use libfuzzer_sys::fuzz_target;
use mapalloc::{Heap, HeapConfig, ReclaimPolicy};

// Each 4-byte chunk is one operation: opcode, two size bytes, one index byte.
fuzz_target!(|data: &[u8]| {
    let Some((&first, ops)) = data.split_first() else {
        return;
    };
    let policy = if first & 1 == 0 {
        ReclaimPolicy::Eager
    } else {
        ReclaimPolicy::RetainActive
    };
    let heap = Heap::with_config(HeapConfig::DEFAULT.with_reclaim(policy).with_poison(true));
    let mut live: Vec<(std::ptr::NonNull<u8>, usize)> = Vec::new();

    for chunk in ops.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let pick = usize::from(chunk[3]);
        match chunk[0] % 4 {
            0 => {
                if let Ok(ptr) = heap.allocate(size) {
                    // SAFETY: ptr spans `size` bytes.
                    unsafe { std::ptr::write_bytes(ptr.as_ptr(), chunk[3], size) };
                    live.push((ptr, size));
                }
            }
            1 if !live.is_empty() => {
                let (ptr, _) = live.swap_remove(pick % live.len());
                // SAFETY: ptr is live and released once.
                unsafe { heap.release(ptr) };
            }
            2 if !live.is_empty() => {
                let index = pick % live.len();
                let (ptr, _) = live[index];
                // SAFETY: ptr is live; on success it is replaced by the result.
                if let Ok(moved) = unsafe { heap.reallocate(ptr.as_ptr(), size) } {
                    live[index] = (moved, size);
                }
            }
            3 => {
                let align = 1_usize << (chunk[3] % 12);
                if let Ok(ptr) = heap.allocate_aligned(size, align) {
                    assert_eq!(ptr.as_ptr() as usize % align, 0);
                    live.push((ptr, size));
                }
            }
            _ => {}
        }
        // SAFETY: every tracked pointer is live for at least its recorded size.
        for &(ptr, size) in &live {
            assert!(unsafe { heap.usable_size(ptr) } >= size);
        }
    }

    for (ptr, _) in live {
        // SAFETY: remaining pointers are live and released once.
        unsafe { heap.release(ptr) };
    }
    heap.trim();
    assert_eq!(heap.outstanding_regions(), 0);
});
