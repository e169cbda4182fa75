//! Corruption that must abort the process.
//!
//! Each corrupting case runs in a child copy of this test binary: the parent
//! re-executes itself filtered to one `abort_case_*` test with
//! `MAPALLOC_ABORT_CASE` naming it, then checks the child died of `SIGABRT`
//! after printing the fatal line. Without the variable the cases do nothing.

use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};

use mapalloc::region::PageMapper;
use mapalloc::{Heap, HeapConfig, PAGE_SIZE, ReclaimPolicy, allocate, release};

const CASE_VAR: &str = "MAPALLOC_ABORT_CASE";

fn is_child(case: &str) -> bool {
    std::env::var(CASE_VAR).is_ok_and(|v| v == case)
}

fn run_child(case: &str) -> Output {
    let exe = std::env::current_exe().expect("test binary path");
    Command::new(exe)
        .args([case, "--exact", "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, case)
        .output()
        .expect("spawn child test process")
}

fn assert_aborted(case: &str, expected: &str) {
    let output = run_child(case);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "{case} exited with {:?}; stderr:\n{stderr}",
        output.status
    );
    assert!(
        stderr.contains("mapalloc: fatal: "),
        "{case} stderr lacks the fatal prefix:\n{stderr}"
    );
    assert!(stderr.contains(expected), "{case} stderr lacks {expected:?}:\n{stderr}");
}

#[test]
fn abort_case_unmap_through_foreign_mapper() {
    if !is_child("abort_case_unmap_through_foreign_mapper") {
        return;
    }
    let owner = PageMapper::new();
    let stranger = PageMapper::new();
    let region = owner.map(PAGE_SIZE, 0).expect("map one page");
    // SAFETY: deliberately violates the "mapped by this mapper" contract;
    // the counter check aborts before munmap runs.
    unsafe { stranger.unmap(region.as_ptr().cast::<u8>()) };
    unreachable!("unmap through a mapper with nothing outstanding returned");
}

#[test]
fn abort_case_arena_slot_released_twice() {
    if !is_child("abort_case_arena_slot_released_twice") {
        return;
    }
    // Retaining keeps the emptied arena mapped so the second release reaches it.
    let heap = Heap::with_config(HeapConfig::DEFAULT.with_reclaim(ReclaimPolicy::RetainActive));
    let ptr = heap.allocate(64).expect("allocate one slot");
    // SAFETY: the first release is valid; the second is the corruption under test.
    unsafe {
        heap.release(ptr);
        heap.release(ptr);
    }
    unreachable!("second release of an emptied arena's slot returned");
}

#[test]
fn abort_case_misaligned_slot_release() {
    if !is_child("abort_case_misaligned_slot_release") {
        return;
    }
    let ptr = allocate(64);
    assert!(!ptr.is_null());
    // SAFETY: ptr + 8 stays inside the slot's page; releasing it is the
    // corruption under test.
    unsafe { release(ptr.add(8)) };
    unreachable!("release of an interior slot pointer returned");
}

#[test]
fn foreign_mapper_unmap_aborts_with_accounting_corruption() {
    assert_aborted(
        "abort_case_unmap_through_foreign_mapper",
        "accounting corruption: outstanding region count would drop below zero",
    );
}

#[test]
fn double_release_into_empty_arena_aborts_with_accounting_corruption() {
    assert_aborted(
        "abort_case_arena_slot_released_twice",
        "accounting corruption: arena allocated count would drop below zero",
    );
}

#[test]
fn misaligned_release_aborts_with_invalid_pointer() {
    assert_aborted(
        "abort_case_misaligned_slot_release",
        "is not a live slot of its arena",
    );
}
