//! Protocol tests for the guarded pool: capacity, placement, round-trips,
//! quarantine behavior and diagnostic attribution.

use pagetrap::util::page_size;
use pagetrap::{
    Config, DeallocError, FaultKind, GuardedAllocator, MmapBackend, RegionBackend, SlotState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn pool(slot_count: usize, quarantine_len: usize) -> GuardedAllocator<MmapBackend> {
    GuardedAllocator::init(
        &Config {
            slot_count,
            quarantine_len,
            seed: Some(0x5eed),
            trace_hook: None,
        },
        MmapBackend,
    )
    .expect("guarded region reservation failed")
}

fn page_base(ptr: *const u8) -> usize {
    ptr as usize & !(page_size() - 1)
}

#[test]
fn pool_capacity_is_exact() {
    let a = pool(4, 0);
    assert_eq!(a.capacity(), 4);

    let mut live = Vec::new();
    for _ in 0..4 {
        let p = a.allocate(64, 16).expect("pool should not be exhausted yet");
        live.push(p);
    }
    // 5th concurrent outstanding allocation exhausts the pool.
    assert!(a.allocate(64, 16).is_none());

    // All four live pointers sit on distinct pages.
    let mut pages: Vec<usize> = live.iter().map(|p| page_base(p.as_ptr())).collect();
    pages.sort_unstable();
    pages.dedup();
    assert_eq!(pages.len(), 4);

    for p in live {
        a.deallocate(p.as_ptr()).unwrap();
    }
}

#[test]
fn unsupported_requests_are_declined() {
    let a = pool(4, 0);
    let ps = page_size();

    assert!(a.allocate(ps + 1, 1).is_none(), "oversize must fail");
    if ps == 4096 {
        assert!(a.allocate(5000, 1).is_none());
    }
    assert!(a.allocate(64, ps * 2).is_none(), "align wider than a page");
    assert!(a.allocate(64, 3).is_none(), "non-power-of-two align");
    assert!(a.allocate(64, 0).is_none(), "zero align");

    // Declining consumed no slots.
    assert_eq!(a.stats().free, 4);
}

#[test]
fn placement_respects_alignment_and_page_bounds() {
    let a = pool(4, 0);
    let ps = page_size();

    for &size in &[1usize, 8, 16, 100, 1024, 4095] {
        for &align in &[1usize, 2, 8, 64, 256, 4096] {
            if align > ps {
                continue;
            }
            let p = a
                .allocate(size, align)
                .unwrap_or_else(|| panic!("allocate({}, {}) failed", size, align));
            let addr = p.as_ptr() as usize;
            assert_eq!(addr % align, 0, "allocate({}, {}) misaligned", size, align);
            // The whole allocation lies within one page.
            assert_eq!(
                page_base(p.as_ptr()),
                page_base((addr + size - 1) as *const u8),
                "allocate({}, {}) crosses a page boundary",
                size,
                align
            );
            a.deallocate(p.as_ptr()).unwrap();
        }
    }
}

#[test]
fn page_filling_allocation_succeeds() {
    let a = pool(2, 0);
    let ps = page_size();

    let p = a.allocate(ps, 1).expect("page-filling allocation");
    // Only one placement can fit: the page base.
    assert_eq!(p.as_ptr() as usize, page_base(p.as_ptr()));
    assert_eq!(a.requested_size(p.as_ptr()), Some(ps));
    a.deallocate(p.as_ptr()).unwrap();
}

#[test]
fn zero_size_allocation_consumes_a_slot() {
    let a = pool(2, 0);

    let p = a.allocate(0, 1).expect("zero-size allocation");
    assert_eq!(a.requested_size(p.as_ptr()), Some(0));
    assert_eq!(a.stats().allocated, 1);
    a.deallocate(p.as_ptr()).unwrap();
    assert_eq!(a.stats().allocated, 0);
}

#[test]
fn requested_size_round_trip() {
    let a = pool(4, 0);

    let p = a.allocate(100, 8).unwrap();
    assert_eq!(a.requested_size(p.as_ptr()), Some(100));
    // An interior pointer is not the allocation.
    assert_eq!(a.requested_size(unsafe { p.as_ptr().add(1) }), None);

    a.deallocate(p.as_ptr()).unwrap();
    assert_eq!(a.requested_size(p.as_ptr()), None);
}

#[test]
fn foreign_pointer_is_not_owned() {
    let a = pool(4, 0);

    let mut local = 0u8;
    let foreign = &mut local as *mut u8;
    assert!(!a.owns(foreign));
    assert_eq!(a.deallocate(foreign), Err(DeallocError::NotOwned));

    let p = a.allocate(16, 16).unwrap();
    assert!(a.owns(p.as_ptr()));
    // Guard addresses are ours for routing purposes.
    assert!(a.owns((page_base(p.as_ptr()) + page_size()) as *const u8));
    a.deallocate(p.as_ptr()).unwrap();
}

#[test]
fn pool_recovers_after_deallocate() {
    let a = pool(4, 0);

    let mut live: Vec<_> = (0..4).map(|_| a.allocate(32, 8).unwrap()).collect();
    assert!(a.allocate(32, 8).is_none());

    let freed = live.remove(1);
    a.deallocate(freed.as_ptr()).unwrap();

    let again = a.allocate(32, 8).expect("pool must recover capacity");
    for p in &live {
        assert_ne!(again.as_ptr(), p.as_ptr(), "reused a live pointer");
        assert_ne!(
            page_base(again.as_ptr()),
            page_base(p.as_ptr()),
            "reused a live page"
        );
    }

    a.deallocate(again.as_ptr()).unwrap();
    for p in live {
        a.deallocate(p.as_ptr()).unwrap();
    }
}

#[test]
fn quarantine_withholds_slots_from_reuse() {
    let a = pool(2, 1);

    let p = a.allocate(64, 8).unwrap();
    a.deallocate(p.as_ptr()).unwrap();

    let s = a.stats();
    assert_eq!(s.quarantined, 1);
    assert_eq!(s.free, 1);
    assert_eq!(s.allocated, 0);

    // The quarantined page must not be handed out while withheld.
    let q = a.allocate(64, 8).unwrap();
    assert_ne!(page_base(q.as_ptr()), page_base(p.as_ptr()));

    // The next deallocation pushes the first slot out of quarantine.
    a.deallocate(q.as_ptr()).unwrap();
    let s = a.stats();
    assert_eq!(s.quarantined, 1);
    assert_eq!(s.free, 1);
}

#[test]
fn slot_conservation_through_cycles() {
    let a = pool(4, 2);

    for round in 0..50 {
        let n = 1 + round % 4;
        let live: Vec<_> = (0..n).filter_map(|_| a.allocate(48, 16)).collect();
        let s = a.stats();
        assert_eq!(s.free + s.allocated + s.quarantined, s.capacity);
        for p in live {
            a.deallocate(p.as_ptr()).unwrap();
        }
        let s = a.stats();
        assert_eq!(s.allocated, 0);
        assert_eq!(s.free + s.quarantined, s.capacity);
    }
}

/// An mmap backend whose page-opening call can be made to fail on demand.
#[derive(Clone)]
struct OpenFailsBackend {
    fail_open: Arc<AtomicBool>,
}

unsafe impl RegionBackend for OpenFailsBackend {
    unsafe fn reserve_region(&self, size: usize) -> *mut u8 {
        MmapBackend.reserve_region(size)
    }

    unsafe fn release_region(&self, base: *mut u8, size: usize) {
        MmapBackend.release_region(base, size)
    }

    unsafe fn make_read_write(&self, page: *mut u8, size: usize) -> bool {
        if self.fail_open.load(Ordering::Relaxed) {
            return false;
        }
        MmapBackend.make_read_write(page, size)
    }

    unsafe fn make_inaccessible(&self, page: *mut u8, size: usize) -> bool {
        MmapBackend.make_inaccessible(page, size)
    }
}

#[test]
fn failed_page_open_keeps_the_slot_free() {
    let fail_open = Arc::new(AtomicBool::new(false));
    let a = GuardedAllocator::init(
        &Config {
            slot_count: 2,
            quarantine_len: 0,
            seed: Some(7),
            trace_hook: None,
        },
        OpenFailsBackend {
            fail_open: Arc::clone(&fail_open),
        },
    )
    .unwrap();

    // A declined protection call must not leak the picked slot.
    fail_open.store(true, Ordering::Relaxed);
    assert!(a.allocate(64, 8).is_none());
    assert!(a.allocate(64, 8).is_none());
    assert_eq!(a.stats().free, 2);

    // Once the backend serves again the pool is whole.
    fail_open.store(false, Ordering::Relaxed);
    let p = a.allocate(64, 8).expect("slot was leaked by the failed open");
    let q = a.allocate(64, 8).expect("slot was leaked by the failed open");
    a.deallocate(p.as_ptr()).unwrap();
    a.deallocate(q.as_ptr()).unwrap();
    assert_eq!(a.stats().free, 2);
}

#[test]
fn diagnose_attributes_guard_and_data_addresses() {
    let a = pool(4, 1);

    let p = a.allocate(128, 16).unwrap();
    let base = page_base(p.as_ptr());
    let ps = page_size();

    // One byte before the data page: the slot's left guard.
    let under = a.diagnose(base - 1).expect("left guard attributes");
    assert_eq!(under.fault, FaultKind::BufferUnderflow);
    assert_eq!(under.state, SlotState::Allocated);
    assert_eq!(under.requested_size, 128);
    assert_ne!(under.alloc_thread_id, 0);
    assert_ne!(under.alloc_time, 0);
    assert_eq!(under.dealloc_time, 0);

    // First byte past the data page: the right guard.
    let over = a.diagnose(base + ps).expect("right guard attributes");
    assert_eq!(over.fault, FaultKind::BufferOverflow);
    assert_eq!(over.index, under.index);

    a.deallocate(p.as_ptr()).unwrap();

    // The stale pointer now reads as a use-after-free.
    let stale = a.diagnose(p.as_ptr() as usize).unwrap();
    assert_eq!(stale.fault, FaultKind::UseAfterFree);
    assert_eq!(stale.state, SlotState::Quarantined);
    assert_ne!(stale.dealloc_time, 0);
    assert_ne!(stale.dealloc_thread_id, 0);

    // Addresses outside the region are not ours to explain.
    assert!(a.diagnose(0x10).is_none());
}

#[test]
fn trace_hook_ids_are_recorded() {
    fn fixed_trace() -> u64 {
        0x7ace
    }

    let a = GuardedAllocator::init(
        &Config {
            slot_count: 2,
            quarantine_len: 1,
            seed: Some(1),
            trace_hook: Some(fixed_trace),
        },
        MmapBackend,
    )
    .unwrap();

    let p = a.allocate(8, 8).unwrap();
    let snap = a.diagnose(p.as_ptr() as usize).unwrap();
    assert_eq!(snap.alloc_trace_id, 0x7ace);
    assert_eq!(snap.dealloc_trace_id, 0);

    a.deallocate(p.as_ptr()).unwrap();
    let snap = a.diagnose(p.as_ptr() as usize).unwrap();
    assert_eq!(snap.dealloc_trace_id, 0x7ace);
}

#[test]
fn default_trace_ids_are_monotonic() {
    let a = pool(4, 0);

    let p = a.allocate(8, 8).unwrap();
    let first = a.diagnose(p.as_ptr() as usize).unwrap().alloc_trace_id;
    a.deallocate(p.as_ptr()).unwrap();
    let second = a.diagnose(p.as_ptr() as usize).unwrap().dealloc_trace_id;
    assert!(second > first);
    assert_ne!(first, 0);
}
