//! Per-slot metadata: one record per slot, allocated once at init and never
//! freed or resized, so a crash handler can read it lock-free at any time.
//!
//! Every field is an individual atomic. A reader racing a mutation may see a
//! torn combination of fields (for example a fresh size with a stale trace
//! id) but never an invalid pointer or freed memory; the state is published
//! with release ordering after the fields of its transition are written.

use crate::region::PagePos;
use core::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

const STATE_FREE: u8 = 0;
const STATE_ALLOCATED: u8 = 1;
const STATE_QUARANTINED: u8 = 2;

/// Lifecycle state of a slot: `Free -> Allocated -> Quarantined -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Allocated,
    Quarantined,
}

impl SlotState {
    fn from_raw(raw: u8) -> SlotState {
        match raw {
            STATE_ALLOCATED => SlotState::Allocated,
            STATE_QUARANTINED => SlotState::Quarantined,
            _ => SlotState::Free,
        }
    }
}

/// Best-effort classification of a faulting access, derived from where the
/// address fell and the slot's state at read time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    BufferUnderflow,
    BufferOverflow,
    UseAfterFree,
    Unknown,
}

/// Bookkeeping for one slot. Field writes happen only under the pool lock;
/// reads may come from a signal handler without it.
pub struct SlotMeta {
    state: AtomicU8,
    requested_size: AtomicUsize,
    placement_offset: AtomicUsize,
    alloc_trace_id: AtomicU64,
    dealloc_trace_id: AtomicU64,
    alloc_thread_id: AtomicU64,
    dealloc_thread_id: AtomicU64,
    alloc_time: AtomicU64,
    dealloc_time: AtomicU64,
}

impl SlotMeta {
    fn new() -> Self {
        SlotMeta {
            state: AtomicU8::new(STATE_FREE),
            requested_size: AtomicUsize::new(0),
            placement_offset: AtomicUsize::new(0),
            alloc_trace_id: AtomicU64::new(0),
            dealloc_trace_id: AtomicU64::new(0),
            alloc_thread_id: AtomicU64::new(0),
            dealloc_thread_id: AtomicU64::new(0),
            alloc_time: AtomicU64::new(0),
            dealloc_time: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn requested_size(&self) -> usize {
        self.requested_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn placement_offset(&self) -> usize {
        self.placement_offset.load(Ordering::Relaxed)
    }

    /// Record an allocation and publish the `Allocated` state. Clears the
    /// previous cycle's deallocation fields: a new cycle starts here.
    pub fn record_alloc(&self, size: usize, offset: usize, trace_id: u64, thread_id: u64, now: u64) {
        self.requested_size.store(size, Ordering::Relaxed);
        self.placement_offset.store(offset, Ordering::Relaxed);
        self.alloc_trace_id.store(trace_id, Ordering::Relaxed);
        self.alloc_thread_id.store(thread_id, Ordering::Relaxed);
        self.alloc_time.store(now, Ordering::Relaxed);
        self.dealloc_trace_id.store(0, Ordering::Relaxed);
        self.dealloc_thread_id.store(0, Ordering::Relaxed);
        self.dealloc_time.store(0, Ordering::Relaxed);
        self.state.store(STATE_ALLOCATED, Ordering::Release);
    }

    /// Record a deallocation and publish the `Quarantined` state. The
    /// allocation-side fields are left intact for diagnosis.
    pub fn record_dealloc(&self, trace_id: u64, thread_id: u64, now: u64) {
        self.dealloc_trace_id.store(trace_id, Ordering::Relaxed);
        self.dealloc_thread_id.store(thread_id, Ordering::Relaxed);
        self.dealloc_time.store(now, Ordering::Relaxed);
        self.state.store(STATE_QUARANTINED, Ordering::Release);
    }

    /// Transition a quarantined slot back to `Free`. Historical fields stay
    /// untouched until the slot is allocated again.
    pub fn mark_free(&self) {
        self.state.store(STATE_FREE, Ordering::Release);
    }

    /// Copy this slot's fields into a plain snapshot, classifying the fault
    /// from the page position the address resolved to.
    pub fn snapshot(&self, index: usize, pos: PagePos) -> SlotSnapshot {
        let state = self.state();
        let dealloc_time = self.dealloc_time.load(Ordering::Relaxed);
        let fault = match pos {
            PagePos::LeftGuard => FaultKind::BufferUnderflow,
            PagePos::RightGuard => FaultKind::BufferOverflow,
            PagePos::Data => {
                if state != SlotState::Allocated && dealloc_time != 0 {
                    FaultKind::UseAfterFree
                } else {
                    FaultKind::Unknown
                }
            }
        };
        SlotSnapshot {
            index,
            state,
            fault,
            requested_size: self.requested_size.load(Ordering::Relaxed),
            placement_offset: self.placement_offset.load(Ordering::Relaxed),
            alloc_trace_id: self.alloc_trace_id.load(Ordering::Relaxed),
            dealloc_trace_id: self.dealloc_trace_id.load(Ordering::Relaxed),
            alloc_thread_id: self.alloc_thread_id.load(Ordering::Relaxed),
            dealloc_thread_id: self.dealloc_thread_id.load(Ordering::Relaxed),
            alloc_time: self.alloc_time.load(Ordering::Relaxed),
            dealloc_time,
        }
    }
}

/// Plain-data copy of a slot's metadata, handed to the external crash
/// handler for attribution and symbolication.
#[derive(Debug, Clone, Copy)]
pub struct SlotSnapshot {
    pub index: usize,
    pub state: SlotState,
    pub fault: FaultKind,
    pub requested_size: usize,
    pub placement_offset: usize,
    pub alloc_trace_id: u64,
    pub dealloc_trace_id: u64,
    pub alloc_thread_id: u64,
    pub dealloc_thread_id: u64,
    pub alloc_time: u64,
    pub dealloc_time: u64,
}

/// Exactly one metadata record per slot, indexed by slot index.
pub struct SlotTable {
    slots: Box<[SlotMeta]>,
}

impl SlotTable {
    pub fn new(slot_count: usize) -> Self {
        SlotTable {
            slots: (0..slot_count).map(|_| SlotMeta::new()).collect(),
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> &SlotMeta {
        &self.slots[index]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_cycle() {
        let table = SlotTable::new(1);
        let meta = table.get(0);
        assert_eq!(meta.state(), SlotState::Free);

        meta.record_alloc(100, 64, 7, 11, 1000);
        assert_eq!(meta.state(), SlotState::Allocated);
        assert_eq!(meta.requested_size(), 100);
        assert_eq!(meta.placement_offset(), 64);

        meta.record_dealloc(8, 12, 2000);
        assert_eq!(meta.state(), SlotState::Quarantined);

        meta.mark_free();
        assert_eq!(meta.state(), SlotState::Free);

        // A new cycle clears the previous deallocation fields.
        meta.record_alloc(32, 0, 9, 13, 3000);
        let snap = meta.snapshot(0, PagePos::Data);
        assert_eq!(snap.dealloc_time, 0);
        assert_eq!(snap.alloc_trace_id, 9);
    }

    #[test]
    fn fault_classification() {
        let table = SlotTable::new(1);
        let meta = table.get(0);
        meta.record_alloc(64, 0, 1, 1, 1);

        assert_eq!(
            meta.snapshot(0, PagePos::LeftGuard).fault,
            FaultKind::BufferUnderflow
        );
        assert_eq!(
            meta.snapshot(0, PagePos::RightGuard).fault,
            FaultKind::BufferOverflow
        );
        // A fault inside a live data page is not classifiable.
        assert_eq!(meta.snapshot(0, PagePos::Data).fault, FaultKind::Unknown);

        meta.record_dealloc(2, 2, 2);
        assert_eq!(
            meta.snapshot(0, PagePos::Data).fault,
            FaultKind::UseAfterFree
        );
        // Still use-after-free once the slot has left quarantine.
        meta.mark_free();
        assert_eq!(
            meta.snapshot(0, PagePos::Data).fault,
            FaultKind::UseAfterFree
        );
    }
}
