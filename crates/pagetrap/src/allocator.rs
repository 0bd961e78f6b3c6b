//! The guarded allocation protocol: pick a random free slot, open its page,
//! place the pointer, and record who did what when.
//!
//! One coarse lock guards the free set, the quarantine and the RNG; every
//! state transition is a single critical section. The pool is small and the
//! sections are short, so the coarse lock buys freedom from lock-ordering
//! bugs for negligible contention. The diagnostic path (`diagnose`) never
//! takes the lock: it must work from a fault handler on a thread that may
//! already hold it.

use crate::config::Config;
use crate::free_set::FreeSet;
use crate::meta::{SlotSnapshot, SlotState, SlotTable};
use crate::platform::{self, RegionBackend};
use crate::quarantine::Quarantine;
use crate::region::{RegionUnavailable, SlotRegion};
use crate::report;
use crate::sync::Mutex;
use crate::util::align_down;
use core::fmt;
use core::ptr::NonNull;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Recoverable deallocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocError {
    /// The pointer lies outside the guarded region; it was never returned by
    /// this allocator. Whether that is fatal is the caller's policy.
    NotOwned,
}

impl fmt::Display for DeallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeallocError::NotOwned => f.write_str("pointer not owned by the guarded allocator"),
        }
    }
}

impl std::error::Error for DeallocError {}

/// Slot counts by state at a quiescent point. `free + allocated +
/// quarantined == capacity` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub allocated: usize,
    pub quarantined: usize,
}

/// Mutable pool state, all behind the single lock.
struct Inner {
    free: FreeSet,
    quarantine: Quarantine,
    rng: SmallRng,
    trace_seq: u64,
}

impl Inner {
    fn next_trace_id(&mut self, hook: Option<fn() -> u64>) -> u64 {
        match hook {
            Some(f) => f(),
            None => {
                self.trace_seq += 1;
                self.trace_seq
            }
        }
    }
}

/// A fixed pool of guarded slots serving sampled heap allocations.
///
/// Explicitly constructed and owned by the process's allocation-hooking
/// layer; there is no hidden global instance.
pub struct GuardedAllocator<B: RegionBackend> {
    region: SlotRegion<B>,
    slots: SlotTable,
    inner: Mutex<Inner>,
    trace_hook: Option<fn() -> u64>,
}

impl<B: RegionBackend> GuardedAllocator<B> {
    /// Reserve the guarded region and build the pool. On failure the caller
    /// disables sampling for the process lifetime; the host process carries
    /// on with its general allocator.
    pub fn init(config: &Config, backend: B) -> Result<Self, RegionUnavailable> {
        let slot_count = config.slot_count.max(1);
        let region = SlotRegion::reserve(backend, slot_count)?;
        let seed = config.seed.unwrap_or_else(platform::entropy_seed);
        log::debug!(
            "guarded pool ready: {} slots, page size {}, quarantine {}",
            slot_count,
            region.page_size(),
            config.quarantine_len
        );
        Ok(GuardedAllocator {
            region,
            slots: SlotTable::new(slot_count),
            inner: Mutex::new(Inner {
                free: FreeSet::with_all(slot_count),
                quarantine: Quarantine::new(config.quarantine_len),
                rng: SmallRng::seed_from_u64(seed),
                trace_seq: 0,
            }),
            trace_hook: config.trace_hook,
        })
    }

    /// Total number of slots in the pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Page size of the region; the largest satisfiable request.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.region.page_size()
    }

    /// Serve one sampled allocation from a random free slot.
    ///
    /// Returns None when the request cannot fit a page (`size` over the page
    /// size, or `align` zero, non-power-of-two or wider than a page) or when
    /// the pool is exhausted. Both are recoverable: the caller routes the
    /// allocation to the general allocator instead.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let ps = self.region.page_size();
        if size > ps || align == 0 || !align.is_power_of_two() || align > ps {
            return None;
        }

        let mut inner = self.inner.lock();
        let Inner { free, rng, .. } = &mut *inner;
        let index = free.pick(rng)?;

        // Zero-size requests still consume a slot; place them as one byte so
        // the pointer sits against a real boundary.
        let place_size = size.max(1);
        // Left-aligned placement exposes the left guard to underflows;
        // right-aligned puts the end of the allocation against the right
        // guard so the first overflowing byte faults. Chosen per allocation
        // to diversify detection.
        let offset = if rng.gen::<bool>() {
            align_down(ps - place_size, align)
        } else {
            0
        };

        if !self.region.mark_accessible(index) {
            // Protection call refused; the slot stays free for later use.
            inner.free.release(index);
            return None;
        }

        let trace_id = inner.next_trace_id(self.trace_hook);
        self.slots.get(index).record_alloc(
            size,
            offset,
            trace_id,
            platform::thread_id(),
            platform::monotonic_nanos(),
        );
        drop(inner);

        // The data page is page-aligned and offset is a multiple of align.
        NonNull::new(unsafe { self.region.slot_page(index).add(offset) })
    }

    /// Return a sampled allocation.
    ///
    /// A pointer outside the region is reported as `NotOwned` and the pool
    /// is left untouched. A pointer inside the region that does not name a
    /// live allocation is corruption: double free if the slot is not live,
    /// invalid free if the address was never handed out. Both abort with a
    /// diagnostic, because continuing would mask the bug this allocator
    /// exists to catch.
    pub fn deallocate(&self, ptr: *mut u8) -> Result<(), DeallocError> {
        let mut inner = self.inner.lock();

        let index = match self.region.slot_for_addr(ptr) {
            Some(index) => index,
            None if self.region.contains(ptr) => {
                // A guard-page address was never a valid allocation.
                report::invalid_free(ptr as usize)
            }
            None => return Err(DeallocError::NotOwned),
        };

        let meta = self.slots.get(index);
        if meta.state() != SlotState::Allocated {
            report::double_free(ptr as usize);
        }
        let live = unsafe { self.region.slot_page(index).add(meta.placement_offset()) };
        if ptr != live {
            report::invalid_free(ptr as usize);
        }

        // Closing the page first is what turns a subsequent use of this
        // pointer into a hardware fault. A refusal here cannot be papered
        // over: returning Ok with the page still open would quietly void
        // that guarantee.
        if !self.region.mark_inaccessible(index) {
            report::protection_failure(ptr as usize);
        }
        let trace_id = inner.next_trace_id(self.trace_hook);
        meta.record_dealloc(trace_id, platform::thread_id(), platform::monotonic_nanos());

        if let Some(released) = inner.quarantine.push(index) {
            self.slots.get(released).mark_free();
            inner.free.release(released);
        }
        Ok(())
    }

    /// Size the caller originally requested for a live allocation, or None
    /// if `ptr` does not name one. Locked for consistency with concurrent
    /// transitions of the same slot.
    pub fn requested_size(&self, ptr: *const u8) -> Option<usize> {
        let _inner = self.inner.lock();
        let index = self.region.slot_for_addr(ptr)?;
        let meta = self.slots.get(index);
        if meta.state() != SlotState::Allocated {
            return None;
        }
        let live = unsafe { self.region.slot_page(index).add(meta.placement_offset()) };
        if ptr != live as *const u8 {
            return None;
        }
        Some(meta.requested_size())
    }

    /// Whether `ptr` falls anywhere in the guarded region. This is the
    /// routing check for deallocation hooks; guard-page addresses answer
    /// true. Reads only immutable bounds, so no lock.
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }

    /// Attribute a faulting address to slot metadata: lock-free and
    /// allocation-free, callable from a signal handler even on a thread that
    /// holds the pool lock. The snapshot may be torn against an in-flight
    /// transition but is always memory-safe to produce and read.
    pub fn diagnose(&self, fault_addr: usize) -> Option<SlotSnapshot> {
        let (index, pos) = self.region.slot_for_fault(fault_addr as *const u8)?;
        Some(self.slots.get(index).snapshot(index, pos))
    }

    /// Per-state slot counts at a quiescent point.
    pub fn stats(&self) -> PoolStats {
        let _inner = self.inner.lock();
        let mut stats = PoolStats {
            capacity: self.slots.len(),
            free: 0,
            allocated: 0,
            quarantined: 0,
        };
        for index in 0..self.slots.len() {
            match self.slots.get(index).state() {
                SlotState::Free => stats.free += 1,
                SlotState::Allocated => stats.allocated += 1,
                SlotState::Quarantined => stats.quarantined += 1,
            }
        }
        stats
    }
}
