//! The guarded slot region: one reserved address range partitioned into
//! fixed slots, each a single data page flanked by its own guard pages.
//!
//! Layout per slot is three consecutive pages: `[guard][data][guard]`.
//! Guard pages are never shared between slots, so no two data pages are
//! adjacent and every stray access just past a data page lands on a page
//! attributable to exactly one slot.

use crate::platform::RegionBackend;
use crate::util::page_size;
use core::fmt;

/// Pages per slot: left guard, data, right guard.
pub const PAGES_PER_SLOT: usize = 3;

/// Reservation of the guarded address range failed; the sampling feature is
/// disabled for the process lifetime. Not fatal to the host process.
#[derive(Debug)]
pub struct RegionUnavailable;

impl fmt::Display for RegionUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("guarded region reservation failed")
    }
}

impl std::error::Error for RegionUnavailable {}

/// Where inside a slot's three-page span an address falls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePos {
    LeftGuard,
    Data,
    RightGuard,
}

/// The reserved guarded range. Created once, torn down only on drop; slot
/// addresses are pure arithmetic over `base`.
pub struct SlotRegion<B: RegionBackend> {
    backend: B,
    base: *mut u8,
    page_size: usize,
    slot_count: usize,
}

// The raw base pointer is only ever dereferenced through backend protection
// calls; the range itself is immutable after reservation.
unsafe impl<B: RegionBackend> Send for SlotRegion<B> {}
unsafe impl<B: RegionBackend> Sync for SlotRegion<B> {}

impl<B: RegionBackend> SlotRegion<B> {
    /// Reserve `slot_count` guarded slots as one inaccessible mapping.
    /// The page size is platform-reported and captured here.
    pub fn reserve(backend: B, slot_count: usize) -> Result<Self, RegionUnavailable> {
        debug_assert!(slot_count > 0);
        let ps = page_size();
        let size = match slot_count
            .checked_mul(PAGES_PER_SLOT)
            .and_then(|pages| pages.checked_mul(ps))
        {
            Some(size) => size,
            None => return Err(RegionUnavailable),
        };
        let base = unsafe { backend.reserve_region(size) };
        if base.is_null() {
            log::warn!(
                "failed to reserve guarded region: {} slots ({} bytes)",
                slot_count,
                size
            );
            return Err(RegionUnavailable);
        }
        Ok(SlotRegion {
            backend,
            base,
            page_size: ps,
            slot_count,
        })
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[inline]
    fn region_size(&self) -> usize {
        self.slot_count * PAGES_PER_SLOT * self.page_size
    }

    /// Base address of slot `index`'s data page.
    #[inline]
    pub fn slot_page(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.slot_count);
        unsafe {
            self.base
                .add((index * PAGES_PER_SLOT + 1) * self.page_size)
        }
    }

    /// Whether `addr` falls anywhere inside the reserved range, guard pages
    /// included. Reads only immutable fields; usable without the pool lock.
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.region_size()
    }

    /// Resolve an address to the slot whose *data page* contains it.
    /// Guard-page addresses resolve to None; they are never valid
    /// live-allocation addresses.
    #[inline]
    pub fn slot_for_addr(&self, addr: *const u8) -> Option<usize> {
        let (index, pos) = self.slot_for_fault(addr)?;
        match pos {
            PagePos::Data => Some(index),
            _ => None,
        }
    }

    /// Resolve any in-region address, guard pages included, to its slot and
    /// page position. This is the diagnostic mapping: a fault on slot `i`'s
    /// left guard is an underflow of slot `i`, on its right guard an
    /// overflow. O(1) arithmetic, no locking.
    #[inline]
    pub fn slot_for_fault(&self, addr: *const u8) -> Option<(usize, PagePos)> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr as usize - self.base as usize;
        let page_index = offset / self.page_size;
        let index = page_index / PAGES_PER_SLOT;
        let pos = match page_index % PAGES_PER_SLOT {
            0 => PagePos::LeftGuard,
            1 => PagePos::Data,
            _ => PagePos::RightGuard,
        };
        Some((index, pos))
    }

    /// Make slot `index`'s data page read-write.
    #[inline]
    pub fn mark_accessible(&self, index: usize) -> bool {
        unsafe {
            self.backend
                .make_read_write(self.slot_page(index), self.page_size)
        }
    }

    /// Make slot `index`'s data page inaccessible. Idempotent-safe: calling
    /// this on an already-inaccessible page is harmless.
    #[inline]
    pub fn mark_inaccessible(&self, index: usize) -> bool {
        unsafe {
            self.backend
                .make_inaccessible(self.slot_page(index), self.page_size)
        }
    }
}

impl<B: RegionBackend> Drop for SlotRegion<B> {
    fn drop(&mut self) {
        unsafe {
            self.backend.release_region(self.base, self.region_size());
        }
    }
}
