//! OS-facing surface: the region backend capability set, its mmap-based
//! production implementation, and the thread/clock helpers recorded into slot
//! metadata.

#[cfg(unix)]
pub mod posix;

/// The page-protection primitives the allocator core needs from the OS.
///
/// One implementing variant per OS family; the core depends only on this
/// trait, which also lets tests interpose on protection calls.
///
/// # Safety
/// Implementations must hand out page-aligned mappings and must actually
/// change page protections as described: a page returned by `reserve_region`
/// or passed to `make_inaccessible` must fault on any access until
/// `make_read_write` is called on it.
pub unsafe trait RegionBackend: Send + Sync {
    /// Reserve `size` bytes of inaccessible address space.
    /// Returns null if the reservation fails (address-space exhaustion).
    ///
    /// # Safety
    /// `size` must be page-aligned and non-zero.
    unsafe fn reserve_region(&self, size: usize) -> *mut u8;

    /// Release a reservation made by `reserve_region`.
    ///
    /// # Safety
    /// `base` and `size` must match a prior `reserve_region` call.
    unsafe fn release_region(&self, base: *mut u8, size: usize);

    /// Make one page read-write. Returns false on failure.
    ///
    /// # Safety
    /// `page` must be a page-aligned address inside a reserved region.
    unsafe fn make_read_write(&self, page: *mut u8, size: usize) -> bool;

    /// Make one page inaccessible again. Returns false on failure.
    ///
    /// # Safety
    /// `page` must be a page-aligned address inside a reserved region.
    unsafe fn make_inaccessible(&self, page: *mut u8, size: usize) -> bool;
}

/// Production backend: anonymous mmap reservations plus mprotect/mmap
/// protection toggles.
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBackend;

#[cfg(unix)]
unsafe impl RegionBackend for MmapBackend {
    unsafe fn reserve_region(&self, size: usize) -> *mut u8 {
        posix::reserve_region(size)
    }

    unsafe fn release_region(&self, base: *mut u8, size: usize) {
        posix::release_region(base, size);
    }

    unsafe fn make_read_write(&self, page: *mut u8, size: usize) -> bool {
        posix::make_read_write(page, size)
    }

    unsafe fn make_inaccessible(&self, page: *mut u8, size: usize) -> bool {
        posix::make_inaccessible(page, size)
    }
}

/// A cheap identifier for the calling thread, recorded into slot metadata.
#[inline]
pub fn thread_id() -> u64 {
    #[cfg(unix)]
    {
        posix::thread_id()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Monotonic clock reading in nanoseconds, recorded into slot metadata.
#[inline]
pub fn monotonic_nanos() -> u64 {
    #[cfg(unix)]
    {
        posix::monotonic_nanos()
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// A best-effort seed for the slot-selection RNG when the caller does not
/// provide one. Mixes the monotonic clock with a stack address through a
/// splitmix64 finalizer; not cryptographic, just unpredictable enough to keep
/// slot reuse unbiased across runs.
pub fn entropy_seed() -> u64 {
    let nanos = monotonic_nanos();
    let stack = &nanos as *const u64 as u64;
    let mut x = nanos ^ stack.rotate_left(32);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}
