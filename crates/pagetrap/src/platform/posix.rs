use core::ptr;

/// Reserve inaccessible address space for the slot region.
/// No physical pages are committed until individual pages are made
/// read-write.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
pub unsafe fn reserve_region(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Release a region reserved by `reserve_region`.
///
/// # Safety
/// `base` and `size` must match the original reservation.
pub unsafe fn release_region(base: *mut u8, size: usize) {
    let err = libc::munmap(base as *mut libc::c_void, size);
    debug_assert_eq!(err, 0, "munmap failed");
}

/// Make a slot page read-write before handing it to a caller.
///
/// # Safety
/// `page` must be page-aligned and inside a reserved region.
pub unsafe fn make_read_write(page: *mut u8, size: usize) -> bool {
    libc::mprotect(
        page as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    ) == 0
}

/// Make a slot page inaccessible on deallocation.
///
/// Remaps a fresh PROT_NONE page over the address instead of calling
/// mprotect: the old physical page is released to the system, so quarantined
/// slots do not count against RSS. A later make_read_write on the same
/// address therefore yields a zero-filled page.
///
/// # Safety
/// `page` must be page-aligned and inside a reserved region.
pub unsafe fn make_inaccessible(page: *mut u8, size: usize) -> bool {
    let result = libc::mmap(
        page as *mut libc::c_void,
        size,
        libc::PROT_NONE,
        libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    result == page as *mut libc::c_void
}

/// Kernel thread id of the calling thread, cached in TLS to avoid a syscall
/// on every allocation.
#[inline]
pub fn thread_id() -> u64 {
    use std::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<u64> = const { Cell::new(0) };
    }

    CACHED_TID.with(|tid| {
        let cached = tid.get();
        if cached != 0 {
            return cached;
        }
        let new_tid = current_thread_id();
        tid.set(new_tid);
        new_tid
    })
}

#[cfg(target_os = "linux")]
fn current_thread_id() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "macos")]
fn current_thread_id() -> u64 {
    let mut tid: u64 = 0;
    unsafe {
        libc::pthread_threadid_np(libc::pthread_self(), &mut tid);
    }
    tid
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

/// CLOCK_MONOTONIC in nanoseconds.
#[inline]
pub fn monotonic_nanos() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}
