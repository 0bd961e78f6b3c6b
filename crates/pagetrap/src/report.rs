//! Fatal diagnostics for detected heap corruption.
//!
//! Double free and invalid free indicate the very corruption this allocator
//! exists to catch; masking them would defeat its purpose, so these paths
//! print a diagnostic and abort. The message is composed in a fixed stack
//! buffer and written with a single raw write to stderr: no allocation, no
//! formatting machinery, usable even when the heap is suspect.

/// Write raw bytes to stderr, bypassing std's buffered/locking machinery.
pub fn write_stderr(msg: &[u8]) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Render `value` as 0x-prefixed lowercase hex into `buf`, returning the
/// populated prefix.
fn format_hex(value: usize, buf: &mut [u8; 18]) -> &[u8] {
    buf[0] = b'0';
    buf[1] = b'x';
    let digits = core::mem::size_of::<usize>() * 2;
    let mut v = value;
    for i in (2..2 + digits).rev() {
        let d = (v & 0xF) as u8;
        buf[i] = if d < 10 { b'0' + d } else { b'a' + d - 10 };
        v >>= 4;
    }
    &buf[..2 + digits]
}

#[cold]
#[inline(never)]
fn fatal(what: &str, addr: usize) -> ! {
    let mut line = [0u8; 96];
    let mut n = 0;
    for &b in b"pagetrap: ".iter().chain(what.as_bytes()) {
        line[n] = b;
        n += 1;
    }
    line[n] = b' ';
    n += 1;
    let mut hex = [0u8; 18];
    for &b in format_hex(addr, &mut hex) {
        line[n] = b;
        n += 1;
    }
    line[n] = b'\n';
    n += 1;
    write_stderr(&line[..n]);
    unsafe { libc::abort() }
}

/// A pointer was deallocated while its slot was not live: double free.
pub fn double_free(addr: usize) -> ! {
    fatal("double free detected at", addr)
}

/// A pointer resolved into the region but was never returned by an
/// allocation: invalid free.
pub fn invalid_free(addr: usize) -> ! {
    fatal("invalid free of", addr)
}

/// The backend refused to close a page on deallocation. Continuing would
/// leave the page read-write and silently drop the use-after-free guarantee
/// for its slot, so this is unrecoverable.
pub fn protection_failure(addr: usize) -> ! {
    fatal("page protection failed at", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_formatting() {
        let mut buf = [0u8; 18];
        assert_eq!(
            format_hex(0xdead_beef, &mut buf),
            format!("0x{:01$x}", 0xdead_beefu64, core::mem::size_of::<usize>() * 2).as_bytes()
        );
        assert_eq!(
            format_hex(0, &mut buf),
            format!("0x{:01$x}", 0, core::mem::size_of::<usize>() * 2).as_bytes()
        );
    }
}
