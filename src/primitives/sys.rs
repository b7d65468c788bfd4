#![allow(unsafe_code)]

//! Host facts the engine sizes itself from.

/// Total physical memory in bytes, when the platform reports it.
#[cfg(unix)]
pub fn physical_memory_bytes() -> Option<u64> {
    // SAFETY: sysconf only reads process-wide configuration values.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

/// Total physical memory in bytes, when the platform reports it.
#[cfg(not(unix))]
pub fn physical_memory_bytes() -> Option<u64> {
    None
}
