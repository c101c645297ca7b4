//! Resident-page probing for metadata accounting.
//!
//! The slab region is reserved lazily; most of it is never touched. Metadata
//! accounting reports how much of the reservation is actually backed by
//! resident pages, probed with `mincore(2)` in bounded chunks.

use crate::util::divroundup;

/// Host physical page size, cached on first use.
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        #[cfg(unix)]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                return sz as usize;
            }
        }
        4096
    })
}

/// Number of bytes of `[addr, addr + len)` currently resident in memory.
///
/// `addr` must be page-aligned. The tail page is counted in full if resident.
#[cfg(target_os = "linux")]
pub fn resident_bytes(addr: *mut u8, len: usize) -> usize {
    const CHUNK_PAGES: usize = 4096;

    let page = page_size();
    debug_assert_eq!(addr as usize % page, 0);

    let mut vec = [0u8; CHUNK_PAGES];
    let total_pages = divroundup(len, page);
    let mut resident = 0usize;

    let mut page_off = 0;
    while page_off < total_pages {
        let pages = CHUNK_PAGES.min(total_pages - page_off);
        let chunk_len = (pages * page).min(len - page_off * page);
        let rc = unsafe {
            libc::mincore(
                addr.add(page_off * page) as *mut libc::c_void,
                chunk_len,
                vec.as_mut_ptr(),
            )
        };
        if rc != 0 {
            // Unmapped or otherwise unprobeable; report what we have so far.
            return resident;
        }
        for &entry in &vec[..pages] {
            if entry & 1 != 0 {
                resident += page;
            }
        }
        page_off += pages;
    }
    resident.min(len)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_bytes(_addr: *mut u8, _len: usize) -> usize {
    0
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn touched_pages_are_resident() {
        let page = page_size();
        let len = 16 * page;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);
        let addr = addr as *mut u8;

        // Fresh anonymous mapping: nothing faulted in yet.
        assert_eq!(resident_bytes(addr, len), 0);

        unsafe {
            *addr = 1;
            *addr.add(4 * page) = 1;
        }
        let resident = resident_bytes(addr, len);
        assert!(resident >= 2 * page);
        assert!(resident <= len);

        unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    }
}
