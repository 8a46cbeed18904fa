// PKTRING — DMA MEMORY
// Hugepage-backed, pinned memory regions for descriptor rings and packet
// frames, plus virtual→physical translation through /proc/self/pagemap.
//
// Policy: DMA memory is hugepage-mapped and locked or it does not exist.
// There is no fallback to ordinary 4 KiB pages — a swappable ring is a
// silent-corruption machine once a device DMAs into a stale mapping.

use std::ptr;

use libc::{
    c_void, mmap, munmap, off_t, MAP_ANONYMOUS, MAP_FAILED, MAP_HUGETLB, MAP_LOCKED,
    MAP_POPULATE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
};

/// Platform hugepage size this allocator speaks. 1 GiB pages also exist but
/// every ring geometry in this crate fits comfortably in 2 MiB multiples.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

const PAGE_SIZE: u64 = 4096;

/// Pin all current and future process memory. Called once at process start,
/// before any DMA buffer is touched.
pub fn lock_memory() -> bool {
    // SAFETY: mlockall takes no pointers.
    unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) == 0 }
}

// ============================================================================
// HUGEPAGE REGION
// ============================================================================

/// One hugepage-backed, pinned, zero-initialized mapping. The mapping is
/// stable for the lifetime of the value; rings and frame pools are carved
/// out of it by offset.
pub struct DmaRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the region is a raw mapping; whoever owns the DmaRegion owns the
// memory. Sharing carved pointers across threads is governed by the ring
// protocols built on top, not by this type.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Allocate `size` bytes of hugepage memory. `size` must be a nonzero
    /// multiple of HUGE_PAGE_SIZE. None on exhaustion or permission failure;
    /// the caller decides whether to retry smaller or refuse to start.
    pub fn allocate_huge(size: usize) -> Option<DmaRegion> {
        if size == 0 || size % HUGE_PAGE_SIZE != 0 {
            return None;
        }
        // MAP_POPULATE pre-faults every page so the datapath never page
        // faults; MAP_LOCKED pins them against swap-out.
        let flags = MAP_PRIVATE | MAP_ANONYMOUS | MAP_HUGETLB | MAP_POPULATE | MAP_LOCKED;
        // SAFETY: anonymous mapping, fd -1, offset 0; result checked below.
        let ptr = unsafe { mmap(ptr::null_mut(), size, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if ptr == MAP_FAILED {
            return None;
        }
        Some(DmaRegion { ptr: ptr as *mut u8, len: size })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        unsafe { munmap(self.ptr as *mut c_void, self.len); }
    }
}

// ============================================================================
// PAGEMAP TRANSLATION
// ============================================================================

/// Decode one pagemap entry into the physical address of `vaddr`.
/// Bit 63 = page present; bits 0..54 = page frame number. A hidden frame
/// number (pfn 0, reported to unprivileged readers) counts as a failure —
/// a ring must never be programmed with physical address zero.
pub fn decode_pagemap_entry(entry: u64, vaddr: u64) -> Option<u64> {
    if entry & (1 << 63) == 0 {
        return None;
    }
    let pfn = entry & ((1 << 55) - 1);
    if pfn == 0 {
        return None;
    }
    Some(pfn * PAGE_SIZE + (vaddr & (PAGE_SIZE - 1)))
}

/// Open handle on /proc/self/pagemap. Explicit state rather than a
/// process-wide static; each device/pool owner opens its own.
pub struct Pagemap {
    fd: i32,
}

impl Pagemap {
    pub fn open() -> Option<Pagemap> {
        // SAFETY: opening a proc file with a static NUL-terminated path.
        let fd = unsafe {
            libc::open(b"/proc/self/pagemap\0".as_ptr() as *const libc::c_char, libc::O_RDONLY)
        };
        if fd < 0 {
            return None;
        }
        Some(Pagemap { fd })
    }

    /// Physical address backing `ptr`. Fails if the page is not resident —
    /// fatal for DMA memory, which is why regions are MAP_LOCKED.
    pub fn translate(&self, ptr: *const u8) -> Option<u64> {
        let vaddr = ptr as u64;
        let mut entry = 0u64;
        // SAFETY: pread into an 8-byte local at the entry offset for the page.
        let len = unsafe {
            libc::pread(
                self.fd,
                &mut entry as *mut u64 as *mut c_void,
                8,
                ((vaddr / PAGE_SIZE) * 8) as off_t,
            )
        };
        if len != 8 {
            return None;
        }
        decode_pagemap_entry(entry, vaddr)
    }
}

impl Drop for Pagemap {
    fn drop(&mut self) {
        // SAFETY: fd came from a successful open and is closed once.
        unsafe { libc::close(self.fd); }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_alloc_rejects_bad_sizes() {
        assert!(DmaRegion::allocate_huge(0).is_none());
        assert!(DmaRegion::allocate_huge(4096).is_none());
        assert!(DmaRegion::allocate_huge(HUGE_PAGE_SIZE + 1).is_none());
    }

    #[test]
    fn pagemap_entry_decodes_present_page() {
        let entry = (1u64 << 63) | 0x1234;
        assert_eq!(decode_pagemap_entry(entry, 0x7f00_0000_0abc), Some(0x1234 * 4096 + 0xabc));
    }

    #[test]
    fn pagemap_entry_rejects_absent_and_hidden() {
        assert_eq!(decode_pagemap_entry(0x1234, 0), None, "present bit clear");
        assert_eq!(decode_pagemap_entry(1 << 63, 0), None, "pfn hidden");
    }

    #[test]
    fn pagemap_opens_on_linux() {
        // Translation itself needs CAP_SYS_ADMIN to see frame numbers, so
        // only exercise the open/read path here.
        let pm = Pagemap::open().expect("/proc/self/pagemap should open");
        let x = 0u64;
        let _ = pm.translate(&x as *const u64 as *const u8);
    }
}
