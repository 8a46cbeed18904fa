// PKTRING — NETWORK: VIRTIO VRINGS + VHOST-NET SETUP
// Legacy virtio ring, byte-exact: a descriptor table, an avail ring the
// guest/producer publishes chain heads into, and a used ring the device
// completes into. The two index words live in the shared layout, so every
// crossing carries an explicit fence; the device may be a kernel vhost
// worker or another process entirely.
//
// The vhost-net device is configured with a fixed ioctl sequence; a failure
// anywhere in the sequence abandons the device — there is no partial setup.

use std::mem;
use std::sync::atomic::{fence, AtomicU16, Ordering};

use bytemuck::{Pod, Zeroable};
use libc::{c_void, EFD_NONBLOCK};

use crate::engine::runtime::{fatal, E_RING_GEOMETRY, E_VHOST_SETUP_FAIL};

/// Largest vring Linux vhost accepts.
pub const VHOST_VRING_MAX: u32 = 32 * 1024;

// vring_desc.flags
pub const VRING_DESC_F_NEXT: u16 = 1;
pub const VRING_DESC_F_WRITE: u16 = 2;
pub const VRING_DESC_F_INDIRECT: u16 = 4;

// avail.flags hint: don't bother interrupting the guest.
pub const VRING_F_NO_INTERRUPT: u16 = 1;
// used.flags hint: don't bother kicking the device.
pub const VRING_F_NO_NOTIFY: u16 = 1;

const VRING_PAGE: usize = 4096;

// ============================================================================
// SHARED LAYOUT
// ============================================================================

/// I/O buffer descriptor. `next` chains descriptors when F_NEXT is set and
/// threads the free list when the slot is unused.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct VringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// One completion: which chain head finished and how many bytes the device
/// wrote.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct VringUsedElem {
    pub id: u32,
    pub len: u32,
}

const fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

/// Byte offset of the used ring inside a carved vring region. The legacy
/// layout puts desc and avail back to back and page-aligns used.
pub fn vring_used_offset(num: u32) -> usize {
    let desc_bytes = num as usize * mem::size_of::<VringDesc>();
    let avail_bytes = 4 + 2 * num as usize; // flags, idx, ring[num]
    align_up(desc_bytes + avail_bytes, VRING_PAGE)
}

/// Total bytes a vring of `num` entries occupies.
pub fn vring_region_size(num: u32) -> usize {
    let used_bytes = 4 + mem::size_of::<VringUsedElem>() * num as usize;
    vring_used_offset(num) + used_bytes
}

/// Raw view of one vring carved out of a DMA region. All slot access goes
/// through integer indices with bitmask wraparound.
pub struct Vring {
    num: u32,
    mask: u32,
    desc: *mut VringDesc,
    avail_flags: *mut u16,
    avail_idx: *mut u16,
    avail_ring: *mut u16,
    used_flags: *mut u16,
    used_idx: *mut u16,
    used_ring: *mut VringUsedElem,
}

// SAFETY: one guest-side thread drives a Vring; the device peer accesses the
// same memory under the fence protocol below.
unsafe impl Send for Vring {}

impl Vring {
    /// Carve a vring over `base`. `num` must be a power of two and at most
    /// VHOST_VRING_MAX; `base` must be page-aligned (the used ring's
    /// alignment is part of the ABI).
    ///
    /// # Safety
    /// `base` must point at `vring_region_size(num)` bytes of zeroed, live
    /// memory that outlives the Vring.
    pub unsafe fn carve(base: *mut u8, num: u32) -> Vring {
        if !num.is_power_of_two() || num > VHOST_VRING_MAX {
            fatal(E_RING_GEOMETRY, "vring size must be a power of two <= 32768");
        }
        if base as usize % VRING_PAGE != 0 {
            fatal(E_RING_GEOMETRY, "vring base must be page-aligned");
        }
        let desc = base as *mut VringDesc;
        let avail = base.add(num as usize * mem::size_of::<VringDesc>());
        let used = base.add(vring_used_offset(num));
        Vring {
            num,
            mask: num - 1,
            desc,
            avail_flags: avail as *mut u16,
            avail_idx: (avail as *mut u16).add(1),
            avail_ring: (avail as *mut u16).add(2),
            used_flags: used as *mut u16,
            used_idx: (used as *mut u16).add(1),
            used_ring: used.add(4) as *mut VringUsedElem,
        }
    }

    #[inline(always)]
    pub fn num(&self) -> u32 {
        self.num
    }

    // Userspace addresses handed to VHOST_SET_VRING_ADDR.
    pub fn desc_addr(&self) -> u64 {
        self.desc as u64
    }
    pub fn avail_addr(&self) -> u64 {
        self.avail_flags as u64
    }
    pub fn used_addr(&self) -> u64 {
        self.used_flags as u64
    }
}

// ============================================================================
// GUEST-SIDE QUEUE DRIVER
// ============================================================================

/// Guest/producer side of one vring: owns the descriptor free list, the
/// avail shadow index, and the private last-used cursor. `kickfd` < 0 means
/// no notification fd is attached (in-process device, tests).
pub struct VirtQueue {
    ring: Vring,
    free_head: u16,
    num_free: u16,
    avail_shadow: u16,
    last_used: u16,
    kickfd: i32,
}

impl VirtQueue {
    /// # Safety
    /// As Vring::carve; additionally the region must not be shared with
    /// another VirtQueue.
    pub unsafe fn new(base: *mut u8, num: u32, kickfd: i32) -> VirtQueue {
        let ring = Vring::carve(base, num);
        // Thread the free list through the next fields.
        for i in 0..num as u16 {
            (*ring.desc.add(i as usize)).next = i.wrapping_add(1);
        }
        VirtQueue { ring, free_head: 0, num_free: num as u16, avail_shadow: 0, last_used: 0, kickfd }
    }

    pub fn vring(&self) -> &Vring {
        &self.ring
    }

    #[inline(always)]
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Publish one buffer to the device. `device_writes` marks the buffer
    /// write-only for the device (an RX buffer). Returns the chain head, or
    /// None when the descriptor table is exhausted — never blocks.
    pub fn publish(&mut self, addr: u64, len: u32, device_writes: bool) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let head = self.free_head;
        // SAFETY: head came off the free list, so this slot is ours.
        unsafe {
            let d = self.ring.desc.add(head as usize);
            self.free_head = (*d).next;
            (*d).addr = addr;
            (*d).len = len;
            (*d).flags = if device_writes { VRING_DESC_F_WRITE } else { 0 };
            (*d).next = 0;
        }
        self.num_free -= 1;
        // SAFETY: slot index masked; the entry becomes visible to the device
        // only at the idx store after the fence.
        unsafe {
            *self.ring.avail_ring.add((self.avail_shadow & self.ring.mask as u16) as usize) = head;
        }
        self.avail_shadow = self.avail_shadow.wrapping_add(1);
        fence(Ordering::Release);
        // SAFETY: shared index word.
        unsafe {
            (*(self.ring.avail_idx as *const AtomicU16)).store(self.avail_shadow, Ordering::Relaxed);
        }
        self.kick();
        Some(head)
    }

    /// One completed buffer from the used ring, or None. The chain head goes
    /// back on the free list before returning.
    pub fn poll_used(&mut self) -> Option<VringUsedElem> {
        // SAFETY: shared index word; the fence orders the element read after
        // the device's idx publish.
        let used_idx =
            unsafe { (*(self.ring.used_idx as *const AtomicU16)).load(Ordering::Relaxed) };
        if used_idx == self.last_used {
            return None;
        }
        fence(Ordering::Acquire);
        // SAFETY: element index masked; entries below used_idx are owned by
        // us now.
        let elem = unsafe {
            *self.ring.used_ring.add((self.last_used & self.ring.mask as u16) as usize)
        };
        self.last_used = self.last_used.wrapping_add(1);
        self.reclaim(elem.id as u16);
        Some(elem)
    }

    /// Return a chain to the free list, following F_NEXT links.
    fn reclaim(&mut self, head: u16) {
        let mut idx = head;
        loop {
            // SAFETY: the device handed the chain back via the used ring.
            let (flags, next) = unsafe {
                let d = self.ring.desc.add((idx & self.ring.mask as u16) as usize);
                let f = (*d).flags;
                let n = (*d).next;
                (*d).next = self.free_head;
                (f, n)
            };
            self.free_head = idx;
            self.num_free += 1;
            if flags & VRING_DESC_F_NEXT == 0 {
                break;
            }
            idx = next;
        }
    }

    /// Notify the device, unless it asked not to be kicked.
    pub fn kick(&self) {
        if self.kickfd < 0 {
            return;
        }
        // SAFETY: shared flags word, plain load is fine for a hint.
        let flags = unsafe { (*(self.ring.used_flags as *const AtomicU16)).load(Ordering::Relaxed) };
        if flags & VRING_F_NO_NOTIFY != 0 {
            return;
        }
        let one: u64 = 1;
        // SAFETY: 8-byte write to an eventfd.
        unsafe { libc::write(self.kickfd, &one as *const u64 as *const c_void, 8); }
    }
}

// ============================================================================
// VHOST-NET DEVICE SETUP
// ============================================================================

// ioctl request values for /dev/vhost-net.
pub const VHOST_SET_OWNER: u64 = 0x0000_af01;
pub const VHOST_GET_FEATURES: u64 = 0x8008_af00;
pub const VHOST_SET_MEM_TABLE: u64 = 0x4008_af03;
pub const VHOST_SET_VRING_NUM: u64 = 0x4008_af10;
pub const VHOST_SET_VRING_ADDR: u64 = 0x4028_af11;
pub const VHOST_SET_VRING_BASE: u64 = 0x4008_af12;
pub const VHOST_SET_VRING_KICK: u64 = 0x4008_af20;
pub const VHOST_SET_VRING_CALL: u64 = 0x4008_af21;
pub const VHOST_NET_SET_BACKEND: u64 = 0x4008_af30;

pub const VHOST_MEMORY_MAX_NREGIONS: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct VhostVringState {
    pub index: u32,
    pub num: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct VhostVringFile {
    pub index: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct VhostVringAddr {
    pub index: u32,
    pub flags: u32,
    pub desc_user_addr: u64,
    pub used_user_addr: u64,
    pub avail_user_addr: u64,
    pub log_guest_addr: u64,
}

/// One DMA address range the kernel may translate vring addresses against.
#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct VhostMemoryRegion {
    pub guest_phys_addr: u64,
    pub memory_size: u64,
    pub userspace_addr: u64,
    pub flags_padding: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Zeroable)]
pub struct VhostMemory {
    pub nregions: u32,
    pub padding: u32,
    pub regions: [VhostMemoryRegion; VHOST_MEMORY_MAX_NREGIONS],
}

impl Default for VhostMemory {
    fn default() -> Self {
        VhostMemory {
            nregions: 0,
            padding: 0,
            regions: [VhostMemoryRegion::default(); VHOST_MEMORY_MAX_NREGIONS],
        }
    }
}

fn ioctl_or_die(fd: i32, req: u64, arg: *mut c_void, what: &str) {
    // SAFETY: caller passes a live argument matching the request.
    if unsafe { libc::ioctl(fd, req, arg) } < 0 {
        // SAFETY: fd is live; closing before exit keeps the kernel side clean.
        unsafe { libc::close(fd); }
        fatal(E_VHOST_SETUP_FAIL, what);
    }
}

/// A vhost-net device with its two vrings (0 = receive, 1 = transmit)
/// attached to a TAP backend. Construction runs the whole configuration
/// sequence or exits; a half-configured device is never returned.
pub struct VhostDev {
    vhostfd: i32,
    tapfd: i32,
    features: u64,
    kickfd: [i32; 2],
    callfd: [i32; 2],
}

impl VhostDev {
    pub fn open(tapfd: i32, memory: &mut VhostMemory, rings: [&Vring; 2]) -> VhostDev {
        // SAFETY: opening a device node with a static NUL-terminated path.
        let vhostfd = unsafe {
            libc::open(b"/dev/vhost-net\0".as_ptr() as *const libc::c_char, libc::O_RDWR)
        };
        if vhostfd < 0 {
            fatal(E_VHOST_SETUP_FAIL, "open /dev/vhost-net failed");
        }
        ioctl_or_die(vhostfd, VHOST_SET_OWNER, std::ptr::null_mut(), "VHOST_SET_OWNER failed");
        let mut features: u64 = 0;
        ioctl_or_die(
            vhostfd,
            VHOST_GET_FEATURES,
            &mut features as *mut u64 as *mut c_void,
            "VHOST_GET_FEATURES failed",
        );
        ioctl_or_die(
            vhostfd,
            VHOST_SET_MEM_TABLE,
            memory as *mut VhostMemory as *mut c_void,
            "VHOST_SET_MEM_TABLE failed",
        );

        let mut dev = VhostDev { vhostfd, tapfd, features, kickfd: [-1; 2], callfd: [-1; 2] };
        for (index, ring) in rings.into_iter().enumerate() {
            dev.setup_vring(index as u32, ring);
        }
        dev
    }

    fn setup_vring(&mut self, index: u32, ring: &Vring) {
        // SAFETY: eventfd takes no pointers.
        let kickfd = unsafe { libc::eventfd(0, EFD_NONBLOCK) };
        // SAFETY: as above.
        let callfd = unsafe { libc::eventfd(0, EFD_NONBLOCK) };
        if kickfd < 0 || callfd < 0 {
            fatal(E_VHOST_SETUP_FAIL, "eventfd for kick/call failed");
        }
        self.kickfd[index as usize] = kickfd;
        self.callfd[index as usize] = callfd;

        let mut num = VhostVringState { index, num: ring.num() };
        let mut base = VhostVringState { index, num: 0 };
        let mut kick = VhostVringFile { index, fd: kickfd };
        let mut call = VhostVringFile { index, fd: callfd };
        let mut addr = VhostVringAddr {
            index,
            flags: 0,
            desc_user_addr: ring.desc_addr(),
            used_user_addr: ring.used_addr(),
            avail_user_addr: ring.avail_addr(),
            log_guest_addr: 0,
        };
        let mut backend = VhostVringFile { index, fd: self.tapfd };

        let fd = self.vhostfd;
        ioctl_or_die(fd, VHOST_SET_VRING_NUM, &mut num as *mut _ as *mut c_void, "VHOST_SET_VRING_NUM failed");
        ioctl_or_die(fd, VHOST_SET_VRING_BASE, &mut base as *mut _ as *mut c_void, "VHOST_SET_VRING_BASE failed");
        ioctl_or_die(fd, VHOST_SET_VRING_KICK, &mut kick as *mut _ as *mut c_void, "VHOST_SET_VRING_KICK failed");
        ioctl_or_die(fd, VHOST_SET_VRING_CALL, &mut call as *mut _ as *mut c_void, "VHOST_SET_VRING_CALL failed");
        ioctl_or_die(fd, VHOST_SET_VRING_ADDR, &mut addr as *mut _ as *mut c_void, "VHOST_SET_VRING_ADDR failed");
        ioctl_or_die(fd, VHOST_NET_SET_BACKEND, &mut backend as *mut _ as *mut c_void, "VHOST_NET_SET_BACKEND failed");
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn kickfd(&self, index: usize) -> i32 {
        self.kickfd[index]
    }

    /// True if the device signalled the call eventfd since the last check.
    pub fn call_pending(&self, index: usize) -> bool {
        let mut val: u64 = 0;
        // SAFETY: nonblocking 8-byte read from an eventfd.
        let n = unsafe {
            libc::read(self.callfd[index], &mut val as *mut u64 as *mut c_void, 8)
        };
        n == 8 && val > 0
    }
}

impl Drop for VhostDev {
    fn drop(&mut self) {
        // SAFETY: fds below came from successful open/eventfd calls; -1
        // entries are ignored by close with an EBADF we don't care about at
        // teardown.
        unsafe {
            for fd in self.kickfd.iter().chain(self.callfd.iter()) {
                if *fd >= 0 {
                    libc::close(*fd);
                }
            }
            libc::close(self.vhostfd);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
