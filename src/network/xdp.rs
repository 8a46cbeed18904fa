// PKTRING — NETWORK: AF_XDP RINGS
// Four rings per socket: fill and completion (u64 frame offsets) on the
// umem, RX and TX (descriptors) on the socket. Each ring is a kernel-shared
// {producer, consumer, slots} triple mapped at a fixed page offset; this
// side keeps cached copies of both indices and refreshes the *other side's*
// only when the local view says there is not enough room or data.
//
// The ABI surface (struct layouts, socket options, mmap offsets) is small
// and declared here directly against linux/if_xdp.h.

use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use bytemuck::{Pod, Zeroable};
use libc::{c_void, MAP_FAILED, MAP_POPULATE, MAP_SHARED, MSG_DONTWAIT, PROT_READ, PROT_WRITE};

use crate::engine::runtime::{fatal, E_KICK_FAIL, E_RING_GEOMETRY, E_XSK_SETUP_FAIL};
use crate::memory::DmaRegion;
use crate::packet::FramePool;

// ============================================================================
// KERNEL ABI (linux/if_xdp.h)
// ============================================================================

pub const PF_XDP: i32 = 44;
pub const SOL_XDP: i32 = 283;

// Socket options
pub const XDP_MMAP_OFFSETS: i32 = 1;
pub const XDP_RX_RING: i32 = 1;
pub const XDP_TX_RING: i32 = 2;
pub const XDP_UMEM_REG: i32 = 3;
pub const XDP_UMEM_FILL_RING: i32 = 4;
pub const XDP_UMEM_COMPLETION_RING: i32 = 5;

// mmap page offsets selecting which ring a mapping refers to
pub const XDP_PGOFF_RX_RING: i64 = 0;
pub const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
pub const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
pub const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

// Bind flags
pub const XDP_SHARED_UMEM: u16 = 1 << 0;
pub const XDP_COPY: u16 = 1 << 1;
pub const XDP_ZEROCOPY: u16 = 1 << 2;
pub const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

/// RX/TX ring slot: frame offset in the umem plus frame length.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct XdpUmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct XdpRingOffset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct XdpMmapOffsets {
    pub rx: XdpRingOffset,
    pub tx: XdpRingOffset,
    pub fr: XdpRingOffset,
    pub cr: XdpRingOffset,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Zeroable)]
pub struct SockaddrXdp {
    pub sxdp_family: u16,
    pub sxdp_flags: u16,
    pub sxdp_ifindex: u32,
    pub sxdp_queue_id: u32,
    pub sxdp_shared_umem_fd: u32,
}

// ============================================================================
// RING OPERATIONS
// ============================================================================

/// Producer side of a kernel-shared ring (fill, TX). `cached_prod` is the
/// local write cursor; `cached_cons` is a stale copy of the kernel's read
/// cursor, refreshed only when the stale view is too full.
pub struct ProdRing {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut c_void,
    mask: u32,
    size: u32,
    cached_prod: u32,
    cached_cons: u32,
}

// SAFETY: a ring half is owned by exactly one thread; the shared words are
// only touched through atomics + fences.
unsafe impl Send for ProdRing {}

impl ProdRing {
    /// # Safety
    /// The three pointers must address a live mapping laid out as a
    /// {producer word, consumer word, size slots} ring of the given size.
    pub unsafe fn from_raw(
        producer: *mut u32,
        consumer: *mut u32,
        ring: *mut c_void,
        size: u32,
    ) -> ProdRing {
        if !size.is_power_of_two() {
            fatal(E_RING_GEOMETRY, "xdp ring size must be a power of two");
        }
        let init = (*(producer as *const AtomicU32)).load(Ordering::Relaxed);
        let cons = (*(consumer as *const AtomicU32)).load(Ordering::Relaxed);
        ProdRing {
            producer,
            consumer,
            ring,
            mask: size - 1,
            size,
            cached_prod: init,
            cached_cons: cons,
        }
    }

    /// Free slots, crossing the interconnect only if the cached view cannot
    /// satisfy `want`.
    #[inline(always)]
    pub fn free_slots(&mut self, want: u32) -> u32 {
        let mut free = self.size - self.cached_prod.wrapping_sub(self.cached_cons);
        if free < want {
            // SAFETY: consumer word lives in the shared mapping.
            self.cached_cons =
                unsafe { (*(self.consumer as *const AtomicU32)).load(Ordering::Acquire) };
            free = self.size - self.cached_prod.wrapping_sub(self.cached_cons);
        }
        free
    }

    #[inline(always)]
    fn stage_addr(&mut self, addr: u64) {
        // SAFETY: index masked to the slot array; the slot is invisible to
        // the kernel until commit() publishes the producer index.
        unsafe {
            *(self.ring as *mut u64).add((self.cached_prod & self.mask) as usize) = addr;
        }
        self.cached_prod = self.cached_prod.wrapping_add(1);
    }

    #[inline(always)]
    fn stage_desc(&mut self, desc: XdpDesc) {
        // SAFETY: as stage_addr.
        unsafe {
            *(self.ring as *mut XdpDesc).add((self.cached_prod & self.mask) as usize) = desc;
        }
        self.cached_prod = self.cached_prod.wrapping_add(1);
    }

    /// Publish everything staged: one write barrier for the whole batch,
    /// then the producer-index store the kernel polls.
    #[inline(always)]
    pub fn commit(&mut self) {
        fence(Ordering::Release);
        // SAFETY: producer word lives in the shared mapping.
        unsafe {
            (*(self.producer as *const AtomicU32)).store(self.cached_prod, Ordering::Relaxed);
        }
    }

    /// Batch-enqueue frame offsets (fill ring). Returns how many were taken;
    /// zero when the kernel has not consumed enough yet — never blocks.
    pub fn enq_addrs(&mut self, addrs: &[u64]) -> usize {
        let n = (self.free_slots(addrs.len() as u32) as usize).min(addrs.len());
        if n == 0 {
            return 0;
        }
        for &a in &addrs[..n] {
            self.stage_addr(a);
        }
        self.commit();
        n
    }

    /// Batch-enqueue descriptors (TX ring).
    pub fn enq_descs(&mut self, descs: &[XdpDesc]) -> usize {
        let n = (self.free_slots(descs.len() as u32) as usize).min(descs.len());
        if n == 0 {
            return 0;
        }
        for &d in &descs[..n] {
            self.stage_desc(d);
        }
        self.commit();
        n
    }
}

/// Consumer side of a kernel-shared ring (RX, completion).
pub struct ConsRing {
    producer: *mut u32,
    consumer: *mut u32,
    ring: *mut c_void,
    mask: u32,
    cached_prod: u32,
    cached_cons: u32,
}

// SAFETY: as ProdRing.
unsafe impl Send for ConsRing {}

impl ConsRing {
    /// # Safety
    /// As ProdRing::from_raw.
    pub unsafe fn from_raw(
        producer: *mut u32,
        consumer: *mut u32,
        ring: *mut c_void,
        size: u32,
    ) -> ConsRing {
        if !size.is_power_of_two() {
            fatal(E_RING_GEOMETRY, "xdp ring size must be a power of two");
        }
        let prod = (*(producer as *const AtomicU32)).load(Ordering::Relaxed);
        let cons = (*(consumer as *const AtomicU32)).load(Ordering::Relaxed);
        ConsRing { producer, consumer, ring, mask: size - 1, cached_prod: prod, cached_cons: cons }
    }

    /// Entries ready to consume. Refreshes the kernel's producer index only
    /// when the cached view is empty; the Acquire fence orders the slot
    /// reads after the index read.
    #[inline(always)]
    pub fn available(&mut self) -> u32 {
        let mut avail = self.cached_prod.wrapping_sub(self.cached_cons);
        if avail == 0 {
            // SAFETY: producer word lives in the shared mapping.
            self.cached_prod =
                unsafe { (*(self.producer as *const AtomicU32)).load(Ordering::Relaxed) };
            fence(Ordering::Acquire);
            avail = self.cached_prod.wrapping_sub(self.cached_cons);
        }
        avail
    }

    /// Batch-dequeue frame offsets (completion ring). Zero when empty.
    pub fn deq_addrs(&mut self, out: &mut [u64]) -> usize {
        let n = (self.available() as usize).min(out.len());
        for slot in out.iter_mut().take(n) {
            // SAFETY: index masked; entries up to cached_prod were published
            // by the kernel before the producer-index store we acquired.
            *slot = unsafe {
                *(self.ring as *const u64).add((self.cached_cons & self.mask) as usize)
            };
            self.cached_cons = self.cached_cons.wrapping_add(1);
        }
        if n > 0 {
            // SAFETY: consumer word lives in the shared mapping. Release
            // hands the consumed slots back to the kernel.
            unsafe {
                (*(self.consumer as *const AtomicU32)).store(self.cached_cons, Ordering::Release);
            }
        }
        n
    }

    /// Batch-dequeue descriptors (RX ring). Zero when empty.
    pub fn deq_descs(&mut self, out: &mut [XdpDesc]) -> usize {
        let n = (self.available() as usize).min(out.len());
        for slot in out.iter_mut().take(n) {
            // SAFETY: as deq_addrs.
            *slot = unsafe {
                *(self.ring as *const XdpDesc).add((self.cached_cons & self.mask) as usize)
            };
            self.cached_cons = self.cached_cons.wrapping_add(1);
        }
        if n > 0 {
            // SAFETY: as deq_addrs.
            unsafe {
                (*(self.consumer as *const AtomicU32)).store(self.cached_cons, Ordering::Release);
            }
        }
        n
    }
}

// ============================================================================
// SOCKET SETUP
// ============================================================================

#[derive(Clone, Copy)]
pub struct XskConfig {
    pub fill_size: u32,
    pub comp_size: u32,
    pub rx_size: u32,
    pub tx_size: u32,
    pub frame_size: u32,
    pub bind_flags: u16,
}

impl Default for XskConfig {
    fn default() -> Self {
        XskConfig {
            fill_size: 4096,
            comp_size: 4096,
            rx_size: 2048,
            tx_size: 2048,
            frame_size: crate::packet::XDP_FRAME_SIZE,
            bind_flags: XDP_ZEROCOPY | XDP_USE_NEED_WAKEUP,
        }
    }
}

/// One mmapped ring region. Unmapped when the socket is torn down.
struct RingMap {
    map: *mut u8,
    len: usize,
}

impl Drop for RingMap {
    fn drop(&mut self) {
        // SAFETY: map/len came from a successful mmap.
        unsafe { libc::munmap(self.map as *mut c_void, self.len); }
    }
}

/// An AF_XDP socket bound to one interface queue, with its four rings over a
/// caller-owned umem region. Setup either fully succeeds or the process
/// exits — a half-configured ring must never carry traffic.
pub struct XskSocket {
    fd: i32,
    pub fq: ProdRing,
    pub cq: ConsRing,
    pub rx: ConsRing,
    pub tx: ProdRing,
    outstanding_tx: u32,
    _maps: [RingMap; 4],
}

// SAFETY: the socket and its ring halves are driven by one datapath thread.
unsafe impl Send for XskSocket {}

fn setsockopt_or_die(fd: i32, opt: i32, val: *const c_void, len: u32, what: &str) {
    // SAFETY: caller passes a live value of `len` bytes.
    if unsafe { libc::setsockopt(fd, SOL_XDP, opt, val, len) } != 0 {
        fatal(E_XSK_SETUP_FAIL, what);
    }
}

fn map_ring(fd: i32, len: usize, pgoff: i64, what: &str) -> RingMap {
    // SAFETY: mapping a kernel ring; result checked against MAP_FAILED.
    let map = unsafe {
        libc::mmap(ptr::null_mut(), len, PROT_READ | PROT_WRITE, MAP_SHARED | MAP_POPULATE, fd, pgoff)
    };
    if map == MAP_FAILED {
        fatal(E_XSK_SETUP_FAIL, what);
    }
    RingMap { map: map as *mut u8, len }
}

impl XskSocket {
    pub fn bind(ifname: &str, queue_id: u32, umem: &DmaRegion, cfg: &XskConfig) -> XskSocket {
        for sz in [cfg.fill_size, cfg.comp_size, cfg.rx_size, cfg.tx_size] {
            if !sz.is_power_of_two() {
                fatal(E_RING_GEOMETRY, "xsk ring sizes must be powers of two");
            }
        }
        if umem.len() % cfg.frame_size as usize != 0 {
            fatal(E_RING_GEOMETRY, "umem length not a multiple of the frame size");
        }

        // SAFETY: plain socket(2) call.
        let fd = unsafe { libc::socket(PF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            fatal(E_XSK_SETUP_FAIL, "socket(AF_XDP) failed — kernel lacks AF_XDP support");
        }

        let reg = XdpUmemReg {
            addr: umem.as_ptr() as u64,
            len: umem.len() as u64,
            chunk_size: cfg.frame_size,
            headroom: 0,
            flags: 0,
        };
        setsockopt_or_die(
            fd,
            XDP_UMEM_REG,
            &reg as *const _ as *const c_void,
            mem::size_of::<XdpUmemReg>() as u32,
            "XDP_UMEM_REG rejected",
        );
        setsockopt_or_die(
            fd,
            XDP_UMEM_FILL_RING,
            &cfg.fill_size as *const _ as *const c_void,
            4,
            "XDP_UMEM_FILL_RING rejected",
        );
        setsockopt_or_die(
            fd,
            XDP_UMEM_COMPLETION_RING,
            &cfg.comp_size as *const _ as *const c_void,
            4,
            "XDP_UMEM_COMPLETION_RING rejected",
        );
        setsockopt_or_die(
            fd,
            XDP_RX_RING,
            &cfg.rx_size as *const _ as *const c_void,
            4,
            "XDP_RX_RING rejected",
        );
        setsockopt_or_die(
            fd,
            XDP_TX_RING,
            &cfg.tx_size as *const _ as *const c_void,
            4,
            "XDP_TX_RING rejected",
        );

        let mut off = XdpMmapOffsets::default();
        let mut optlen = mem::size_of::<XdpMmapOffsets>() as u32;
        // SAFETY: off is a live struct of optlen bytes.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                SOL_XDP,
                XDP_MMAP_OFFSETS,
                &mut off as *mut _ as *mut c_void,
                &mut optlen,
            )
        };
        if ret != 0 {
            fatal(E_XSK_SETUP_FAIL, "getsockopt XDP_MMAP_OFFSETS failed — kernel ABI mismatch");
        }

        let fq_map = map_ring(
            fd,
            off.fr.desc as usize + cfg.fill_size as usize * 8,
            XDP_UMEM_PGOFF_FILL_RING,
            "fill ring mmap failed",
        );
        let cq_map = map_ring(
            fd,
            off.cr.desc as usize + cfg.comp_size as usize * 8,
            XDP_UMEM_PGOFF_COMPLETION_RING,
            "completion ring mmap failed",
        );
        let rx_map = map_ring(
            fd,
            off.rx.desc as usize + cfg.rx_size as usize * mem::size_of::<XdpDesc>(),
            XDP_PGOFF_RX_RING,
            "rx ring mmap failed",
        );
        let tx_map = map_ring(
            fd,
            off.tx.desc as usize + cfg.tx_size as usize * mem::size_of::<XdpDesc>(),
            XDP_PGOFF_TX_RING,
            "tx ring mmap failed",
        );

        // SAFETY: each mapping covers {producer, consumer, slots} at the
        // offsets the kernel just reported.
        let (fq, cq, rx, tx) = unsafe {
            (
                ProdRing::from_raw(
                    fq_map.map.add(off.fr.producer as usize) as *mut u32,
                    fq_map.map.add(off.fr.consumer as usize) as *mut u32,
                    fq_map.map.add(off.fr.desc as usize) as *mut c_void,
                    cfg.fill_size,
                ),
                ConsRing::from_raw(
                    cq_map.map.add(off.cr.producer as usize) as *mut u32,
                    cq_map.map.add(off.cr.consumer as usize) as *mut u32,
                    cq_map.map.add(off.cr.desc as usize) as *mut c_void,
                    cfg.comp_size,
                ),
                ConsRing::from_raw(
                    rx_map.map.add(off.rx.producer as usize) as *mut u32,
                    rx_map.map.add(off.rx.consumer as usize) as *mut u32,
                    rx_map.map.add(off.rx.desc as usize) as *mut c_void,
                    cfg.rx_size,
                ),
                ProdRing::from_raw(
                    tx_map.map.add(off.tx.producer as usize) as *mut u32,
                    tx_map.map.add(off.tx.consumer as usize) as *mut u32,
                    tx_map.map.add(off.tx.desc as usize) as *mut c_void,
                    cfg.tx_size,
                ),
            )
        };

        let ifname_c = match std::ffi::CString::new(ifname) {
            Ok(c) => c,
            Err(_) => fatal(E_XSK_SETUP_FAIL, "interface name contains a null byte"),
        };
        // SAFETY: NUL-terminated name.
        let ifindex = unsafe { libc::if_nametoindex(ifname_c.as_ptr()) };
        if ifindex == 0 {
            fatal(E_XSK_SETUP_FAIL, "interface does not exist");
        }

        let sxdp = SockaddrXdp {
            sxdp_family: PF_XDP as u16,
            sxdp_flags: cfg.bind_flags,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };
        // SAFETY: sxdp is a live sockaddr_xdp.
        let ret = unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrXdp>() as u32,
            )
        };
        if ret != 0 {
            fatal(E_XSK_SETUP_FAIL, "bind(AF_XDP) failed — driver lacks the requested mode");
        }

        XskSocket { fd, fq, cq, rx, tx, outstanding_tx: 0, _maps: [fq_map, cq_map, rx_map, tx_map] }
    }

    #[inline(always)]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Tell the kernel the TX ring has news. Unconditional: the need-wakeup
    /// flag can go stale when the datapath stalls, and a spurious kick is
    /// cheaper than a stranded ring. EAGAIN/EBUSY/ENOBUFS are transient
    /// backpressure; the driver drains by the next tick.
    pub fn kick_tx(&self) {
        // SAFETY: zero-length send on our own socket.
        let res = unsafe { libc::sendto(self.fd, ptr::null(), 0, MSG_DONTWAIT, ptr::null(), 0) };
        if res < 0 {
            // SAFETY: errno read immediately after the failed call.
            let e = unsafe { *libc::__errno_location() };
            if e != libc::EAGAIN && e != libc::EBUSY && e != libc::ENOBUFS {
                fatal(E_KICK_FAIL, "tx kick failed with a non-transient error (ENXIO/EBADF)");
            }
        }
    }

    /// Enqueue descriptors on the TX ring and kick. Returns how many were
    /// accepted; the rest stay with the caller.
    pub fn transmit(&mut self, descs: &[XdpDesc]) -> usize {
        let n = self.tx.enq_descs(descs);
        if n > 0 {
            self.outstanding_tx += n as u32;
            self.kick_tx();
        }
        n
    }

    /// Drain the completion ring back into the frame pool. Returns frames
    /// recycled.
    pub fn recycle_tx(&mut self, pool: &mut FramePool) -> usize {
        let mut addrs = [0u64; 64];
        let mut total = 0usize;
        loop {
            let n = self.cq.deq_addrs(&mut addrs);
            for &a in &addrs[..n] {
                pool.free(pool.offset_to_index(a));
            }
            total += n;
            if n < addrs.len() {
                break;
            }
        }
        self.outstanding_tx = self.outstanding_tx.saturating_sub(total as u32);
        total
    }

    /// Top up the fill ring from the pool so the kernel always has RX
    /// frames. Frames that do not fit stay in the pool.
    pub fn refill_fill(&mut self, pool: &mut FramePool) -> usize {
        let want = self.fq.free_slots(1) as usize;
        if want == 0 {
            return 0;
        }
        let mut staged = 0usize;
        for _ in 0..want {
            match pool.alloc() {
                Some(idx) => {
                    self.fq.stage_addr(pool.frame_offset(idx));
                    staged += 1;
                }
                None => break,
            }
        }
        if staged > 0 {
            self.fq.commit();
        }
        staged
    }

    /// Pull received descriptors. Zero when the RX ring is empty.
    pub fn poll_rx(&mut self, out: &mut [XdpDesc]) -> usize {
        self.rx.deq_descs(out)
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        // SAFETY: fd came from a successful socket(2).
        unsafe { libc::close(self.fd); }
    }
}
