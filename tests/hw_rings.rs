// PKTRING — INTEGRATION TESTS: HARDWARE RING ADAPTERS
// Runs the exact AF_XDP and virtio ring code against heap-backed mock ring
// memory, with the kernel/device peer simulated in the test. No sockets,
// no /dev/vhost-net — the protocol under test is the shared-memory index
// discipline itself.

use std::os::raw::c_void;

use pktring::network::virtio::{
    vring_region_size, vring_used_offset, VirtQueue, VRING_F_NO_NOTIFY,
};
use pktring::network::xdp::{ConsRing, ProdRing, XdpDesc};

// ============================================================================
// MOCK AF_XDP RING MEMORY
// ============================================================================

const MOCK_RING_SIZE: u32 = 64;

#[repr(C)]
struct MockRing<T> {
    prod: u32,
    cons: u32,
    slots: [T; MOCK_RING_SIZE as usize],
}

impl<T: Copy + Default> MockRing<T> {
    fn boxed() -> Box<MockRing<T>> {
        Box::new(MockRing { prod: 0, cons: 0, slots: [T::default(); MOCK_RING_SIZE as usize] })
    }
}

fn prod_view<T>(m: &mut MockRing<T>) -> ProdRing {
    // SAFETY: the mock ring outlives the view in every test; layout matches
    // the {producer, consumer, slots} contract.
    unsafe {
        ProdRing::from_raw(
            &mut m.prod as *mut u32,
            &mut m.cons as *mut u32,
            m.slots.as_mut_ptr() as *mut c_void,
            MOCK_RING_SIZE,
        )
    }
}

fn cons_view<T>(m: &mut MockRing<T>) -> ConsRing {
    // SAFETY: as prod_view.
    unsafe {
        ConsRing::from_raw(
            &mut m.prod as *mut u32,
            &mut m.cons as *mut u32,
            m.slots.as_mut_ptr() as *mut c_void,
            MOCK_RING_SIZE,
        )
    }
}

// Simulated kernel: consume published entries from a guest-producer ring.
fn kernel_take<T: Copy>(m: *mut MockRing<T>) -> Vec<T> {
    // SAFETY: test-owned mock memory; the simulated peer runs on the same
    // thread, so plain accesses are ordered with the guest's fenced ones.
    unsafe {
        let prod = std::ptr::addr_of!((*m).prod).read_volatile();
        let mut cons = std::ptr::addr_of!((*m).cons).read_volatile();
        let mut taken = Vec::new();
        while cons != prod {
            taken.push((*m).slots[(cons & (MOCK_RING_SIZE - 1)) as usize]);
            cons = cons.wrapping_add(1);
        }
        std::ptr::addr_of_mut!((*m).cons).write_volatile(cons);
        taken
    }
}

// Simulated kernel: publish entries into a guest-consumer ring.
fn kernel_put<T: Copy>(m: *mut MockRing<T>, entries: &[T]) {
    // SAFETY: as kernel_take.
    unsafe {
        let mut prod = std::ptr::addr_of!((*m).prod).read_volatile();
        for e in entries {
            (*m).slots[(prod & (MOCK_RING_SIZE - 1)) as usize] = *e;
            prod = prod.wrapping_add(1);
        }
        std::ptr::addr_of_mut!((*m).prod).write_volatile(prod);
    }
}

// ============================================================================
// TEST 1: fill → RX round-trip — addresses survive unmodified
// ============================================================================

#[test]
fn fill_to_rx_roundtrip_preserves_addresses() {
    let mut fill = MockRing::<u64>::boxed();
    let mut rx = MockRing::<XdpDesc>::boxed();
    let mut fq = prod_view(&mut fill);
    let mut rxq = cons_view(&mut rx);

    let frames = [0x0000u64, 0x0800, 0x1000, 0x1800];
    assert_eq!(fq.enq_addrs(&frames), 4);

    // Kernel side: take fill entries, receive packets into them.
    let taken = kernel_take(&mut *fill);
    assert_eq!(taken, frames, "fill ring delivered the exact addresses");
    let descs: Vec<XdpDesc> =
        taken.iter().map(|&addr| XdpDesc { addr, len: 60, options: 0 }).collect();
    kernel_put(&mut *rx, &descs);

    let mut out = [XdpDesc::default(); 8];
    let n = rxq.deq_descs(&mut out);
    assert_eq!(n, 4);
    for (i, d) in out[..4].iter().enumerate() {
        assert_eq!(d.addr, frames[i], "descriptor address must be unmodified");
        assert_eq!(d.len, 60);
    }
    assert_eq!(rxq.deq_descs(&mut out), 0, "rx ring drained");
}

// ============================================================================
// TEST 2: TX → completion round-trip
// ============================================================================

#[test]
fn tx_to_completion_roundtrip() {
    let mut tx = MockRing::<XdpDesc>::boxed();
    let mut comp = MockRing::<u64>::boxed();
    let mut txq = prod_view(&mut tx);
    let mut cq = cons_view(&mut comp);

    let descs = [
        XdpDesc { addr: 0x2000, len: 1514, options: 0 },
        XdpDesc { addr: 0x2800, len: 64, options: 0 },
    ];
    assert_eq!(txq.enq_descs(&descs), 2);

    // Kernel transmits and hands the frames back through the completion ring.
    let sent = kernel_take(&mut *tx);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].addr, 0x2000);
    assert_eq!(sent[1].len, 64);
    let addrs: Vec<u64> = sent.iter().map(|d| d.addr).collect();
    kernel_put(&mut *comp, &addrs);

    let mut out = [0u64; 8];
    let n = cq.deq_addrs(&mut out);
    assert_eq!(n, 2);
    assert_eq!(&out[..2], &[0x2000, 0x2800]);
}

// ============================================================================
// TEST 3: producer respects capacity until the kernel catches up
// ============================================================================

#[test]
fn producer_full_until_kernel_consumes() {
    let mut fill = MockRing::<u64>::boxed();
    let mut fq = prod_view(&mut fill);

    let addrs: Vec<u64> = (0..MOCK_RING_SIZE as u64).map(|i| i * 0x800).collect();
    assert_eq!(fq.enq_addrs(&addrs), MOCK_RING_SIZE as usize, "ring takes exactly size entries");
    assert_eq!(fq.enq_addrs(&[0xDEAD]), 0, "full ring refuses without blocking");

    // Kernel consumes three entries; the cached consumer index is stale
    // until the next refresh, which the failed enqueue above forces.
    let mut taken = Vec::new();
    // SAFETY: test-owned mock memory.
    unsafe {
        let m: *mut MockRing<u64> = &mut *fill;
        let mut cons = std::ptr::addr_of!((*m).cons).read_volatile();
        for _ in 0..3 {
            taken.push((*m).slots[(cons & (MOCK_RING_SIZE - 1)) as usize]);
            cons = cons.wrapping_add(1);
        }
        std::ptr::addr_of_mut!((*m).cons).write_volatile(cons);
    }
    assert_eq!(taken, vec![0, 0x800, 0x1000]);

    assert_eq!(fq.enq_addrs(&[0xA000, 0xA800, 0xB000]), 3, "freed slots become usable");
    assert_eq!(fq.enq_addrs(&[0xB800]), 0, "and no more than that");
}

// ============================================================================
// TEST 4: consumer on an empty ring returns zero, batch of one works
// ============================================================================

#[test]
fn consumer_empty_and_single_batches() {
    let mut rx = MockRing::<XdpDesc>::boxed();
    let mut rxq = cons_view(&mut rx);

    let mut out = [XdpDesc::default(); 1];
    assert_eq!(rxq.deq_descs(&mut out), 0, "empty ring yields nothing");

    // Latency-bounded callers run batches as small as one descriptor.
    for i in 0..5u64 {
        kernel_put(&mut *rx, &[XdpDesc { addr: i * 0x800, len: 100 + i as u32, options: 0 }]);
        assert_eq!(rxq.deq_descs(&mut out), 1);
        assert_eq!(out[0].addr, i * 0x800);
        assert_eq!(out[0].len, 100 + i as u32);
    }
}

// ============================================================================
// TEST 4b: frame lifecycle — pool → fill ring → kernel → completion → pool
// ============================================================================

#[test]
fn frames_recycle_through_fill_and_completion() {
    use pktring::packet::FramePool;

    const FRAME_SIZE: u32 = 2048;
    let mut umem = vec![0u8; 16 * FRAME_SIZE as usize];
    // SAFETY: umem outlives the pool.
    let mut pool = unsafe { FramePool::from_raw(umem.as_mut_ptr(), umem.len(), FRAME_SIZE) };

    let mut fill = MockRing::<u64>::boxed();
    let mut comp = MockRing::<u64>::boxed();
    let mut fq = prod_view(&mut fill);
    let mut cq = cons_view(&mut comp);

    // Hand 8 frames to the kernel.
    let mut offsets = Vec::new();
    for _ in 0..8 {
        let idx = pool.alloc().expect("pool has frames");
        offsets.push(pool.frame_offset(idx));
    }
    assert_eq!(fq.enq_addrs(&offsets), 8);
    assert_eq!(pool.available(), 8);

    // Kernel consumes them and completes the same addresses.
    let taken = kernel_take(&mut *fill);
    kernel_put(&mut *comp, &taken);

    // Recycle: every completed offset maps back to a pool index.
    let mut out = [0u64; 16];
    let n = cq.deq_addrs(&mut out);
    assert_eq!(n, 8);
    for &addr in &out[..n] {
        pool.free(pool.offset_to_index(addr));
    }
    assert_eq!(pool.available(), 16, "every frame returned to the pool");
}

// ============================================================================
// MOCK VRING MEMORY + DEVICE SIMULATION
// ============================================================================

struct AlignedRegion {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl AlignedRegion {
    fn new(size: usize) -> AlignedRegion {
        let layout = std::alloc::Layout::from_size_align(size, 4096).unwrap();
        // SAFETY: nonzero size, valid alignment; checked for null below.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        AlignedRegion { ptr, layout }
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/layout from the successful alloc above.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// Device side of a vring: walks the avail ring, reads descriptors, and
/// completes them into the used ring.
struct DeviceSim {
    base: *mut u8,
    num: u32,
    last_avail: u16,
}

impl DeviceSim {
    fn new(base: *mut u8, num: u32) -> DeviceSim {
        DeviceSim { base, num, last_avail: 0 }
    }

    /// Complete every pending avail entry with `written` bytes. Returns the
    /// (head, addr, len) triples it saw.
    fn complete_pending(&mut self, written: u32) -> Vec<(u16, u64, u32)> {
        let mask = (self.num - 1) as u16;
        let desc_bytes = self.num as usize * 16;
        let used_off = vring_used_offset(self.num);
        let mut seen = Vec::new();
        // SAFETY: test-owned region; same-thread simulated peer.
        unsafe {
            let avail_idx = (self.base.add(desc_bytes + 2) as *const u16).read_volatile();
            let avail_ring = self.base.add(desc_bytes + 4) as *const u16;
            let used_idx_ptr = self.base.add(used_off + 2) as *mut u16;
            let used_ring = self.base.add(used_off + 4) as *mut [u32; 2];
            let mut used_idx = used_idx_ptr.read_volatile();
            while self.last_avail != avail_idx {
                let head = avail_ring.add((self.last_avail & mask) as usize).read_volatile();
                let d = self.base.add((head & mask) as usize * 16);
                let addr = (d as *const u64).read_volatile();
                let len = (d.add(8) as *const u32).read_volatile();
                seen.push((head, addr, len));
                used_ring
                    .add((used_idx & mask) as usize)
                    .write_volatile([head as u32, written]);
                used_idx = used_idx.wrapping_add(1);
                self.last_avail = self.last_avail.wrapping_add(1);
            }
            used_idx_ptr.write_volatile(used_idx);
        }
        seen
    }
}

// ============================================================================
// TEST 5: avail → used round-trip — the chain head comes back unmodified
// ============================================================================

#[test]
fn vring_publish_complete_roundtrip() {
    const NUM: u32 = 8;
    let region = AlignedRegion::new(vring_region_size(NUM));
    // SAFETY: region is zeroed, page-aligned, and outlives the queue.
    let mut vq = unsafe { VirtQueue::new(region.ptr, NUM, -1) };
    let mut dev = DeviceSim::new(region.ptr, NUM);

    let mut heads = Vec::new();
    for i in 0..3u64 {
        let head = vq.publish(0x1_0000 + i * 0x1000, 1600, true).expect("free descriptors");
        heads.push(head);
    }

    let seen = dev.complete_pending(52);
    assert_eq!(seen.len(), 3);
    for (i, &(head, addr, len)) in seen.iter().enumerate() {
        assert_eq!(head, heads[i], "avail ring delivers heads in publish order");
        assert_eq!(addr, 0x1_0000 + i as u64 * 0x1000, "descriptor address unmodified");
        assert_eq!(len, 1600);
    }

    for &head in &heads {
        let elem = vq.poll_used().expect("completion pending");
        assert_eq!(elem.id, head as u32);
        assert_eq!(elem.len, 52);
    }
    assert!(vq.poll_used().is_none(), "used ring drained");
    assert_eq!(vq.num_free(), NUM as u16, "all descriptors reclaimed");
}

// ============================================================================
// TEST 6: descriptor table exhaustion and recycle
// ============================================================================

#[test]
fn vring_descriptor_exhaustion() {
    const NUM: u32 = 4;
    let region = AlignedRegion::new(vring_region_size(NUM));
    // SAFETY: as above.
    let mut vq = unsafe { VirtQueue::new(region.ptr, NUM, -1) };
    let mut dev = DeviceSim::new(region.ptr, NUM);

    for i in 0..NUM as u64 {
        assert!(vq.publish(i * 0x1000, 64, false).is_some());
    }
    assert!(vq.publish(0xFFFF, 64, false).is_none(), "no free descriptors left");

    dev.complete_pending(0);
    assert!(vq.poll_used().is_some());
    assert!(vq.publish(0xFFFF, 64, false).is_some(), "reclaimed descriptor is reusable");
}

// ============================================================================
// TEST 7: kick fires the eventfd unless the device suppresses it
// ============================================================================

#[test]
fn vring_kick_respects_no_notify() {
    const NUM: u32 = 8;
    let region = AlignedRegion::new(vring_region_size(NUM));
    // SAFETY: eventfd takes no pointers.
    let kickfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
    assert!(kickfd >= 0);
    // SAFETY: as above.
    let mut vq = unsafe { VirtQueue::new(region.ptr, NUM, kickfd) };

    vq.publish(0x1000, 64, false).unwrap();
    let mut val: u64 = 0;
    // SAFETY: 8-byte read from our eventfd.
    let n = unsafe { libc::read(kickfd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    assert_eq!(n, 8, "publish must kick the device");
    assert!(val >= 1);

    // Device suppresses notifications.
    // SAFETY: used.flags is the first u16 of the used ring area.
    unsafe {
        (region.ptr.add(vring_used_offset(NUM)) as *mut u16).write_volatile(VRING_F_NO_NOTIFY);
    }
    vq.publish(0x2000, 64, false).unwrap();
    // SAFETY: as above.
    let n = unsafe { libc::read(kickfd, &mut val as *mut u64 as *mut libc::c_void, 8) };
    assert!(n < 0, "suppressed kick must not signal the eventfd");

    // SAFETY: closing our own fd.
    unsafe { libc::close(kickfd) };
}
