// PKTRING — PACKET BUFFER MODEL
// A packet is a fixed-capacity frame carved from a DMA region: a 2-byte
// length header followed by payload. The frame's address is the handle that
// moves through the software links (never zero, so it coexists with the
// sentinel ring) and, as a region offset, through the hardware rings.
//
// Frames are recycled through the pool's index slab, never freed
// individually; the pool dies with its region at teardown.

use crate::engine::runtime::FrameSlab;
use crate::memory::{DmaRegion, Pagemap};

/// Generic packet payload ceiling.
pub const PACKET_PAYLOAD_MAX: usize = 10 * 1024;
/// AF_XDP umem frame size.
pub const XDP_FRAME_SIZE: u32 = 2048;
/// Frame size used on shared-memory device rings.
pub const SHM_FRAME_SIZE: u32 = 1600;

/// In-frame header: current valid payload length.
pub const PACKET_HDR_SIZE: u32 = 2;

// ============================================================================
// PACKET VIEW
// ============================================================================

/// Mutable view of one frame. Holds no ownership — the pool slab does.
pub struct Packet {
    ptr: *mut u8,
    capacity: u32,
}

impl Packet {
    /// # Safety
    /// `ptr` must point at the start of a live frame of `frame_size` bytes,
    /// and the caller must be the frame's current exclusive owner.
    #[inline(always)]
    pub unsafe fn from_frame(ptr: *mut u8, frame_size: u32) -> Packet {
        debug_assert!(frame_size > PACKET_HDR_SIZE);
        Packet { ptr, capacity: frame_size - PACKET_HDR_SIZE }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        // SAFETY: header bytes are inside the frame by construction.
        let mut b = [0u8; 2];
        unsafe { std::ptr::copy_nonoverlapping(self.ptr, b.as_mut_ptr(), 2); }
        u16::from_ne_bytes(b) as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Panics if `len` exceeds the frame capacity — the one packet invariant.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity as usize, "packet length exceeds capacity");
        let b = (len as u16).to_ne_bytes();
        // SAFETY: header bytes are inside the frame by construction.
        unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), self.ptr, 2); }
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        let len = self.len();
        // SAFETY: len <= capacity is enforced by set_len; payload starts
        // after the header and stays inside the frame.
        unsafe { std::slice::from_raw_parts(self.ptr.add(PACKET_HDR_SIZE as usize), len) }
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.len();
        // SAFETY: as data(), and we hold the frame exclusively.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(PACKET_HDR_SIZE as usize), len) }
    }

    /// The frame address used as the link datum. Never zero.
    #[inline(always)]
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }
}

// ============================================================================
// FRAME POOL
// ============================================================================

/// Carves a memory region into `frame_size` frames and recycles them by
/// index through a LIFO slab.
pub struct FramePool {
    base: *mut u8,
    frame_size: u32,
    nframes: u32,
    slab: FrameSlab,
    // Keeps the hugepage mapping alive for pool-owned regions. Pools built
    // with from_raw borrow memory owned elsewhere (a umem, a test arena).
    _region: Option<DmaRegion>,
}

// SAFETY: the pool is used from one thread; frames handed out travel between
// threads under the link ownership protocol.
unsafe impl Send for FramePool {}

impl FramePool {
    pub fn new(region: DmaRegion, frame_size: u32) -> FramePool {
        assert!(frame_size.is_power_of_two(), "frame size must be a power of two");
        assert!(frame_size > PACKET_HDR_SIZE);
        let nframes = (region.len() / frame_size as usize) as u32;
        assert!(nframes > 0, "region smaller than one frame");
        FramePool {
            base: region.as_ptr(),
            frame_size,
            nframes,
            slab: FrameSlab::new(nframes as usize),
            _region: Some(region),
        }
    }

    /// Pool over memory owned elsewhere (an AF_XDP umem area, a test arena).
    ///
    /// # Safety
    /// `base..base+len` must stay valid and unaliased for the pool lifetime.
    pub unsafe fn from_raw(base: *mut u8, len: usize, frame_size: u32) -> FramePool {
        assert!(frame_size.is_power_of_two(), "frame size must be a power of two");
        assert!(frame_size > PACKET_HDR_SIZE);
        let nframes = (len / frame_size as usize) as u32;
        assert!(nframes > 0, "region smaller than one frame");
        FramePool { base, frame_size, nframes, slab: FrameSlab::new(nframes as usize), _region: None }
    }

    #[inline(always)]
    pub fn alloc(&mut self) -> Option<u32> {
        self.slab.alloc()
    }

    #[inline(always)]
    pub fn free(&mut self, idx: u32) {
        debug_assert!(idx < self.nframes);
        self.slab.free(idx);
    }

    #[inline(always)]
    pub fn available(&self) -> usize {
        self.slab.available()
    }

    #[inline(always)]
    pub fn nframes(&self) -> u32 {
        self.nframes
    }

    #[inline(always)]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Byte offset of a frame inside the region — the address form hardware
    /// rings carry.
    #[inline(always)]
    pub fn frame_offset(&self, idx: u32) -> u64 {
        debug_assert!(idx < self.nframes);
        idx as u64 * self.frame_size as u64
    }

    /// Frame index back from a ring-carried offset.
    #[inline(always)]
    pub fn offset_to_index(&self, offset: u64) -> u32 {
        (offset / self.frame_size as u64) as u32
    }

    #[inline(always)]
    pub fn frame_ptr(&self, idx: u32) -> *mut u8 {
        debug_assert!(idx < self.nframes);
        // SAFETY: idx < nframes keeps the offset inside the region.
        unsafe { self.base.add(idx as usize * self.frame_size as usize) }
    }

    /// Packet view of a frame the caller currently owns.
    ///
    /// # Safety
    /// The caller must hold `idx` allocated and be its only user.
    #[inline(always)]
    pub unsafe fn packet(&self, idx: u32) -> Packet {
        Packet::from_frame(self.frame_ptr(idx), self.frame_size)
    }

    /// Physical address of a frame, for descriptor rings programmed with
    /// physical memory. None if the page is not resident or hidden.
    pub fn frame_phys(&self, pagemap: &Pagemap, idx: u32) -> Option<u64> {
        pagemap.translate(self.frame_ptr(idx))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_pool(frames: usize, frame_size: u32) -> (Vec<u8>, FramePool) {
        let mut arena = vec![0u8; frames * frame_size as usize];
        // SAFETY: arena outlives the pool in every test below.
        let pool = unsafe { FramePool::from_raw(arena.as_mut_ptr(), arena.len(), frame_size) };
        (arena, pool)
    }

    #[test]
    fn pool_carves_expected_frame_count() {
        let (_arena, pool) = heap_pool(16, 2048);
        assert_eq!(pool.nframes(), 16);
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.frame_offset(3), 3 * 2048);
        assert_eq!(pool.offset_to_index(3 * 2048), 3);
    }

    #[test]
    fn packet_len_roundtrip() {
        let (_arena, mut pool) = heap_pool(4, 2048);
        let idx = pool.alloc().unwrap();
        // SAFETY: idx freshly allocated, single-threaded test.
        let mut pkt = unsafe { pool.packet(idx) };
        assert_eq!(pkt.len(), 0);
        pkt.set_len(60);
        pkt.data_mut().fill(0xEE);
        assert_eq!(pkt.len(), 60);
        assert!(pkt.data().iter().all(|&b| b == 0xEE));
        pool.free(idx);
    }

    #[test]
    #[should_panic(expected = "exceeds capacity")]
    fn packet_len_cannot_exceed_capacity() {
        let (_arena, mut pool) = heap_pool(1, 2048);
        let idx = pool.alloc().unwrap();
        // SAFETY: idx freshly allocated, single-threaded test.
        let mut pkt = unsafe { pool.packet(idx) };
        pkt.set_len(2047); // capacity is 2048 - 2
    }

    #[test]
    fn pool_exhaustion_and_recycle() {
        let (_arena, mut pool) = heap_pool(2, 2048);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
        pool.free(b);
        pool.free(a);
        assert_eq!(pool.available(), 2);
        // LIFO: last freed comes back first.
        assert_eq!(pool.alloc(), Some(a));
    }

    #[test]
    fn frame_addr_is_nonzero_link_datum() {
        let (_arena, mut pool) = heap_pool(2, 2048);
        let idx = pool.alloc().unwrap();
        // SAFETY: idx freshly allocated, single-threaded test.
        let pkt = unsafe { pool.packet(idx) };
        assert_ne!(pkt.addr(), 0);
    }
}
