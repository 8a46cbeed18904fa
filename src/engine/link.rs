// PKTRING — ENGINE: SPSC SOFTWARE LINKS
// Two lock-free ring variants behind one transmit/receive contract.
//
// Variant A ("cursor"): classic circular buffer with separate read/write
// cursors. Empty when read == write, full when (write+1) & mask == read, so
// one slot is always kept empty and depth-1 slots are usable. The cursors
// and the slot array share cache lines on purpose — this variant is the
// contention baseline the sentinel ring is measured against.
//
// Variant B ("sentinel", FastForward-style): the slot array is the only
// shared state. A slot holding 0 is empty; anything else is a live datum.
// Each side keeps its cursor in its own handle, so the cursors never cross
// a core boundary. Costs one extra store (the consumer's sentinel clear) to
// eliminate the shared-cursor cache-line bounce.
//
// Both carry u64 data — typically a frame address from the pool, which is
// never zero, or a raw tag value in the benchmark harness.
//
// Hard SPSC contract: exactly one thread owns each handle. Handles are Send
// but not Clone, so a second producer cannot be constructed safely.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::runtime::{CachePadded, Counter};

/// Reserved sentinel meaning "slot empty" in the sentinel ring.
pub const EMPTY_SLOT: u64 = 0;

// ============================================================================
// LINK STATISTICS
// ============================================================================

/// Per-link counters. txpackets/txdrop are written only by the producer
/// side, rxpackets only by the consumer side; any thread may read them
/// (approximate reads are fine — they are Relaxed diagnostics). Padding
/// keeps the producer-written and consumer-written lines apart.
pub struct LinkStats {
    pub txpackets: CachePadded<Counter>,
    pub txdrop: CachePadded<Counter>,
    pub rxpackets: CachePadded<Counter>,
}

impl Default for LinkStats {
    fn default() -> Self {
        LinkStats {
            txpackets: CachePadded::new(Counter::default()),
            txdrop: CachePadded::new(Counter::default()),
            rxpackets: CachePadded::new(Counter::default()),
        }
    }
}

// ============================================================================
// CONTRACT
// ============================================================================

/// Producer half of a link. `transmit` never blocks and never retries; a
/// false return means the ring was full and the datum was NOT taken.
pub trait LinkTx: Send {
    fn transmit(&mut self, datum: u64) -> bool;
    /// Record a dropped datum. Called by the producer role when it decides
    /// to discard rather than retry; `transmit` itself does not count drops
    /// so that a spinning relay does not inflate the statistic.
    fn count_drop(&self);
    fn stats(&self) -> &LinkStats;
    /// Number of data the ring can hold at once.
    fn usable_capacity(&self) -> usize;
}

/// Consumer half of a link. `receive` never blocks; None means empty.
pub trait LinkRx: Send {
    fn receive(&mut self) -> Option<u64>;
    fn stats(&self) -> &LinkStats;
}

fn check_depth(depth: usize) {
    assert!(depth.is_power_of_two(), "link depth must be a power of two");
    assert!(depth >= 2, "link depth must be at least 2");
    assert!(depth <= u32::MAX as usize / 2, "link depth out of range");
}

// ============================================================================
// VARIANT A — CURSOR RING
// ============================================================================

struct CursorShared {
    // Cursors adjacent to each other and to the array header: the false
    // sharing is the documented weakness of this variant.
    read: AtomicU32,
    write: AtomicU32,
    mask: u32,
    slots: Box<[UnsafeCell<u64>]>,
    stats: LinkStats,
}

// SAFETY: the single-writer-per-field discipline makes the UnsafeCell slots
// race-free: slot `i` is written by the producer strictly before the Release
// store that publishes it, and read by the consumer strictly after the
// matching Acquire load.
unsafe impl Send for CursorShared {}
unsafe impl Sync for CursorShared {}

pub struct CursorTx {
    ring: Arc<CursorShared>,
}

pub struct CursorRx {
    ring: Arc<CursorShared>,
}

/// Create a cursor-ring link. `depth` is the slot count; `depth - 1` data
/// fit at once.
pub fn make_cursor_link(depth: usize) -> (CursorTx, CursorRx) {
    check_depth(depth);
    let slots: Vec<UnsafeCell<u64>> = (0..depth).map(|_| UnsafeCell::new(0)).collect();
    let ring = Arc::new(CursorShared {
        read: AtomicU32::new(0),
        write: AtomicU32::new(0),
        mask: depth as u32 - 1,
        slots: slots.into_boxed_slice(),
        stats: LinkStats::default(),
    });
    (CursorTx { ring: ring.clone() }, CursorRx { ring })
}

impl LinkTx for CursorTx {
    #[inline(always)]
    fn transmit(&mut self, datum: u64) -> bool {
        let r = &*self.ring;
        let w = r.write.load(Ordering::Relaxed);
        let next = (w + 1) & r.mask;
        if next == r.read.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: slot `w` is outside the consumer's visible window until the
        // Release store below; index is masked to the array bounds.
        unsafe { *r.slots[w as usize].get() = datum; }
        r.write.store(next, Ordering::Release);
        r.stats.txpackets.value.add(1);
        true
    }

    #[inline(always)]
    fn count_drop(&self) {
        self.ring.stats.txdrop.value.add(1);
    }

    fn stats(&self) -> &LinkStats {
        &self.ring.stats
    }

    fn usable_capacity(&self) -> usize {
        self.ring.mask as usize
    }
}

impl LinkRx for CursorRx {
    #[inline(always)]
    fn receive(&mut self) -> Option<u64> {
        let r = &*self.ring;
        let rd = r.read.load(Ordering::Relaxed);
        if rd == r.write.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the Acquire load above ordered this read after the
        // producer's slot write; index is masked to the array bounds.
        let datum = unsafe { *r.slots[rd as usize].get() };
        r.read.store((rd + 1) & r.mask, Ordering::Release);
        r.stats.rxpackets.value.add(1);
        Some(datum)
    }

    fn stats(&self) -> &LinkStats {
        &self.ring.stats
    }
}

// ============================================================================
// VARIANT B — SENTINEL RING (FastForward)
// ============================================================================

struct SentinelShared {
    slots: Box<[AtomicU64]>,
    mask: u32,
    stats: LinkStats,
}

pub struct SentinelTx {
    ring: Arc<SentinelShared>,
    // Local write cursor: a hint only. The authoritative full signal is the
    // sentinel value in the slot itself.
    write: u32,
}

pub struct SentinelRx {
    ring: Arc<SentinelShared>,
    read: u32,
}

/// Create a sentinel-ring link. All `depth` slots are usable. Data must be
/// nonzero (0 is the empty sentinel).
pub fn make_sentinel_link(depth: usize) -> (SentinelTx, SentinelRx) {
    check_depth(depth);
    let slots: Vec<AtomicU64> = (0..depth).map(|_| AtomicU64::new(EMPTY_SLOT)).collect();
    let ring = Arc::new(SentinelShared {
        slots: slots.into_boxed_slice(),
        mask: depth as u32 - 1,
        stats: LinkStats::default(),
    });
    (SentinelTx { ring: ring.clone(), write: 0 }, SentinelRx { ring, read: 0 })
}

impl LinkTx for SentinelTx {
    #[inline(always)]
    fn transmit(&mut self, datum: u64) -> bool {
        debug_assert_ne!(datum, EMPTY_SLOT, "0 is the empty sentinel");
        let r = &*self.ring;
        let slot = &r.slots[self.write as usize];
        if slot.load(Ordering::Acquire) != EMPTY_SLOT {
            return false;
        }
        slot.store(datum, Ordering::Release);
        self.write = (self.write + 1) & r.mask;
        r.stats.txpackets.value.add(1);
        true
    }

    #[inline(always)]
    fn count_drop(&self) {
        self.ring.stats.txdrop.value.add(1);
    }

    fn stats(&self) -> &LinkStats {
        &self.ring.stats
    }

    fn usable_capacity(&self) -> usize {
        self.ring.mask as usize + 1
    }
}

impl LinkRx for SentinelRx {
    #[inline(always)]
    fn receive(&mut self) -> Option<u64> {
        let r = &*self.ring;
        let slot = &r.slots[self.read as usize];
        let datum = slot.load(Ordering::Acquire);
        if datum == EMPTY_SLOT {
            return None;
        }
        // The Release clear hands the slot (and anything the datum points
        // at) back to the producer.
        slot.store(EMPTY_SLOT, Ordering::Release);
        self.read = (self.read + 1) & r.mask;
        r.stats.rxpackets.value.add(1);
        Some(datum)
    }

    fn stats(&self) -> &LinkStats {
        &self.ring.stats
    }
}

// ============================================================================
// TESTS
// ============================================================================
