// PKTRING — ENGINE: LINK TOPOLOGIES
// Wires SPSC links into generator → relay → discarder pipelines and
// generator → N-discarder fans, one pinned OS thread per role.
//
// Role policies:
//   generator  — drop on full (count_drop), never retries
//   relay      — busy-retries its single output until the transmit lands;
//                the one deliberate backpressure point in the graph
//   discarder  — drains and counts
//
// Each role runs until its upstream signals completion AND its inputs are
// drained, so every injected datum is accounted for as received or dropped.
// The roles are generic over the link traits and monomorphize per ring
// variant — no virtual dispatch on the hot path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::link::{LinkRx, LinkTx};
use crate::engine::runtime::{fatal, online_cpus, pin_to_core, spin_ticks, E_THREAD_SPAWN};

// ============================================================================
// ROLES
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct GenReport {
    pub sent: u64,
    pub dropped: u64,
}

/// Inject `total` sequentially numbered data (1..=total) into one output.
/// Sets `done` on return so downstream stages know no more data is coming.
pub fn generate_single_output<T: LinkTx>(
    output: &mut T,
    total: u64,
    delay_ticks: u64,
    done: &AtomicBool,
) -> GenReport {
    let mut report = GenReport { sent: total, dropped: 0 };
    for n in 1..=total {
        spin_ticks(delay_ticks);
        if !output.transmit(n) {
            output.count_drop();
            report.dropped += 1;
        }
    }
    done.store(true, Ordering::Release);
    report
}

/// Inject each datum into every output. A full ring drops that copy only;
/// the other outputs still get theirs, and the drop lands on that ring's
/// own statistics.
pub fn generate_broadcast<T: LinkTx>(
    outputs: &mut [T],
    total: u64,
    delay_ticks: u64,
    done: &AtomicBool,
) -> GenReport {
    let mut report = GenReport { sent: total, dropped: 0 };
    for n in 1..=total {
        spin_ticks(delay_ticks);
        for out in outputs.iter_mut() {
            if !out.transmit(n) {
                out.count_drop();
                report.dropped += 1;
            }
        }
    }
    done.store(true, Ordering::Release);
    report
}

/// Inject each datum into exactly one output, selected round-robin.
pub fn generate_round_robin<T: LinkTx>(
    outputs: &mut [T],
    total: u64,
    delay_ticks: u64,
    done: &AtomicBool,
) -> GenReport {
    let mut report = GenReport { sent: total, dropped: 0 };
    let mut dest = 0usize;
    for n in 1..=total {
        spin_ticks(delay_ticks);
        if !outputs[dest].transmit(n) {
            outputs[dest].count_drop();
            report.dropped += 1;
        }
        dest += 1;
        if dest == outputs.len() {
            dest = 0;
        }
    }
    done.store(true, Ordering::Release);
    report
}

/// Receive from one input and re-send to one output, retrying the transmit
/// until it succeeds. Exits only after the upstream is done and the input
/// ring is drained, then signals its own `done`.
pub fn relay_simple<R: LinkRx, T: LinkTx>(
    input: &mut R,
    output: &mut T,
    delay_ticks: u64,
    upstream_done: &AtomicBool,
    done: &AtomicBool,
) {
    loop {
        while let Some(datum) = input.receive() {
            spin_ticks(delay_ticks);
            while !output.transmit(datum) {
                std::hint::spin_loop();
            }
        }
        if upstream_done.load(Ordering::Acquire) {
            // One more drain: entries published before the flag became
            // visible at that Acquire are still in the ring.
            while let Some(datum) = input.receive() {
                while !output.transmit(datum) {
                    std::hint::spin_loop();
                }
            }
            break;
        }
        std::hint::spin_loop();
    }
    done.store(true, Ordering::Release);
}

/// Receive and count data from one input until the upstream is done and the
/// ring is drained.
pub fn discard_single_input<R: LinkRx>(
    input: &mut R,
    delay_ticks: u64,
    upstream_done: &AtomicBool,
) -> u64 {
    let mut discarded = 0u64;
    loop {
        while input.receive().is_some() {
            spin_ticks(delay_ticks);
            discarded += 1;
        }
        if upstream_done.load(Ordering::Acquire) {
            // Drain what was published before the flag became visible.
            while input.receive().is_some() {
                discarded += 1;
            }
            break;
        }
        std::hint::spin_loop();
    }
    discarded
}

/// Round-robin drain over several inputs. Exits after the upstream is done
/// and a full scan finds every input empty.
pub fn discard_inputs<R: LinkRx>(
    inputs: &mut [R],
    delay_ticks: u64,
    upstream_done: &AtomicBool,
) -> u64 {
    let mut discarded = 0u64;
    loop {
        let mut idle = true;
        for input in inputs.iter_mut() {
            if input.receive().is_some() {
                spin_ticks(delay_ticks);
                discarded += 1;
                idle = false;
            }
        }
        if idle && upstream_done.load(Ordering::Acquire) {
            // Final sweep: entries published before the flag became visible
            // at that Acquire are drained before exiting.
            for input in inputs.iter_mut() {
                while input.receive().is_some() {
                    discarded += 1;
                }
            }
            break;
        }
    }
    discarded
}

// ============================================================================
// TOPOLOGY HARNESSES
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub received: u64,
    pub dropped: u64,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn mpps(&self) -> f64 {
        self.received as f64 / self.elapsed.as_secs_f64() / 1e6
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BenchConfig {
    pub total: u64,
    pub depth: usize,
    pub delay_ticks: u64,
    /// Bind each role to its own core. Off for test runs on shared machines.
    pub pin: bool,
}

fn bench_cores(n: usize) -> Vec<usize> {
    let isolated = crate::engine::runtime::discover_isolated_cores();
    if isolated.len() >= n {
        return isolated[..n].to_vec();
    }
    (0..n).collect()
}

fn spawn_role<F>(name: String, core: Option<usize>, f: F) -> std::thread::JoinHandle<u64>
where
    F: FnOnce() -> u64 + Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Some(c) = core {
                pin_to_core(c);
            }
            f()
        })
        .unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "role thread spawn failed"))
}

/// Pipeline: generator → (stages − 2) relays → discarder, one link between
/// each pair of neighbours. `make` builds one link of the chosen variant.
pub fn pipeline_bench<Tx, Rx, F>(make: F, stages: usize, cfg: BenchConfig) -> BenchReport
where
    Tx: LinkTx + 'static,
    Rx: LinkRx + 'static,
    F: Fn(usize) -> (Tx, Rx),
{
    assert!(stages >= 2, "a pipeline needs a generator and a discarder");
    if cfg.pin && stages > online_cpus() {
        fatal(E_THREAD_SPAWN, "more pipeline stages than cpus");
    }
    let nlinks = stages - 1;
    let mut txs = Vec::with_capacity(nlinks);
    let mut rxs = Vec::with_capacity(nlinks);
    for _ in 0..nlinks {
        let (tx, rx) = make(cfg.depth);
        txs.push(tx);
        rxs.push(rx);
    }
    // done[0] is set by the generator, done[i] by relay i.
    let done: Vec<Arc<AtomicBool>> =
        (0..stages - 1).map(|_| Arc::new(AtomicBool::new(false))).collect();
    let cores = bench_cores(stages);
    let core = |i: usize| if cfg.pin { Some(cores[i]) } else { None };

    let started = Instant::now();

    let sink_done = done[done.len() - 1].clone();
    let mut sink_input = rxs.pop().expect("pipeline has at least one link");
    let discarder = spawn_role("pkt-sink".into(), core(stages - 1), move || {
        discard_single_input(&mut sink_input, 0, &sink_done)
    });

    let mut relays = Vec::new();
    for (i, (mut input, mut output)) in rxs.into_iter().zip(txs.drain(1..)).enumerate() {
        let upstream = done[i].clone();
        let mine = done[i + 1].clone();
        relays.push(spawn_role(format!("pkt-relay{}", i), core(i + 1), move || {
            relay_simple(&mut input, &mut output, 0, &upstream, &mine);
            0
        }));
    }

    let mut gen_out = txs.pop().expect("generator output link");
    let gen_done = done[0].clone();
    let total = cfg.total;
    let delay = cfg.delay_ticks;
    let generator = spawn_role("pkt-gen".into(), core(0), move || {
        generate_single_output(&mut gen_out, total, delay, &gen_done).dropped
    });

    let dropped = generator.join().unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "generator panicked"));
    for r in relays {
        let _ = r.join();
    }
    let received =
        discarder.join().unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "discarder panicked"));
    BenchReport { received, dropped, elapsed: started.elapsed() }
}

/// Fan: one round-robin generator feeding `outputs` discarders, one link per
/// discarder.
pub fn fan_bench<Tx, Rx, F>(make: F, outputs: usize, cfg: BenchConfig) -> BenchReport
where
    Tx: LinkTx + 'static,
    Rx: LinkRx + 'static,
    F: Fn(usize) -> (Tx, Rx),
{
    assert!(outputs >= 2, "a fan needs at least 2 outputs");
    if cfg.pin && outputs + 1 > online_cpus() {
        fatal(E_THREAD_SPAWN, "more fan threads than cpus");
    }
    let mut txs = Vec::with_capacity(outputs);
    let mut rxs = Vec::with_capacity(outputs);
    for _ in 0..outputs {
        let (tx, rx) = make(cfg.depth);
        txs.push(tx);
        rxs.push(rx);
    }
    let done = Arc::new(AtomicBool::new(false));
    let cores = bench_cores(outputs + 1);
    let core = |i: usize| if cfg.pin { Some(cores[i]) } else { None };

    let started = Instant::now();

    let mut discarders = Vec::new();
    for (i, mut input) in rxs.into_iter().enumerate() {
        let upstream = done.clone();
        discarders.push(spawn_role(format!("pkt-sink{}", i), core(i + 1), move || {
            discard_single_input(&mut input, 0, &upstream)
        }));
    }

    let gen_done = done.clone();
    let total = cfg.total;
    let delay = cfg.delay_ticks;
    let generator = spawn_role("pkt-gen".into(), core(0), move || {
        generate_round_robin(&mut txs, total, delay, &gen_done).dropped
    });

    let dropped = generator.join().unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "generator panicked"));
    let mut received = 0u64;
    for d in discarders {
        received += d.join().unwrap_or_else(|_| fatal(E_THREAD_SPAWN, "discarder panicked"));
    }
    BenchReport { received, dropped, elapsed: started.elapsed() }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::link::{make_cursor_link, make_sentinel_link};

    #[test]
    fn pipeline_two_stages_conserves() {
        let cfg = BenchConfig { total: 50_000, depth: 256, delay_ticks: 0, pin: false };
        let report = pipeline_bench(make_sentinel_link, 2, cfg);
        assert_eq!(report.received + report.dropped, 50_000);
    }

    #[test]
    fn fan_round_robin_conserves() {
        let cfg = BenchConfig { total: 30_000, depth: 256, delay_ticks: 0, pin: false };
        let report = fan_bench(make_cursor_link, 3, cfg);
        assert_eq!(report.received + report.dropped, 30_000);
    }

    #[test]
    fn broadcast_counts_per_ring_drops() {
        let (mut full_tx, _full_rx) = make_sentinel_link(4);
        for v in 1..=4u64 {
            assert!(full_tx.transmit(v));
        }
        let (o1, mut r1) = make_sentinel_link(4);
        let (o2, mut r2) = make_sentinel_link(4);
        let mut outs = vec![full_tx, o1, o2];
        let done = AtomicBool::new(false);
        let report = generate_broadcast(&mut outs, 1, 0, &done);
        assert_eq!(report.dropped, 1, "only the pre-filled ring drops");
        assert_eq!(outs[0].stats().txdrop.value.get(), 1);
        assert_eq!(r1.receive(), Some(1));
        assert_eq!(r2.receive(), Some(1));
    }
}
