// PKTRING — Bench Orchestrator
// Drives the two SPSC link variants through the pipeline and fan topologies
// with one pinned thread per role, and reports throughput.

use pktring::engine::link::{make_cursor_link, make_sentinel_link};
use pktring::engine::runtime::{fatal, online_cpus, E_BAD_ARGS};
use pktring::engine::topo::{fan_bench, pipeline_bench, BenchConfig, BenchReport};
use pktring::memory;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Pipeline,
    Fan,
}

#[derive(Clone, Copy, PartialEq)]
enum LinkKind {
    Cursor,
    Sentinel,
}

fn usage(argv0: &str) -> ! {
    eprintln!("usage: {} [options]", argv0);
    eprintln!(" -m, --mode <pipeline|fan>   test to run (default pipeline)");
    eprintln!(" -l, --link <cursor|sentinel> ring variant (default sentinel)");
    eprintln!(" -t, --threads <n>           worker threads, <= cpus (default 2)");
    eprintln!(" -p, --packets <n>           packets to inject (default 10000000)");
    eprintln!("     --depth <n>             link depth, power of two (default 256)");
    eprintln!("     --spin <ticks>          per-packet TSC spin in the generator");
    eprintln!("     --no-pin                skip core pinning");
    std::process::exit(1);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut mode = Mode::Pipeline;
    let mut kind = LinkKind::Sentinel;
    let mut threads: usize = 2;
    let mut packets: u64 = 10_000_000;
    let mut depth: usize = 256;
    let mut spin: u64 = 0;
    let mut pin = true;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-m" | "--mode" => {
                i += 1;
                if i >= args.len() {
                    usage(&args[0]);
                }
                mode = match args[i].as_str() {
                    "pipeline" => Mode::Pipeline,
                    "fan" => Mode::Fan,
                    _ => usage(&args[0]),
                };
            }
            "-l" | "--link" => {
                i += 1;
                if i >= args.len() {
                    usage(&args[0]);
                }
                kind = match args[i].as_str() {
                    "cursor" => LinkKind::Cursor,
                    "sentinel" => LinkKind::Sentinel,
                    _ => usage(&args[0]),
                };
            }
            "-t" | "--threads" => {
                i += 1;
                threads = match args.get(i).and_then(|a| a.parse().ok()) {
                    Some(v) if v >= 2 => v,
                    _ => fatal(E_BAD_ARGS, "--threads must be an integer >= 2"),
                };
            }
            "-p" | "--packets" => {
                i += 1;
                packets = match args.get(i).and_then(|a| a.parse().ok()) {
                    Some(v) if v >= 1 => v,
                    _ => fatal(E_BAD_ARGS, "--packets must be an integer >= 1"),
                };
            }
            "--depth" => {
                i += 1;
                depth = match args.get(i).and_then(|a| a.parse::<usize>().ok()) {
                    Some(v) if v.is_power_of_two() && v >= 2 => v,
                    _ => fatal(E_BAD_ARGS, "--depth must be a power of two >= 2"),
                };
            }
            "--spin" => {
                i += 1;
                spin = match args.get(i).and_then(|a| a.parse().ok()) {
                    Some(v) => v,
                    _ => fatal(E_BAD_ARGS, "--spin must be an integer"),
                };
            }
            "--no-pin" => {
                pin = false;
            }
            _ => usage(&args[0]),
        }
        i += 1;
    }

    if threads > online_cpus() {
        fatal(E_BAD_ARGS, "more threads than cpus");
    }
    if mode == Mode::Fan && threads < 3 {
        fatal(E_BAD_ARGS, "the fan test needs at least 3 threads");
    }

    if !memory::lock_memory() {
        eprintln!("[PKT-EXEC] WARNING: mlockall failed; pages may swap under pressure.");
    }

    let link_name = match kind {
        LinkKind::Cursor => "cursor",
        LinkKind::Sentinel => "sentinel",
    };
    eprintln!("[PKT-BENCH] link type: {}", link_name);
    eprintln!("[PKT-BENCH] sending {} packets, depth {}, {} threads", packets, depth, threads);

    let cfg = BenchConfig { total: packets, depth, delay_ticks: spin, pin };
    let report = match (mode, kind) {
        (Mode::Pipeline, LinkKind::Cursor) => {
            eprintln!("[PKT-BENCH] pipeline test with {} stages", threads);
            pipeline_bench(make_cursor_link, threads, cfg)
        }
        (Mode::Pipeline, LinkKind::Sentinel) => {
            eprintln!("[PKT-BENCH] pipeline test with {} stages", threads);
            pipeline_bench(make_sentinel_link, threads, cfg)
        }
        (Mode::Fan, LinkKind::Cursor) => {
            eprintln!("[PKT-BENCH] fan test with generator and {} outputs", threads - 1);
            fan_bench(make_cursor_link, threads - 1, cfg)
        }
        (Mode::Fan, LinkKind::Sentinel) => {
            eprintln!("[PKT-BENCH] fan test with generator and {} outputs", threads - 1);
            fan_bench(make_sentinel_link, threads - 1, cfg)
        }
    };

    print_report(packets, &report);
}

fn print_report(total: u64, report: &BenchReport) {
    let seconds = report.elapsed.as_secs_f64();
    println!("elapsed time for {} elements: {:.6} sec", report.received, seconds);
    println!(
        "dropped packets: {} ({:.1}%)",
        report.dropped,
        100.0 * report.dropped as f64 / total as f64
    );
    println!("{:7.2} Mpps", report.mpps());
}
