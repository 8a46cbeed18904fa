// PKTRING — ENGINE MODULE
//   link.rs     — SPSC software rings (cursor + sentinel variants), link stats
//   topo.rs     — fan/pipeline topologies over links, worker roles
//   runtime.rs  — fatal exit diagnostics, CPU management, TSC, frame slab

pub mod link;
pub mod runtime;
pub mod topo;
