// PKTRING — CRATE ROOT (LIBRARY)
// Lock-free packet links and zero-copy hardware ring adapters.
//
// Module hierarchy:
//   engine/link     — SPSC software links: cursor ring, sentinel ring, stats
//   engine/topo     — generator/relay/discarder roles, pipeline + fan harnesses
//   engine/runtime  — fatal exit, CPU pinning, TSC spin, frame-index slab
//   memory          — hugepage DMA regions, mlockall, pagemap translation
//   packet          — packet buffer model + frame pool over a DMA region
//   network/        — AF_XDP umem/socket rings, virtio vrings + vhost setup,
//                     legacy NIC status-bit descriptor ring

pub mod engine;
pub mod memory;
pub mod network;
pub mod packet;
