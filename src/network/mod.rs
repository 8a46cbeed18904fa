// PKTRING — NETWORK MODULE
// Ring adapters whose peer is not a thread in this process:
//   xdp.rs    — AF_XDP umem/socket rings shared with the kernel
//   virtio.rs — virtio vrings shared with a vhost device / guest
//   nic.rs    — legacy NIC descriptor ring polled via per-slot done bits
//
// All three speak the same enqueue/dequeue shape as engine::link but cross a
// memory-mapped boundary, so every index publish/observe carries an explicit
// fence instead of relying on same-process happens-before.

pub mod nic;
pub mod virtio;
pub mod xdp;
