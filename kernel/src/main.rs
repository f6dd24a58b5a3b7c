//! TCP latency probe - kernel space program
//!
//! Tracks per-connection TCP round-trip latency by timestamping
//! tcp_sendmsg and pairing it with the next tcp_recvmsg on the same
//! flow. Ambient hooks (cleanup, drop, state, XDP) add telemetry that
//! is not required for the core measurement.
//!
//! ## Architecture
//!
//! ```text
//! tcp_sendmsg() -> record timestamp in FLOW_START, index by socket
//!                  |
//!                  v
//! tcp_recvmsg() -> pair with FLOW_START, emit LatencyEvent (or roll
//!                  into PER_FLOW_AGG in rollup mode)
//!                  |
//!                  v
//! userspace    -> read EVENTS, aggregate, export metrics
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none
//! ```
//!
//! The compiled bytecode is then loaded by the userspace daemon.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

pub use handlers::{
    kfree_skb_tracepoint, tcp_cleanup_rbuf, tcp_close, tcp_drop, tcp_recvmsg, tcp_sendmsg,
    tcp_set_state, tcp_v4_connect, xdp_packet_monitor,
};

pub use maps::{
    CONFIG, CONNECTION_STATES, EVENTS, FLOW_START, PACKET_DROPS, PER_FLOW_AGG, SOCK_INDEX, STATS,
    XDP_CONN_STATS,
};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
