//! Shared constants for the TCP latency probe.
//!
//! Used by both the kernel and userspace programs to keep limits and
//! behavior in lock-step.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Maximum number of concurrent flows tracked in FlowStart/SockIndex/PerFlowAgg
pub const MAX_FLOWS: u32 = 10_240;

/// Maximum number of XDP-level connections tracked
pub const MAX_XDP_CONNS: u32 = 10_240;

/// Number of slots in the SelfStats counter array
pub const MAX_STATS: u32 = 24;

// ============================================================================
// SelfStats reserved slot indices (spec.md §4.B)
// ============================================================================

pub const STAT_SENDS_SEEN: u32 = 0;
pub const STAT_RECVS_SEEN: u32 = 1;
pub const STAT_CLEANUPS_SEEN: u32 = 2;
pub const STAT_EVENTS_EMITTED: u32 = 3;
pub const STAT_EVENTS_DROPPED: u32 = 4;
pub const STAT_LOOKUP_MISSES: u32 = 5;
pub const STAT_ELAPSED_ANOMALIES: u32 = 6;
pub const STAT_XDP_PACKETS: u32 = 7;
pub const STAT_XDP_IPV4_PACKETS: u32 = 8;
pub const STAT_XDP_TCP_PACKETS: u32 = 9;
pub const STAT_XDP_UDP_PACKETS: u32 = 10;
pub const STAT_XDP_ICMP_PACKETS: u32 = 11;
pub const STAT_XDP_OTHER_PACKETS: u32 = 12;

// Extended slots for ambient (non-primary) telemetry: connection-state
// transitions and packet-drop counts, alongside the primary latency stats.
pub const STAT_INVALID_SOCKETS: u32 = 13;
pub const STAT_PACKET_DROPS: u32 = 14;
pub const STAT_STATE_TRANSITIONS: u32 = 15;
pub const STAT_CONNECTIONS_OPENED: u32 = 16;
pub const STAT_CONNECTIONS_CLOSED: u32 = 17;
pub const STAT_TOTAL_EVENTS: u32 = 18;

// ============================================================================
// Event Kinds
// ============================================================================

pub use crate::types::event_kind::{CLEANUP as EVENT_TYPE_CLEANUP, RECV as EVENT_TYPE_RECV, SEND as EVENT_TYPE_SEND};

// ============================================================================
// Connection states (ambient ConnectionState.state)
// ============================================================================

pub const CONN_STATE_CONNECTING: u8 = 0;
pub const CONN_STATE_ESTABLISHED: u8 = 1;
pub const CONN_STATE_CLOSING: u8 = 2;
pub const CONN_STATE_CLOSED: u8 = 3;

// ============================================================================
// Drop locations (ambient PacketDropEvent.drop_location)
// ============================================================================

pub const DROP_LOCATION_TC: u8 = 0;
pub const DROP_LOCATION_XDP: u8 = 1;
pub const DROP_LOCATION_NETFILTER: u8 = 2;
pub const DROP_LOCATION_STACK: u8 = 3;
pub const DROP_LOCATION_APP: u8 = 4;

// ============================================================================
// Latency thresholds
// ============================================================================

/// Latencies at or above this many nanoseconds (60s) are discarded as anomalies.
pub const MAX_LATENCY_NS: u64 = 60_000_000_000;

// ============================================================================
// Coarse histogram bucket boundaries (microseconds)
// ============================================================================

pub const HISTOGRAM_BUCKET_1MS: u64 = 1_000;
pub const HISTOGRAM_BUCKET_5MS: u64 = 5_000;
pub const HISTOGRAM_BUCKET_10MS: u64 = 10_000;
pub const HISTOGRAM_BUCKET_50MS: u64 = 50_000;
pub const HISTOGRAM_BUCKET_100MS: u64 = 100_000;

// ============================================================================
// Fine log-spaced histogram (percentile reconstruction)
// ============================================================================

/// Lower bound of the fine histogram, in nanoseconds (1 microsecond).
pub const FINE_HISTOGRAM_MIN_NS: f64 = 1_000.0;
/// Number of log-spaced buckets spanning 1us .. 60s.
pub const FINE_HISTOGRAM_BUCKETS: usize = 136;
/// Per-bucket growth factor, derived so that `FINE_HISTOGRAM_BUCKETS`
/// buckets cover `[FINE_HISTOGRAM_MIN_NS, MAX_LATENCY_NS]`:
/// `growth = (MAX_LATENCY_NS / FINE_HISTOGRAM_MIN_NS) ^ (1 / FINE_HISTOGRAM_BUCKETS)`.
pub const FINE_HISTOGRAM_GROWTH: f64 = 1.141;

// ============================================================================
// Sampling
// ============================================================================

pub const DEFAULT_SAMPLE_RATE: u32 = 1;
pub const MAX_SAMPLE_RATE: u32 = 1000;

// ============================================================================
// Protocol numbers (linux/in.h)
// ============================================================================

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMP: u8 = 1;

// ============================================================================
// Map capacities shared by loader + kernel object
// ============================================================================

/// Default ring size per CPU, in bytes (>= 1 MiB per spec.md §5).
pub const RING_BUFFER_BYTES_PER_CPU: usize = 1024 * 1024;
