//! BPF map definitions for latency tracking
//!
//! Defines the maps used for communication between kernel and
//! userspace, and the tables the kernel tier keeps for itself.

use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, LruHashMap, PerCpuArray, PerfEventArray},
};
use probe_common::{constants::*, types::*};

/// Send-side timestamp per flow.
///
/// Latest-send semantics: any send on the same flow overwrites the
/// previous timestamp. LRU eviction keeps this bounded under load
/// instead of silently failing inserts once full.
#[map]
pub static FLOW_START: LruHashMap<FlowKey, u64> = LruHashMap::with_max_entries(MAX_FLOWS, 0);

/// socket identifier -> outstanding FlowKey.
///
/// The receive-side hook sees the socket but not always the full
/// 4-tuple cheaply; this indirection avoids re-deriving it.
#[map]
pub static SOCK_INDEX: LruHashMap<u64, FlowKey> = LruHashMap::with_max_entries(MAX_FLOWS, 0);

/// Per-CPU ring of latency measurements read by the collector.
#[map]
pub static EVENTS: PerfEventArray<LatencyEvent> = PerfEventArray::new(0);

/// Kernel-side per-flow rollup, populated only in rollup mode.
#[map]
pub static PER_FLOW_AGG: LruHashMap<FlowKey, PerFlowAgg> = LruHashMap::with_max_entries(MAX_FLOWS, 0);

/// Per-CPU, lock-free self-statistics counters (see STAT_* slot indices).
#[map]
pub static STATS: PerCpuArray<u64> = PerCpuArray::with_max_entries(MAX_STATS, 0);

/// XDP-level per-connection packet/byte counters.
#[map]
pub static XDP_CONN_STATS: LruHashMap<ConnectionKey, XdpConnStats> =
    LruHashMap::with_max_entries(MAX_XDP_CONNS, 0);

/// Single-entry configuration pushed from userspace before attach.
#[map]
pub static CONFIG: Array<ProbeConfig> = Array::with_max_entries(1, 0);

/// Packet drop events (ambient telemetry, not part of the primary path).
#[map]
pub static PACKET_DROPS: PerfEventArray<PacketDropEvent> = PerfEventArray::new(0);

/// Connection lifecycle state (ambient telemetry).
#[map]
pub static CONNECTION_STATES: HashMap<ConnectionKey, ConnectionState> =
    HashMap::with_max_entries(MAX_XDP_CONNS, 0);
