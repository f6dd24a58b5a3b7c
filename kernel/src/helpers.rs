//! Helper functions for the eBPF programs
//!
//! Safe wrappers around BPF helper functions and small utilities
//! shared across the kprobe/XDP handlers.

use aya_ebpf::helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_get_smp_processor_id};
use probe_common::{constants::*, types::*};

/// Current monotonic boot-time nanosecond timestamp.
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Thread-group id (PID as userspace understands it) of the current task.
#[inline(always)]
pub fn get_pid() -> u32 {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    (pid_tgid >> 32) as u32
}

/// Index of the CPU currently executing this hook.
#[inline(always)]
pub fn get_cpu_id() -> u32 {
    unsafe { bpf_get_smp_processor_id() }
}

/// True if `elapsed_ns` is a plausible round-trip latency: non-negative
/// (guaranteed by the unsigned subtraction at the call site) and below
/// the 60s anomaly threshold.
#[inline(always)]
pub fn is_valid_latency(elapsed_ns: u64) -> bool {
    elapsed_ns < MAX_LATENCY_NS
}

/// Bump a per-CPU, lock-free self-statistics counter.
///
/// Each CPU owns its own slot copy, so this never contends with other
/// CPUs running the same hook concurrently; the daemon sums across
/// CPUs when it reads SelfStats back.
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    use crate::maps::STATS;

    unsafe {
        if let Some(counter) = STATS.get_ptr_mut(stat_id) {
            *counter += 1;
        }
    }
}

/// Read the single-entry probe configuration pushed by userspace.
#[inline(always)]
pub fn read_config() -> ProbeConfig {
    use crate::maps::CONFIG;

    unsafe { CONFIG.get(0).copied().unwrap_or_default() }
}

/// Build a fully-initialized LatencyEvent for the given flow and kind.
///
/// Every byte not explicitly meaningful is zeroed so no uninitialized
/// kernel memory ever crosses the kernel/user boundary.
#[inline(always)]
pub fn create_latency_event(
    key: FlowKey,
    kind: u8,
    latency_ns: u64,
    timestamp_ns: u64,
    payload_hint_bytes: u32,
) -> LatencyEvent {
    let mut event = LatencyEvent::zeroed(kind);
    event.cpu_id = get_cpu_id() as u8;
    event.saddr = key.saddr;
    event.daddr = key.daddr;
    event.sport = key.sport;
    event.dport = key.dport;
    event.pid = key.pid;
    event.payload_hint_bytes = payload_hint_bytes;
    event.latency_ns = latency_ns;
    event.timestamp_ns = timestamp_ns;
    event
}
