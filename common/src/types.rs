//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code. `FlowKey`/`LatencyEvent`
//! are the wire-stable types; everything here is read and written
//! identically by the `kernel` and `daemon` crates.

/// Identifies one unidirectional TCP flow.
///
/// PID is included so concurrent flows sharing a 4-tuple across
/// processes (SO_REUSEPORT) do not collide in the kernel maps.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source IP address (network byte order)
    pub saddr: u32,
    /// Destination IP address (network byte order)
    pub daddr: u32,
    /// Source port (network byte order)
    pub sport: u16,
    /// Destination port (network byte order)
    pub dport: u16,
    /// Process (thread-group) id that owns the socket
    pub pid: u32,
}

const _: () = assert!(core::mem::size_of::<FlowKey>() == 16);

/// 4-tuple connection key used at layers that never see a PID
/// (the XDP hook observes packets before any socket is resolved).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Source IP address (network byte order)
    pub saddr: u32,
    /// Destination IP address (network byte order)
    pub daddr: u32,
    /// Source port (network byte order)
    pub sport: u16,
    /// Destination port (network byte order)
    pub dport: u16,
}

const _: () = assert!(core::mem::size_of::<ConnectionKey>() == 12);

/// Event kind carried in `LatencyEvent::kind`.
pub mod event_kind {
    pub const SEND: u8 = 1;
    pub const RECV: u8 = 2;
    pub const CLEANUP: u8 = 3;
}

/// Latency event emitted from kernel to userspace over the per-CPU ring.
///
/// Exact 48-byte layout, little-endian, no padding ambiguity — see the
/// offset table in the design docs. Every field not populated by the
/// producer must be explicitly zeroed before `EVENTS.output()`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LatencyEvent {
    /// 1=SEND, 2=RECV, 3=CLEANUP
    pub kind: u8,
    /// CPU index of the producer
    pub cpu_id: u8,
    /// Must be zero
    pub reserved: u16,
    /// Source IP address (network byte order)
    pub saddr: u32,
    /// Destination IP address (network byte order)
    pub daddr: u32,
    /// Source port (host byte order)
    pub sport: u16,
    /// Destination port (host byte order)
    pub dport: u16,
    /// Process id that triggered the event
    pub pid: u32,
    /// Payload size hint in bytes (0 if unknown)
    pub payload_hint_bytes: u32,
    /// Measured latency in nanoseconds (0 for SEND)
    pub latency_ns: u64,
    /// Monotonic boot-time nanosecond timestamp at emit
    pub timestamp_ns: u64,
    /// Must be zero
    pub reserved2: u64,
}

const _: () = assert!(core::mem::size_of::<LatencyEvent>() == 48);
const _: () = assert!(core::mem::align_of::<LatencyEvent>() == 8);

impl LatencyEvent {
    pub fn zeroed(kind: u8) -> Self {
        Self {
            kind,
            cpu_id: 0,
            reserved: 0,
            saddr: 0,
            daddr: 0,
            sport: 0,
            dport: 0,
            pid: 0,
            payload_hint_bytes: 0,
            latency_ns: 0,
            timestamp_ns: 0,
            reserved2: 0,
        }
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            saddr: self.saddr,
            daddr: self.daddr,
            sport: self.sport,
            dport: self.dport,
            pid: self.pid,
        }
    }
}

/// Per-flow counters updated from the NIC-level (XDP) hook.
///
/// `drop_count` is part of the wire format for forward compatibility
/// but is never incremented by this probe: the probe is
/// observation-only and never drops or mutates packets (see Non-goals).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct XdpConnStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub last_seen_ns: u64,
    pub drop_count: u64,
}

const _: () = assert!(core::mem::size_of::<XdpConnStats>() == 32);

/// Kernel-side per-flow rollup, used when rollup mode suppresses
/// per-event RECV traffic on the ring.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct PerFlowAgg {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

const _: () = assert!(core::mem::size_of::<PerFlowAgg>() == 32);

/// Packet drop event data (ambient telemetry, not part of the
/// primary latency measurement path).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PacketDropEvent {
    pub key: ConnectionKey,
    pub timestamp_ns: u64,
    pub drop_reason: u32,
    pub drop_location: u8,
    pub protocol: u8,
    pub _padding: [u8; 2],
}

/// Connection state tracking (ambient telemetry).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ConnectionState {
    pub key: ConnectionKey,
    pub start_time_ns: u64,
    pub close_time_ns: u64,
    pub state: u8,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pid: u32,
    pub _padding: [u8; 4],
}

// Config pushed from userspace into the kernel object's single-entry
// config map (index 0), read back with a volatile load on every hook.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProbeConfig {
    /// Non-zero enables kernel-side per-flow rollup (suppresses RECV events)
    pub rollup_mode: u32,
    pub _padding: u32,
}

const _: () = assert!(core::mem::size_of::<ProbeConfig>() == 8);

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for ConnectionKey {}
    unsafe impl aya::Pod for LatencyEvent {}
    unsafe impl aya::Pod for XdpConnStats {}
    unsafe impl aya::Pod for PerFlowAgg {}
    unsafe impl aya::Pod for PacketDropEvent {}
    unsafe impl aya::Pod for ConnectionState {}
    unsafe impl aya::Pod for ProbeConfig {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_c_sizes_match_wire_layout() {
        assert_eq!(core::mem::size_of::<FlowKey>(), 16);
        assert_eq!(core::mem::size_of::<ConnectionKey>(), 12);
        assert_eq!(core::mem::size_of::<LatencyEvent>(), 48);
        assert_eq!(core::mem::align_of::<LatencyEvent>(), 8);
        assert_eq!(core::mem::size_of::<XdpConnStats>(), 32);
        assert_eq!(core::mem::size_of::<PerFlowAgg>(), 32);
        assert_eq!(core::mem::size_of::<ProbeConfig>(), 8);
    }

    #[test]
    fn zeroed_latency_event_has_only_kind_set() {
        let event = LatencyEvent::zeroed(event_kind::RECV);
        assert_eq!(event.kind, event_kind::RECV);
        assert_eq!(event.cpu_id, 0);
        assert_eq!(event.saddr, 0);
        assert_eq!(event.daddr, 0);
        assert_eq!(event.sport, 0);
        assert_eq!(event.dport, 0);
        assert_eq!(event.pid, 0);
        assert_eq!(event.payload_hint_bytes, 0);
        assert_eq!(event.latency_ns, 0);
        assert_eq!(event.timestamp_ns, 0);
    }

    #[test]
    fn latency_event_key_projects_flow_fields_only() {
        let mut event = LatencyEvent::zeroed(event_kind::SEND);
        event.saddr = 0x0100007f;
        event.daddr = 0x0200007f;
        event.sport = 0x3412;
        event.dport = 0x5634;
        event.pid = 4321;
        event.latency_ns = 999;

        let key = event.key();
        assert_eq!(key.saddr, event.saddr);
        assert_eq!(key.daddr, event.daddr);
        assert_eq!(key.sport, event.sport);
        assert_eq!(key.dport, event.dport);
        assert_eq!(key.pid, event.pid);
    }

    #[test]
    fn flow_keys_with_different_pid_are_distinct() {
        let base = FlowKey { saddr: 1, daddr: 2, sport: 3, dport: 4, pid: 100 };
        let other = FlowKey { pid: 200, ..base };
        assert_ne!(base, other);
    }
}
