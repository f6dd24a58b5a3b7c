//! Kprobe, tracepoint, and XDP handlers for TCP latency tracking
//!
//! Implements the eBPF programs that attach to kernel functions and
//! measure send-to-receive latency, packet drops, and connection
//! lifecycle. The send/recv pair is the primary measurement path;
//! cleanup, drop, state, and XDP hooks are soft/ambient telemetry that
//! the loader treats as best-effort.

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::macros::{kprobe, tracepoint, xdp};
use aya_ebpf::programs::{ProbeContext, XdpContext};
use probe_common::{constants::*, types::*};

use crate::{helpers::*, maps::*, socket_parser::*};

/// Identity used to index SOCK_INDEX: the raw socket pointer value.
///
/// Stable for the lifetime of the socket; reused as a map key rather
/// than re-deriving the flow key from scratch on every hook.
#[inline(always)]
fn sock_identity(sock: *const sock) -> u64 {
    sock as u64
}

// ============================================================================
// Primary latency measurement path
// ============================================================================

/// Records the send timestamp for a flow.
///
/// Attached to: tcp_sendmsg (hard-required hook).
#[kprobe]
pub fn tcp_sendmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_sendmsg(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_sendmsg(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_SENDS_SEEN);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        increment_stat(STAT_INVALID_SOCKETS);
        return Ok(0);
    }

    let key = match extract_flow_key(sock) {
        Ok(k) => k,
        Err(_) => {
            increment_stat(STAT_INVALID_SOCKETS);
            return Ok(0);
        }
    };

    let timestamp = get_timestamp();
    let identity = sock_identity(sock);

    unsafe {
        let _ = FLOW_START.insert(&key, &timestamp, 0);
        let _ = SOCK_INDEX.insert(&identity, &key, 0);
    }

    Ok(0)
}

/// Computes send-to-receive latency and emits a RECV event (or rolls
/// it into the kernel-side per-flow aggregate in rollup mode).
///
/// Attached to: tcp_recvmsg (hard-required hook).
#[kprobe]
pub fn tcp_recvmsg(ctx: ProbeContext) -> u32 {
    match try_tcp_recvmsg(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_recvmsg(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_RECVS_SEEN);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        increment_stat(STAT_INVALID_SOCKETS);
        return Ok(0);
    }

    let identity = sock_identity(sock);

    let key = match unsafe { SOCK_INDEX.get(&identity) } {
        Some(k) => *k,
        None => match extract_flow_key(sock) {
            Ok(k) => k,
            Err(_) => {
                increment_stat(STAT_INVALID_SOCKETS);
                return Ok(0);
            }
        },
    };

    let current_time = get_timestamp();

    // A send must precede a recv for this to be a valid pairing; once
    // consumed the entry is removed so a second recv with no intervening
    // send counts as a miss instead of replaying a stale baseline.
    let start_time = match unsafe { FLOW_START.get(&key) } {
        Some(ts) => *ts,
        None => {
            increment_stat(STAT_LOOKUP_MISSES);
            return Ok(0);
        }
    };

    if current_time <= start_time {
        increment_stat(STAT_ELAPSED_ANOMALIES);
        return Ok(0);
    }

    let latency_ns = current_time - start_time;

    if !is_valid_latency(latency_ns) {
        increment_stat(STAT_ELAPSED_ANOMALIES);
        unsafe {
            let _ = FLOW_START.remove(&key);
        }
        return Ok(0);
    }

    let config = read_config();

    if config.rollup_mode != 0 {
        unsafe {
            match PER_FLOW_AGG.get_ptr_mut(&key) {
                Some(agg) => {
                    (*agg).count += 1;
                    (*agg).sum_ns += latency_ns;
                    if latency_ns < (*agg).min_ns || (*agg).min_ns == 0 {
                        (*agg).min_ns = latency_ns;
                    }
                    if latency_ns > (*agg).max_ns {
                        (*agg).max_ns = latency_ns;
                    }
                }
                None => {
                    let agg = PerFlowAgg {
                        count: 1,
                        sum_ns: latency_ns,
                        min_ns: latency_ns,
                        max_ns: latency_ns,
                    };
                    let _ = PER_FLOW_AGG.insert(&key, &agg, 0);
                }
            }
        }
    } else {
        let event = create_latency_event(key, event_kind::RECV, latency_ns, current_time, 0);
        unsafe {
            EVENTS.output(ctx, &event, 0);
        }
        increment_stat(STAT_EVENTS_EMITTED);
    }

    unsafe {
        let _ = FLOW_START.remove(&key);
    }

    Ok(0)
}

/// Additional receive-side measurement point, taken when the receive
/// buffer is drained after the application reads the data.
///
/// Attached to: tcp_cleanup_rbuf (soft/optional hook).
#[kprobe]
pub fn tcp_cleanup_rbuf(ctx: ProbeContext) -> u32 {
    match try_tcp_cleanup_rbuf(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_cleanup_rbuf(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_CLEANUPS_SEEN);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        return Ok(0);
    }

    let identity = sock_identity(sock);

    let key = match unsafe { SOCK_INDEX.get(&identity) } {
        Some(k) => *k,
        None => return Ok(0),
    };

    // tcp_recvmsg already consumed FLOW_START for this pairing in the
    // common case, so a miss here is expected and not counted as an
    // anomaly; this hook only fires when a baseline genuinely remains.
    let start_time = match unsafe { FLOW_START.get(&key) } {
        Some(ts) => *ts,
        None => return Ok(0),
    };

    let current_time = get_timestamp();

    if current_time <= start_time {
        return Ok(0);
    }

    let latency_ns = current_time - start_time;

    if !is_valid_latency(latency_ns) {
        increment_stat(STAT_ELAPSED_ANOMALIES);
        return Ok(0);
    }

    let event = create_latency_event(key, event_kind::CLEANUP, latency_ns, current_time, 0);
    unsafe {
        EVENTS.output(ctx, &event, 0);
        let _ = FLOW_START.remove(&key);
    }
    increment_stat(STAT_EVENTS_EMITTED);

    Ok(0)
}

// ============================================================================
// Packet drop tracking (ambient)
// ============================================================================

/// Attached to: tcp_drop (soft/optional hook).
#[kprobe]
pub fn tcp_drop(ctx: ProbeContext) -> u32 {
    match try_tcp_drop(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_drop(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_PACKET_DROPS);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        return Ok(0);
    }

    let key = match extract_flow_key(sock) {
        Ok(k) => k,
        Err(_) => return Ok(0),
    };

    let event = PacketDropEvent {
        key: ConnectionKey {
            saddr: key.saddr,
            daddr: key.daddr,
            sport: key.sport,
            dport: key.dport,
        },
        timestamp_ns: get_timestamp(),
        drop_reason: 0,
        drop_location: DROP_LOCATION_STACK,
        protocol: IPPROTO_TCP,
        _padding: [0; 2],
    };

    unsafe {
        let _ = PACKET_DROPS.output(ctx, &event, 0);
    }

    Ok(0)
}

/// Attached to: skb:kfree_skb tracepoint (soft/optional hook).
///
/// Extracting the 4-tuple from the raw skb needs deeper header parsing
/// than this tracepoint's arguments offer cheaply; the drop is still
/// counted, just without connection attribution.
#[tracepoint]
pub fn kfree_skb_tracepoint(ctx: ProbeContext) -> u32 {
    match try_kfree_skb(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_kfree_skb(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_PACKET_DROPS);

    let event = PacketDropEvent {
        key: ConnectionKey {
            saddr: 0,
            daddr: 0,
            sport: 0,
            dport: 0,
        },
        timestamp_ns: get_timestamp(),
        drop_reason: 0,
        drop_location: DROP_LOCATION_STACK,
        protocol: IPPROTO_TCP,
        _padding: [0; 2],
    };

    unsafe {
        let _ = PACKET_DROPS.output(ctx, &event, 0);
    }

    Ok(0)
}

// ============================================================================
// Connection lifecycle tracking (ambient)
// ============================================================================

/// Attached to: tcp_set_state (soft/optional hook).
#[kprobe]
pub fn tcp_set_state(ctx: ProbeContext) -> u32 {
    match try_tcp_set_state(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_set_state(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_STATE_TRANSITIONS);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        return Ok(0);
    }

    let flow_key = match extract_flow_key(sock) {
        Ok(k) => k,
        Err(_) => return Ok(0),
    };
    let key = ConnectionKey {
        saddr: flow_key.saddr,
        daddr: flow_key.daddr,
        sport: flow_key.sport,
        dport: flow_key.dport,
    };

    let new_state: i32 = ctx.arg(1).ok_or(-1)?;
    let timestamp = get_timestamp();
    let pid = get_pid();

    let conn_state = match new_state {
        1 => {
            increment_stat(STAT_CONNECTIONS_OPENED);
            CONN_STATE_ESTABLISHED
        }
        2..=6 => CONN_STATE_ESTABLISHED,
        7 => {
            increment_stat(STAT_CONNECTIONS_CLOSED);
            CONN_STATE_CLOSED
        }
        8..=10 => CONN_STATE_CLOSING,
        _ => CONN_STATE_CONNECTING,
    };

    unsafe {
        if let Some(existing) = CONNECTION_STATES.get(&key) {
            let mut updated = *existing;
            updated.state = conn_state;
            if conn_state == CONN_STATE_CLOSED {
                updated.close_time_ns = timestamp;
            }
            let _ = CONNECTION_STATES.insert(&key, &updated, 0);
        } else {
            let new_conn_state = ConnectionState {
                key,
                start_time_ns: timestamp,
                close_time_ns: if conn_state == CONN_STATE_CLOSED { timestamp } else { 0 },
                state: conn_state,
                bytes_sent: 0,
                bytes_received: 0,
                pid,
                _padding: [0; 4],
            };
            let _ = CONNECTION_STATES.insert(&key, &new_conn_state, 0);
        }
    }

    Ok(0)
}

/// Attached to: tcp_v4_connect (soft/optional hook).
#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    match try_tcp_v4_connect(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_v4_connect(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        return Ok(0);
    }

    let flow_key = match extract_flow_key(sock) {
        Ok(k) => k,
        Err(_) => return Ok(0),
    };
    let key = ConnectionKey {
        saddr: flow_key.saddr,
        daddr: flow_key.daddr,
        sport: flow_key.sport,
        dport: flow_key.dport,
    };

    let timestamp = get_timestamp();
    let pid = get_pid();

    unsafe {
        let conn_state = ConnectionState {
            key,
            start_time_ns: timestamp,
            close_time_ns: 0,
            state: CONN_STATE_CONNECTING,
            bytes_sent: 0,
            bytes_received: 0,
            pid,
            _padding: [0; 4],
        };
        let _ = CONNECTION_STATES.insert(&key, &conn_state, 0);
    }

    Ok(0)
}

/// Attached to: tcp_close (soft/optional hook).
///
/// Also performs best-effort cleanup of FLOW_START/SOCK_INDEX for this
/// socket so a closed connection doesn't leave a stale baseline behind
/// for the LRU to evict later.
#[kprobe]
pub fn tcp_close(ctx: ProbeContext) -> u32 {
    match try_tcp_close(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_close(ctx: &ProbeContext) -> Result<u32, i64> {
    increment_stat(STAT_TOTAL_EVENTS);

    let sock = get_sock_from_context(ctx)?;

    if !is_valid_socket(sock) {
        return Ok(0);
    }

    let flow_key = match extract_flow_key(sock) {
        Ok(k) => k,
        Err(_) => return Ok(0),
    };
    let key = ConnectionKey {
        saddr: flow_key.saddr,
        daddr: flow_key.daddr,
        sport: flow_key.sport,
        dport: flow_key.dport,
    };
    let timestamp = get_timestamp();
    let identity = sock_identity(sock);

    unsafe {
        if let Some(existing) = CONNECTION_STATES.get(&key) {
            let mut updated = *existing;
            updated.state = CONN_STATE_CLOSING;
            updated.close_time_ns = timestamp;
            let _ = CONNECTION_STATES.insert(&key, &updated, 0);
        }
        let _ = FLOW_START.remove(&flow_key);
        let _ = SOCK_INDEX.remove(&identity);
        let _ = PER_FLOW_AGG.remove(&flow_key);
    }

    Ok(0)
}

// ============================================================================
// XDP packet monitoring (ambient)
// ============================================================================

/// Attached to: a network interface via the XDP hook (soft/optional;
/// never drops or redirects, observation-only).
#[xdp]
pub fn xdp_packet_monitor(ctx: XdpContext) -> u32 {
    match try_xdp_packet_monitor(&ctx) {
        Ok(action) => action,
        Err(_) => xdp_action::XDP_ABORTED,
    }
}

fn try_xdp_packet_monitor(ctx: &XdpContext) -> Result<u32, ()> {
    increment_stat(STAT_TOTAL_EVENTS);
    increment_stat(STAT_XDP_PACKETS);

    let eth_hdr = ptr_at::<EthHdr>(ctx, 0)?;
    let eth_proto = u16::from_be(unsafe { (*eth_hdr).ether_type });

    if eth_proto != ETH_P_IP {
        return Ok(xdp_action::XDP_PASS);
    }

    increment_stat(STAT_XDP_IPV4_PACKETS);

    let ip_hdr = ptr_at::<IpHdr>(ctx, EthHdr::LEN)?;
    let protocol = unsafe { (*ip_hdr).protocol };

    match protocol {
        IPPROTO_TCP => {
            increment_stat(STAT_XDP_TCP_PACKETS);

            let tcp_hdr = ptr_at::<TcpHdr>(ctx, EthHdr::LEN + IpHdr::LEN)?;

            let saddr = u32::from_be(unsafe { (*ip_hdr).saddr });
            let daddr = u32::from_be(unsafe { (*ip_hdr).daddr });
            let sport = u16::from_be(unsafe { (*tcp_hdr).source });
            let dport = u16::from_be(unsafe { (*tcp_hdr).dest });

            let key = ConnectionKey { saddr, daddr, sport, dport };
            let packet_len = (ctx.data_end() - ctx.data()) as u64;

            unsafe {
                match XDP_CONN_STATS.get_ptr_mut(&key) {
                    Some(stats) => {
                        (*stats).packet_count += 1;
                        (*stats).byte_count += packet_len;
                        (*stats).last_seen_ns = get_timestamp();
                    }
                    None => {
                        let new_stats = XdpConnStats {
                            packet_count: 1,
                            byte_count: packet_len,
                            last_seen_ns: get_timestamp(),
                            drop_count: 0,
                        };
                        let _ = XDP_CONN_STATS.insert(&key, &new_stats, 0);
                    }
                }
            }
        }
        IPPROTO_UDP => increment_stat(STAT_XDP_UDP_PACKETS),
        IPPROTO_ICMP => increment_stat(STAT_XDP_ICMP_PACKETS),
        _ => increment_stat(STAT_XDP_OTHER_PACKETS),
    }

    // Observation-only: every packet is passed through to the stack.
    Ok(xdp_action::XDP_PASS)
}

#[inline(always)]
fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*const T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = core::mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }

    Ok((start + offset) as *const T)
}

#[repr(C)]
struct EthHdr {
    dst_addr: [u8; 6],
    src_addr: [u8; 6],
    ether_type: u16,
}

impl EthHdr {
    const LEN: usize = 14;
}

#[repr(C)]
struct IpHdr {
    _bitfield: u8,
    _tos: u8,
    _tot_len: u16,
    _id: u16,
    _frag_off: u16,
    _ttl: u8,
    protocol: u8,
    _check: u16,
    saddr: u32,
    daddr: u32,
}

impl IpHdr {
    const LEN: usize = 20;
}

#[repr(C)]
struct TcpHdr {
    source: u16,
    dest: u16,
    _seq: u32,
    _ack_seq: u32,
    _res1_doff: u16,
    _flags: u16,
    _window: u16,
    _check: u16,
    _urg_ptr: u16,
}

const ETH_P_IP: u16 = 0x0800;
