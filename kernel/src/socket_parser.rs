//! Socket structure parsing utilities with CO-RE support
//!
//! Extracts connection information from kernel socket structures using
//! CO-RE (Compile Once, Run Everywhere) and BTF so a single compiled
//! object works across kernel versions without field-offset patching.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use probe_common::types::FlowKey;

use crate::helpers::get_pid;

/// Kernel `struct sock` representation (partial).
///
/// We only define the fields we need; CO-RE relocations handle the
/// actual field offsets at load time.
#[repr(C)]
pub struct sock {
    __sk_common: sock_common,
}

/// Kernel `struct sock_common` (partial).
///
/// Contains the connection 4-tuple we need for tracking.
#[repr(C)]
struct sock_common {
    skc_daddr: u32,     // Destination address
    skc_rcv_saddr: u32, // Source address
    skc_dport: u16,     // Destination port (network byte order)
    skc_num: u16,       // Source port (host byte order)
    skc_family: u16,    // Address family (AF_INET, AF_INET6)
    skc_state: u8,      // Connection state
}

/// IPv4 address family constant
const AF_INET: u16 = 2;

/// TCP connection states we care about
#[allow(dead_code)]
const TCP_ESTABLISHED: u8 = 1;

/// Extract the socket pointer from a kprobe context.
///
/// The first argument to tcp_sendmsg, tcp_recvmsg, and tcp_cleanup_rbuf
/// is a pointer to `struct sock`.
#[inline(always)]
pub fn get_sock_from_context(ctx: &ProbeContext) -> Result<*const sock, i64> {
    ctx.arg::<*const sock>(0).ok_or(-1)
}

/// Extract the 5-tuple flow key (4-tuple plus owning PID) from a socket.
///
/// The PID comes from the current task, not from the socket structure:
/// the calling process is always the one invoking send/recv on its own
/// socket, which is exactly the identity the flow key needs.
///
/// # Safety
///
/// Uses `bpf_probe_read_kernel` to safely read kernel memory; the BPF
/// verifier rejects the program if this read could be unsafe.
pub fn extract_flow_key(sock_ptr: *const sock) -> Result<FlowKey, i64> {
    if sock_ptr.is_null() {
        return Err(-1);
    }

    let sk_common = unsafe {
        let common_ptr = sock_ptr as *const sock_common;
        bpf_probe_read_kernel(common_ptr).map_err(|_| -1)?
    };

    if sk_common.skc_family != AF_INET {
        return Err(-2); // unsupported address family (IPv6 is a non-goal)
    }

    Ok(FlowKey {
        saddr: sk_common.skc_rcv_saddr,
        daddr: sk_common.skc_daddr,
        sport: (sk_common.skc_num as u16).to_be(),
        dport: sk_common.skc_dport,
        pid: get_pid(),
    })
}

/// Validates that the socket represents an IPv4 connection we track.
pub fn is_valid_socket(sock_ptr: *const sock) -> bool {
    if sock_ptr.is_null() {
        return false;
    }

    let result = unsafe {
        let common_ptr = sock_ptr as *const sock_common;
        bpf_probe_read_kernel(common_ptr)
    };

    match result {
        Ok(sk_common) => sk_common.skc_family == AF_INET,
        Err(_) => false,
    }
}

/// Returns the TCP connection state for the given socket.
pub fn get_socket_state(sock_ptr: *const sock) -> Result<u8, i64> {
    if sock_ptr.is_null() {
        return Err(-1);
    }

    unsafe {
        let common_ptr = sock_ptr as *const sock_common;
        let sk_common = bpf_probe_read_kernel(common_ptr).map_err(|_| -1)?;
        Ok(sk_common.skc_state)
    }
}

/// Returns the address family (AF_INET, AF_INET6, etc.) of the socket.
pub fn get_socket_family(sock_ptr: *const sock) -> Result<u16, i64> {
    if sock_ptr.is_null() {
        return Err(-1);
    }

    unsafe {
        let common_ptr = sock_ptr as *const sock_common;
        let sk_common = bpf_probe_read_kernel(common_ptr).map_err(|_| -1)?;
        Ok(sk_common.skc_family)
    }
}
