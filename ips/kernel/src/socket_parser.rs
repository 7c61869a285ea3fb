//! Socket structure parsing utilities
//!
//! Reads the address and port pair out of `struct sock`. Only the leading
//! `sock_common` fields are declared; their offsets are stable across the
//! kernels we target.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use probe_common::constants::AF_INET;

/// Kernel struct sock representation (partial)
#[allow(non_camel_case_types)]
#[repr(C)]
pub struct sock {
    __sk_common: sock_common,
}

/// Kernel struct sock_common (partial)
#[allow(non_camel_case_types)]
#[repr(C)]
struct sock_common {
    skc_daddr: u32,     // Remote address (network byte order)
    skc_rcv_saddr: u32, // Local address (network byte order)
    skc_hash: u32,
    skc_dport: u16,  // Remote port (network byte order)
    skc_num: u16,    // Local port (host byte order)
    skc_family: u16, // Address family (AF_INET, AF_INET6)
}

/// Addresses of an IPv4 TCP socket, seen from the local end
#[derive(Clone, Copy)]
pub struct SockAddrs {
    /// Local address (network byte order)
    pub local_ip: u32,
    /// Remote address (network byte order)
    pub remote_ip: u32,
    /// Local port (host byte order)
    pub local_port: u16,
    /// Remote port (host byte order)
    pub remote_port: u16,
}

/// Extract socket pointer from kprobe context
///
/// The first argument to tcp_v4_connect is a pointer to struct sock.
#[inline(always)]
pub fn get_sock_from_context(ctx: &ProbeContext) -> Result<*const sock, i64> {
    ctx.arg::<*const sock>(0).ok_or(-1)
}

/// Read the address pair from a socket
///
/// Errors with -1 on a null pointer or failed read, -2 for anything
/// other than AF_INET (IPv6 is not tracked).
#[inline(always)]
pub fn read_sock_addrs(sock_ptr: *const sock) -> Result<SockAddrs, i64> {
    if sock_ptr.is_null() {
        return Err(-1);
    }

    // sk_common is at the beginning of struct sock
    let sk_common = unsafe {
        let common_ptr = sock_ptr as *const sock_common;
        bpf_probe_read_kernel(common_ptr).map_err(|_| -1i64)?
    };

    if sk_common.skc_family != AF_INET {
        return Err(-2);
    }

    Ok(SockAddrs {
        local_ip: sk_common.skc_rcv_saddr,
        remote_ip: sk_common.skc_daddr,
        local_port: sk_common.skc_num,
        remote_port: u16::from_be(sk_common.skc_dport),
    })
}
