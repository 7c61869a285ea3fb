//! eBPF IPS Probe - Kernel Space Program
//!
//! Watches TCP connection establishment and turns it into classified
//! alerts: outbound connects through tcp_v4_connect (entry and return)
//! and inbound accepts through inet_csk_accept (return).
//!
//! ## Architecture
//!
//! ```text
//! tcp_v4_connect()       -> stash sock pointer in CONNECT_ARGS by pid_tgid
//!                           |
//! tcp_v4_connect() ret   -> resolve addresses, SSH_ATTEMPT / CONNECT_OBSERVED
//!                           |
//! inet_csk_accept() ret  -> per-IP window in FAILED_LOGINS,
//!                           SSH_ATTEMPT / SSH_AUTH_FAIL / BRUTE_FORCE_THRESHOLD
//!                           |
//!                           v
//! ALERT_EVENTS ring buffer -> userspace bridge
//! ```
//!
//! A second, independent program set reports process activity into
//! ACTIVITY_EVENTS, gated by MONITOR_CONFIG:
//!
//! ```text
//! raw_syscalls:sys_enter     -> per-PID SYSCALL_COUNTS, SYSCALL record
//! do_filp_open()             -> FILE_OPEN record with the path
//! tcp_sendmsg/tcp_recvmsg()  -> TCP_SEND / TCP_RECV record with the size
//! sched:sched_process_fork   -> PROCESS_FORK record, parent remembered
//! sched:sched_process_exit   -> per-PID entries removed
//! ```
//!
//! Every probe reads IPS_CONFIG first and does nothing while it is
//! disabled. Map and ring buffer failures are counted and swallowed so
//! the traced syscall never observes them.
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none -Z build-std=core
//! ```
//!
//! The compiled bytecode is then loaded by the userspace bridge.

#![no_std]
#![no_main]

mod activity;
mod handlers;
mod helpers;
mod maps;
mod socket_parser;

// Re-export probe functions so they're visible to the loader
pub use activity::{
    monitor_file_open, monitor_process_exit, monitor_process_fork, monitor_sys_enter,
    monitor_tcp_recvmsg, monitor_tcp_sendmsg,
};
pub use handlers::{inet_csk_accept_ret, tcp_v4_connect, tcp_v4_connect_ret};

// Re-export maps for verification
pub use maps::{
    ACTIVITY_EVENTS, ALERT_EVENTS, CONNECT_ARGS, FAILED_LOGINS, IPS_CONFIG, MONITORED_PROCESSES,
    MONITOR_CONFIG, PROBE_STATS, PROCESS_STATS, SYSCALL_COUNTS,
};

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // eBPF programs cannot panic - this should never be reached
    // The verifier should catch any potential panics
    loop {}
}
