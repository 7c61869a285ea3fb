//! Probe handlers for TCP connection tracking
//!
//! Implements the eBPF programs that attach to the TCP connect and accept
//! paths and classify what they see.

use aya_ebpf::{
    macros::{kprobe, kretprobe},
    programs::{ProbeContext, RetProbeContext},
};
use aya_log_ebpf::warn;
use probe_common::{
    constants::*,
    types::*,
    window::{classify_connect, Verdict},
};

use crate::{helpers::*, maps::*, socket_parser::*};

/// Remember the socket of an outbound connect
///
/// Attached to: tcp_v4_connect (entry)
///
/// The resolved addresses are only reliable once the call returns, so
/// the socket pointer is stashed for the return probe.
#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    match try_tcp_v4_connect(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_v4_connect(ctx: &ProbeContext) -> Result<u32, i64> {
    if active_config().is_none() {
        return Ok(0);
    }

    let sock = get_sock_from_context(ctx)?;
    let pid_tgid = get_pid_tgid();

    if CONNECT_ARGS.insert(&pid_tgid, &(sock as u64), 0).is_err() {
        increment_stat(STAT_MAP_UPDATE_FAILED);
    }

    Ok(0)
}

/// Classify a completed outbound connect
///
/// Attached to: tcp_v4_connect (return)
///
/// SSH on either end always produces SSH_ATTEMPT. Anything else produces
/// CONNECT_OBSERVED only when monitor_all_connections is set. Failed
/// connects only clean up.
#[kretprobe]
pub fn tcp_v4_connect_ret(ctx: RetProbeContext) -> u32 {
    match try_tcp_v4_connect_ret(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_v4_connect_ret(ctx: &RetProbeContext) -> Result<u32, i64> {
    let pid_tgid = get_pid_tgid();

    // Disabled means no counters move. A stash left by an entry that ran
    // before the switch flipped is still dropped.
    let config = match active_config() {
        Some(cfg) => cfg,
        None => {
            let _ = CONNECT_ARGS.remove(&pid_tgid);
            return Ok(0);
        }
    };

    let sock = match unsafe { CONNECT_ARGS.get(&pid_tgid) } {
        Some(ptr) => *ptr as *const sock,
        None => {
            increment_stat(STAT_ORPHAN_RETURNS);
            return Ok(0);
        }
    };
    let _ = CONNECT_ARGS.remove(&pid_tgid);

    let ret: i32 = ctx.ret().ok_or(-1i64)?;
    if ret != 0 {
        return Ok(0);
    }

    let addrs = match read_sock_addrs(sock) {
        Ok(a) => a,
        Err(_) => {
            increment_stat(STAT_NON_IPV4);
            return Ok(0);
        }
    };

    increment_stat(STAT_CONNECTS_SEEN);
    record_process_activity(false);

    let alert_kind = match classify_connect(addrs.local_port, addrs.remote_port, &config) {
        Some(kind) => kind,
        None => return Ok(0),
    };

    let now = get_timestamp();
    let verdict = Verdict {
        alert_kind,
        fail_count: 0,
        first_seen: now,
        last_seen: now,
    };

    submit_alert(create_alert(
        addrs.local_ip,
        addrs.remote_ip,
        addrs.local_port,
        addrs.remote_port,
        &verdict,
    ));

    Ok(0)
}

/// Count inbound SSH connections per source IP
///
/// Attached to: inet_csk_accept (return)
///
/// Only sockets whose local port is the SSH port are considered. The
/// remote address is run through the sliding window in FAILED_LOGINS.
#[kretprobe]
pub fn inet_csk_accept_ret(ctx: RetProbeContext) -> u32 {
    match try_inet_csk_accept_ret(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_inet_csk_accept_ret(ctx: &RetProbeContext) -> Result<u32, i64> {
    let config = match active_config() {
        Some(cfg) => cfg,
        None => return Ok(0),
    };

    let sock: *const sock = ctx.ret().ok_or(-1i64)?;
    if sock.is_null() {
        return Ok(0);
    }

    increment_stat(STAT_ACCEPTS_SEEN);
    record_process_activity(true);

    let addrs = match read_sock_addrs(sock) {
        Ok(a) => a,
        Err(_) => {
            increment_stat(STAT_NON_IPV4);
            return Ok(0);
        }
    };

    if addrs.local_port != SSH_PORT {
        return Ok(0);
    }
    increment_stat(STAT_SSH_ACCEPTS);

    let source_ip = addrs.remote_ip;
    let now = get_timestamp();

    let verdict = match FAILED_LOGINS.get_ptr_mut(&source_ip) {
        // The pointer refers to the map value, so the update persists
        Some(track) => unsafe { (*track).record_accept(now, &config) },
        None => {
            if FAILED_LOGINS.insert(&source_ip, &IpTrack::new(now), 0).is_err() {
                increment_stat(STAT_MAP_UPDATE_FAILED);
            }
            Verdict::first_sighting(now)
        }
    };

    if verdict.is_threshold() {
        warn!(
            ctx,
            "ssh threshold reached by {:i}: {} accepts",
            u32::from_be(source_ip),
            verdict.fail_count
        );
    }

    submit_alert(create_alert(
        source_ip,
        addrs.local_ip,
        addrs.remote_port,
        SSH_PORT,
        &verdict,
    ));

    Ok(0)
}
