//! Helper functions for eBPF programs
//!
//! Provides safe wrappers around BPF helper functions and the shared
//! pieces every probe needs: config lookup, counters, alert submission.

use aya_ebpf::helpers::{
    bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid, bpf_ktime_get_ns,
};
use probe_common::{constants::*, types::*, window::Verdict};

use crate::maps::{ALERT_EVENTS, IPS_CONFIG, MONITOR_CONFIG, PROBE_STATS, PROCESS_STATS};

/// Get current timestamp in nanoseconds
#[inline(always)]
pub fn get_timestamp() -> u64 {
    unsafe { bpf_ktime_get_ns() }
}

/// Get current pid_tgid, the per-thread correlation key
#[inline(always)]
pub fn get_pid_tgid() -> u64 {
    bpf_get_current_pid_tgid()
}

/// Get current process ID
#[inline(always)]
pub fn get_pid() -> u32 {
    (get_pid_tgid() >> 32) as u32
}

/// Get current (uid, gid)
#[inline(always)]
pub fn get_uid_gid() -> (u32, u32) {
    let uid_gid = bpf_get_current_uid_gid();
    (uid_gid as u32, (uid_gid >> 32) as u32)
}

/// Get current task comm, zeroed if unavailable
#[inline(always)]
pub fn get_comm() -> [u8; TASK_COMM_LEN] {
    bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
}

/// Read the runtime configuration
///
/// Returns None when the probe should do nothing: no entry, or disabled.
#[inline(always)]
pub fn active_config() -> Option<IpsConfig> {
    match IPS_CONFIG.get(CONFIG_INDEX) {
        Some(cfg) if cfg.is_enabled() => Some(*cfg),
        _ => None,
    }
}

/// Read the activity monitor configuration, zeroed when absent
#[inline(always)]
pub fn active_monitor() -> MonitorConfig {
    match MONITOR_CONFIG.get(CONFIG_INDEX) {
        Some(cfg) => *cfg,
        None => MonitorConfig::zeroed(),
    }
}

/// Increment a statistics counter
///
/// Safely increments a counter in the PROBE_STATS map.
#[inline(always)]
pub fn increment_stat(stat_id: u32) {
    unsafe {
        if let Some(count) = PROBE_STATS.get(&stat_id) {
            let new_count = *count + 1;
            let _ = PROBE_STATS.insert(&stat_id, &new_count, 0);
        } else {
            let _ = PROBE_STATS.insert(&stat_id, &1u64, 0);
        }
    }
}

/// Bump the connect or accept counter of the current process
#[inline(always)]
pub fn record_process_activity(is_accept: bool) {
    let pid = get_pid();

    if let Some(stats) = PROCESS_STATS.get_ptr_mut(&pid) {
        unsafe {
            if is_accept {
                (*stats).accept_count += 1;
            } else {
                (*stats).connect_count += 1;
            }
        }
        return;
    }

    let mut stats = ProcessStats::new(pid, get_timestamp(), get_comm());
    if is_accept {
        stats.accept_count = 1;
    } else {
        stats.connect_count = 1;
    }
    if PROCESS_STATS.insert(&pid, &stats, 0).is_err() {
        increment_stat(STAT_MAP_UPDATE_FAILED);
    }
}

/// Create an alert event
///
/// Fills in pid and comm from the current task.
#[inline(always)]
pub fn create_alert(
    source_ip: u32,
    dest_ip: u32,
    source_port: u16,
    dest_port: u16,
    verdict: &Verdict,
) -> AlertEvent {
    let mut event = AlertEvent::zeroed();
    event.source_ip = source_ip;
    event.dest_ip = dest_ip;
    event.source_port = source_port;
    event.dest_port = dest_port;
    event.pid = get_pid();
    event.fail_count = verdict.fail_count;
    event.first_seen = verdict.first_seen;
    event.last_seen = verdict.last_seen;
    event.alert_kind = verdict.alert_kind;
    event.process_name = get_comm();
    event
}

/// Reserve, fill and submit one alert
///
/// A full ring buffer drops the alert; the caller is never told.
#[inline(always)]
pub fn submit_alert(event: AlertEvent) {
    match ALERT_EVENTS.reserve::<AlertEvent>(0) {
        Some(mut entry) => {
            entry.write(event);
            entry.submit(0);
            increment_stat(STAT_ALERTS_SUBMITTED);
        }
        None => increment_stat(STAT_RINGBUF_FULL),
    }
}
