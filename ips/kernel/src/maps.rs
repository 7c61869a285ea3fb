//! BPF map definitions for the IPS probe
//!
//! Defines the ring buffer used to hand alerts to userspace, the
//! per-IP window table, the runtime configuration, and the scratch map
//! that ties tcp_v4_connect entry to its return. The activity monitor
//! has its own ring buffer, configuration and per-PID tables.

use aya_ebpf::{
    macros::map,
    maps::{Array, HashMap, LruHashMap, RingBuf},
};
use probe_common::{constants::*, types::*};

/// Ring buffer carrying AlertEvent records to userspace
///
/// Reservations that do not fit are dropped, never retried. Userspace
/// may resize it at load time.
#[map]
pub static ALERT_EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_BUFFER_BYTES, 0);

/// Per-source-IP sliding window state
///
/// Key: IPv4 address (network byte order)
/// Value: IpTrack
///
/// LRU so a flood of distinct sources evicts stale entries instead of
/// failing inserts.
#[map]
pub static FAILED_LOGINS: LruHashMap<u32, IpTrack> =
    LruHashMap::with_max_entries(MAX_TRACKED_IPS, 0);

/// Runtime configuration, single entry at CONFIG_INDEX
#[map]
pub static IPS_CONFIG: Array<IpsConfig> = Array::with_max_entries(1, 0);

/// In-flight tcp_v4_connect calls
///
/// Key: pid_tgid of the calling thread
/// Value: struct sock pointer passed to tcp_v4_connect
#[map]
pub static CONNECT_ARGS: HashMap<u64, u64> = HashMap::with_max_entries(MAX_PENDING_CONNECTS, 0);

/// Per-process connection counters, read on demand by userspace
#[map]
pub static PROCESS_STATS: LruHashMap<u32, ProcessStats> =
    LruHashMap::with_max_entries(MAX_PROCESSES, 0);

/// Statistics counter map
///
/// Tracks probe health.
/// Key: stat_id (see STAT_* constants)
/// Value: u64 counter
#[map]
pub static PROBE_STATS: HashMap<u32, u64> = HashMap::with_max_entries(MAX_STATS, 0);

/// Ring buffer carrying ActivityEvent records to userspace
#[map]
pub static ACTIVITY_EVENTS: RingBuf = RingBuf::with_byte_size(SYSCALL_RING_BUFFER_BYTES, 0);

/// Activity monitor configuration, single entry at CONFIG_INDEX
#[map]
pub static MONITOR_CONFIG: Array<MonitorConfig> = Array::with_max_entries(1, 0);

/// Processes seen by the activity monitor
///
/// Key: pid (tgid)
/// Value: MonitoredProcess
#[map]
pub static MONITORED_PROCESSES: LruHashMap<u32, MonitoredProcess> =
    LruHashMap::with_max_entries(MAX_PROCESSES, 0);

/// Syscall entries per process
///
/// Key: pid (tgid)
/// Value: u64 counter
#[map]
pub static SYSCALL_COUNTS: LruHashMap<u32, u64> = LruHashMap::with_max_entries(MAX_PROCESSES, 0);
