//! Shared constants for the IPS probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in map names, limits and alert codes. The
//! process activity monitor has its own maps and record kinds below.

// ============================================================================
// BPF Map Names
// ============================================================================

/// Ring buffer carrying `AlertEvent` records to userspace
pub const MAP_ALERT_EVENTS: &str = "ALERT_EVENTS";

/// LRU hash of per-source-IP window state
pub const MAP_FAILED_LOGINS: &str = "FAILED_LOGINS";

/// Single-entry runtime configuration array
pub const MAP_IPS_CONFIG: &str = "IPS_CONFIG";

/// Scratch map correlating connect entry and return
pub const MAP_CONNECT_ARGS: &str = "CONNECT_ARGS";

/// Per-PID connection counters
pub const MAP_PROCESS_STATS: &str = "PROCESS_STATS";

/// Probe health counters
pub const MAP_PROBE_STATS: &str = "PROBE_STATS";

/// Ring buffer carrying `ActivityEvent` records to userspace
pub const MAP_ACTIVITY_EVENTS: &str = "ACTIVITY_EVENTS";

/// Single-entry activity monitor configuration array
pub const MAP_MONITOR_CONFIG: &str = "MONITOR_CONFIG";

/// Per-PID identity of processes seen by the activity monitor
pub const MAP_MONITORED_PROCESSES: &str = "MONITORED_PROCESSES";

/// Per-PID syscall entry counts
pub const MAP_SYSCALL_COUNTS: &str = "SYSCALL_COUNTS";

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Default ring buffer size in bytes (64 KiB, alerts are infrequent)
pub const DEFAULT_RING_BUFFER_BYTES: u32 = 64 * 1024;

/// Default activity ring buffer size in bytes (256 KiB, syscall tracing is chatty)
pub const SYSCALL_RING_BUFFER_BYTES: u32 = 256 * 1024;

/// Maximum number of source IPs tracked before LRU eviction
pub const MAX_TRACKED_IPS: u32 = 4096;

/// Maximum number of in-flight connect() calls awaiting their return probe
pub const MAX_PENDING_CONNECTS: u32 = 4096;

/// Maximum number of processes with connection counters, and of processes
/// tracked by the activity monitor
pub const MAX_PROCESSES: u32 = 1024;

/// Index of the only entry in the IPS_CONFIG and MONITOR_CONFIG arrays
pub const CONFIG_INDEX: u32 = 0;

// ============================================================================
// Alert Kinds (for AlertEvent.alert_kind)
// ============================================================================

/// Successful outbound TCP connect (only with monitor_all_connections)
pub const ALERT_CONNECT_OBSERVED: u8 = 1;

/// SSH connection observed (outbound SSH, or first inbound from an IP)
pub const ALERT_SSH_ATTEMPT: u8 = 2;

/// Failure threshold reached within the window
pub const ALERT_BRUTE_FORCE_THRESHOLD: u8 = 3;

/// Inbound SSH connection counted as a failure
pub const ALERT_SSH_AUTH_FAIL: u8 = 4;

// ============================================================================
// Activity Kinds (for ActivityEvent.kind)
// ============================================================================

/// Syscall entry, syscall_nr set
pub const ACTIVITY_SYSCALL: u32 = 1;

/// Kernel file open, path in data
pub const ACTIVITY_FILE_OPEN: u32 = 2;

/// tcp_sendmsg call, requested size in arg
pub const ACTIVITY_TCP_SEND: u32 = 3;

/// tcp_recvmsg call, requested size in arg
pub const ACTIVITY_TCP_RECV: u32 = 4;

/// New process forked, pid is the child and ppid the parent
pub const ACTIVITY_PROCESS_FORK: u32 = 5;

/// Size of the free-form data field of an activity record
pub const ACTIVITY_DATA_LEN: usize = 256;

// ============================================================================
// Detection Defaults
// ============================================================================

/// Well-known SSH port (host byte order)
pub const SSH_PORT: u16 = 22;

/// Failure threshold applied when the configured one is zero
pub const DEFAULT_FAIL_THRESHOLD: u32 = 5;

/// Window applied when the configured one is zero (5 minutes in nanoseconds)
pub const DEFAULT_WINDOW_NS: u64 = 300 * 1_000_000_000;

/// Length of the kernel task comm buffer
pub const TASK_COMM_LEN: usize = 16;

// ============================================================================
// Protocol Numbers
// ============================================================================

/// IPv4 address family
pub const AF_INET: u16 = 2;

// ============================================================================
// Statistics Counter Indices (for PROBE_STATS map)
// ============================================================================

/// tcp_v4_connect return probes that observed a successful connect
pub const STAT_CONNECTS_SEEN: u32 = 0;

/// inet_csk_accept return probes with a socket
pub const STAT_ACCEPTS_SEEN: u32 = 1;

/// Accepts on the SSH port
pub const STAT_SSH_ACCEPTS: u32 = 2;

/// Alerts successfully submitted to the ring buffer
pub const STAT_ALERTS_SUBMITTED: u32 = 3;

/// Alerts dropped because the ring buffer had no room
pub const STAT_RINGBUF_FULL: u32 = 4;

/// Failed inserts into FAILED_LOGINS or CONNECT_ARGS
pub const STAT_MAP_UPDATE_FAILED: u32 = 5;

/// Connect return probes with no stashed socket
pub const STAT_ORPHAN_RETURNS: u32 = 6;

/// Sockets skipped because they were not AF_INET
pub const STAT_NON_IPV4: u32 = 7;

/// Syscall entries that passed the monitor filters
pub const STAT_SYSCALLS_SEEN: u32 = 8;

/// Activity records successfully submitted to their ring buffer
pub const STAT_ACTIVITY_SUBMITTED: u32 = 9;

/// Activity records dropped because their ring buffer had no room
pub const STAT_ACTIVITY_RINGBUF_FULL: u32 = 10;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 16;
