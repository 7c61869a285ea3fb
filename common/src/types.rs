//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code. Every padding byte is an
//! explicit field so both sides agree byte-for-byte.

use crate::constants::*;

/// Alert record sent from kernel to userspace through the ring buffer
///
/// IP addresses are in network byte order, ports in host byte order.
///
/// ```text
/// offset  field         size
/// 0       source_ip     4
/// 4       dest_ip       4
/// 8       source_port   2
/// 10      dest_port     2
/// 12      pid           4
/// 16      fail_count    4
/// 20      _pad0         4
/// 24      first_seen    8
/// 32      last_seen     8
/// 40      alert_kind    1
/// 41      _pad1         7
/// 48      process_name  16
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlertEvent {
    /// Source IPv4 address (network byte order)
    pub source_ip: u32,
    /// Destination IPv4 address (network byte order)
    pub dest_ip: u32,
    /// Source port (host byte order)
    pub source_port: u16,
    /// Destination port (host byte order)
    pub dest_port: u16,
    /// Process that was running when the probe fired (0 if unknown)
    pub pid: u32,
    /// Failures counted in the current window at alert time
    pub fail_count: u32,
    /// Padding for alignment
    pub _pad0: u32,
    /// Window start, kernel monotonic nanoseconds
    pub first_seen: u64,
    /// Latest observation, kernel monotonic nanoseconds
    pub last_seen: u64,
    /// One of the ALERT_* constants
    pub alert_kind: u8,
    /// Padding for alignment
    pub _pad1: [u8; 7],
    /// Task comm, NUL padded, not necessarily NUL terminated
    pub process_name: [u8; TASK_COMM_LEN],
}

impl AlertEvent {
    /// Size of the record on the wire
    pub const SIZE: usize = core::mem::size_of::<AlertEvent>();

    /// Create a zero-initialized event
    pub const fn zeroed() -> Self {
        Self {
            source_ip: 0,
            dest_ip: 0,
            source_port: 0,
            dest_port: 0,
            pid: 0,
            fail_count: 0,
            _pad0: 0,
            first_seen: 0,
            last_seen: 0,
            alert_kind: 0,
            _pad1: [0; 7],
            process_name: [0; TASK_COMM_LEN],
        }
    }
}

/// Per-source-IP tracking entry stored in FAILED_LOGINS
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpTrack {
    /// Failures counted since window_start
    pub fail_count: u32,
    /// Padding for alignment
    pub _pad: u32,
    /// Anchor of the current sliding window
    pub window_start: u64,
    /// First observation reported for the current window
    pub first_seen: u64,
    /// Most recent observation
    pub last_seen: u64,
}

impl IpTrack {
    /// Entry created on the first connection seen from an IP
    pub const fn new(now: u64) -> Self {
        Self {
            fail_count: 0,
            _pad: 0,
            window_start: now,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// Runtime configuration, the single value in IPS_CONFIG
///
/// Written by the bridge, read by every probe invocation. A zeroed entry
/// (the state of a freshly created array map) means disabled.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpsConfig {
    /// Master switch, non-zero means enabled
    pub enabled: u32,
    /// Failures within the window that trigger a threshold alert (0 = default)
    pub fail_threshold: u32,
    /// Sliding window in nanoseconds (0 = default)
    pub window_ns: u64,
    /// Non-zero to report every successful outbound connect
    pub monitor_all_connections: u32,
    /// Padding for alignment
    pub _pad: u32,
}

impl IpsConfig {
    /// Create a zero-initialized (disabled) configuration
    pub const fn zeroed() -> Self {
        Self {
            enabled: 0,
            fail_threshold: 0,
            window_ns: 0,
            monitor_all_connections: 0,
            _pad: 0,
        }
    }

    #[inline(always)]
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    #[inline(always)]
    pub fn monitors_all(&self) -> bool {
        self.monitor_all_connections != 0
    }

    /// Threshold with the zero-means-default rule applied
    #[inline(always)]
    pub fn effective_threshold(&self) -> u32 {
        if self.fail_threshold == 0 {
            DEFAULT_FAIL_THRESHOLD
        } else {
            self.fail_threshold
        }
    }

    /// Window with the zero-means-default rule applied
    #[inline(always)]
    pub fn effective_window_ns(&self) -> u64 {
        if self.window_ns == 0 {
            DEFAULT_WINDOW_NS
        } else {
            self.window_ns
        }
    }
}

/// Per-process connection counters stored in PROCESS_STATS
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessStats {
    /// Process id (tgid)
    pub pid: u32,
    /// Padding for alignment
    pub _pad: u32,
    /// First time the process was seen by a probe
    pub first_seen: u64,
    /// Successful outbound IPv4 connects
    pub connect_count: u64,
    /// Accepted inbound connections
    pub accept_count: u64,
    /// Task comm at first sighting
    pub comm: [u8; TASK_COMM_LEN],
}

impl ProcessStats {
    pub const fn new(pid: u32, now: u64, comm: [u8; TASK_COMM_LEN]) -> Self {
        Self {
            pid,
            _pad: 0,
            first_seen: now,
            connect_count: 0,
            accept_count: 0,
            comm,
        }
    }
}

/// Activity monitor record sent through ACTIVITY_EVENTS
///
/// `arg` carries the requested byte count for TCP records; `data` holds
/// a NUL-padded path for file opens and for open/exec syscalls.
///
/// ```text
/// offset  field        size
/// 0       kind         4
/// 4       pid          4
/// 8       ppid         4
/// 12      uid          4
/// 16      gid          4
/// 20      _pad         4
/// 24      timestamp    8
/// 32      syscall_nr   8
/// 40      arg          8
/// 48      comm         16
/// 64      data         256
/// ```
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActivityEvent {
    /// One of the ACTIVITY_* constants
    pub kind: u32,
    pub pid: u32,
    /// Parent pid, only known for fork records
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Padding for alignment
    pub _pad: u32,
    /// Kernel monotonic nanoseconds
    pub timestamp: u64,
    /// Syscall number for ACTIVITY_SYSCALL, -1 otherwise
    pub syscall_nr: i64,
    pub arg: u64,
    pub comm: [u8; TASK_COMM_LEN],
    pub data: [u8; ACTIVITY_DATA_LEN],
}

impl ActivityEvent {
    /// Size of the record on the wire
    pub const SIZE: usize = core::mem::size_of::<ActivityEvent>();

    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            pid: 0,
            ppid: 0,
            uid: 0,
            gid: 0,
            _pad: 0,
            timestamp: 0,
            syscall_nr: 0,
            arg: 0,
            comm: [0; TASK_COMM_LEN],
            data: [0; ACTIVITY_DATA_LEN],
        }
    }
}

/// Activity monitor configuration, the single value in MONITOR_CONFIG
///
/// Each flag switches one family of programs on. A zeroed entry turns
/// every activity program into a no-op.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Non-zero to report forks and clean up after exits
    pub process_lifecycle: u32,
    /// Non-zero to report every syscall entry
    pub syscalls: u32,
    /// Non-zero to report kernel file opens
    pub files: u32,
    /// Non-zero to report TCP send and receive calls
    pub network: u32,
    /// Only report this process (0 = every process)
    pub target_pid: u32,
}

impl MonitorConfig {
    pub const fn zeroed() -> Self {
        Self {
            process_lifecycle: 0,
            syscalls: 0,
            files: 0,
            network: 0,
            target_pid: 0,
        }
    }

    /// Whether the pid filter lets `pid` through
    #[inline(always)]
    pub fn admits(&self, pid: u32) -> bool {
        self.target_pid == 0 || self.target_pid == pid
    }

    #[inline(always)]
    pub fn tracks_lifecycle(&self) -> bool {
        self.process_lifecycle != 0
    }

    /// Whether an activity of `kind` performed by `pid` should be reported
    ///
    /// Forks are reported for every process; the pid filter applies to
    /// the per-process kinds only.
    #[inline(always)]
    pub fn traces(&self, kind: u32, pid: u32) -> bool {
        let flag = match kind {
            ACTIVITY_SYSCALL => self.syscalls,
            ACTIVITY_FILE_OPEN => self.files,
            ACTIVITY_TCP_SEND | ACTIVITY_TCP_RECV => self.network,
            ACTIVITY_PROCESS_FORK => return self.tracks_lifecycle(),
            _ => 0,
        };
        flag != 0 && self.admits(pid)
    }
}

/// Identity of a process seen by the activity monitor, in MONITORED_PROCESSES
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitoredProcess {
    pub pid: u32,
    /// Parent pid when the fork was observed, 0 otherwise
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// First time the monitor saw the process
    pub start_time: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

// Compile-time layout checks
// These will fail to compile if a field change breaks the wire format
const _: () = {
    assert!(core::mem::size_of::<AlertEvent>() == 64);
    assert!(core::mem::size_of::<AlertEvent>() % core::mem::align_of::<AlertEvent>() == 0);
    assert!(core::mem::size_of::<IpTrack>() == 32);
    assert!(core::mem::size_of::<IpsConfig>() == 24);
    assert!(core::mem::size_of::<ProcessStats>() == 48);
    assert!(core::mem::size_of::<ActivityEvent>() == 320);
    assert!(core::mem::size_of::<MonitorConfig>() == 20);
    assert!(core::mem::size_of::<MonitoredProcess>() == 40);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // SAFETY: every type here is repr(C), contains only integers and byte
    // arrays, and spells out its padding, so any bit pattern is valid.
    unsafe impl aya::Pod for AlertEvent {}
    unsafe impl aya::Pod for IpTrack {}
    unsafe impl aya::Pod for IpsConfig {}
    unsafe impl aya::Pod for ProcessStats {}
    unsafe impl aya::Pod for ActivityEvent {}
    unsafe impl aya::Pod for MonitorConfig {}
    unsafe impl aya::Pod for MonitoredProcess {}
}
