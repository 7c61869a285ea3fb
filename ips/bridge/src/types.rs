//! Userspace type definitions
//!
//! Defines the decoded form of kernel records (alerts and activity
//! records) and the statistics the bridge reports.
//!
//! ## Organization
//!
//! This module separates kernel and userspace types:
//! - **Kernel Types**: Types shared with eBPF programs (from probe_common)
//! - **Userspace Types**: Decoded alerts, activity records and statistics

use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

// ============================================================================
// Kernel Types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace
    //!
    //! These are re-exported from the probe-common crate and must
    //! maintain binary compatibility with the eBPF programs.

    pub use probe_common::constants;
    pub use probe_common::types::{
        ActivityEvent, AlertEvent, IpTrack, IpsConfig, MonitorConfig, MonitoredProcess,
        ProcessStats,
    };
}

pub use kernel::{ActivityEvent, AlertEvent};
use kernel::constants::*;

/// Classification carried by every alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    ConnectObserved,
    SshAttempt,
    SshAuthFail,
    BruteForceThreshold,
}

impl AlertKind {
    /// Wire code of this kind
    pub fn code(self) -> u8 {
        match self {
            AlertKind::ConnectObserved => ALERT_CONNECT_OBSERVED,
            AlertKind::SshAttempt => ALERT_SSH_ATTEMPT,
            AlertKind::SshAuthFail => ALERT_SSH_AUTH_FAIL,
            AlertKind::BruteForceThreshold => ALERT_BRUTE_FORCE_THRESHOLD,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            ALERT_CONNECT_OBSERVED => Some(AlertKind::ConnectObserved),
            ALERT_SSH_ATTEMPT => Some(AlertKind::SshAttempt),
            ALERT_SSH_AUTH_FAIL => Some(AlertKind::SshAuthFail),
            ALERT_BRUTE_FORCE_THRESHOLD => Some(AlertKind::BruteForceThreshold),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::ConnectObserved => "CONNECT_OBSERVED",
            AlertKind::SshAttempt => "SSH_ATTEMPT",
            AlertKind::SshAuthFail => "SSH_AUTH_FAIL",
            AlertKind::BruteForceThreshold => "BRUTE_FORCE_THRESHOLD",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded alert, as handed to callbacks and the pull queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub source_ip: Ipv4Addr,
    pub dest_ip: Ipv4Addr,
    pub source_port: u16,
    pub dest_port: u16,
    pub pid: u32,
    pub fail_count: u32,
    /// Window start, kernel monotonic nanoseconds
    pub first_seen_ns: u64,
    /// Latest observation, kernel monotonic nanoseconds
    pub last_seen_ns: u64,
    pub process_name: String,
    /// Raw comm bytes, kept so the record can be rebuilt exactly
    #[serde(skip)]
    process_name_raw: [u8; TASK_COMM_LEN],
}

impl Alert {
    /// Decode a raw ring buffer record
    ///
    /// Records shorter than `AlertEvent` are rejected; longer ones are
    /// read up to the record size.
    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        if data.len() < AlertEvent::SIZE {
            return Err(BridgeError::Decode(format!(
                "record is {} bytes, expected {}",
                data.len(),
                AlertEvent::SIZE
            )));
        }

        // SAFETY: length checked above; AlertEvent is Pod and read unaligned
        let event = unsafe { (data.as_ptr() as *const AlertEvent).read_unaligned() };
        Alert::try_from(event)
    }

    /// Rebuild the exact wire record
    pub fn to_event(&self) -> AlertEvent {
        let mut event = AlertEvent::zeroed();
        event.source_ip = u32::from(self.source_ip).to_be();
        event.dest_ip = u32::from(self.dest_ip).to_be();
        event.source_port = self.source_port;
        event.dest_port = self.dest_port;
        event.pid = self.pid;
        event.fail_count = self.fail_count;
        event.first_seen = self.first_seen_ns;
        event.last_seen = self.last_seen_ns;
        event.alert_kind = self.kind.code();
        event.process_name = self.process_name_raw;
        event
    }

    /// Wire bytes of this alert
    pub fn to_bytes(&self) -> [u8; AlertEvent::SIZE] {
        let event = self.to_event();
        // SAFETY: AlertEvent is repr(C) Pod with explicit padding
        unsafe { std::mem::transmute::<AlertEvent, [u8; AlertEvent::SIZE]>(event) }
    }
}

impl TryFrom<AlertEvent> for Alert {
    type Error = BridgeError;

    fn try_from(event: AlertEvent) -> Result<Self, Self::Error> {
        let kind = AlertKind::from_code(event.alert_kind).ok_or_else(|| {
            BridgeError::Decode(format!("unknown alert kind {}", event.alert_kind))
        })?;

        Ok(Alert {
            kind,
            source_ip: ipv4_from_be(event.source_ip),
            dest_ip: ipv4_from_be(event.dest_ip),
            source_port: event.source_port,
            dest_port: event.dest_port,
            pid: event.pid,
            fail_count: event.fail_count,
            first_seen_ns: event.first_seen,
            last_seen_ns: event.last_seen,
            process_name: comm_to_string(&event.process_name),
            process_name_raw: event.process_name,
        })
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{} count={} pid={} comm={}",
            self.kind,
            self.source_ip,
            self.source_port,
            self.dest_ip,
            self.dest_port,
            self.fail_count,
            self.pid,
            self.process_name
        )
    }
}

/// Decoded per-process connection counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub comm: String,
    pub first_seen_ns: u64,
    pub connect_count: u64,
    pub accept_count: u64,
}

impl From<kernel::ProcessStats> for ProcessInfo {
    fn from(stats: kernel::ProcessStats) -> Self {
        Self {
            pid: stats.pid,
            comm: comm_to_string(&stats.comm),
            first_seen_ns: stats.first_seen,
            connect_count: stats.connect_count,
            accept_count: stats.accept_count,
        }
    }
}

/// Kind of an activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityKind {
    Syscall,
    FileOpen,
    TcpSend,
    TcpRecv,
    ProcessFork,
}

impl ActivityKind {
    pub fn code(self) -> u32 {
        match self {
            ActivityKind::Syscall => ACTIVITY_SYSCALL,
            ActivityKind::FileOpen => ACTIVITY_FILE_OPEN,
            ActivityKind::TcpSend => ACTIVITY_TCP_SEND,
            ActivityKind::TcpRecv => ACTIVITY_TCP_RECV,
            ActivityKind::ProcessFork => ACTIVITY_PROCESS_FORK,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            ACTIVITY_SYSCALL => Some(ActivityKind::Syscall),
            ACTIVITY_FILE_OPEN => Some(ActivityKind::FileOpen),
            ACTIVITY_TCP_SEND => Some(ActivityKind::TcpSend),
            ACTIVITY_TCP_RECV => Some(ActivityKind::TcpRecv),
            ACTIVITY_PROCESS_FORK => Some(ActivityKind::ProcessFork),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Syscall => "SYSCALL",
            ActivityKind::FileOpen => "FILE_OPEN",
            ActivityKind::TcpSend => "TCP_SEND",
            ActivityKind::TcpRecv => "TCP_RECV",
            ActivityKind::ProcessFork => "PROCESS_FORK",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded activity record
///
/// Only the fields meaningful for the kind are set: `syscall_nr` for
/// syscalls, `bytes` for TCP calls, `path` wherever the kernel captured one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,
    pub pid: u32,
    /// Parent pid, 0 when no fork of the process was observed
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Kernel monotonic nanoseconds
    pub timestamp_ns: u64,
    pub comm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syscall_nr: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Activity {
    /// Decode a raw ACTIVITY_EVENTS record
    pub fn decode(data: &[u8]) -> Result<Self, BridgeError> {
        if data.len() < ActivityEvent::SIZE {
            return Err(BridgeError::Decode(format!(
                "activity record is {} bytes, expected {}",
                data.len(),
                ActivityEvent::SIZE
            )));
        }

        // SAFETY: length checked above; ActivityEvent is Pod and read unaligned
        let event = unsafe { (data.as_ptr() as *const ActivityEvent).read_unaligned() };
        Activity::try_from(event)
    }
}

impl TryFrom<ActivityEvent> for Activity {
    type Error = BridgeError;

    fn try_from(event: ActivityEvent) -> Result<Self, Self::Error> {
        let kind = ActivityKind::from_code(event.kind)
            .ok_or_else(|| BridgeError::Decode(format!("unknown activity kind {}", event.kind)))?;

        let path = nul_padded_to_string(&event.data);
        Ok(Activity {
            kind,
            pid: event.pid,
            ppid: event.ppid,
            uid: event.uid,
            gid: event.gid,
            timestamp_ns: event.timestamp,
            comm: comm_to_string(&event.comm),
            syscall_nr: (kind == ActivityKind::Syscall).then_some(event.syscall_nr),
            bytes: matches!(kind, ActivityKind::TcpSend | ActivityKind::TcpRecv)
                .then_some(event.arg),
            path: (!path.is_empty()).then_some(path),
        })
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pid={} ppid={} uid={} comm={}",
            self.kind, self.pid, self.ppid, self.uid, self.comm
        )?;
        if let Some(nr) = self.syscall_nr {
            write!(f, " nr={}", nr)?;
        }
        if let Some(bytes) = self.bytes {
            write!(f, " bytes={}", bytes)?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={}", path)?;
        }
        Ok(())
    }
}

/// A process seen by the activity monitor, with its syscall count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    pub start_time_ns: u64,
    pub syscall_count: u64,
}

impl MonitoredProcessInfo {
    pub fn new(process: kernel::MonitoredProcess, syscall_count: u64) -> Self {
        Self {
            pid: process.pid,
            ppid: process.ppid,
            uid: process.uid,
            gid: process.gid,
            comm: comm_to_string(&process.comm),
            start_time_ns: process.start_time,
            syscall_count,
        }
    }
}

/// Probe health counters read from PROBE_STATS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelCounters {
    pub connects_seen: u64,
    pub accepts_seen: u64,
    pub ssh_accepts: u64,
    pub alerts_submitted: u64,
    pub ringbuf_full: u64,
    pub map_update_failed: u64,
    pub orphan_returns: u64,
    pub non_ipv4: u64,
    pub syscalls_seen: u64,
    pub activity_submitted: u64,
    pub activity_ringbuf_full: u64,
}

impl KernelCounters {
    /// Fill counters from a lookup by STAT_* index
    pub fn from_lookup(mut get: impl FnMut(u32) -> u64) -> Self {
        Self {
            connects_seen: get(STAT_CONNECTS_SEEN),
            accepts_seen: get(STAT_ACCEPTS_SEEN),
            ssh_accepts: get(STAT_SSH_ACCEPTS),
            alerts_submitted: get(STAT_ALERTS_SUBMITTED),
            ringbuf_full: get(STAT_RINGBUF_FULL),
            map_update_failed: get(STAT_MAP_UPDATE_FAILED),
            orphan_returns: get(STAT_ORPHAN_RETURNS),
            non_ipv4: get(STAT_NON_IPV4),
            syscalls_seen: get(STAT_SYSCALLS_SEEN),
            activity_submitted: get(STAT_ACTIVITY_SUBMITTED),
            activity_ringbuf_full: get(STAT_ACTIVITY_RINGBUF_FULL),
        }
    }
}

/// Aggregate bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Source IPs currently held in FAILED_LOGINS
    pub tracked_sources: usize,
    /// Events waiting in the pull queue
    pub events_pending: usize,
    /// Events decoded since start
    pub total_events: u64,
    /// Events dropped from the front of the pull queue
    pub queue_overflows: u64,
    /// Records that failed to decode, alerts and activity alike
    pub decode_errors: u64,
    /// Activity records decoded since start
    pub activity_events: u64,
    /// Activity records waiting in their pull queue
    pub activity_pending: usize,
    /// Activity records dropped from the front of their pull queue
    pub activity_overflows: u64,
    pub kernel: KernelCounters,
}

/// Convert a network-order u32 into an address
pub fn ipv4_from_be(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from_be(addr))
}

/// Convert a NUL-padded comm buffer to a string
///
/// All 16 bytes are used when no NUL is present.
pub fn comm_to_string(comm: &[u8; TASK_COMM_LEN]) -> String {
    nul_padded_to_string(comm)
}

fn nul_padded_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
