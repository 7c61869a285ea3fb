//! Bridge configuration
//!
//! `BridgeConfig` holds deployment settings fixed at initialization (map
//! sizes, queue bound, poll interval). `RuntimeConfig` is the part that
//! can be pushed into the kernel at any time, and so is `MonitorSettings`
//! for the activity monitor.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use probe_common::{
    constants::*,
    types::{IpsConfig, MonitorConfig},
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Default bound of the pull queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default ring buffer poll timeout
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

const PAGE_SIZE: u32 = 4096;

/// Runtime-tunable detection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Master switch; when false every probe is a no-op
    pub enabled: bool,
    /// Failures within the window before a threshold alert (0 = kernel default of 5)
    pub fail_threshold: u32,
    /// Window length in seconds (0 = kernel default of 300)
    pub window_secs: u64,
    /// Report every successful outbound connect, not only SSH
    pub monitor_all_connections: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fail_threshold: DEFAULT_FAIL_THRESHOLD,
            window_secs: DEFAULT_WINDOW_NS / 1_000_000_000,
            monitor_all_connections: false,
        }
    }
}

impl RuntimeConfig {
    /// Kernel record for IPS_CONFIG
    ///
    /// Zero threshold and window are passed through; the probe applies
    /// the defaults itself.
    pub fn to_kernel(&self) -> IpsConfig {
        IpsConfig {
            enabled: self.enabled as u32,
            fail_threshold: self.fail_threshold,
            window_ns: self.window_secs.saturating_mul(1_000_000_000),
            monitor_all_connections: self.monitor_all_connections as u32,
            _pad: 0,
        }
    }
}

/// Partial update for `Bridge::update_config`
///
/// Fields left as None keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigUpdate {
    pub enabled: Option<bool>,
    pub fail_threshold: Option<u32>,
    pub window_secs: Option<u64>,
    pub monitor_all_connections: Option<bool>,
}

impl ConfigUpdate {
    /// Apply the set fields on top of `base`
    pub fn apply(&self, base: RuntimeConfig) -> RuntimeConfig {
        RuntimeConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            fail_threshold: self.fail_threshold.unwrap_or(base.fail_threshold),
            window_secs: self.window_secs.unwrap_or(base.window_secs),
            monitor_all_connections: self
                .monitor_all_connections
                .unwrap_or(base.monitor_all_connections),
        }
    }
}

/// Activity monitor switches
///
/// Defaults trace syscalls only, for every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Report every syscall entry and count them per process
    pub syscalls: bool,
    /// Report kernel file opens with their path
    pub files: bool,
    /// Report TCP send and receive calls
    pub network: bool,
    /// Report forks and drop per-process state on exit
    pub process_lifecycle: bool,
    /// Only trace this pid (0 = every process)
    pub target_pid: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            syscalls: true,
            files: false,
            network: false,
            process_lifecycle: false,
            target_pid: 0,
        }
    }
}

impl MonitorSettings {
    /// Kernel record for MONITOR_CONFIG
    pub fn to_kernel(&self) -> MonitorConfig {
        MonitorConfig {
            process_lifecycle: self.process_lifecycle as u32,
            syscalls: self.syscalls as u32,
            files: self.files as u32,
            network: self.network as u32,
            target_pid: self.target_pid,
        }
    }
}

/// Partial update for `Bridge::update_monitor`
///
/// Fields left as None keep their current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct MonitorUpdate {
    pub syscalls: Option<bool>,
    pub files: Option<bool>,
    pub network: Option<bool>,
    pub process_lifecycle: Option<bool>,
    pub target_pid: Option<u32>,
}

impl MonitorUpdate {
    pub fn apply(&self, base: MonitorSettings) -> MonitorSettings {
        MonitorSettings {
            syscalls: self.syscalls.unwrap_or(base.syscalls),
            files: self.files.unwrap_or(base.files),
            network: self.network.unwrap_or(base.network),
            process_lifecycle: self.process_lifecycle.unwrap_or(base.process_lifecycle),
            target_pid: self.target_pid.unwrap_or(base.target_pid),
        }
    }
}

/// Settings fixed for the lifetime of an initialized bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// eBPF object to load; None uses the embedded object
    pub ebpf_object: Option<PathBuf>,
    /// ALERT_EVENTS size in bytes (power of two, page multiple)
    pub ring_buffer_bytes: u32,
    /// FAILED_LOGINS capacity before LRU eviction
    pub tracked_ip_capacity: u32,
    /// Pull queue bound; oldest events are dropped beyond it
    pub queue_capacity: usize,
    /// Ring buffer poll timeout, also the stop latency bound
    pub poll_interval_ms: u64,
    /// Initial runtime configuration
    pub runtime: RuntimeConfig,
    /// Activity monitor; None leaves its programs unattached
    pub monitor: Option<MonitorSettings>,
    /// ACTIVITY_EVENTS size in bytes (power of two, page multiple)
    pub activity_ring_bytes: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ebpf_object: None,
            ring_buffer_bytes: DEFAULT_RING_BUFFER_BYTES,
            tracked_ip_capacity: MAX_TRACKED_IPS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            runtime: RuntimeConfig::default(),
            monitor: None,
            activity_ring_bytes: SYSCALL_RING_BUFFER_BYTES,
        }
    }
}

impl BridgeConfig {
    /// Load a JSON configuration file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: BridgeConfig = serde_json::from_str(&data).map_err(|e| {
            BridgeError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the kernel or the bridge cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.tracked_ip_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "tracked_ip_capacity must be greater than zero".to_string(),
            ));
        }
        validate_ring("ring_buffer_bytes", self.ring_buffer_bytes)?;
        validate_ring("activity_ring_bytes", self.activity_ring_bytes)?;
        Ok(())
    }
}

fn validate_ring(field: &str, bytes: u32) -> Result<()> {
    if !bytes.is_power_of_two() || bytes % PAGE_SIZE != 0 {
        return Err(BridgeError::InvalidConfig(format!(
            "{} must be a power of two and a multiple of {}, got {}",
            field, PAGE_SIZE, bytes
        )));
    }
    Ok(())
}
