//! IPS Bridge Library
//!
//! Loads the SSH brute-force detection probes, decodes the alerts they
//! emit and delivers them to a callback and a bounded pull queue. The
//! optional process activity monitor gets the same treatment on its own
//! ring buffer and queue.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod loader;
pub mod output;
pub mod tracker;
pub mod types;

pub use bridge::{Bridge, BridgeState, KernelBridge};
pub use config::{BridgeConfig, ConfigUpdate, MonitorSettings, MonitorUpdate, RuntimeConfig};
pub use error::{BridgeError, InitFailure, Result};
pub use events::{RecordSource, RingBufSource};
pub use loader::{ProbeControl, ProbeLoader};
pub use tracker::WindowTracker;
pub use types::{
    Activity, ActivityKind, Alert, AlertKind, BridgeStats, KernelCounters, MonitoredProcessInfo,
    ProcessInfo,
};
