//! Shared types and utilities for the IPS probes
//!
//! This crate provides the fixed-layout records exchanged between the
//! eBPF programs and the userspace bridge, the map names both sides agree
//! on, the per-IP sliding-window algorithm the accept probe runs, and the
//! filters of the process activity monitor.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod types;
pub mod window;

// Re-export commonly used types
pub use constants::*;
pub use types::{
    ActivityEvent, AlertEvent, IpTrack, IpsConfig, MonitorConfig, MonitoredProcess, ProcessStats,
};
pub use window::{classify_connect, Verdict};
