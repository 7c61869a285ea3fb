//! Bridge error types
//!
//! Initialization failures are classified so a caller can tell "not
//! root" from "kernel too old" from "someone else holds the probe" and
//! pick a fallback event source accordingly.

use std::{error::Error as StdError, fmt, io};

use aya::programs::ProgramError;
use serde::Serialize;
use thiserror::Error;

use crate::bridge::BridgeState;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Why the probes could not be brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitFailure {
    /// Missing CAP_BPF/CAP_PERFMON (or root), or memlock too low
    PermissionDenied,
    /// Traced function, map type or helper missing on this kernel
    UnsupportedKernel,
    /// Probe already attached by another instance
    AlreadyAttached,
    /// The verifier refused a program
    VerifierRejected,
    /// eBPF object, program or map not found
    ObjectMissing,
}

impl InitFailure {
    /// Operator hint for the failure
    pub fn remediation(&self) -> &'static str {
        match self {
            InitFailure::PermissionDenied => {
                "run as root or grant CAP_BPF and CAP_PERFMON (check RLIMIT_MEMLOCK on kernels < 5.11)"
            }
            InitFailure::UnsupportedKernel => {
                "requires Linux >= 5.8 with kprobes and BPF ring buffers enabled"
            }
            InitFailure::AlreadyAttached => "stop the other instance holding the probe",
            InitFailure::VerifierRejected => "rebuild the eBPF object against this kernel",
            InitFailure::ObjectMissing => "build the kernel program or pass --ebpf-object",
        }
    }

    /// Classify an error by the errno found in its source chain
    ///
    /// Verifier rejections surface as a `ProgramError::LoadError` whose
    /// errno is usually EACCES or EINVAL, so that variant is checked
    /// before the generic errno mapping.
    pub fn classify(err: &(dyn StdError + 'static), fallback: InitFailure) -> InitFailure {
        let mut current = Some(err);

        while let Some(e) = current {
            if let Some(ProgramError::LoadError { io_error, .. }) = e.downcast_ref::<ProgramError>() {
                return match io_error.raw_os_error() {
                    Some(libc::EPERM) => InitFailure::PermissionDenied,
                    _ => InitFailure::VerifierRejected,
                };
            }
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return Self::from_io(io_err).unwrap_or(fallback);
            }
            current = e.source();
        }

        fallback
    }

    fn from_io(err: &io::Error) -> Option<InitFailure> {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Some(InitFailure::PermissionDenied),
            Some(libc::EBUSY) | Some(libc::EEXIST) => Some(InitFailure::AlreadyAttached),
            Some(libc::ENOENT) | Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
                Some(InitFailure::UnsupportedKernel)
            }
            // ENOTSUPP is kernel-internal and has no libc constant
            Some(524) => Some(InitFailure::UnsupportedKernel),
            _ => match err.kind() {
                io::ErrorKind::PermissionDenied => Some(InitFailure::PermissionDenied),
                io::ErrorKind::NotFound => Some(InitFailure::ObjectMissing),
                _ => None,
            },
        }
    }
}

impl fmt::Display for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitFailure::PermissionDenied => "permission denied",
            InitFailure::UnsupportedKernel => "unsupported kernel",
            InitFailure::AlreadyAttached => "already attached",
            InitFailure::VerifierRejected => "verifier rejected program",
            InitFailure::ObjectMissing => "eBPF object missing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("initialization failed ({kind}) during {stage}: {detail}")]
    Init {
        kind: InitFailure,
        stage: String,
        detail: String,
    },

    #[error("{operation} is not valid while the bridge is {state}")]
    InvalidState {
        operation: &'static str,
        state: BridgeState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("map {map}: {detail}")]
    Map { map: &'static str, detail: String },

    #[error("malformed alert record: {0}")]
    Decode(String),

    #[error("ring buffer poll failed: {0}")]
    Poll(#[from] io::Error),
}

impl BridgeError {
    /// Build a classified initialization error from an aya or io error
    pub fn init<E>(stage: impl Into<String>, err: E, fallback: InitFailure) -> Self
    where
        E: StdError + 'static,
    {
        BridgeError::Init {
            kind: InitFailure::classify(&err, fallback),
            stage: stage.into(),
            detail: error_chain(&err),
        }
    }

    /// Initialization error that has no underlying OS error
    pub fn missing(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        BridgeError::Init {
            kind: InitFailure::ObjectMissing,
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    /// Classification of an initialization failure, None for other errors
    pub fn init_failure(&self) -> Option<InitFailure> {
        match self {
            BridgeError::Init { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Render an error and its sources, skipping sources already quoted
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        let msg = e.to_string();
        if !out.contains(&msg) {
            out.push_str(": ");
            out.push_str(&msg);
        }
        source = e.source();
    }
    out
}
