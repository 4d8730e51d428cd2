//! Custom error types for the acquisition coordinator.
//!
//! `DaqError` is the application-level error returned across component
//! boundaries. Components that need a richer vocabulary define their own
//! `thiserror` enums (`CaptureError`, `EncodeError`, `ProtocolError`) which the
//! Scheduler or server turn into run-level decisions.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantic errors in settings that parsed fine but are
//!   logically inconsistent (duplicate camera ids, zero dividers, ...).
//! - **`Io`**: wraps `std::io::Error` for file and network I/O.
//! - **`Instrument`**: camera or controller hardware failures.
//! - **`OutputUnwritable`**: the run directory could not be created or written.
//! - **`SerialFeatureDisabled`**: the controller link was requested in a build
//!   without the `serial` feature.
//!
//! `TerminationReason` is not an error but lives here because it is what every
//! fatal error is finally reduced to: a stable tag and a process exit code.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Output directory unwritable: {0}")]
    OutputUnwritable(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features serial")]
    SerialFeatureDisabled,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<crate::config::ConfigError> for DaqError {
    fn from(err: crate::config::ConfigError) -> Self {
        DaqError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Metadata(err.to_string())
    }
}

/// Failure of a single capture call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// Camera did not return a frame within the capture timeout.
    #[error("capture timed out after {0} ms")]
    Timeout(u64),
    /// Driver-level failure.
    #[error("device error: {0}")]
    Device(String),
    /// Camera has been closed.
    #[error("camera closed")]
    Closed,
}

impl CaptureError {
    /// Short stable code recorded in capture summaries.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::Timeout(_) => "capture-timeout",
            CaptureError::Device(_) => "device-error",
            CaptureError::Closed => "camera-closed",
        }
    }
}

/// Failure of a still/video/HDR encode step.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The encoder (or external tool) is not available at all. Disables the path.
    #[error("encoder unavailable: {0}")]
    Unavailable(String),
    /// A single encode failed; the path stays enabled.
    #[error("encode failed: {0}")]
    Failed(String),
}

impl From<std::io::Error> for EncodeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            // Tool missing, or the encoder process exited under us.
            std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                EncodeError::Unavailable(err.to_string())
            }
            _ => EncodeError::Failed(err.to_string()),
        }
    }
}

impl From<image::ImageError> for EncodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => EncodeError::Unavailable(e.to_string()),
            other => EncodeError::Failed(other.to_string()),
        }
    }
}

/// Errors raised while framing or dispatching client protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("unknown message type {0}")]
    UnknownType(i32),

    #[error("unexpected message type {0}")]
    UnexpectedType(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Stable code carried in ERROR responses.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "frame-too-large",
            ProtocolError::Decode(_) => "decode-error",
            ProtocolError::UnknownType(_) => "unknown-type",
            ProtocolError::UnexpectedType(_) => "unexpected-type",
            ProtocolError::InvalidRequest(_) => "invalid-request",
            ProtocolError::Closed => "closed",
            ProtocolError::Io(_) => "io-error",
        }
    }
}

/// Why a run ended. Each variant has a stable log tag and exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// `trigger_count` reached the configured limit.
    LimitReached,
    /// Operator stop (signal or protocol `stop` parameter).
    Operator,
    /// Controller requested shutdown.
    ControllerShutdown,
    /// Free disk space fell below the threshold.
    DiskFull,
    /// Controller link lost while it was the trigger source.
    ControllerLinkLost,
    /// Configuration inconsistent at startup.
    ConfigurationError,
    /// Output directory could not be created or written.
    OutputUnwritable,
}

impl TerminationReason {
    /// Stable tag written to the log and run metadata.
    pub fn tag(&self) -> &'static str {
        match self {
            TerminationReason::LimitReached => "limit-reached",
            TerminationReason::Operator => "operator",
            TerminationReason::ControllerShutdown => "controller-shutdown",
            TerminationReason::DiskFull => "disk-full",
            TerminationReason::ControllerLinkLost => "controller-link-lost",
            TerminationReason::ConfigurationError => "configuration-error",
            TerminationReason::OutputUnwritable => "output-unwritable",
        }
    }

    /// Process exit code.
    ///
    /// | code | reasons |
    /// |------|---------|
    /// | 0 | limit-reached, operator, controller-shutdown |
    /// | 2 | disk-full |
    /// | 3 | controller-link-lost |
    /// | 4 | configuration-error |
    /// | 5 | output-unwritable |
    ///
    /// Code 1 is reserved for unclassified startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationReason::LimitReached
            | TerminationReason::Operator
            | TerminationReason::ControllerShutdown => 0,
            TerminationReason::DiskFull => 2,
            TerminationReason::ControllerLinkLost => 3,
            TerminationReason::ConfigurationError => 4,
            TerminationReason::OutputUnwritable => 5,
        }
    }

    /// True for reasons that skip the graceful drain.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TerminationReason::ControllerLinkLost
                | TerminationReason::ConfigurationError
                | TerminationReason::OutputUnwritable
        )
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}
