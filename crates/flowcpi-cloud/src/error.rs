//! CPI error taxonomy
//!
//! Every failure that leaves an adapter or the orchestrator is one of these
//! variants. The variant decides the wire `type` name and whether the director
//! may resend the identical command later.

use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use thiserror::Error;

/// Closed set of failure kinds reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CloudError,
    #[serde(rename = "VMCreationFailed")]
    VmCreationFailed,
    DiskNotFound,
    #[serde(rename = "VMNotFound")]
    VmNotFound,
    DiskNotAttached,
    InvalidCall,
    NotSupported,
    Unknown,
}

impl ErrorKind {
    /// Name used in the `type` field of a response
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CloudError => "CloudError",
            ErrorKind::VmCreationFailed => "VMCreationFailed",
            ErrorKind::DiskNotFound => "DiskNotFound",
            ErrorKind::VmNotFound => "VMNotFound",
            ErrorKind::DiskNotAttached => "DiskNotAttached",
            ErrorKind::InvalidCall => "InvalidCall",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::Unknown => "Unknown",
        }
    }

    /// Whether resending the identical command later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::CloudError | ErrorKind::VmCreationFailed)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified CPI failure
#[derive(Error, Debug, Clone)]
pub enum CpiError {
    #[error("{0}")]
    Cloud(String),

    #[error("{0}")]
    VmCreationFailed(String),

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("vm not found: {0}")]
    VmNotFound(String),

    #[error("disk {disk_id} is not attached to vm {vm_id}")]
    DiskNotAttached { vm_id: String, disk_id: String },

    #[error("{0}")]
    InvalidCall(String),

    #[error("{0}")]
    NotSupported(String),

    /// Internal fault nobody classified. `trace` goes to the log, never to the message.
    #[error("{message}")]
    Unknown { message: String, trace: String },
}

impl CpiError {
    /// Build an `Unknown` error, capturing a backtrace at the call site
    pub fn unknown(message: impl Into<String>) -> Self {
        CpiError::Unknown {
            message: message.into(),
            trace: Backtrace::force_capture().to_string(),
        }
    }

    /// Retryable backend fault for a bounded wait that ran out
    pub fn timeout(operation: impl std::fmt::Display, secs: u64) -> Self {
        CpiError::Cloud(format!("timed out after {}s waiting for {}", secs, operation))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CpiError::Cloud(_) => ErrorKind::CloudError,
            CpiError::VmCreationFailed(_) => ErrorKind::VmCreationFailed,
            CpiError::DiskNotFound(_) => ErrorKind::DiskNotFound,
            CpiError::VmNotFound(_) => ErrorKind::VmNotFound,
            CpiError::DiskNotAttached { .. } => ErrorKind::DiskNotAttached,
            CpiError::InvalidCall(_) => ErrorKind::InvalidCall,
            CpiError::NotSupported(_) => ErrorKind::NotSupported,
            CpiError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn ok_to_retry(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Diagnostic backtrace, present only for `Unknown`
    pub fn trace(&self) -> Option<&str> {
        match self {
            CpiError::Unknown { trace, .. } => Some(trace.as_str()),
            _ => None,
        }
    }

    /// Wire representation of this error
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            error_type: self.kind().as_str().to_string(),
            message: self.to_string(),
            ok_to_retry: self.ok_to_retry(),
        }
    }
}

impl From<serde_json::Error> for CpiError {
    fn from(err: serde_json::Error) -> Self {
        CpiError::unknown(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for CpiError {
    fn from(err: std::io::Error) -> Self {
        CpiError::unknown(format!("IO error: {}", err))
    }
}

/// `error` object of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub ok_to_retry: bool,
}

pub type Result<T> = std::result::Result<T, CpiError>;
