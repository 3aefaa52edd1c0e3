//! Sakura Cloud backend error types

use flowcpi_cloud::CpiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SakuraError {
    #[error("usacloud not found. Please install: brew install usacloud")]
    UsacloudNotFound,

    #[error("usacloud authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("usacloud command failed: {0}")]
    CommandFailed(String),

    #[error("usacloud {command} did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Disk not found: {0}")]
    DiskNotFound(String),

    #[error("Disk {disk} is not connected to server {server}")]
    DiskNotConnected { server: String, disk: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Classification of Sakura failures into the CPI taxonomy
impl From<SakuraError> for CpiError {
    fn from(err: SakuraError) -> Self {
        match err {
            SakuraError::ServerNotFound(id) => CpiError::VmNotFound(id),
            SakuraError::DiskNotFound(id) => CpiError::DiskNotFound(id),
            SakuraError::DiskNotConnected { server, disk } => CpiError::DiskNotAttached {
                vm_id: server,
                disk_id: disk,
            },
            SakuraError::InvalidPlan(plan) => {
                CpiError::InvalidCall(format!("invalid server plan: {}", plan))
            }
            SakuraError::Timeout { command, secs } => CpiError::timeout(command, secs),
            err @ SakuraError::CommandFailed(_) => CpiError::Cloud(err.to_string()),
            // host misconfiguration: resending cannot help until an operator steps in
            err @ (SakuraError::UsacloudNotFound | SakuraError::AuthenticationFailed(_)) => {
                CpiError::InvalidCall(err.to_string())
            }
            err @ (SakuraError::JsonError(_) | SakuraError::IoError(_)) => {
                CpiError::unknown(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SakuraError>;
