//! Sakura Cloud backend for FlowCPI
//!
//! This crate implements the CloudBackend trait for Sakura Cloud,
//! so the CPI can manage servers, disks and archives there.
//!
//! # Mapping
//!
//! - VM → server, VM metadata → server tags (`key=value`)
//! - Disk → disk, attach/detach → connect/disconnect
//! - Snapshot → archive
//!
//! # Requirements
//!
//! - `usacloud` CLI must be installed and configured
//! - Authentication is managed through usacloud configuration
//!
//! # Example
//!
//! ```ignore
//! use flowcpi_cloud_sakura::SakuraBackend;
//! use flowcpi_cloud::CloudBackend;
//!
//! let backend = SakuraBackend::new("tk1a");
//! let exists = backend.vm_exists("113000000001").await?;
//! ```

pub mod error;
pub mod provider;
pub mod usacloud;

pub use error::{Result, SakuraError};
pub use provider::SakuraBackend;
pub use usacloud::{ArchiveInfo, CreateDiskConfig, CreateServerConfig, DiskInfo, ServerInfo, Usacloud};
