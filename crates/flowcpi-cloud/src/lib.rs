//! FlowCPI Cloud abstraction
//!
//! This crate holds the pieces every other FlowCPI crate agrees on:
//! the error taxonomy reported to the director, the backend adapter trait,
//! and the resource model adapters use to track what they manage.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               flowcpi (stdin/stdout)             │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 flowcpi-core                     │
//! │   Dispatcher → Operations → Lifecycle/Pool       │
//! └─────────────────┬───────────────────────────────┘
//!                   │  trait CloudBackend
//! ┌─────────────────▼───────────────────────────────┐
//! │                 flowcpi-cloud                    │
//! │  CpiError taxonomy │ ResourceHandle │ memory     │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │ sakura-cloud  │
//! │   backend     │
//! └───────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod provider;
pub mod state;

// Re-exports
pub use error::{CpiError, ErrorInfo, ErrorKind, Result};
pub use memory::InMemoryBackend;
pub use provider::{CloudBackend, DiskInfo, DiskSpec, VmSpec, mib_to_gib};
pub use state::{ResourceHandle, ResourceKind, ResourceStatus};
