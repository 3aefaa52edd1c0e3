//! FlowCPI core
//!
//! Command execution for the CPI process:
//!
//! - [`Dispatcher`]: one [`Command`] in, exactly one [`Response`] out
//! - [`Cpi`]: the director-facing operations
//! - [`Lifecycle`]: acquire → use → release with a reverse-order cleanup stack
//! - [`WorkerPool`]: bounded fan-out for independent sub-steps

pub mod capture;
pub mod dispatcher;
pub mod lifecycle;
pub mod operations;
pub mod pool;

pub use capture::{LogCapture, install_panic_hook, parse_level};
pub use dispatcher::{Command, Dispatcher, NoArguments, Registry, Response};
pub use lifecycle::{AggregatedFailure, CleanupPolicy, CleanupTask, Lifecycle};
pub use operations::{API_VERSION, Cpi, STEMCELL_FORMAT};
pub use pool::{BatchReport, Unit, UnitOutcome, WorkerPool};
