//! # Level Zero Conformance Checks
//!
//! This crate drives a GPU compute driver through three conformance
//! scenarios: command submission in immediate and deferred form, cooperative
//! launches whose group count is negotiated against the device's resident
//! maximum, and several independent processes sharing one device.
//!
//! ## Core Modules
//!
//! - `driver`: The driver API surface as an object-safe trait, plus handles and errors.
//! - `runtime`: Process-scoped driver init and RAII contexts.
//! - `bundle`: The command bundle, one submission interface over both modes.
//! - `negotiate`: Group-size and cooperative group-count negotiation.
//! - `cooperative`: The cooperative kernel scenario and its parameter grid.
//! - `harness`: The multi-process worker body and the parent that spawns it.
//! - `reference`: An in-process software device used by tests and dry runs.
//! - `level_zero`: The real driver, loaded at runtime.
//! - `tracer`: A call-tracing decorator for any driver.

pub mod bundle;
pub mod config;
pub mod cooperative;
pub mod driver;
pub mod error;
pub mod harness;
pub mod kernel;
pub mod level_zero;
pub mod memory;
pub mod negotiate;
pub mod reference;
pub mod runtime;
pub mod tracer;

pub use bundle::{BundleDesc, BundleError, CommandBundle, ExecutionMode};
pub use config::{DriverArgs, DriverKind};
pub use driver::{Driver, DriverError, GroupCount, GroupSize, Timeout};
pub use error::{ConformanceError, Verdict};
pub use negotiate::{CooperativePlan, NegotiationError};
pub use runtime::{Context, Runtime};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
