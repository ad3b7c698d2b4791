//! Tether – host-side protocol layer for sandboxed script engines
//!
//! This crate drives an interpreter that lives across a thread or process
//! boundary and exposes it as one resumable execution contract:
//! - Run-to-completion and start/resume execution with external-call suspensions
//! - A single translation layer from loosely-typed wire records to typed results
//! - A strict `Idle -> Active -> Disposed` lifecycle per execution context
//! - Sessions that persist serializable globals across otherwise stateless runs
//! - Optional snapshot/restore, future resolution and namespace capabilities

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Execution contract, adapters and session layer
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{
    ExecutionContext, ExecutionResult, PlatformConfig, PlatformError, Progress, Session,
};

/// Current version of the Tether crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the NDJSON wire protocol spoken by [`runtime::wire`] and [`runtime::host`]
pub const WIRE_PROTOCOL_VERSION: &str = "1.0.0";
