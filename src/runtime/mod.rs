//! Execution runtime and public API
//!
//! This module ties together the domain model, the bindings abstraction and
//! its adapters, the execution state machine and the session layer. The
//! [`PlatformConfig`] here carries the host-side defaults every context
//! falls back on.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

// Submodules
pub mod bindings;
pub mod context;
pub mod engine;
pub mod error;
pub mod host;
pub mod result;
pub mod session;
pub mod snapshot;
pub mod thread;
pub mod translate;
pub mod wire;

pub use bindings::{
    Bindings, FutureCapability, GlobalsReply, NamespaceCapability, ProgressReply, RunReply,
    SnapshotCapability,
};
pub use context::{ExecutionContext, RunOptions, StartOptions};
pub use engine::{Engine, EngineCapabilities, EngineFactory};
pub use error::{
    CapabilityError, ChannelError, ContextState, EngineError, ExecutionFailure, PlatformError,
    ProtocolError, SnapshotError, StateError,
};
pub use host::WireHost;
pub use result::{
    ExecutionError, ExecutionLimits, ExecutionResult, GlobalValue, PendingCall, Progress,
    ResourceUsage, StackFrame,
};
pub use session::Session;
pub use thread::ThreadBindings;
pub use wire::{NdjsonChannel, WireBindings, WireChannel};

/// Host-side defaults for execution contexts and adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Script name reported in tracebacks when a call does not give one
    pub script_name: String,

    /// Limits applied to dimensions a call leaves open
    pub default_limits: ExecutionLimits,

    /// Name of the worker thread spawned by [`ThreadBindings`]
    pub worker_thread_name: String,

    /// Capacity of the command queue feeding a worker
    pub command_buffer: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            script_name: "<input>".to_string(),
            default_limits: ExecutionLimits::default(),
            worker_thread_name: "tether-engine".to_string(),
            command_buffer: 16,
        }
    }
}

impl PlatformConfig {
    /// Load a configuration file written by [`PlatformConfig::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let data =
            fs::read(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: PlatformConfig =
            serde_json::from_slice(&data).context("Failed to deserialize config")?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration atomically as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize config")?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write config")?;
        file.sync_all().context("Failed to sync config")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }

    /// Reject settings no adapter can honour
    pub fn validate(&self) -> std::result::Result<(), PlatformError> {
        if self.command_buffer == 0 {
            return Err(PlatformError::Config(
                "command_buffer must be at least 1".into(),
            ));
        }
        if self.worker_thread_name.is_empty() {
            return Err(PlatformError::Config(
                "worker_thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}
