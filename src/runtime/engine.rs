//! Engine-side interface
//!
//! The sandboxed interpreter is an external collaborator. Adapters in this
//! crate reach it only through [`Engine`]: a synchronous set of primitives
//! that live on the far side of the boundary (a worker thread for
//! [`thread`](super::thread), the serving process for [`host`](super::host)).
//!
//! Sandbox errors are data here: `run` returns them inside the result and the
//! iterative primitives return them as a `Complete` progress carrying the
//! error. [`EngineError`] is reserved for failures of the engine contract
//! itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::{EngineError, EngineResult};
use super::result::{ExecutionLimits, ExecutionResult, GlobalValue, Progress};

/// Optional primitives an engine implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// `snapshot` / `restore` are available.
    #[serde(default)]
    pub snapshot: bool,
    /// Idle executions may be snapshotted, not just suspended ones.
    #[serde(default)]
    pub idle_snapshot: bool,
    /// `resume_as_future` / `resolve_futures` are available.
    #[serde(default)]
    pub futures: bool,
    /// `globals` is available.
    #[serde(default)]
    pub namespace: bool,
}

/// One sandboxed interpreter instance.
pub trait Engine: Send {
    /// Execute `code` to completion.
    fn run(
        &mut self,
        code: &str,
        limits: Option<&ExecutionLimits>,
        script_name: &str,
    ) -> ExecutionResult;

    /// Begin iterative execution, suspending at calls to `external_functions`.
    fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        limits: Option<&ExecutionLimits>,
        script_name: &str,
    ) -> EngineResult<Progress>;

    /// Answer the pending call with a value.
    fn resume(&mut self, value: Value) -> EngineResult<Progress>;

    /// Answer the pending call by raising `message` inside the sandbox.
    fn resume_with_error(&mut self, message: &str) -> EngineResult<Progress>;

    /// Defer the pending call as a future.
    fn resume_as_future(&mut self) -> EngineResult<Progress> {
        Err(EngineError::Unsupported("resume_as_future"))
    }

    /// Answer outstanding futures by call id.
    fn resolve_futures(
        &mut self,
        _results: BTreeMap<u32, Value>,
        _errors: BTreeMap<u32, String>,
    ) -> EngineResult<Progress> {
        Err(EngineError::Unsupported("resolve_futures"))
    }

    /// Capture interpreter state.
    fn snapshot(&mut self) -> EngineResult<Vec<u8>> {
        Err(EngineError::Unsupported("snapshot"))
    }

    /// Replace interpreter state with a captured one.
    fn restore(&mut self, _bytes: &[u8]) -> EngineResult<()> {
        Err(EngineError::Unsupported("restore"))
    }

    /// Globals left behind by the most recent `run`.
    fn globals(&mut self) -> EngineResult<BTreeMap<String, GlobalValue>> {
        Err(EngineError::Unsupported("globals"))
    }

    /// Which optional primitives are implemented.
    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }
}

/// Builds engines on the far side of the boundary; `Err` carries the reason
/// the engine could not be created. Shared so a failed `init` can be retried.
pub type EngineFactory = Arc<dyn Fn() -> Result<Box<dyn Engine>, String> + Send + Sync>;

/// Text of a caught engine panic.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
