//! Bindings abstraction over the remote-call channel
//!
//! [`Bindings`] is the minimal contract every backend provides. Optional
//! features live in separate capability traits that a backend exposes through
//! the `as_*` queries, so the core contract never carries stub methods.
//!
//! Replies come in one of two shapes: already-typed domain values when the
//! channel can hand objects over directly, or loosely-typed wire records when
//! only serialized payloads cross. [`translate`](super::translate) owns the
//! conversion of the latter.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use super::error::{ProtocolError, Result};
use super::result::{ExecutionLimits, ExecutionResult, GlobalValue, Progress};
use super::translate;

/// Reply to `run`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunReply {
    /// Already a domain value.
    Typed(ExecutionResult),
    /// Wire record to be translated.
    Wire(Value),
}

impl RunReply {
    /// Normalize into the domain model.
    pub fn into_result(self) -> std::result::Result<ExecutionResult, ProtocolError> {
        match self {
            RunReply::Typed(result) => Ok(result),
            RunReply::Wire(record) => translate::run_result_from_wire(&record),
        }
    }
}

/// Reply to `start` and the resume family.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressReply {
    /// Already a domain value.
    Typed(Progress),
    /// Wire record to be translated.
    Wire(Value),
}

impl ProgressReply {
    /// Normalize into the domain model.
    pub fn into_progress(self) -> std::result::Result<Progress, ProtocolError> {
        match self {
            ProgressReply::Typed(progress) => Ok(progress),
            ProgressReply::Wire(record) => translate::progress_from_wire(&record),
        }
    }
}

/// Reply to a namespace capture.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalsReply {
    /// Already a domain value.
    Typed(BTreeMap<String, GlobalValue>),
    /// Wire record to be translated.
    Wire(Value),
}

impl GlobalsReply {
    /// Normalize into the domain model.
    pub fn into_globals(
        self,
    ) -> std::result::Result<BTreeMap<String, GlobalValue>, ProtocolError> {
        match self {
            GlobalsReply::Typed(globals) => Ok(globals),
            GlobalsReply::Wire(record) => translate::globals_from_wire(&record),
        }
    }
}

/// Core capability set over one remote execution context.
///
/// Failures at this layer surface as [`PlatformError`](super::PlatformError)
/// values, normally `Channel`; they are never swallowed. Idempotence of
/// `dispose` is not required here, the context enforces it.
#[async_trait]
pub trait Bindings: Send {
    /// Backend name used in logs, capability errors and snapshot envelopes.
    fn backend(&self) -> &str;

    /// Establish the remote context. `false` means it could not be established.
    async fn init(&mut self) -> Result<bool>;

    /// One-shot execution.
    async fn run(
        &mut self,
        code: &str,
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<RunReply>;

    /// Begin iterative execution; `external_functions` lists the names the
    /// sandbox may call out to.
    async fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<ProgressReply>;

    /// Answer the pending external call with a return value.
    async fn resume(&mut self, return_value: Value) -> Result<ProgressReply>;

    /// Answer the pending external call with an error.
    async fn resume_with_error(&mut self, message: &str) -> Result<ProgressReply>;

    /// Release the remote context.
    async fn dispose(&mut self) -> Result<()>;

    /// Snapshot/restore capability, if the backend has it.
    fn as_snapshot(&mut self) -> Option<&mut dyn SnapshotCapability> {
        None
    }

    /// Future-resolution capability, if the backend has it.
    fn as_futures(&mut self) -> Option<&mut dyn FutureCapability> {
        None
    }

    /// Namespace-capture capability, if the backend has it.
    fn as_namespace(&mut self) -> Option<&mut dyn NamespaceCapability> {
        None
    }
}

/// Binary capture of full interpreter state.
///
/// Formats are backend-specific; a snapshot taken on one backend is not
/// expected to restore on another.
#[async_trait]
pub trait SnapshotCapability: Send {
    /// Capture the current state as opaque bytes.
    async fn snapshot(&mut self) -> Result<Vec<u8>>;

    /// Replace the remote state with one captured by `snapshot`.
    async fn restore(&mut self, bytes: &[u8]) -> Result<()>;

    /// Whether an idle context may be snapshotted as well as a suspended one.
    fn allows_idle_snapshot(&self) -> bool {
        false
    }
}

/// Batch resolution of asynchronous external calls.
#[async_trait]
pub trait FutureCapability: Send {
    /// Turn the latest pending call into a future the caller answers later.
    async fn resume_as_future(&mut self) -> Result<ProgressReply>;

    /// Answer outstanding futures by call id.
    async fn resolve_futures(
        &mut self,
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
    ) -> Result<ProgressReply>;
}

/// Access to the global namespace left behind by the most recent `run`.
#[async_trait]
pub trait NamespaceCapability: Send {
    /// Every global binding, representable or not.
    async fn globals(&mut self) -> Result<GlobalsReply>;
}

#[async_trait]
impl Bindings for Box<dyn Bindings> {
    fn backend(&self) -> &str {
        (**self).backend()
    }

    async fn init(&mut self) -> Result<bool> {
        (**self).init().await
    }

    async fn run(
        &mut self,
        code: &str,
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<RunReply> {
        (**self).run(code, limits, script_name).await
    }

    async fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<ProgressReply> {
        (**self)
            .start(code, external_functions, limits, script_name)
            .await
    }

    async fn resume(&mut self, return_value: Value) -> Result<ProgressReply> {
        (**self).resume(return_value).await
    }

    async fn resume_with_error(&mut self, message: &str) -> Result<ProgressReply> {
        (**self).resume_with_error(message).await
    }

    async fn dispose(&mut self) -> Result<()> {
        (**self).dispose().await
    }

    fn as_snapshot(&mut self) -> Option<&mut dyn SnapshotCapability> {
        (**self).as_snapshot()
    }

    fn as_futures(&mut self) -> Option<&mut dyn FutureCapability> {
        (**self).as_futures()
    }

    fn as_namespace(&mut self) -> Option<&mut dyn NamespaceCapability> {
        (**self).as_namespace()
    }
}
