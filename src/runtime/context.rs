//! Execution state machine
//!
//! An [`ExecutionContext`] owns one [`Bindings`] backend and gates every
//! operation on its lifecycle state:
//!
//! ```text
//!            start / resume* -> Pending | ResolveFutures
//!   Idle  ───────────────────────────────────────────────▶  Active
//!    ▲  ◀───────────────────────────────────────────────     │
//!    │      Complete, sandbox error, failed resume           │
//!    │                                                       │
//!    └──────────────── dispose (any state) ──────▶  Disposed ◀┘
//! ```
//!
//! Operations take `&mut self`, so a context never runs two operations at
//! once and `dispose` waits for any in-flight operation by construction.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::PlatformConfig;
use super::bindings::{Bindings, ProgressReply};
use super::error::{
    CapabilityError, ChannelError, ContextState, ExecutionFailure, PlatformError, ProtocolError,
    Result, StateError,
};
use super::result::{ExecutionLimits, ExecutionResult, GlobalValue, Progress};
use super::snapshot::SnapshotEnvelope;

/// Options for [`ExecutionContext::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    /// Per-call limits, merged over the configured defaults.
    pub limits: Option<ExecutionLimits>,
    /// Script name used in tracebacks.
    pub script_name: Option<String>,
    /// Globals to pre-seed before execution.
    pub inputs: BTreeMap<String, Value>,
}

impl RunOptions {
    /// Options with the given limits.
    pub fn with_limits(limits: ExecutionLimits) -> Self {
        Self {
            limits: Some(limits),
            ..Default::default()
        }
    }
}

/// Options for [`ExecutionContext::start`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartOptions {
    /// Names the sandbox may call out to.
    pub external_functions: Vec<String>,
    /// Per-call limits, merged over the configured defaults.
    pub limits: Option<ExecutionLimits>,
    /// Script name used in tracebacks.
    pub script_name: Option<String>,
    /// Globals to pre-seed before execution.
    pub inputs: BTreeMap<String, Value>,
}

impl StartOptions {
    /// Options allowing calls to the given external functions.
    pub fn with_externals<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            external_functions: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// One logical sandbox instance and its lifecycle.
pub struct ExecutionContext<B: Bindings> {
    id: Uuid,
    bindings: B,
    config: PlatformConfig,
    state: ContextState,
    initialized: bool,
    /// Call ids observed during the current execution
    seen_call_ids: HashSet<u32>,
    /// Call ids announced by the latest `ResolveFutures`; `None` when unknown
    /// (after a restore).
    outstanding_futures: Option<Vec<u32>>,
}

impl<B: Bindings> ExecutionContext<B> {
    /// Wrap a backend using the default configuration.
    pub fn new(bindings: B) -> Self {
        Self::with_config(bindings, PlatformConfig::default())
    }

    /// Wrap a backend using `config` for defaults.
    pub fn with_config(bindings: B, config: PlatformConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            bindings,
            config,
            state: ContextState::Idle,
            initialized: false,
            seen_call_ids: HashSet::new(),
            outstanding_futures: Some(Vec::new()),
        }
    }

    /// Identifier carried in log fields.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Whether the backend has been initialised.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Backend name.
    pub fn backend(&self) -> &str {
        self.bindings.backend()
    }

    /// Configuration in effect.
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// The wrapped backend.
    pub fn bindings(&self) -> &B {
        &self.bindings
    }

    /// Establish the remote context. Called lazily by the operations that
    /// need it; calling it again after success does nothing.
    pub async fn init(&mut self) -> Result<()> {
        self.require("init", &[ContextState::Idle, ContextState::Active])?;
        if self.initialized {
            return Ok(());
        }
        let ready = self.bindings.init().await;
        if !self.observe(ready)? {
            tracing::warn!(
                context = %self.id,
                backend = self.bindings.backend(),
                "backend init failed"
            );
            return Err(ChannelError::InitFailed.into());
        }
        self.initialized = true;
        tracing::debug!(
            context = %self.id,
            backend = self.bindings.backend(),
            "context initialized"
        );
        Ok(())
    }

    /// Execute `code` to completion. Sandbox errors are returned as data in
    /// the result.
    pub async fn run(&mut self, code: &str, options: RunOptions) -> Result<ExecutionResult> {
        self.require("run", &[ContextState::Idle])?;
        self.reject_inputs(&options.inputs)?;
        self.init().await?;

        let limits = self.effective_limits(options.limits);
        let script_name = options
            .script_name
            .unwrap_or_else(|| self.config.script_name.clone());

        let reply = self
            .bindings
            .run(code, limits.as_ref(), Some(&script_name))
            .await;
        let result = self.observe(reply)?.into_result()?;
        tracing::debug!(
            context = %self.id,
            error = result.is_error(),
            time_ms = result.usage.time_elapsed_ms,
            "run completed"
        );
        Ok(result)
    }

    /// Begin iterative execution.
    pub async fn start(&mut self, code: &str, options: StartOptions) -> Result<Progress> {
        self.require("start", &[ContextState::Idle])?;
        self.reject_inputs(&options.inputs)?;
        self.init().await?;

        let limits = self.effective_limits(options.limits);
        let script_name = options
            .script_name
            .unwrap_or_else(|| self.config.script_name.clone());

        self.seen_call_ids.clear();
        self.outstanding_futures = Some(Vec::new());
        let reply = self
            .bindings
            .start(
                code,
                &options.external_functions,
                limits.as_ref(),
                Some(&script_name),
            )
            .await;
        self.settle("start", reply)
    }

    /// Answer the pending call with a value.
    pub async fn resume(&mut self, return_value: Value) -> Result<Progress> {
        self.require("resume", &[ContextState::Active])?;
        let reply = self.bindings.resume(return_value).await;
        self.settle("resume", reply)
    }

    /// Answer the pending call by raising `message` inside the sandbox.
    pub async fn resume_with_error(&mut self, message: &str) -> Result<Progress> {
        self.require("resume_with_error", &[ContextState::Active])?;
        let reply = self.bindings.resume_with_error(message).await;
        self.settle("resume_with_error", reply)
    }

    /// Defer the pending call as a future answered later through
    /// [`resolve_futures`](Self::resolve_futures).
    pub async fn resume_as_future(&mut self) -> Result<Progress> {
        self.require("resume_as_future", &[ContextState::Active])?;
        let backend = self.bindings.backend().to_owned();
        let Some(futures) = self.bindings.as_futures() else {
            return Err(unsupported(backend, "resume_as_future"));
        };
        let reply = futures.resume_as_future().await;
        self.settle("resume_as_future", reply)
    }

    /// Answer outstanding futures: `results` maps call id to value, `errors`
    /// maps call id to an error message.
    pub async fn resolve_futures(
        &mut self,
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
    ) -> Result<Progress> {
        self.require("resolve_futures", &[ContextState::Active])?;
        let backend = self.bindings.backend().to_owned();
        if self.bindings.as_futures().is_none() {
            return Err(unsupported(backend, "resolve_futures"));
        }

        if let Some(id) = results.keys().find(|id| errors.contains_key(*id)) {
            return Err(PlatformError::InvalidArgument(format!(
                "call id {id} appears in both results and errors"
            )));
        }
        if let Some(announced) = &self.outstanding_futures {
            if let Some(id) = results
                .keys()
                .chain(errors.keys())
                .find(|id| !announced.contains(id))
            {
                return Err(PlatformError::InvalidArgument(format!(
                    "call id {id} is not awaiting resolution"
                )));
            }
        }

        let Some(futures) = self.bindings.as_futures() else {
            return Err(unsupported(backend, "resolve_futures"));
        };
        let reply = futures.resolve_futures(results, errors).await;
        self.settle("resolve_futures", reply)
    }

    /// Capture the interpreter state as a sealed snapshot.
    ///
    /// Legal while `Active`; legal while `Idle` only when the backend says so
    /// through [`SnapshotCapability::allows_idle_snapshot`](super::SnapshotCapability::allows_idle_snapshot).
    pub async fn snapshot(&mut self) -> Result<Vec<u8>> {
        self.require("snapshot", &[ContextState::Active, ContextState::Idle])?;
        let state = self.state;
        let idle_refused = StateError {
            operation: "snapshot",
            required: ContextState::Active.to_string(),
            actual: state,
        };
        // an uninitialized context has nothing to capture
        if state == ContextState::Idle && !self.initialized {
            return Err(idle_refused.into());
        }
        self.init().await?;
        let backend = self.bindings.backend().to_owned();
        let Some(capability) = self.bindings.as_snapshot() else {
            return Err(unsupported(backend, "snapshot"));
        };
        if state == ContextState::Idle && !capability.allows_idle_snapshot() {
            return Err(idle_refused.into());
        }

        let payload = capability.snapshot().await;
        let payload = self.observe(payload)?;
        let sealed = SnapshotEnvelope::new(backend, payload).encode()?;
        tracing::debug!(context = %self.id, bytes = sealed.len(), "snapshot captured");
        Ok(sealed)
    }

    /// Resume from a snapshot taken by [`snapshot`](Self::snapshot) on the
    /// same backend. The context ends up `Active`.
    ///
    /// The envelope is verified before anything reaches the backend.
    pub async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.require("restore", &[ContextState::Idle])?;
        let backend = self.bindings.backend().to_owned();
        let envelope = SnapshotEnvelope::decode(bytes)?;
        envelope.verify_backend(&backend)?;

        self.init().await?;
        let Some(capability) = self.bindings.as_snapshot() else {
            return Err(unsupported(backend, "restore"));
        };
        let restored = capability.restore(&envelope.payload).await;
        self.observe(restored)?;

        self.seen_call_ids.clear();
        self.outstanding_futures = None;
        self.state = ContextState::Active;
        tracing::debug!(context = %self.id, "snapshot restored");
        Ok(())
    }

    /// Global namespace left by the most recent `run`.
    pub async fn globals(&mut self) -> Result<BTreeMap<String, GlobalValue>> {
        self.require("globals", &[ContextState::Idle])?;
        if !self.initialized {
            return Ok(BTreeMap::new());
        }
        let backend = self.bindings.backend().to_owned();
        let Some(namespace) = self.bindings.as_namespace() else {
            return Err(unsupported(backend, "globals"));
        };
        let reply = namespace.globals().await;
        Ok(self.observe(reply)?.into_globals()?)
    }

    /// Whether the backend can report globals; initializes on first use.
    pub async fn supports_namespace(&mut self) -> Result<bool> {
        self.init().await?;
        Ok(self.bindings.as_namespace().is_some())
    }

    /// Release the backend. Idempotent; a context that never initialised does
    /// not reach the backend at all.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.state == ContextState::Disposed {
            return Ok(());
        }
        self.state = ContextState::Disposed;
        self.seen_call_ids.clear();
        self.outstanding_futures = None;
        if !self.initialized {
            tracing::debug!(context = %self.id, "disposed uninitialized context");
            return Ok(());
        }
        self.initialized = false;
        self.bindings.dispose().await?;
        tracing::debug!(context = %self.id, "context disposed");
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[ContextState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let required = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(StateError {
            operation,
            required,
            actual: self.state,
        }
        .into())
    }

    fn reject_inputs(&self, inputs: &BTreeMap<String, Value>) -> Result<()> {
        if inputs.is_empty() {
            Ok(())
        } else {
            Err(unsupported(self.bindings.backend().to_owned(), "inputs"))
        }
    }

    fn effective_limits(&self, limits: Option<ExecutionLimits>) -> Option<ExecutionLimits> {
        let merged = limits
            .unwrap_or_default()
            .merged_over(&self.config.default_limits);
        (!merged.is_unlimited()).then_some(merged)
    }

    /// Apply the lifecycle rule to the outcome of an iterative operation.
    fn settle(
        &mut self,
        operation: &'static str,
        reply: Result<ProgressReply>,
    ) -> Result<Progress> {
        let reply = self.observe(reply);
        let outcome = reply.and_then(|reply| reply.into_progress().map_err(PlatformError::from));
        let progress = match outcome {
            Ok(progress) => progress,
            Err(err) => {
                tracing::warn!(context = %self.id, operation, error = %err, "execution aborted");
                self.finish_execution();
                return Err(err);
            }
        };

        match progress {
            Progress::Complete {
                result:
                    ExecutionResult {
                        error: Some(error),
                        usage,
                        ..
                    },
            } => {
                self.finish_execution();
                tracing::debug!(context = %self.id, operation, "execution raised");
                Err(ExecutionFailure { error, usage }.into())
            }
            Progress::Complete { result } => {
                self.finish_execution();
                tracing::debug!(context = %self.id, operation, "execution complete");
                Ok(Progress::Complete { result })
            }
            Progress::Pending(call) => {
                if !self.seen_call_ids.insert(call.call_id) {
                    self.finish_execution();
                    return Err(ProtocolError::DuplicateCallId(call.call_id).into());
                }
                self.state = ContextState::Active;
                self.outstanding_futures = Some(Vec::new());
                tracing::debug!(
                    context = %self.id,
                    operation,
                    function = %call.function_name,
                    call_id = call.call_id,
                    "execution suspended"
                );
                Ok(Progress::Pending(call))
            }
            Progress::ResolveFutures { pending_call_ids } => {
                self.state = ContextState::Active;
                self.outstanding_futures = Some(pending_call_ids.clone());
                tracing::debug!(
                    context = %self.id,
                    operation,
                    pending = pending_call_ids.len(),
                    "awaiting futures"
                );
                Ok(Progress::ResolveFutures { pending_call_ids })
            }
        }
    }

    /// A closed channel means the remote context is gone; the next operation
    /// initializes again.
    fn observe<T>(&mut self, outcome: Result<T>) -> Result<T> {
        if let Err(PlatformError::Channel(ChannelError::Closed(reason))) = &outcome {
            if self.initialized {
                tracing::warn!(context = %self.id, %reason, "backend lost, will initialize again");
            }
            self.initialized = false;
        }
        outcome
    }

    fn finish_execution(&mut self) {
        self.state = ContextState::Idle;
        self.seen_call_ids.clear();
        self.outstanding_futures = Some(Vec::new());
    }
}

fn unsupported(backend: String, operation: &'static str) -> PlatformError {
    CapabilityError::Unsupported { backend, operation }.into()
}

impl<B: Bindings> std::fmt::Debug for ExecutionContext<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("backend", &self.bindings.backend())
            .field("state", &self.state)
            .field("initialized", &self.initialized)
            .finish()
    }
}
