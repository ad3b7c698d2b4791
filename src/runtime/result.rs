//! Result and progress domain model
//!
//! Immutable value types describing what an execution produced: completed
//! results, suspensions awaiting host input, resource usage and sandbox
//! errors. Every type serializes to a JSON-compatible map with snake_case keys
//! and compares structurally.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::hash::{Hash, Hasher};

/// Resource counters reported by the engine on every completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak heap usage in bytes.
    pub memory_bytes_used: u64,
    /// Wall-clock time spent executing, in milliseconds.
    pub time_elapsed_ms: u64,
    /// Deepest call stack reached.
    pub stack_depth_used: u64,
}

/// One frame of a sandbox traceback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    /// Script name the frame belongs to.
    pub filename: String,
    /// 1-based line where the frame's expression starts.
    pub start_line: u32,
    /// Column where the frame's expression starts.
    pub start_column: u32,
    /// Function name, `<module>` for top-level code.
    pub frame_name: String,
    /// Source line snippet, when the engine provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_line: Option<String>,
}

/// Failure raised inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionError {
    /// Human-readable message.
    pub message: String,
    /// Sandboxed exception class name (e.g. `ZeroDivisionError`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    /// Script name of the innermost frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Line of the innermost frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    /// Column of the innermost frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
    /// Frames, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<StackFrame>,
}

impl ExecutionError {
    /// Create an error with only a message and an exception type.
    pub fn new(exc_type: Option<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exc_type,
            filename: None,
            line_number: None,
            column_number: None,
            traceback: Vec::new(),
        }
    }

    /// `ExcType: message`, or just the message when the type is unknown.
    pub fn summary(&self) -> String {
        match &self.exc_type {
            Some(exc_type) => format!("{exc_type}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Outcome of a run-to-completion.
///
/// Exactly one of `value` / `error` is meaningful: a result is successful when
/// `error` is `None`, and a `None` value then stands for the sandbox's null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Value of the final expression.
    #[serde(default)]
    pub value: Option<Value>,
    /// Sandbox error, if execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Resource counters, present even on error.
    #[serde(default)]
    pub usage: ResourceUsage,
}

impl ExecutionResult {
    /// Successful result. A JSON `null` is stored as an absent value.
    pub fn success(value: Value, usage: ResourceUsage) -> Self {
        let value = if value.is_null() { None } else { Some(value) };
        Self {
            value,
            error: None,
            usage,
        }
    }

    /// Failed result carrying the sandbox error.
    pub fn failure(error: ExecutionError, usage: ResourceUsage) -> Self {
        Self {
            value: None,
            error: Some(error),
            usage,
        }
    }

    /// Whether the execution raised inside the sandbox.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The result value, `null` when absent.
    pub fn value_or_null(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }
}

impl Hash for ExecutionResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.as_ref().map(Value::to_string).hash(state);
        self.error.hash(state);
        self.usage.hash(state);
    }
}

/// Resource ceilings for one execution. `None` means unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    /// Wall-clock cutoff in milliseconds.
    #[serde(default, alias = "timeout_ms", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Heap ceiling in bytes.
    #[serde(default, alias = "memory_bytes", skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    /// Call-depth ceiling.
    #[serde(default, alias = "stack_depth", skip_serializing_if = "Option::is_none")]
    pub stack_depth: Option<u64>,
}

impl ExecutionLimits {
    /// No ceiling in any dimension.
    pub fn is_unlimited(&self) -> bool {
        self.timeout_ms.is_none() && self.memory_bytes.is_none() && self.stack_depth.is_none()
    }

    /// Fill dimensions left open here from `defaults`.
    pub fn merged_over(self, defaults: &ExecutionLimits) -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: self.timeout_ms.or(defaults.timeout_ms),
            memory_bytes: self.memory_bytes.or(defaults.memory_bytes),
            stack_depth: self.stack_depth.or(defaults.stack_depth),
        }
    }
}

/// External call the sandbox is suspended on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCall {
    /// Name of the external function.
    pub function_name: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// Keyword arguments, absent when none were passed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    /// Identifier correlating this call, unique within one execution.
    pub call_id: u32,
    /// `obj.method()` rather than `func()`.
    pub method_call: bool,
}

impl Hash for PendingCall {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function_name.hash(state);
        for argument in &self.arguments {
            argument.to_string().hash(state);
        }
        self.kwargs
            .as_ref()
            .map(|kwargs| Value::Object(kwargs.clone()).to_string())
            .hash(state);
        self.call_id.hash(state);
        self.method_call.hash(state);
    }
}

/// Result of `start` and the resume family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Progress {
    /// Execution finished; the context is idle again.
    Complete {
        /// Final result, possibly carrying a sandbox error.
        result: ExecutionResult,
    },
    /// Execution is suspended on one external call.
    Pending(PendingCall),
    /// Execution is suspended on a batch of outstanding futures.
    ResolveFutures {
        /// Call ids that must be answered together.
        pending_call_ids: Vec<u32>,
    },
}

impl Progress {
    /// Whether this progress ends the execution.
    pub fn is_complete(&self) -> bool {
        matches!(self, Progress::Complete { .. })
    }

    /// The pending call, if execution is suspended on one.
    pub fn as_pending(&self) -> Option<&PendingCall> {
        match self {
            Progress::Pending(call) => Some(call),
            _ => None,
        }
    }

    /// Short variant name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Progress::Complete { .. } => "complete",
            Progress::Pending(_) => "pending",
            Progress::ResolveFutures { .. } => "resolve_futures",
        }
    }
}

/// One post-execution global binding, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalValue {
    /// JSON-representable data.
    Data(Value),
    /// Anything that cannot cross the boundary (functions, modules, ...).
    Opaque {
        /// Sandbox type name of the binding.
        type_name: String,
    },
}

impl GlobalValue {
    /// The data, when the binding is representable.
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            GlobalValue::Data(value) => Some(value),
            GlobalValue::Opaque { .. } => None,
        }
    }
}
