//! Error types for the Tether runtime
//!
//! Three kinds are never conflated: sandbox errors raised by executed code,
//! protocol/state violations signalling caller or backend bugs, and channel
//! failures of the remote call itself. Each subsystem has its own enum and
//! everything converges on [`PlatformError`].

use std::fmt;
use std::io;
use thiserror::Error;

use super::result::{ExecutionError, ResourceUsage};

/// Top-level error
#[derive(Debug, Error)]
pub enum PlatformError {
    /// Code inside the sandbox failed (iterative operations only)
    #[error("sandbox error: {0}")]
    Sandbox(#[from] ExecutionFailure),

    /// Operation invoked in the wrong lifecycle state
    #[error("state violation: {0}")]
    State(#[from] StateError),

    /// Backend produced something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Remote call could not be completed
    #[error("channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// Backend lacks an optional capability
    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Snapshot capture or restore failed
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Caller passed arguments the contract rejects
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl PlatformError {
    /// Whether this is a failure raised by sandboxed code.
    pub fn is_sandbox_error(&self) -> bool {
        matches!(self, PlatformError::Sandbox(_))
    }

    /// Whether this is a lifecycle-state violation.
    pub fn is_state_violation(&self) -> bool {
        matches!(self, PlatformError::State(_))
    }

    /// Whether the remote channel itself failed.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, PlatformError::Channel(_))
    }

    /// The sandbox failure, if this is one.
    pub fn as_sandbox(&self) -> Option<&ExecutionFailure> {
        match self {
            PlatformError::Sandbox(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Sandbox error surfaced from `start` or the resume family, bundling the
/// same fields `run` would return as data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .error.summary())]
pub struct ExecutionFailure {
    /// Error raised inside the sandbox.
    pub error: ExecutionError,
    /// Resource counters at the point of failure.
    pub usage: ResourceUsage,
}

/// Lifecycle state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// No execution in flight.
    Idle,
    /// An execution is suspended awaiting a resume.
    Active,
    /// Terminal; every operation except `dispose` fails.
    Disposed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextState::Idle => "Idle",
            ContextState::Active => "Active",
            ContextState::Disposed => "Disposed",
        };
        f.write_str(name)
    }
}

/// Operation invoked from the wrong state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{operation}` requires the context to be {required}, but it is {actual}")]
pub struct StateError {
    /// Offending operation.
    pub operation: &'static str,
    /// State(s) the operation accepts, e.g. `Idle` or `Active or Idle`.
    pub required: String,
    /// State the context was in.
    pub actual: ContextState,
}

/// Protocol-level violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Progress record carried a state tag outside the known set
    #[error("unknown progress state '{0}'")]
    UnknownProgressState(String),

    /// Wire record had the wrong shape
    #[error("malformed wire record: {0}")]
    MalformedRecord(String),

    /// Engine reused a call id within one suspended execution
    #[error("call id {0} was reused within one execution")]
    DuplicateCallId(u32),

    /// Backend answered with a reply kind that does not fit the request
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Engine refused a request its internal state does not allow
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

/// Remote-call channel failures
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `init` reported that the remote context could not be established
    #[error("remote execution context could not be established")]
    InitFailed,

    /// The worker or peer went away
    #[error("channel closed: {0}")]
    Closed(String),

    /// I/O error while talking to the peer
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Envelope (de)serialisation error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer sent an envelope that breaks the framing rules
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The peer reported a structured error
    #[error("remote error: {0}")]
    Remote(RemoteError),
}

/// Structured error reported by the remote side of a wire channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Optional peer-defined error code.
    pub code: Option<String>,
    /// Human-readable error message.
    pub message: String,
}

/// Optional capability errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// Backend does not implement the operation
    #[error("backend '{backend}' does not support {operation}")]
    Unsupported {
        /// Backend name.
        backend: String,
        /// Operation or feature requested.
        operation: &'static str,
    },
}

/// Snapshot-specific errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Bytes are not a snapshot this crate produced, or were altered
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    /// Snapshot was taken on a different backend
    #[error("snapshot was taken on backend '{found}', cannot restore on '{expected}'")]
    BackendMismatch {
        /// Backend restoring the snapshot.
        expected: String,
        /// Backend recorded in the snapshot.
        found: String,
    },

    /// Backend refused to capture state
    #[error("snapshot capture failed: {0}")]
    CaptureFailed(String),
}

/// Convenience result alias for snapshot operations
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Failures reported by an [`Engine`](super::engine::Engine) that are not sandbox errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Operation not implemented by this engine
    #[error("engine does not support {0}")]
    Unsupported(&'static str),

    /// Engine was asked to do something its internal state does not allow
    #[error("invalid engine state: {0}")]
    InvalidState(String),

    /// Restore bytes could not be decoded
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

impl EngineError {
    /// Stable code used when the error crosses a wire channel.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unsupported(_) => "unsupported",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::MalformedSnapshot(_) => "malformed_snapshot",
        }
    }

    /// Lift into the platform error space for the named backend.
    pub fn into_platform(self, backend: &str) -> PlatformError {
        match self {
            EngineError::Unsupported(operation) => CapabilityError::Unsupported {
                backend: backend.to_owned(),
                operation,
            }
            .into(),
            EngineError::InvalidState(message) => ProtocolError::Rejected(message).into(),
            EngineError::MalformedSnapshot(message) => SnapshotError::Malformed(message).into(),
        }
    }
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Result type using PlatformError
pub type Result<T> = std::result::Result<T, PlatformError>;
