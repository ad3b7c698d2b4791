//! Translation between wire records and the domain model
//!
//! Channels that only move serialized payloads return loosely-typed records:
//! a JSON object with an `ok` flag, an optional `state` tag and optional
//! fields. This module is the single place that knows every tag, key and
//! error shape, in both directions, so backends never duplicate decoding.
//!
//! Decoding never lets an absent value through: missing messages become
//! [`UNKNOWN_ERROR_MESSAGE`], missing usage becomes zeroed counters and missing
//! pending-call fields receive fixed defaults. Unknown state tags fail fast.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use super::error::ProtocolError;
use super::result::{
    ExecutionError, ExecutionResult, GlobalValue, PendingCall, Progress, ResourceUsage,
    StackFrame,
};

/// Message used when a failed record carries none.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// Frame name used when a traceback frame carries none.
pub const DEFAULT_FRAME_NAME: &str = "<module>";

/// Progress tag for a finished execution.
pub const STATE_COMPLETE: &str = "complete";
/// Progress tag for a suspension on one external call.
pub const STATE_PENDING: &str = "pending";
/// Progress tag for a suspension on a batch of futures.
pub const STATE_RESOLVE_FUTURES: &str = "resolve_futures";
/// Progress tag for a finished execution that raised.
pub const STATE_ERROR: &str = "error";

type Record = Map<String, Value>;

/// Decode a `RunResult` wire record.
pub fn run_result_from_wire(record: &Value) -> Result<ExecutionResult, ProtocolError> {
    let obj = as_record(record, "run result")?;
    let usage = usage_from_wire(obj)?;

    if ok_flag(obj)? {
        let value = obj.get("value").cloned().unwrap_or(Value::Null);
        Ok(ExecutionResult::success(value, usage))
    } else {
        Ok(ExecutionResult::failure(error_from_wire(obj)?, usage))
    }
}

/// Decode a `ProgressResult` wire record.
pub fn progress_from_wire(record: &Value) -> Result<Progress, ProtocolError> {
    let obj = as_record(record, "progress result")?;
    let state = match obj.get("state") {
        Some(Value::String(state)) => state.as_str(),
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "progress state must be a string, got {other}"
            )));
        }
        None => {
            return Err(ProtocolError::MalformedRecord(
                "progress result missing state".into(),
            ));
        }
    };

    match state {
        STATE_COMPLETE => Ok(Progress::Complete {
            result: run_result_from_wire(record)?,
        }),
        STATE_ERROR => {
            let usage = usage_from_wire(obj)?;
            Ok(Progress::Complete {
                result: ExecutionResult::failure(error_from_wire(obj)?, usage),
            })
        }
        STATE_PENDING => pending_from_wire(obj).map(Progress::Pending),
        STATE_RESOLVE_FUTURES => Ok(Progress::ResolveFutures {
            pending_call_ids: call_ids_from_wire(obj)?,
        }),
        other => Err(ProtocolError::UnknownProgressState(other.to_string())),
    }
}

/// Decode a namespace capture record: `{"globals": {name: {"value": v} | {"type": t}}}`.
pub fn globals_from_wire(
    record: &Value,
) -> Result<BTreeMap<String, GlobalValue>, ProtocolError> {
    let obj = as_record(record, "globals result")?;
    let globals = obj
        .get("globals")
        .and_then(Value::as_object)
        .ok_or_else(|| ProtocolError::MalformedRecord("globals result missing globals".into()))?;

    let mut decoded = BTreeMap::new();
    for (name, entry) in globals {
        let entry = entry.as_object().ok_or_else(|| {
            ProtocolError::MalformedRecord(format!("global '{name}' is not an object"))
        })?;
        let value = match entry.get("value") {
            Some(value) => GlobalValue::Data(value.clone()),
            None => GlobalValue::Opaque {
                type_name: entry
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("object")
                    .to_owned(),
            },
        };
        decoded.insert(name.clone(), value);
    }
    Ok(decoded)
}

/// Encode a run result as a `RunResult` wire record.
pub fn run_result_to_wire(result: &ExecutionResult) -> Value {
    let mut obj = Record::new();
    obj.insert("ok".into(), Value::Bool(!result.is_error()));
    obj.insert("usage".into(), usage_to_wire(&result.usage));
    match &result.error {
        Some(error) => error_to_wire(error, &mut obj),
        None => {
            obj.insert("value".into(), result.value_or_null());
        }
    }
    Value::Object(obj)
}

/// Encode progress as a `ProgressResult` wire record.
///
/// A completion that raised is tagged `error`.
pub fn progress_to_wire(progress: &Progress) -> Value {
    match progress {
        Progress::Complete { result } => {
            let mut record = run_result_to_wire(result);
            let state = if result.is_error() {
                STATE_ERROR
            } else {
                STATE_COMPLETE
            };
            if let Some(obj) = record.as_object_mut() {
                obj.insert("state".into(), Value::String(state.into()));
            }
            record
        }
        Progress::Pending(call) => {
            let mut obj = Record::new();
            obj.insert("ok".into(), Value::Bool(true));
            obj.insert("state".into(), Value::String(STATE_PENDING.into()));
            obj.insert(
                "function_name".into(),
                Value::String(call.function_name.clone()),
            );
            obj.insert("arguments".into(), Value::Array(call.arguments.clone()));
            // empty kwargs decode as absent, so they are not sent
            if let Some(kwargs) = call.kwargs.as_ref().filter(|kwargs| !kwargs.is_empty()) {
                obj.insert("kwargs".into(), Value::Object(kwargs.clone()));
            }
            obj.insert("call_id".into(), json!(call.call_id));
            obj.insert("method_call".into(), Value::Bool(call.method_call));
            Value::Object(obj)
        }
        Progress::ResolveFutures { pending_call_ids } => json!({
            "ok": true,
            "state": STATE_RESOLVE_FUTURES,
            "pending_call_ids": pending_call_ids,
        }),
    }
}

/// Encode a namespace capture.
pub fn globals_to_wire(globals: &BTreeMap<String, GlobalValue>) -> Value {
    let entries: Record = globals
        .iter()
        .map(|(name, global)| {
            let entry = match global {
                GlobalValue::Data(value) => json!({ "value": value }),
                GlobalValue::Opaque { type_name } => json!({ "type": type_name }),
            };
            (name.clone(), entry)
        })
        .collect();
    json!({ "globals": entries })
}

fn as_record<'a>(record: &'a Value, what: &str) -> Result<&'a Record, ProtocolError> {
    record
        .as_object()
        .ok_or_else(|| ProtocolError::MalformedRecord(format!("{what} must be an object")))
}

fn ok_flag(obj: &Record) -> Result<bool, ProtocolError> {
    match obj.get("ok") {
        Some(Value::Bool(ok)) => Ok(*ok),
        None | Some(Value::Null) => Ok(false),
        Some(other) => Err(ProtocolError::MalformedRecord(format!(
            "ok flag must be a boolean, got {other}"
        ))),
    }
}

fn usage_from_wire(obj: &Record) -> Result<ResourceUsage, ProtocolError> {
    let usage = match obj.get("usage") {
        None | Some(Value::Null) => return Ok(ResourceUsage::default()),
        Some(Value::Object(usage)) => usage,
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "usage must be an object, got {other}"
            )));
        }
    };
    let counter = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);

    Ok(ResourceUsage {
        memory_bytes_used: counter("memory_bytes_used"),
        time_elapsed_ms: counter("time_elapsed_ms"),
        stack_depth_used: counter("stack_depth_used"),
    })
}

fn usage_to_wire(usage: &ResourceUsage) -> Value {
    json!({
        "memory_bytes_used": usage.memory_bytes_used,
        "time_elapsed_ms": usage.time_elapsed_ms,
        "stack_depth_used": usage.stack_depth_used,
    })
}

/// Error detail either sits on the record itself (`error` is the message) or
/// in a nested object under `error`.
fn error_from_wire(obj: &Record) -> Result<ExecutionError, ProtocolError> {
    let (detail, message) = match obj.get("error") {
        Some(Value::Object(nested)) => (
            nested,
            nested
                .get("message")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        ),
        Some(Value::String(message)) => (obj, Some(message.clone())),
        _ => (obj, None),
    };

    let traceback = match detail.get("traceback") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(frames)) => frames
            .iter()
            .map(frame_from_wire)
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "traceback must be an array, got {other}"
            )));
        }
    };

    let innermost = traceback.last();
    let filename = detail
        .get("filename")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| innermost.map(|frame| frame.filename.clone()));
    let line_number = detail
        .get("line_number")
        .and_then(Value::as_u64)
        .map(saturate_u32)
        .or_else(|| innermost.map(|frame| frame.start_line));
    let column_number = detail
        .get("column_number")
        .and_then(Value::as_u64)
        .map(saturate_u32)
        .or_else(|| innermost.map(|frame| frame.start_column));

    Ok(ExecutionError {
        message: message.unwrap_or_else(|| UNKNOWN_ERROR_MESSAGE.to_owned()),
        exc_type: detail
            .get("exc_type")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        filename,
        line_number,
        column_number,
        traceback,
    })
}

fn error_to_wire(error: &ExecutionError, obj: &mut Record) {
    obj.insert("error".into(), Value::String(error.message.clone()));
    if let Some(exc_type) = &error.exc_type {
        obj.insert("exc_type".into(), Value::String(exc_type.clone()));
    }
    if let Some(filename) = &error.filename {
        obj.insert("filename".into(), Value::String(filename.clone()));
    }
    if let Some(line) = error.line_number {
        obj.insert("line_number".into(), json!(line));
    }
    if let Some(column) = error.column_number {
        obj.insert("column_number".into(), json!(column));
    }
    if !error.traceback.is_empty() {
        let frames = error
            .traceback
            .iter()
            .map(|frame| {
                let mut f = json!({
                    "filename": frame.filename,
                    "start_line": frame.start_line,
                    "start_column": frame.start_column,
                    "frame_name": frame.frame_name,
                });
                if let (Some(preview), Some(fm)) = (&frame.preview_line, f.as_object_mut()) {
                    fm.insert("preview_line".into(), Value::String(preview.clone()));
                }
                f
            })
            .collect();
        obj.insert("traceback".into(), Value::Array(frames));
    }
}

fn frame_from_wire(value: &Value) -> Result<StackFrame, ProtocolError> {
    let frame = value.as_object().ok_or_else(|| {
        ProtocolError::MalformedRecord("traceback frame is not an object".into())
    })?;

    let filename = frame
        .get("filename")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::MalformedRecord("traceback frame missing filename".into()))?
        .to_owned();
    let start_line = frame
        .get("start_line")
        .and_then(Value::as_u64)
        .map(saturate_u32)
        .ok_or_else(|| {
            ProtocolError::MalformedRecord("traceback frame missing start_line".into())
        })?;
    let start_column = frame
        .get("start_column")
        .and_then(Value::as_u64)
        .map(saturate_u32)
        .unwrap_or(0);
    let frame_name = frame
        .get("frame_name")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_FRAME_NAME)
        .to_owned();
    let preview_line = frame
        .get("preview_line")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    Ok(StackFrame {
        filename,
        start_line,
        start_column,
        frame_name,
        preview_line,
    })
}

fn pending_from_wire(obj: &Record) -> Result<PendingCall, ProtocolError> {
    let function_name = match obj.get("function_name") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(name)) => name.clone(),
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "function_name must be a string, got {other}"
            )));
        }
    };
    let arguments = match obj.get("arguments") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "arguments must be an array, got {other}"
            )));
        }
    };
    let kwargs = match obj.get("kwargs") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) if map.is_empty() => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(other) => {
            return Err(ProtocolError::MalformedRecord(format!(
                "kwargs must be an object, got {other}"
            )));
        }
    };
    let call_id = match obj.get("call_id") {
        None | Some(Value::Null) => 0,
        Some(value) => value.as_u64().and_then(|id| u32::try_from(id).ok()).ok_or_else(|| {
            ProtocolError::MalformedRecord(format!("call_id must be a u32, got {value}"))
        })?,
    };
    let method_call = obj
        .get("method_call")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(PendingCall {
        function_name,
        arguments,
        kwargs,
        call_id,
        method_call,
    })
}

fn call_ids_from_wire(obj: &Record) -> Result<Vec<u32>, ProtocolError> {
    match obj.get("pending_call_ids") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|id| {
                id.as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| {
                        ProtocolError::MalformedRecord(format!("invalid pending call id {id}"))
                    })
            })
            .collect(),
        Some(other) => Err(ProtocolError::MalformedRecord(format!(
            "pending_call_ids must be an array, got {other}"
        ))),
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
