//! NDJSON engine host
//!
//! [`WireHost`] is the far end of a [`WireBindings`](super::WireBindings)
//! channel. It owns one engine, built by a factory on `init`, and translates
//! newline-delimited JSON commands into engine calls. Commands are processed
//! sequentially; results are encoded through the same translation module the
//! bindings decode with.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::engine::{Engine, EngineFactory, panic_message};
use super::error::EngineError;
use super::result::ExecutionLimits;
use super::translate;
use crate::WIRE_PROTOCOL_VERSION;

const DEFAULT_SCRIPT_NAME: &str = "<input>";

/// Engine-side server for the NDJSON wire protocol.
pub struct WireHost {
    factory: EngineFactory,
    engine: Option<Box<dyn Engine>>,
}

impl WireHost {
    /// Host that builds its engine with `factory` on `init`.
    pub fn new(factory: EngineFactory) -> Self {
        Self {
            factory,
            engine: None,
        }
    }

    /// Whether an engine is currently live.
    pub fn is_active(&self) -> bool {
        self.engine.is_some()
    }

    /// Serve one connection until the reader reaches end of stream.
    pub async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(request) => self.handle_request(request),
                Err(err) => {
                    ResponseEnvelope::from_error(Value::Null, HostError::Parse(err.to_string()))
                }
            };

            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
            writer.flush().await?;
        }

        self.engine = None;
        Ok(())
    }

    fn handle_request(&mut self, request: RequestEnvelope) -> ResponseEnvelope {
        tracing::trace!(command = %request.command, "host request");
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(&request.command, &request.params)
        }))
        .unwrap_or_else(|payload| {
            // engine state is unknown after a panic; the client must init again
            self.engine = None;
            let reason = panic_message(&*payload);
            tracing::error!(command = %request.command, %reason, "engine panicked");
            Err(HostError::Panicked(reason))
        });
        match outcome {
            Ok(value) => ResponseEnvelope::success(request.id, value),
            Err(err) => {
                tracing::debug!(
                    command = %request.command,
                    error = %err.message(),
                    "host request failed"
                );
                ResponseEnvelope::from_error(request.id, err)
            }
        }
    }

    fn dispatch(&mut self, command: &str, params: &Value) -> Result<Value, HostError> {
        match command {
            "init" => self.cmd_init(params),
            "run" => self.cmd_run(params),
            "start" => self.cmd_start(params),
            "resume" => self.cmd_resume(params),
            "resume_with_error" => self.cmd_resume_with_error(params),
            "resume_as_future" => self.cmd_resume_as_future(),
            "resolve_futures" => self.cmd_resolve_futures(params),
            "snapshot" => self.cmd_snapshot(),
            "restore" => self.cmd_restore(params),
            "globals" => self.cmd_globals(),
            "dispose" => self.cmd_dispose(),
            other => Err(HostError::Unsupported(other.to_string())),
        }
    }

    fn engine(&mut self) -> Result<&mut (dyn Engine + 'static), HostError> {
        self.engine
            .as_deref_mut()
            .ok_or(HostError::NotInitialized)
    }

    fn cmd_init(&mut self, params: &Value) -> Result<Value, HostError> {
        if let Some(requested) = params.get("protocol_version").and_then(Value::as_str) {
            if requested != WIRE_PROTOCOL_VERSION {
                return Err(HostError::InvalidParams(format!(
                    "unsupported protocol version {requested} (host speaks {WIRE_PROTOCOL_VERSION})"
                )));
            }
        }

        if self.engine.is_none() {
            match (self.factory)() {
                Ok(engine) => self.engine = Some(engine),
                Err(reason) => return Ok(json!({ "ok": false, "error": reason })),
            }
        }

        let capabilities = self.engine()?.capabilities();
        Ok(json!({
            "ok": true,
            "protocol_version": WIRE_PROTOCOL_VERSION,
            "capabilities": capabilities,
        }))
    }

    fn cmd_run(&mut self, params: &Value) -> Result<Value, HostError> {
        let code = required_str(params, "code")?;
        let limits = limits_param(params)?;
        let script_name = script_name_param(params);
        let result = self.engine()?.run(code, limits.as_ref(), script_name);
        Ok(translate::run_result_to_wire(&result))
    }

    fn cmd_start(&mut self, params: &Value) -> Result<Value, HostError> {
        let code = required_str(params, "code")?;
        let limits = limits_param(params)?;
        let script_name = script_name_param(params);
        let external_functions: Vec<String> = match params.get("external_functions") {
            None | Some(Value::Null) => Vec::new(),
            Some(names) => serde_json::from_value(names.clone())
                .map_err(|_| HostError::invalid_param("external_functions"))?,
        };
        let progress =
            self.engine()?
                .start(code, &external_functions, limits.as_ref(), script_name)?;
        Ok(translate::progress_to_wire(&progress))
    }

    fn cmd_resume(&mut self, params: &Value) -> Result<Value, HostError> {
        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let progress = self.engine()?.resume(value)?;
        Ok(translate::progress_to_wire(&progress))
    }

    fn cmd_resume_with_error(&mut self, params: &Value) -> Result<Value, HostError> {
        let message = required_str(params, "message")?;
        let progress = self.engine()?.resume_with_error(message)?;
        Ok(translate::progress_to_wire(&progress))
    }

    fn cmd_resume_as_future(&mut self) -> Result<Value, HostError> {
        let progress = self.engine()?.resume_as_future()?;
        Ok(translate::progress_to_wire(&progress))
    }

    fn cmd_resolve_futures(&mut self, params: &Value) -> Result<Value, HostError> {
        let results = keyed_by_call_id(params, "results", |value| Some(value.clone()))?;
        let errors = keyed_by_call_id(params, "errors", |value| {
            value.as_str().map(str::to_owned)
        })?;
        let progress = self.engine()?.resolve_futures(results, errors)?;
        Ok(translate::progress_to_wire(&progress))
    }

    fn cmd_snapshot(&mut self) -> Result<Value, HostError> {
        let bytes = self.engine()?.snapshot()?;
        Ok(json!({ "bytes": bytes }))
    }

    fn cmd_restore(&mut self, params: &Value) -> Result<Value, HostError> {
        let bytes: Vec<u8> = params
            .get("bytes")
            .cloned()
            .and_then(|bytes| serde_json::from_value(bytes).ok())
            .ok_or_else(|| HostError::invalid_param("bytes"))?;
        self.engine()?.restore(&bytes)?;
        Ok(json!({ "ok": true }))
    }

    fn cmd_globals(&mut self) -> Result<Value, HostError> {
        let globals = self.engine()?.globals()?;
        Ok(translate::globals_to_wire(&globals))
    }

    fn cmd_dispose(&mut self) -> Result<Value, HostError> {
        let disposed = self.engine.take().is_some();
        Ok(json!({ "ok": true, "disposed": disposed }))
    }
}

fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, HostError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| HostError::invalid_param(name))
}

fn script_name_param(params: &Value) -> &str {
    params
        .get("script_name")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SCRIPT_NAME)
}

fn limits_param(params: &Value) -> Result<Option<ExecutionLimits>, HostError> {
    match params.get("limits") {
        None | Some(Value::Null) => Ok(None),
        Some(limits) => serde_json::from_value(limits.clone())
            .map(Some)
            .map_err(|_| HostError::invalid_param("limits")),
    }
}

fn keyed_by_call_id<T>(
    params: &Value,
    name: &str,
    convert: impl Fn(&Value) -> Option<T>,
) -> Result<BTreeMap<u32, T>, HostError> {
    let entries = match params.get(name) {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(HostError::invalid_param(name)),
    };
    let mut out = BTreeMap::new();
    for (key, value) in entries {
        let call_id = key
            .parse::<u32>()
            .map_err(|_| HostError::InvalidParams(format!("{name}: '{key}' is not a call id")))?;
        let value = convert(value).ok_or_else(|| HostError::invalid_param(name))?;
        out.insert(call_id, value);
    }
    Ok(out)
}

#[derive(Debug)]
enum HostError {
    Parse(String),
    InvalidParams(String),
    Unsupported(String),
    NotInitialized,
    Panicked(String),
    Engine(EngineError),
}

impl HostError {
    fn invalid_param(name: &str) -> Self {
        HostError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }

    fn message(&self) -> String {
        match self {
            HostError::Parse(message) | HostError::InvalidParams(message) => message.clone(),
            HostError::Unsupported(command) => format!("Command '{command}' is not supported"),
            HostError::NotInitialized => "engine has not been initialized".to_string(),
            HostError::Panicked(reason) => format!("engine panicked: {reason}"),
            HostError::Engine(err) => err.to_string(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            HostError::Parse(_) => "parse_error",
            HostError::InvalidParams(_) => "invalid_params",
            HostError::Unsupported(_) => "unsupported_command",
            HostError::NotInitialized => "not_initialized",
            HostError::Panicked(_) => "engine_panicked",
            HostError::Engine(err) => err.code(),
        }
    }
}

impl From<EngineError> for HostError {
    fn from(err: EngineError) -> Self {
        HostError::Engine(err)
    }
}

#[derive(Deserialize)]
struct RequestEnvelope {
    id: Value,
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, error: HostError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
}

impl From<HostError> for ErrorEnvelope {
    fn from(error: HostError) -> Self {
        ErrorEnvelope {
            code: error.code().to_string(),
            message: error.message(),
        }
    }
}
