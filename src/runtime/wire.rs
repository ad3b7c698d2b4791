//! Serialized-channel adapter
//!
//! [`WireBindings`] drives an engine living behind a [`WireChannel`]: every
//! operation becomes one command carrying JSON params, and every reply is a
//! loosely-typed wire record handed to the translation layer.
//!
//! [`NdjsonChannel`] is the stock channel. It speaks newline-delimited JSON:
//!
//! ```text
//! -> {"id": 7, "command": "resume", "params": {"value": 42}}
//! <- {"id": 7, "result": {"ok": true, "state": "complete", "value": 43, ...}}
//! <- {"id": 8, "error": {"code": "unsupported", "message": "..."}}
//! ```

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::bindings::{
    Bindings, FutureCapability, GlobalsReply, NamespaceCapability, ProgressReply, RunReply,
    SnapshotCapability,
};
use super::engine::EngineCapabilities;
use super::error::{
    CapabilityError, ChannelError, PlatformError, ProtocolError, RemoteError, Result,
    SnapshotError,
};
use super::result::ExecutionLimits;
use crate::WIRE_PROTOCOL_VERSION;

const BACKEND: &str = "wire";

/// Request/response transport for [`WireBindings`].
#[async_trait]
pub trait WireChannel: Send {
    /// Send one command and wait for its result. A structured error from the
    /// peer is `ChannelError::Remote`.
    async fn call(&mut self, command: &str, params: Value) -> Result<Value>;

    /// Release the transport.
    async fn close(&mut self) -> Result<()>;
}

/// NDJSON request/response channel over any async reader/writer pair.
pub struct NdjsonChannel<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    next_request_id: u64,
    child: Option<Child>,
}

impl<R, W> NdjsonChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Channel over an existing stream pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            next_request_id: 1,
            child: None,
        }
    }

    async fn send_request(
        &mut self,
        command: &str,
        params: Value,
    ) -> std::result::Result<Value, ChannelError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let envelope = json!({
            "id": request_id,
            "command": command,
            "params": params,
        });

        let mut payload = serde_json::to_vec(&envelope)?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;

        // replies to requests abandoned mid-flight arrive first; skip them
        let response = loop {
            let line = self.read_line().await?;
            let response: Value = serde_json::from_slice(&line)?;
            let response_id = response
                .get("id")
                .and_then(Value::as_u64)
                .ok_or_else(|| ChannelError::MalformedEnvelope("response missing id".into()))?;
            if response_id == request_id {
                break response;
            }
            if response_id > request_id {
                return Err(ChannelError::MalformedEnvelope(format!(
                    "response id mismatch (expected {request_id}, got {response_id})"
                )));
            }
            tracing::debug!(stale = response_id, expected = request_id, "discarding stale reply");
        };

        if let Some(error) = response.get("error") {
            let code = error.get("code").and_then(Value::as_str).map(String::from);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown remote error")
                .to_owned();
            return Err(ChannelError::Remote(RemoteError { code, message }));
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn read_line(&mut self) -> std::result::Result<Vec<u8>, ChannelError> {
        let mut buffer = Vec::with_capacity(256);
        loop {
            buffer.clear();
            let bytes = self.reader.read_until(b'\n', &mut buffer).await?;
            if bytes == 0 {
                return Err(ChannelError::Closed("connection closed by peer".into()));
            }
            if !buffer.trim_ascii().is_empty() {
                return Ok(buffer);
            }
        }
    }
}

impl NdjsonChannel<ChildStdout, ChildStdin> {
    /// Spawn `program` and talk to it over its stdin/stdout. The child is
    /// killed when the channel is closed or dropped.
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(ChannelError::Io)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Closed("spawned engine did not expose stdout".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Closed("spawned engine did not expose stdin".into()))?;

        let mut channel = Self::new(stdout, stdin);
        channel.child = Some(child);
        Ok(channel)
    }
}

#[async_trait]
impl<R, W> WireChannel for NdjsonChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn call(&mut self, command: &str, params: Value) -> Result<Value> {
        Ok(self.send_request(command, params).await?)
    }

    async fn close(&mut self) -> Result<()> {
        let shutdown = self.writer.shutdown().await;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            child.wait().await.map_err(ChannelError::Io)?;
        }
        shutdown.map_err(ChannelError::Io)?;
        Ok(())
    }
}

/// Bindings that drive a remote engine over a [`WireChannel`].
pub struct WireBindings<C: WireChannel> {
    channel: C,
    capabilities: EngineCapabilities,
    connected: bool,
}

impl<C: WireChannel> WireBindings<C> {
    /// Bindings over `channel`.
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            capabilities: EngineCapabilities::default(),
            connected: false,
        }
    }

    /// Capabilities the peer advertised at init.
    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    /// Issue `command`, lifting structured peer errors into the platform
    /// error space.
    async fn command(&mut self, operation: &'static str, params: Value) -> Result<Value> {
        let outcome = match self.channel.call(operation, params).await {
            Err(PlatformError::Channel(ChannelError::Remote(remote))) => {
                Err(lift_remote(operation, remote))
            }
            other => other,
        };
        if let Err(PlatformError::Channel(ChannelError::Closed(_))) = &outcome {
            self.connected = false;
            self.capabilities = EngineCapabilities::default();
        }
        outcome
    }

    async fn progress(&mut self, operation: &'static str, params: Value) -> Result<ProgressReply> {
        Ok(ProgressReply::Wire(self.command(operation, params).await?))
    }
}

fn lift_remote(operation: &'static str, remote: RemoteError) -> PlatformError {
    match remote.code.as_deref() {
        Some("unsupported") => CapabilityError::Unsupported {
            backend: BACKEND.to_owned(),
            operation,
        }
        .into(),
        Some("malformed_snapshot") => SnapshotError::Malformed(remote.message).into(),
        Some("invalid_state") => ProtocolError::Rejected(remote.message).into(),
        Some("engine_panicked" | "not_initialized") => ChannelError::Closed(remote.message).into(),
        _ => ChannelError::Remote(remote).into(),
    }
}

fn run_params(
    code: &str,
    limits: Option<&ExecutionLimits>,
    script_name: Option<&str>,
) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("code".into(), Value::String(code.to_owned()));
    if let Some(limits) = limits {
        params.insert("limits".into(), json!(limits));
    }
    if let Some(script_name) = script_name {
        params.insert("script_name".into(), Value::String(script_name.to_owned()));
    }
    params
}

#[async_trait]
impl<C: WireChannel> Bindings for WireBindings<C> {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn init(&mut self) -> Result<bool> {
        if self.connected {
            return Ok(true);
        }
        let reply = self
            .command("init", json!({ "protocol_version": WIRE_PROTOCOL_VERSION }))
            .await?;
        if reply.get("ok").and_then(Value::as_bool) != Some(true) {
            let reason = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            tracing::warn!(%reason, "remote engine could not be created");
            return Ok(false);
        }

        self.capabilities = match reply.get("capabilities") {
            Some(advertised) => serde_json::from_value(advertised.clone()).map_err(|err| {
                ProtocolError::MalformedRecord(format!("invalid capabilities: {err}"))
            })?,
            None => EngineCapabilities::default(),
        };
        self.connected = true;
        tracing::debug!(capabilities = ?self.capabilities, "remote engine ready");
        Ok(true)
    }

    async fn run(
        &mut self,
        code: &str,
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<RunReply> {
        let params = run_params(code, limits, script_name);
        Ok(RunReply::Wire(self.command("run", Value::Object(params)).await?))
    }

    async fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<ProgressReply> {
        let mut params = run_params(code, limits, script_name);
        params.insert("external_functions".into(), json!(external_functions));
        self.progress("start", Value::Object(params)).await
    }

    async fn resume(&mut self, return_value: Value) -> Result<ProgressReply> {
        self.progress("resume", json!({ "value": return_value }))
            .await
    }

    async fn resume_with_error(&mut self, message: &str) -> Result<ProgressReply> {
        self.progress("resume_with_error", json!({ "message": message }))
            .await
    }

    async fn dispose(&mut self) -> Result<()> {
        let outcome = self.command("dispose", json!({})).await;
        self.connected = false;
        self.capabilities = EngineCapabilities::default();
        let closed = self.channel.close().await;
        outcome?;
        closed
    }

    fn as_snapshot(&mut self) -> Option<&mut dyn SnapshotCapability> {
        if self.capabilities.snapshot {
            Some(self)
        } else {
            None
        }
    }

    fn as_futures(&mut self) -> Option<&mut dyn FutureCapability> {
        if self.capabilities.futures {
            Some(self)
        } else {
            None
        }
    }

    fn as_namespace(&mut self) -> Option<&mut dyn NamespaceCapability> {
        if self.capabilities.namespace {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl<C: WireChannel> SnapshotCapability for WireBindings<C> {
    async fn snapshot(&mut self) -> Result<Vec<u8>> {
        let reply = self.command("snapshot", json!({})).await?;
        let bytes = reply.get("bytes").cloned().unwrap_or(Value::Null);
        serde_json::from_value(bytes).map_err(|err| {
            ProtocolError::MalformedRecord(format!("snapshot bytes: {err}")).into()
        })
    }

    async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        self.command("restore", json!({ "bytes": bytes })).await?;
        Ok(())
    }

    fn allows_idle_snapshot(&self) -> bool {
        self.capabilities.idle_snapshot
    }
}

#[async_trait]
impl<C: WireChannel> FutureCapability for WireBindings<C> {
    async fn resume_as_future(&mut self) -> Result<ProgressReply> {
        self.progress("resume_as_future", json!({})).await
    }

    async fn resolve_futures(
        &mut self,
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
    ) -> Result<ProgressReply> {
        let results: Map<String, Value> = results
            .into_iter()
            .map(|(id, value)| (id.to_string(), value))
            .collect();
        let errors: Map<String, Value> = errors
            .into_iter()
            .map(|(id, message)| (id.to_string(), Value::String(message)))
            .collect();
        self.progress(
            "resolve_futures",
            json!({ "results": results, "errors": errors }),
        )
        .await
    }
}

#[async_trait]
impl<C: WireChannel> NamespaceCapability for WireBindings<C> {
    async fn globals(&mut self) -> Result<GlobalsReply> {
        Ok(GlobalsReply::Wire(self.command("globals", json!({})).await?))
    }
}
