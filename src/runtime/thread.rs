//! Same-process thread adapter
//!
//! [`ThreadBindings`] runs an [`Engine`] on a dedicated worker thread and
//! talks to it over a bounded command queue. Each command carries a oneshot
//! sender for its reply, and replies are already-typed domain values, so
//! nothing passes through the translation layer.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use super::PlatformConfig;
use super::bindings::{
    Bindings, FutureCapability, GlobalsReply, NamespaceCapability, ProgressReply, RunReply,
    SnapshotCapability,
};
use super::engine::{Engine, EngineCapabilities, EngineFactory, panic_message};
use super::error::{ChannelError, EngineResult, PlatformError, Result};
use super::result::{ExecutionLimits, ExecutionResult, GlobalValue, Progress};

const BACKEND: &str = "thread";

type Reply<T> = oneshot::Sender<T>;

/// Work items for the engine worker
enum Command {
    Run {
        code: String,
        limits: Option<ExecutionLimits>,
        script_name: String,
        reply: Reply<ExecutionResult>,
    },
    Start {
        code: String,
        external_functions: Vec<String>,
        limits: Option<ExecutionLimits>,
        script_name: String,
        reply: Reply<EngineResult<Progress>>,
    },
    Resume {
        value: Value,
        reply: Reply<EngineResult<Progress>>,
    },
    ResumeWithError {
        message: String,
        reply: Reply<EngineResult<Progress>>,
    },
    ResumeAsFuture {
        reply: Reply<EngineResult<Progress>>,
    },
    ResolveFutures {
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
        reply: Reply<EngineResult<Progress>>,
    },
    Snapshot {
        reply: Reply<EngineResult<Vec<u8>>>,
    },
    Restore {
        bytes: Vec<u8>,
        reply: Reply<EngineResult<()>>,
    },
    Globals {
        reply: Reply<EngineResult<BTreeMap<String, GlobalValue>>>,
    },
}

impl Command {
    /// Execute against the engine and answer. A dropped receiver means the
    /// caller stopped waiting, which is not the worker's problem.
    fn execute(self, engine: &mut dyn Engine) {
        match self {
            Command::Run {
                code,
                limits,
                script_name,
                reply,
            } => {
                let _ = reply.send(engine.run(&code, limits.as_ref(), &script_name));
            }
            Command::Start {
                code,
                external_functions,
                limits,
                script_name,
                reply,
            } => {
                let _ = reply.send(engine.start(
                    &code,
                    &external_functions,
                    limits.as_ref(),
                    &script_name,
                ));
            }
            Command::Resume { value, reply } => {
                let _ = reply.send(engine.resume(value));
            }
            Command::ResumeWithError { message, reply } => {
                let _ = reply.send(engine.resume_with_error(&message));
            }
            Command::ResumeAsFuture { reply } => {
                let _ = reply.send(engine.resume_as_future());
            }
            Command::ResolveFutures {
                results,
                errors,
                reply,
            } => {
                let _ = reply.send(engine.resolve_futures(results, errors));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(engine.snapshot());
            }
            Command::Restore { bytes, reply } => {
                let _ = reply.send(engine.restore(&bytes));
            }
            Command::Globals { reply } => {
                let _ = reply.send(engine.globals());
            }
        }
    }
}

/// Worker thread body: build the engine, report readiness, serve until every
/// sender is gone. A panicking engine ends the worker; the pending reply is
/// dropped and the caller sees a closed channel.
fn serve(
    factory: EngineFactory,
    mut commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<std::result::Result<EngineCapabilities, String>>,
) {
    let mut engine = match factory() {
        Ok(engine) => engine,
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };
    if ready.send(Ok(engine.capabilities())).is_err() {
        return;
    }
    while let Some(command) = commands.blocking_recv() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| command.execute(engine.as_mut()))) {
            tracing::error!(reason = %panic_message(&*payload), "engine panicked, stopping worker");
            return;
        }
    }
    tracing::debug!("engine worker exiting");
}

struct Worker {
    commands: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Bindings backed by an engine on a dedicated worker thread.
pub struct ThreadBindings {
    factory: EngineFactory,
    thread_name: String,
    command_buffer: usize,
    worker: Option<Worker>,
    capabilities: EngineCapabilities,
}

impl ThreadBindings {
    /// Bindings using the default configuration.
    pub fn new(factory: EngineFactory) -> Self {
        Self::with_config(factory, &PlatformConfig::default())
    }

    /// Bindings taking the worker settings from `config`.
    pub fn with_config(factory: EngineFactory, config: &PlatformConfig) -> Self {
        Self {
            factory,
            thread_name: config.worker_thread_name.clone(),
            command_buffer: config.command_buffer.max(1),
            worker: None,
            capabilities: EngineCapabilities::default(),
        }
    }

    /// Capabilities the engine reported at init.
    pub fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn request<T>(&mut self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| ChannelError::Closed("engine worker is not running".into()))?;
        let (reply, response) = oneshot::channel();
        let answered = match worker.commands.send(build(reply)).await {
            Ok(()) => response.await.ok(),
            Err(_) => None,
        };
        match answered {
            Some(answer) => Ok(answer),
            None => {
                self.forget_worker();
                Err(ChannelError::Closed("engine worker stopped before answering".into()).into())
            }
        }
    }

    /// Drop a dead worker so the next `init` starts a fresh one.
    fn forget_worker(&mut self) {
        if self.worker.take().is_some() {
            tracing::warn!(thread = %self.thread_name, "engine worker lost");
        }
        self.capabilities = EngineCapabilities::default();
    }

    async fn progress(
        &mut self,
        build: impl FnOnce(Reply<EngineResult<Progress>>) -> Command,
    ) -> Result<ProgressReply> {
        let progress = self.request(build).await?.map_err(engine_error)?;
        Ok(ProgressReply::Typed(progress))
    }
}

fn engine_error(err: super::error::EngineError) -> PlatformError {
    err.into_platform(BACKEND)
}

#[async_trait]
impl Bindings for ThreadBindings {
    fn backend(&self) -> &str {
        BACKEND
    }

    async fn init(&mut self) -> Result<bool> {
        if self.worker.is_some() {
            return Ok(true);
        }

        let (commands, receiver) = mpsc::channel(self.command_buffer);
        let (ready, readiness) = oneshot::channel();
        let factory = self.factory.clone();
        let handle = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || serve(factory, receiver, ready))
            .map_err(ChannelError::Io)?;

        match readiness.await {
            Ok(Ok(capabilities)) => {
                self.capabilities = capabilities;
                self.worker = Some(Worker { commands, handle });
                tracing::debug!(thread = %self.thread_name, ?capabilities, "engine worker started");
                Ok(true)
            }
            Ok(Err(reason)) => {
                tracing::warn!(thread = %self.thread_name, %reason, "engine could not be created");
                Ok(false)
            }
            Err(_) => Err(ChannelError::Closed("engine worker died during startup".into()).into()),
        }
    }

    async fn run(
        &mut self,
        code: &str,
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<RunReply> {
        let code = code.to_owned();
        let limits = limits.copied();
        let script_name = script_name.unwrap_or_default().to_owned();
        let result = self
            .request(|reply| Command::Run {
                code,
                limits,
                script_name,
                reply,
            })
            .await?;
        Ok(RunReply::Typed(result))
    }

    async fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        limits: Option<&ExecutionLimits>,
        script_name: Option<&str>,
    ) -> Result<ProgressReply> {
        let code = code.to_owned();
        let external_functions = external_functions.to_vec();
        let limits = limits.copied();
        let script_name = script_name.unwrap_or_default().to_owned();
        self.progress(|reply| Command::Start {
            code,
            external_functions,
            limits,
            script_name,
            reply,
        })
        .await
    }

    async fn resume(&mut self, return_value: Value) -> Result<ProgressReply> {
        self.progress(|reply| Command::Resume {
            value: return_value,
            reply,
        })
        .await
    }

    async fn resume_with_error(&mut self, message: &str) -> Result<ProgressReply> {
        let message = message.to_owned();
        self.progress(|reply| Command::ResumeWithError { message, reply })
            .await
    }

    async fn dispose(&mut self) -> Result<()> {
        let Some(Worker { commands, handle }) = self.worker.take() else {
            return Ok(());
        };
        drop(commands);
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|err| ChannelError::Closed(format!("engine worker join failed: {err}")))?;
        if joined.is_err() {
            tracing::warn!(thread = %self.thread_name, "engine worker panicked");
        }
        self.capabilities = EngineCapabilities::default();
        Ok(())
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
impl SnapshotCapability for ThreadBindings {
    async fn snapshot(&mut self) -> Result<Vec<u8>> {
        self.request(|reply| Command::Snapshot { reply })
            .await?
            .map_err(engine_error)
    }

    async fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        let bytes = bytes.to_vec();
        self.request(|reply| Command::Restore { bytes, reply })
            .await?
            .map_err(engine_error)
    }

    fn allows_idle_snapshot(&self) -> bool {
        self.capabilities.idle_snapshot
    }
}

#[async_trait]
impl FutureCapability for ThreadBindings {
    async fn resume_as_future(&mut self) -> Result<ProgressReply> {
        self.progress(|reply| Command::ResumeAsFuture { reply })
            .await
    }

    async fn resolve_futures(
        &mut self,
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
    ) -> Result<ProgressReply> {
        self.progress(|reply| Command::ResolveFutures {
            results,
            errors,
            reply,
        })
        .await
    }
}

#[async_trait]
impl NamespaceCapability for ThreadBindings {
    async fn globals(&mut self) -> Result<GlobalsReply> {
        let globals = self
            .request(|reply| Command::Globals { reply })
            .await?
            .map_err(engine_error)?;
        Ok(GlobalsReply::Typed(globals))
    }
}

impl std::fmt::Debug for ThreadBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBindings")
            .field("thread_name", &self.thread_name)
            .field("running", &self.worker.is_some())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
