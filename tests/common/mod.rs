//! Shared harness for integration tests: a small line-oriented interpreter
//! implementing [`Engine`], a scripted [`Bindings`] backend that counts
//! calls, and context constructors for both adapters.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use tether::runtime::bindings::{Bindings, ProgressReply, RunReply};
use tether::runtime::error::{ChannelError, EngineError, EngineResult, Result};
use tether::runtime::{
    Engine, EngineCapabilities, EngineFactory, ExecutionContext, ExecutionError, ExecutionLimits,
    ExecutionResult, GlobalValue, NdjsonChannel, PendingCall, Progress, ResourceUsage,
    StackFrame, ThreadBindings, WireBindings, WireHost,
};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tracing_subscriber::EnvFilter;

/// Route test logs through the test writer; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// MiniEngine
// ---------------------------------------------------------------------------

const MAX_CALL_DEPTH: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Slot {
    Data(Value),
    Function(String),
}

/// Exception raised while interpreting.
#[derive(Debug)]
struct Raise {
    exc_type: &'static str,
    message: String,
}

impl Raise {
    fn new(exc_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            exc_type,
            message: message.into(),
        }
    }
}

/// Iterative execution in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Execution {
    lines: Vec<String>,
    pc: usize,
    namespace: BTreeMap<String, Slot>,
    script_name: String,
    externals: Vec<String>,
    /// Variable receiving the pending call's result
    pending: Option<(u32, Option<String>)>,
    /// Deferred calls by id, with the variable receiving each result
    futures: BTreeMap<u32, Option<String>>,
    next_call_id: u32,
    last_value: Value,
}

/// A tiny interpreter for one statement per line:
///
/// * `name = expr`, `def name(): return expr`, or a bare expression
/// * integers, floats, strings, `None`/`True`/`False`, lists, dicts
/// * `+ - * /`, parentheses, calls to `def`-ined functions
/// * in iterative mode, `name = ext(args)` or `ext(args)` for an external
///   function suspends the execution
///
/// Globals do not survive between runs.
#[derive(Default)]
pub struct MiniEngine {
    last_globals: BTreeMap<String, Slot>,
    execution: Option<Execution>,
    pub idle_snapshot: bool,
}

impl MiniEngine {
    fn usage(code_len: usize) -> ResourceUsage {
        ResourceUsage {
            memory_bytes_used: code_len as u64,
            time_elapsed_ms: 0,
            stack_depth_used: 1,
        }
    }

    fn error(raise: Raise, script_name: &str, line: usize) -> ExecutionError {
        let line = line as u32 + 1;
        let mut error = ExecutionError::new(Some(raise.exc_type.to_string()), raise.message);
        error.filename = Some(script_name.to_string());
        error.line_number = Some(line);
        error.column_number = Some(0);
        error.traceback.push(StackFrame {
            filename: script_name.to_string(),
            start_line: line,
            start_column: 0,
            frame_name: "<module>".to_string(),
            preview_line: None,
        });
        error
    }

    /// Drive the current execution until it suspends or finishes.
    fn advance(&mut self) -> EngineResult<Progress> {
        let mut exec = self
            .execution
            .take()
            .ok_or_else(|| EngineError::InvalidState("no execution in flight".into()))?;

        while exec.pc < exec.lines.len() {
            let line = exec.lines[exec.pc].trim().to_string();
            if line.is_empty() {
                exec.pc += 1;
                continue;
            }

            let (target, expr) = split_assignment(&line);
            if let Some((name, args, kwargs)) = external_call(expr, &exec) {
                let call_id = exec.next_call_id;
                exec.next_call_id += 1;
                exec.pending = Some((call_id, target.map(str::to_string)));
                exec.pc += 1;
                let call = match (args, kwargs) {
                    (Ok(arguments), Ok(kwargs)) => PendingCall {
                        function_name: name,
                        arguments,
                        kwargs: (!kwargs.is_empty()).then_some(kwargs),
                        call_id,
                        method_call: false,
                    },
                    (Err(raise), _) | (_, Err(raise)) => {
                        return Ok(self.fail(exec, raise));
                    }
                };
                self.execution = Some(exec);
                return Ok(Progress::Pending(call));
            }

            if !exec.futures.is_empty() {
                let pending_call_ids = exec.futures.keys().copied().collect();
                self.execution = Some(exec);
                return Ok(Progress::ResolveFutures { pending_call_ids });
            }

            match execute_line(&line, &mut exec.namespace) {
                Ok(value) => exec.last_value = value,
                Err(raise) => return Ok(self.fail(exec, raise)),
            }
            exec.pc += 1;
        }

        if !exec.futures.is_empty() {
            let pending_call_ids = exec.futures.keys().copied().collect();
            self.execution = Some(exec);
            return Ok(Progress::ResolveFutures { pending_call_ids });
        }

        let usage = Self::usage(exec.lines.iter().map(String::len).sum());
        Ok(Progress::Complete {
            result: ExecutionResult::success(exec.last_value, usage),
        })
    }

    fn fail(&mut self, exec: Execution, raise: Raise) -> Progress {
        let line = exec.pc.min(exec.lines.len().saturating_sub(1));
        let usage = Self::usage(exec.lines.iter().map(String::len).sum());
        Progress::Complete {
            result: ExecutionResult::failure(Self::error(raise, &exec.script_name, line), usage),
        }
    }

    fn take_pending(&mut self) -> EngineResult<(u32, Option<String>)> {
        self.execution
            .as_mut()
            .and_then(|exec| exec.pending.take())
            .ok_or_else(|| EngineError::InvalidState("no external call is pending".into()))
    }

    fn bind(&mut self, target: Option<String>, value: Value) {
        if let (Some(exec), Some(name)) = (self.execution.as_mut(), target) {
            exec.namespace.insert(name, Slot::Data(value));
        }
    }

    fn raise_in_execution(&mut self, raise: Raise) -> EngineResult<Progress> {
        let mut exec = self
            .execution
            .take()
            .ok_or_else(|| EngineError::InvalidState("no execution in flight".into()))?;
        exec.pc = exec.pc.saturating_sub(1);
        Ok(self.fail(exec, raise))
    }
}

impl Engine for MiniEngine {
    fn run(
        &mut self,
        code: &str,
        _limits: Option<&ExecutionLimits>,
        script_name: &str,
    ) -> ExecutionResult {
        let mut namespace = BTreeMap::new();
        let mut last = Value::Null;
        for (index, line) in code.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match execute_line(line, &mut namespace) {
                Ok(value) => last = value,
                Err(raise) => {
                    return ExecutionResult::failure(
                        Self::error(raise, script_name, index),
                        Self::usage(code.len()),
                    );
                }
            }
        }
        self.last_globals = namespace;
        ExecutionResult::success(last, Self::usage(code.len()))
    }

    fn start(
        &mut self,
        code: &str,
        external_functions: &[String],
        _limits: Option<&ExecutionLimits>,
        script_name: &str,
    ) -> EngineResult<Progress> {
        self.execution = Some(Execution {
            lines: code.lines().map(str::to_string).collect(),
            pc: 0,
            namespace: BTreeMap::new(),
            script_name: script_name.to_string(),
            externals: external_functions.to_vec(),
            pending: None,
            futures: BTreeMap::new(),
            next_call_id: 1,
            last_value: Value::Null,
        });
        self.advance()
    }

    fn resume(&mut self, value: Value) -> EngineResult<Progress> {
        let (_, target) = self.take_pending()?;
        self.bind(target, value);
        self.advance()
    }

    fn resume_with_error(&mut self, message: &str) -> EngineResult<Progress> {
        self.take_pending()?;
        self.raise_in_execution(Raise::new("RuntimeError", message))
    }

    fn resume_as_future(&mut self) -> EngineResult<Progress> {
        let (call_id, target) = self.take_pending()?;
        if let Some(exec) = self.execution.as_mut() {
            exec.futures.insert(call_id, target);
        }
        self.advance()
    }

    fn resolve_futures(
        &mut self,
        results: BTreeMap<u32, Value>,
        errors: BTreeMap<u32, String>,
    ) -> EngineResult<Progress> {
        let exec = self
            .execution
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no execution in flight".into()))?;
        if let Some(id) = results
            .keys()
            .chain(errors.keys())
            .find(|id| !exec.futures.contains_key(*id))
        {
            return Err(EngineError::InvalidState(format!(
                "call id {id} is not an outstanding future"
            )));
        }

        if let Some((id, message)) = errors.into_iter().next() {
            exec.futures.remove(&id);
            let raise = Raise::new("RuntimeError", message);
            let exec = self.execution.take().ok_or_else(|| {
                EngineError::InvalidState("no execution in flight".into())
            })?;
            return Ok(self.fail(exec, raise));
        }
        for (id, value) in results {
            if let Some(target) = exec.futures.remove(&id).flatten() {
                exec.namespace.insert(target, Slot::Data(value));
            }
        }
        self.advance()
    }

    fn snapshot(&mut self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(&self.execution)
            .map_err(|err| EngineError::InvalidState(format!("snapshot failed: {err}")))
    }

    fn restore(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let execution: Option<Execution> = serde_json::from_slice(bytes)
            .map_err(|err| EngineError::MalformedSnapshot(err.to_string()))?;
        self.execution = execution;
        Ok(())
    }

    fn globals(&mut self) -> EngineResult<BTreeMap<String, GlobalValue>> {
        Ok(self
            .last_globals
            .iter()
            .map(|(name, slot)| {
                let global = match slot {
                    Slot::Data(value) => GlobalValue::Data(value.clone()),
                    Slot::Function(_) => GlobalValue::Opaque {
                        type_name: "function".into(),
                    },
                };
                (name.clone(), global)
            })
            .collect())
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            snapshot: true,
            idle_snapshot: self.idle_snapshot,
            futures: true,
            namespace: true,
        }
    }
}

/// `name = expr` -> `(Some(name), expr)`; otherwise `(None, line)`.
fn split_assignment(line: &str) -> (Option<&str>, &str) {
    let bytes = line.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match (quote, b) {
            (Some(q), c) if c == q && (i == 0 || bytes[i - 1] != b'\\') => quote = None,
            (Some(_), _) => {}
            (None, b'"' | b'\'') => quote = Some(b),
            (None, b'(' | b'[' | b'{') => depth += 1,
            (None, b')' | b']' | b'}') => depth -= 1,
            (None, b'=') if depth == 0 => {
                let next_is_eq = bytes.get(i + 1) == Some(&b'=');
                let prev_is_op = i > 0 && matches!(bytes[i - 1], b'=' | b'!' | b'<' | b'>');
                if next_is_eq || prev_is_op {
                    return (None, line);
                }
                let name = line[..i].trim();
                if is_name(name) {
                    return (Some(name), line[i + 1..].trim());
                }
                return (None, line);
            }
            _ => {}
        }
    }
    (None, line)
}

type CallArgs = (
    String,
    std::result::Result<Vec<Value>, Raise>,
    std::result::Result<Map<String, Value>, Raise>,
);

/// Recognise `ext(args)` where `ext` is an allowed external function.
fn external_call(expr: &str, exec: &Execution) -> Option<CallArgs> {
    let open = expr.find('(')?;
    let name = expr[..open].trim();
    if !exec.externals.iter().any(|ext| ext == name) || !expr.ends_with(')') {
        return None;
    }
    let inner = &expr[open + 1..expr.len() - 1];
    let mut parser = Parser::new(inner, &exec.namespace, 0);
    let parsed = parser.call_arguments(None);
    Some(match parsed {
        Ok((args, kwargs)) => (name.to_string(), Ok(args), Ok(kwargs)),
        Err(raise) => (name.to_string(), Err(raise), Ok(Map::new())),
    })
}

fn execute_line(line: &str, namespace: &mut BTreeMap<String, Slot>) -> std::result::Result<Value, Raise> {
    if let Some(rest) = line.strip_prefix("def ") {
        let (name, body) = rest
            .split_once("():")
            .ok_or_else(|| Raise::new("SyntaxError", "invalid function definition"))?;
        let body = body
            .trim()
            .strip_prefix("return ")
            .ok_or_else(|| Raise::new("SyntaxError", "function body must be a return"))?;
        namespace.insert(name.trim().to_string(), Slot::Function(body.trim().to_string()));
        return Ok(Value::Null);
    }

    let (target, expr) = split_assignment(line);
    let value = evaluate(expr, namespace, 0)?;
    match target {
        Some(name) => {
            namespace.insert(name.to_string(), Slot::Data(value));
            Ok(Value::Null)
        }
        None => Ok(value),
    }
}

fn evaluate(
    expr: &str,
    namespace: &BTreeMap<String, Slot>,
    depth: usize,
) -> std::result::Result<Value, Raise> {
    let mut parser = Parser::new(expr, namespace, depth);
    let value = parser.expression()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(Raise::new("SyntaxError", "invalid syntax"));
    }
    Ok(value)
}

fn is_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    namespace: &'a BTreeMap<String, Slot>,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &str, namespace: &'a BTreeMap<String, Slot>, depth: usize) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            namespace,
            depth,
        }
    }

    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> std::result::Result<(), Raise> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(Raise::new("SyntaxError", format!("expected '{expected}'")))
        }
    }

    fn expression(&mut self) -> std::result::Result<Value, Raise> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = add(left, right)?;
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = arithmetic(left, right, '-')?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> std::result::Result<Value, Raise> {
        let mut left = self.atom()?;
        loop {
            match self.peek() {
                Some(op @ ('*' | '/')) => {
                    self.pos += 1;
                    let right = self.atom()?;
                    left = arithmetic(left, right, op)?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn atom(&mut self) -> std::result::Result<Value, Raise> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expression()?;
                self.expect(')')?;
                Ok(value)
            }
            Some('[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(']') {
                    loop {
                        items.push(self.expression()?);
                        if self.eat(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(Value::Array(items))
            }
            Some('{') => {
                self.pos += 1;
                let mut map = Map::new();
                if !self.eat('}') {
                    loop {
                        let key = match self.expression()? {
                            Value::String(key) => key,
                            other => other.to_string(),
                        };
                        self.expect(':')?;
                        map.insert(key, self.expression()?);
                        if self.eat('}') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                Ok(Value::Object(map))
            }
            Some(q @ ('"' | '\'')) => self.string(q),
            Some(c) if c.is_ascii_digit() => self.number(false),
            Some('-') => {
                self.pos += 1;
                self.number(true)
            }
            Some(c) if c == '_' || c.is_alphabetic() => self.name(),
            Some(other) => Err(Raise::new(
                "SyntaxError",
                format!("unexpected character '{other}'"),
            )),
            None => Err(Raise::new("SyntaxError", "unexpected end of input")),
        }
    }

    fn string(&mut self, quote: char) -> std::result::Result<Value, Raise> {
        let start = self.pos;
        self.pos += 1;
        while let Some(&c) = self.chars.get(self.pos) {
            if c == '\\' {
                self.pos += 2;
                continue;
            }
            self.pos += 1;
            if c == quote {
                let raw: String = self.chars[start..self.pos].iter().collect();
                if quote == '\'' {
                    return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
                }
                return serde_json::from_str(&raw)
                    .map_err(|_| Raise::new("SyntaxError", "invalid string literal"));
            }
        }
        Err(Raise::new("SyntaxError", "unterminated string literal"))
    }

    fn number(&mut self, negative: bool) -> std::result::Result<Value, Raise> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let text = if negative { format!("-{text}") } else { text };
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::from(int));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| Raise::new("SyntaxError", format!("invalid number '{text}'")))
    }

    fn name(&mut self) -> std::result::Result<Value, Raise> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| *c == '_' || c.is_alphanumeric())
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        match name.as_str() {
            "None" => return Ok(Value::Null),
            "True" => return Ok(Value::Bool(true)),
            "False" => return Ok(Value::Bool(false)),
            _ => {}
        }

        let slot = self
            .namespace
            .get(&name)
            .ok_or_else(|| Raise::new("NameError", format!("name '{name}' is not defined")))?;

        if self.eat('(') {
            let (args, _) = self.call_arguments(Some(')'))?;
            return match slot {
                Slot::Function(body) if args.is_empty() => {
                    if self.depth >= MAX_CALL_DEPTH {
                        return Err(Raise::new(
                            "RecursionError",
                            "maximum recursion depth exceeded",
                        ));
                    }
                    evaluate(body, self.namespace, self.depth + 1)
                }
                Slot::Function(_) => Err(Raise::new(
                    "TypeError",
                    format!("{name}() takes 0 positional arguments"),
                )),
                Slot::Data(_) => Err(Raise::new(
                    "TypeError",
                    format!("'{name}' object is not callable"),
                )),
            };
        }

        match slot {
            Slot::Data(value) => Ok(value.clone()),
            Slot::Function(_) => Err(Raise::new(
                "TypeError",
                format!("function '{name}' cannot be used as a value"),
            )),
        }
    }

    /// Comma-separated arguments up to `close` (or end of input), with
    /// `key=value` pairs collected as keyword arguments.
    fn call_arguments(
        &mut self,
        close: Option<char>,
    ) -> std::result::Result<(Vec<Value>, Map<String, Value>), Raise> {
        let mut args = Vec::new();
        let mut kwargs = Map::new();
        let at_end = |parser: &mut Self| match close {
            Some(c) => parser.eat(c),
            None => parser.peek().is_none(),
        };
        if at_end(self) {
            return Ok((args, kwargs));
        }
        loop {
            let checkpoint = self.pos;
            self.skip_ws();
            let start = self.pos;
            while self
                .chars
                .get(self.pos)
                .is_some_and(|c| *c == '_' || c.is_alphanumeric())
            {
                self.pos += 1;
            }
            let key: String = self.chars[start..self.pos].iter().collect();
            if !key.is_empty() && self.peek() == Some('=') && self.chars.get(self.pos + 1) != Some(&'=')
            {
                self.pos += 1;
                kwargs.insert(key, self.expression()?);
            } else {
                self.pos = checkpoint;
                args.push(self.expression()?);
            }
            if at_end(self) {
                return Ok((args, kwargs));
            }
            self.expect(',')?;
        }
    }
}

fn add(left: Value, right: Value) -> std::result::Result<Value, Raise> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (left, right) => arithmetic(left, right, '+'),
    }
}

fn arithmetic(left: Value, right: Value, op: char) -> std::result::Result<Value, Raise> {
    let unsupported = || {
        Raise::new(
            "TypeError",
            format!("unsupported operand type(s) for {op}"),
        )
    };
    if op == '/' {
        let (a, b) = (
            left.as_f64().ok_or_else(unsupported)?,
            right.as_f64().ok_or_else(unsupported)?,
        );
        if b == 0.0 {
            return Err(Raise::new("ZeroDivisionError", "division by zero"));
        }
        return Number::from_f64(a / b)
            .map(Value::Number)
            .ok_or_else(unsupported);
    }
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            '+' => a.checked_add(b),
            '-' => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        return result
            .map(Value::from)
            .ok_or_else(|| Raise::new("OverflowError", "integer overflow"));
    }
    let (a, b) = (
        left.as_f64().ok_or_else(unsupported)?,
        right.as_f64().ok_or_else(unsupported)?,
    );
    let result = match op {
        '+' => a + b,
        '-' => a - b,
        _ => a * b,
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(unsupported)
}

// ---------------------------------------------------------------------------
// Context constructors
// ---------------------------------------------------------------------------

pub fn mini_factory() -> EngineFactory {
    Arc::new(|| -> std::result::Result<Box<dyn Engine>, String> {
        Ok(Box::new(MiniEngine::default()))
    })
}

pub fn idle_snapshot_factory() -> EngineFactory {
    Arc::new(|| -> std::result::Result<Box<dyn Engine>, String> {
        Ok(Box::new(MiniEngine {
            idle_snapshot: true,
            ..Default::default()
        }))
    })
}

pub fn thread_context() -> ExecutionContext<ThreadBindings> {
    init_tracing();
    ExecutionContext::new(ThreadBindings::new(mini_factory()))
}

pub type DuplexChannel = NdjsonChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Context whose engine runs behind an in-memory NDJSON pipe served by a
/// [`WireHost`] task.
pub fn wire_context_with(factory: EngineFactory) -> ExecutionContext<WireBindings<DuplexChannel>> {
    init_tracing();
    let (client, server) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server);
        let mut host = WireHost::new(factory);
        let _ = host.serve(reader, writer).await;
    });
    let (reader, writer) = tokio::io::split(client);
    ExecutionContext::new(WireBindings::new(NdjsonChannel::new(reader, writer)))
}

pub fn wire_context() -> ExecutionContext<WireBindings<DuplexChannel>> {
    wire_context_with(mini_factory())
}

// ---------------------------------------------------------------------------
// Scripted bindings
// ---------------------------------------------------------------------------

/// Call counters shared with the test after the bindings move into a context.
#[derive(Debug, Default)]
pub struct Counters {
    pub init: AtomicUsize,
    pub run: AtomicUsize,
    pub start: AtomicUsize,
    pub resume: AtomicUsize,
    pub dispose: AtomicUsize,
    /// Limits passed to the most recent `run`
    pub limits: Mutex<Option<ExecutionLimits>>,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Backend without optional capabilities that replays canned wire records
/// for `start` and the resume family and counts every call.
pub struct ScriptedBindings {
    pub replies: VecDeque<Value>,
    pub counters: Arc<Counters>,
    pub init_ok: bool,
}

impl ScriptedBindings {
    pub fn new(replies: Vec<Value>) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Self {
                replies: replies.into(),
                counters: counters.clone(),
                init_ok: true,
            },
            counters,
        )
    }

    fn next(&mut self) -> Result<ProgressReply> {
        self.replies
            .pop_front()
            .map(ProgressReply::Wire)
            .ok_or_else(|| ChannelError::Closed("script exhausted".into()).into())
    }
}

#[async_trait]
impl Bindings for ScriptedBindings {
    fn backend(&self) -> &str {
        "scripted"
    }

    async fn init(&mut self) -> Result<bool> {
        self.counters.init.fetch_add(1, Ordering::SeqCst);
        Ok(self.init_ok)
    }

    async fn run(
        &mut self,
        _code: &str,
        limits: Option<&ExecutionLimits>,
        _script_name: Option<&str>,
    ) -> Result<RunReply> {
        self.counters.run.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.counters.limits.lock() {
            *last = limits.cloned();
        }
        Ok(RunReply::Wire(serde_json::json!({"ok": true, "value": null})))
    }

    async fn start(
        &mut self,
        _code: &str,
        _external_functions: &[String],
        _limits: Option<&ExecutionLimits>,
        _script_name: Option<&str>,
    ) -> Result<ProgressReply> {
        self.counters.start.fetch_add(1, Ordering::SeqCst);
        self.next()
    }

    async fn resume(&mut self, _return_value: Value) -> Result<ProgressReply> {
        self.counters.resume.fetch_add(1, Ordering::SeqCst);
        self.next()
    }

    async fn resume_with_error(&mut self, _message: &str) -> Result<ProgressReply> {
        self.counters.resume.fetch_add(1, Ordering::SeqCst);
        self.next()
    }

    async fn dispose(&mut self) -> Result<()> {
        self.counters.dispose.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn pending_record(function_name: &str, call_id: u32) -> Value {
    serde_json::json!({
        "ok": true,
        "state": "pending",
        "function_name": function_name,
        "arguments": [],
        "call_id": call_id,
    })
}

pub fn complete_record(value: Value) -> Value {
    serde_json::json!({"ok": true, "state": "complete", "value": value})
}
