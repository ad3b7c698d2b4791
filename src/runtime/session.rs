//! Session layer
//!
//! The engine forgets its globals between runs. A [`Session`] keeps a map of
//! JSON-representable variables and replays them as assignment statements in
//! front of every submitted snippet, then captures the namespace the run left
//! behind. Bindings that cannot be represented as data (functions, modules,
//! class instances) are dropped on capture and do not survive to the next run.

use serde_json::Value;
use std::collections::BTreeMap;

use super::bindings::Bindings;
use super::context::{ExecutionContext, RunOptions};
use super::error::{CapabilityError, ContextState, Result, StateError};
use super::result::{ExecutionError, ExecutionResult, GlobalValue};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Apparent variable persistence on top of one execution context.
pub struct Session<B: Bindings> {
    context: ExecutionContext<B>,
    state: BTreeMap<String, Value>,
    closed: bool,
}

impl<B: Bindings> Session<B> {
    /// Wrap a context with empty state.
    pub fn new(context: ExecutionContext<B>) -> Self {
        Self {
            context,
            state: BTreeMap::new(),
            closed: false,
        }
    }

    /// Run `code` with the stored variables in scope.
    pub async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        self.run_with_options(code, RunOptions::default()).await
    }

    /// [`run`](Self::run) with explicit options.
    ///
    /// On success the stored state is replaced by the data bindings of the
    /// resulting namespace. On a sandbox error the stored state is left
    /// untouched and the error is returned as data. A backend that cannot
    /// report its namespace is refused before any code runs.
    pub async fn run_with_options(
        &mut self,
        code: &str,
        options: RunOptions,
    ) -> Result<ExecutionResult> {
        if self.closed {
            return Err(StateError {
                operation: "session run",
                required: ContextState::Idle.to_string(),
                actual: ContextState::Disposed,
            }
            .into());
        }

        if !self.context.supports_namespace().await? {
            return Err(CapabilityError::Unsupported {
                backend: self.context.backend().to_owned(),
                operation: "session",
            }
            .into());
        }

        let (prelude, prelude_lines) = self.prelude();
        let source = format!("{prelude}{code}");
        let mut result = self.context.run(&source, options).await?;

        if let Some(error) = result.error.as_mut() {
            shift_lines(error, prelude_lines);
            tracing::debug!(
                context = %self.context.id(),
                error = %error.summary(),
                "session run raised; state kept"
            );
            return Ok(result);
        }

        let globals = self.context.globals().await?;
        self.state = capture(globals);
        Ok(result)
    }

    /// Persisted variables.
    pub fn state(&self) -> &BTreeMap<String, Value> {
        &self.state
    }

    /// Forget every persisted variable. The context is left alone.
    pub fn clear_state(&mut self) {
        self.state.clear();
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The wrapped context.
    pub fn context(&self) -> &ExecutionContext<B> {
        &self.context
    }

    /// The wrapped context, mutably.
    pub fn context_mut(&mut self) -> &mut ExecutionContext<B> {
        &mut self.context
    }

    /// Unwrap the context, discarding the session state.
    pub fn into_context(self) -> ExecutionContext<B> {
        self.context
    }

    /// Close the session. The underlying context stays alive; dispose it
    /// separately or use [`dispose_context`](Self::dispose_context).
    pub fn dispose(&mut self) {
        self.state.clear();
        self.closed = true;
    }

    /// Close the session and dispose the underlying context.
    pub async fn dispose_context(&mut self) -> Result<()> {
        self.dispose();
        self.context.dispose().await
    }

    fn prelude(&self) -> (String, u32) {
        let mut prelude = String::new();
        let mut lines = 0;
        for (name, value) in &self.state {
            if !is_identifier(name) {
                tracing::warn!(
                    context = %self.context.id(),
                    name = %name,
                    "skipping session variable that is not an identifier"
                );
                continue;
            }
            prelude.push_str(name);
            prelude.push_str(" = ");
            prelude.push_str(&to_python_literal(value));
            prelude.push('\n');
            lines += 1;
        }
        (prelude, lines)
    }
}

/// Keep data bindings, drop everything else.
fn capture(globals: BTreeMap<String, GlobalValue>) -> BTreeMap<String, Value> {
    globals
        .into_iter()
        .filter_map(|(name, global)| match global {
            GlobalValue::Data(value) => Some((name, value)),
            GlobalValue::Opaque { type_name } => {
                tracing::trace!(name = %name, type_name = %type_name, "dropping opaque global");
                None
            }
        })
        .collect()
}

/// Make error positions relative to the submitted snippet.
fn shift_lines(error: &mut ExecutionError, prelude_lines: u32) {
    if prelude_lines == 0 {
        return;
    }
    if let Some(line) = error.line_number.as_mut() {
        if *line > prelude_lines {
            *line -= prelude_lines;
        }
    }
    for frame in &mut error.traceback {
        if frame.start_line > prelude_lines {
            frame.start_line -= prelude_lines;
        }
    }
}

/// Render JSON data as a Python literal expression.
pub fn to_python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(number) => number.to_string(),
        // JSON string escapes are valid Python escapes
        Value::String(text) => Value::String(text.clone()).to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_python_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}: {}",
                        Value::String(key.clone()),
                        to_python_literal(value)
                    )
                })
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

/// Whether `name` can appear on the left of an assignment.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
        && !KEYWORDS.contains(&name)
}
