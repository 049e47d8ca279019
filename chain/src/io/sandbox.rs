//! Sandboxed scriptlet executor.
//!
//! A scriptlet is parsed by [`crate::core::script`] and interpreted on a scoped
//! worker thread against the caller's environment snapshot. Every run starts
//! from a fresh namespace holding only the builtins and the declared tools,
//! so variables never leak between scriptlets. Declared tools are
//! reachable as functions; their results come back as strings, and a failing
//! tool raises an error whose text carries the tool status. Output is captured,
//! scrubbed of local paths, scanned for the first embedded status and
//! optionally truncated.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::observation::{
    NO_OUTPUT, extract_status, scrub_paths, tool_failure_message, truncate_middle,
};
use crate::core::script::{Call, Expr, Program, Stmt, parse_program};
use crate::core::status::{GIVE_UP_ACTION, StatusCodes};
use crate::core::tools::{ToolBinding, ToolRegistry};
use crate::io::environment::Environment;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Wall-clock budget for one scriptlet.
    pub timeout: Duration,
    /// Truncate observations longer than this many characters (0 = never).
    pub max_observation_length: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_observation_length: 0,
        }
    }
}

/// Aggregated outcome of one scriptlet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub observation: String,
    pub status: i32,
    pub timed_out: bool,
}

/// A scriptlet produced the give-up status without invoking the give-up action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveUpMismatchError {
    pub status: i32,
    pub code: String,
}

impl fmt::Display for GiveUpMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scriptlet produced give-up status {} without calling {}: {}",
            self.status, GIVE_UP_ACTION, self.code
        )
    }
}

impl std::error::Error for GiveUpMismatchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Print,
    Sleep,
}

#[derive(Debug, Clone)]
enum Binding {
    Tool(Arc<ToolBinding>),
    Builtin(Builtin),
    Value(Value),
}

pub struct Sandbox {
    base: HashMap<String, Binding>,
    config: SandboxConfig,
    statuses: StatusCodes,
}

impl Sandbox {
    pub fn new(registry: &ToolRegistry, config: SandboxConfig, statuses: StatusCodes) -> Self {
        let mut base = HashMap::new();
        base.insert("print".to_string(), Binding::Builtin(Builtin::Print));
        base.insert("sleep".to_string(), Binding::Builtin(Builtin::Sleep));
        for binding in registry.bindings() {
            base.insert(
                binding.name.clone(),
                Binding::Tool(Arc::new(binding.clone())),
            );
        }
        Self {
            base,
            config,
            statuses,
        }
    }

    /// Execute `code` against `env`, which receives every tool call.
    ///
    /// Syntax errors, tool failures and timeouts are reported through the
    /// returned [`Execution`]. `Err` is reserved for a give-up status raised
    /// by a scriptlet that never names the give-up action
    /// ([`GiveUpMismatchError`]) and for a worker that dies without a result.
    #[instrument(skip_all, fields(timeout_ms = self.config.timeout.as_millis() as u64))]
    pub fn run<E: Environment>(&self, env: &mut E, code: &str) -> Result<Execution> {
        let program = match parse_program(code) {
            Ok(program) => program,
            Err(err) => {
                debug!(err = %err, "scriptlet failed to parse");
                return Ok(Execution {
                    observation: scrub_paths(&format!("SyntaxError: {err}")),
                    status: self.statuses.invalid_input,
                    timed_out: false,
                });
            }
        };

        let Some(output) = self.evaluate(env, &program)? else {
            warn!(
                timeout_secs = self.config.timeout.as_secs_f64(),
                "scriptlet timed out"
            );
            return Ok(Execution {
                observation: timeout_message(self.config.timeout),
                status: self.statuses.timeout,
                timed_out: true,
            });
        };

        let scrubbed = scrub_paths(output.trim_end());
        let status = extract_status(&scrubbed).unwrap_or(self.statuses.success);
        if status == self.statuses.give_up && !code.contains(GIVE_UP_ACTION) {
            return Err(GiveUpMismatchError {
                status,
                code: code.to_string(),
            }
            .into());
        }

        let observation = if scrubbed.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            truncate_middle(&scrubbed, self.config.max_observation_length)
        };
        debug!(status, len = observation.len(), "scriptlet finished");
        Ok(Execution {
            observation,
            status,
            timed_out: false,
        })
    }

    /// Interpret on a scoped worker; `None` when the deadline passed first.
    ///
    /// Tool calls receive the deadline, so a call in flight when it passes
    /// returns promptly and the worker can be joined.
    fn evaluate<E: Environment>(&self, env: &mut E, program: &Program) -> Result<Option<String>> {
        let cancel = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + self.config.timeout;
        let success = self.statuses.success;
        let namespace = self.base.clone();
        let cancel_ref = &cancel;

        thread::scope(|scope| {
            scope.spawn(move || {
                let mut interpreter = Interpreter {
                    namespace,
                    env,
                    cancel: cancel_ref,
                    deadline,
                    success,
                    output: String::new(),
                };
                let finished = interpreter.run(program);
                let _ = tx.send(finished.then_some(interpreter.output));
            });

            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(Some(output)) => Ok(Some(output)),
                Ok(None) => Ok(None),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    cancel.store(true, Ordering::SeqCst);
                    Ok(None)
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(anyhow!("sandbox worker exited without a result"))
                }
            }
        })
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!(
        "TimeoutError: Timed out after {} seconds. Consider change your code to reduce the running time.",
        timeout.as_secs_f64()
    )
}

enum Raise {
    Error { kind: &'static str, message: String },
    Cancelled,
}

impl Raise {
    fn error(kind: &'static str, message: impl Into<String>) -> Self {
        Raise::Error {
            kind,
            message: message.into(),
        }
    }
}

struct Interpreter<'a, E> {
    namespace: HashMap<String, Binding>,
    env: &'a mut E,
    cancel: &'a AtomicBool,
    deadline: Instant,
    success: i32,
    output: String,
}

impl<E: Environment> Interpreter<'_, E> {
    /// Returns false when cancelled.
    fn run(&mut self, program: &Program) -> bool {
        let last = program.stmts.len().saturating_sub(1);
        for (idx, stmt) in program.stmts.iter().enumerate() {
            if self.cancelled() {
                return false;
            }
            match self.exec(stmt, idx == last) {
                Ok(()) => {}
                Err(Raise::Cancelled) => return false,
                Err(Raise::Error { kind, message }) => {
                    self.emit(&format!("{kind}: {message}"));
                    break;
                }
            }
        }
        true
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn emit(&mut self, line: &str) {
        self.output.push_str(line);
        self.output.push('\n');
    }

    fn exec(&mut self, stmt: &Stmt, is_last: bool) -> Result<(), Raise> {
        match stmt {
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                self.namespace.insert(target.clone(), Binding::Value(value));
            }
            Stmt::Expr(expr) => {
                let value = self.eval(expr)?;
                if is_last && !matches!(&value, Value::Null) && value != Value::from("") {
                    self.emit(&display_value(&value));
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Raise> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => match self.namespace.get(name) {
                Some(Binding::Value(value)) => Ok(value.clone()),
                Some(_) => Err(Raise::error(
                    "TypeError",
                    format!("'{name}' is a function and must be called"),
                )),
                None => Err(Raise::error(
                    "NameError",
                    format!("name '{name}' is not defined"),
                )),
            },
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Add(lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                add(lhs, rhs)
            }
            Expr::Call(call) => self.call(call),
        }
    }

    fn call(&mut self, call: &Call) -> Result<Value, Raise> {
        let binding = match self.namespace.get(&call.callee) {
            Some(Binding::Value(_)) => {
                return Err(Raise::error(
                    "TypeError",
                    format!("'{}' is not callable", call.callee),
                ));
            }
            Some(binding) => binding.clone(),
            None => {
                return Err(Raise::error(
                    "NameError",
                    format!("name '{}' is not defined", call.callee),
                ));
            }
        };

        let positional = call
            .args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let mut keyword = Vec::with_capacity(call.kwargs.len());
        for (key, arg) in &call.kwargs {
            keyword.push((key.clone(), self.eval(arg)?));
        }

        match binding {
            Binding::Builtin(Builtin::Print) => {
                reject_keywords("print", &keyword)?;
                let line = positional
                    .iter()
                    .map(display_value)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.emit(&line);
                Ok(Value::Null)
            }
            Binding::Builtin(Builtin::Sleep) => {
                reject_keywords("sleep", &keyword)?;
                let secs = match positional.as_slice() {
                    [Value::Number(n)] => n.as_f64().unwrap_or(0.0),
                    _ => {
                        return Err(Raise::error(
                            "ArgumentError",
                            "sleep() takes exactly one numeric argument",
                        ));
                    }
                };
                self.sleep(Duration::from_secs_f64(secs.max(0.0)))?;
                Ok(Value::Null)
            }
            Binding::Tool(tool) => {
                if self.cancelled() {
                    return Err(Raise::Cancelled);
                }
                let packed = tool
                    .pack_arguments(positional, keyword)
                    .map_err(|message| Raise::error("ArgumentError", message))?;
                let arguments = Value::Object(packed).to_string();
                let outcome = self.env.step(&tool.name, &arguments, Some(self.deadline));
                if self.cancelled() || Instant::now() >= self.deadline {
                    return Err(Raise::Cancelled);
                }
                if outcome.status != self.success {
                    return Err(Raise::error(
                        "ToolError",
                        tool_failure_message(&tool.name, outcome.status, &outcome.observation),
                    ));
                }
                Ok(Value::String(outcome.observation))
            }
            Binding::Value(_) => Err(Raise::error(
                "TypeError",
                format!("'{}' is not callable", call.callee),
            )),
        }
    }

    fn sleep(&self, duration: Duration) -> Result<(), Raise> {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancelled() {
                return Err(Raise::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

fn reject_keywords(name: &str, keyword: &[(String, Value)]) -> Result<(), Raise> {
    match keyword.first() {
        Some((key, _)) => Err(Raise::error(
            "ArgumentError",
            format!("{name}() got an unexpected keyword argument '{key}'"),
        )),
        None => Ok(()),
    }
}

fn add(lhs: Value, rhs: Value) -> Result<Value, Raise> {
    match (lhs, rhs) {
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64())
                && let Some(sum) = x.checked_add(y)
            {
                return Ok(Value::from(sum));
            }
            let sum = a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN);
            serde_json::Number::from_f64(sum)
                .map(Value::Number)
                .ok_or_else(|| Raise::error("TypeError", "numeric overflow in '+'"))
        }
        (a, b) => Err(Raise::error(
            "TypeError",
            format!(
                "unsupported operand types for +: '{}' and '{}'",
                type_name(&a),
                type_name(&b)
            ),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "None",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}
