//! Environment whose tools are served by a child process.
//!
//! Each tool call runs `<program...> <tool-name>` with the JSON arguments on
//! stdin. The process answers on stdout with
//! `{"observation": "...", "status": 0, "success": false}`; `success: true`
//! marks the task complete for this snapshot.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::status::StatusCodes;
use crate::io::config::SearchConfig;
use crate::io::environment::{Environment, StepOutcome};
use crate::io::process::run_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandSpec {
    program: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    statuses: StatusCodes,
}

#[derive(Debug, Deserialize)]
struct ToolReply {
    observation: String,
    status: i32,
    #[serde(default)]
    success: bool,
}

/// Snapshot of a process-backed tool environment.
#[derive(Debug, Clone)]
pub struct CommandEnvironment {
    spec: Arc<CommandSpec>,
    calls: usize,
    solved: bool,
}

impl CommandEnvironment {
    pub fn from_config(cfg: &SearchConfig) -> Result<Self> {
        if cfg.command.program.is_empty() {
            bail!("command.program is not configured");
        }
        Ok(Self {
            spec: Arc::new(CommandSpec {
                program: cfg.command.program.clone(),
                timeout: Duration::from_secs(cfg.command.timeout_secs),
                output_limit_bytes: cfg.command.output_limit_bytes,
                statuses: cfg.status,
            }),
            calls: 0,
            solved: false,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Run one tool call; the flag is the process's task-success report.
    fn invoke(
        &self,
        name: &str,
        arguments: &str,
        deadline: Option<Instant>,
    ) -> Result<(StepOutcome, bool)> {
        let (program, args) = match self.spec.program.split_first() {
            Some(split) => split,
            None => bail!("command.program is not configured"),
        };
        let budget = match deadline {
            Some(deadline) => self
                .spec
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.spec.timeout,
        };
        if budget.is_zero() {
            return Ok((self.timed_out(name, budget), false));
        }

        let mut cmd = Command::new(program);
        cmd.args(args).arg(name);
        let output = run_with_timeout(
            cmd,
            arguments.as_bytes(),
            budget,
            self.spec.output_limit_bytes,
        )?;

        if output.timed_out {
            return Ok((self.timed_out(name, budget), false));
        }
        if let Some(notice) = output.truncation_notice() {
            bail!("tool {name} produced too much output {notice}");
        }
        if !output.status.success() {
            bail!(
                "tool {name} exited with {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            );
        }

        let reply: ToolReply = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("tool {name} replied with invalid JSON"))?;
        debug!(tool = name, status = reply.status, success = reply.success, "tool replied");
        Ok((
            StepOutcome::new(reply.observation, reply.status),
            reply.success,
        ))
    }

    fn timed_out(&self, name: &str, budget: Duration) -> StepOutcome {
        StepOutcome::new(
            format!(
                "tool {name} timed out after {:.1} seconds",
                budget.as_secs_f64()
            ),
            self.spec.statuses.timeout,
        )
    }
}

impl Environment for CommandEnvironment {
    fn step(&mut self, name: &str, arguments: &str, deadline: Option<Instant>) -> StepOutcome {
        self.calls += 1;
        match self.invoke(name, arguments, deadline) {
            Ok((outcome, success)) => {
                self.solved |= success;
                outcome
            }
            Err(err) => {
                warn!(tool = name, err = %err, "tool backend failed");
                StepOutcome::new(format!("{err:#}"), self.spec.statuses.transport_error)
            }
        }
    }

    fn check_success(&self) -> bool {
        self.solved
    }

    fn snapshot(&self) -> Option<Value> {
        Some(json!({"calls": self.calls, "solved": self.solved}))
    }
}
