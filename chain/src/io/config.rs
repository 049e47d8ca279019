//! Search configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::status::StatusCodes;
use crate::core::types::ActionMode;
use crate::io::model::RetryPolicy;
use crate::io::sandbox::SandboxConfig;

/// Decision-loop configuration (TOML).
///
/// Missing fields default to the values a single-attempt run expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    /// Depth at which a non-terminal attempt is pruned.
    pub max_steps: usize,

    /// Attempts before giving up.
    pub pass_at: usize,

    /// Successful attempts required to stop early.
    pub answer: usize,

    pub action_mode: ActionMode,

    pub sandbox: SandboxSettings,

    pub model: ModelSettings,

    pub status: StatusCodes,

    pub command: CommandSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxSettings {
    pub timeout_secs: u64,
    /// Truncate observations beyond this many characters; 0 disables.
    pub max_observation_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelSettings {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Child-process tool backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandSettings {
    /// Program plus leading arguments; the tool name is appended.
    pub program: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            pass_at: 1,
            answer: 1,
            action_mode: ActionMode::JsonAsAction,
            sandbox: SandboxSettings::default(),
            model: ModelSettings::default(),
            status: StatusCodes::default(),
            command: CommandSettings::default(),
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_observation_length: 0,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff_ms: 1_000,
            max_backoff_ms: 40_000,
        }
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            program: Vec::new(),
            timeout_secs: 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.pass_at == 0 {
            return Err(anyhow!("pass_at must be > 0"));
        }
        if self.answer == 0 {
            return Err(anyhow!("answer must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.model.max_attempts == 0 {
            return Err(anyhow!("model.max_attempts must be > 0"));
        }
        if self.model.min_backoff_ms > self.model.max_backoff_ms {
            return Err(anyhow!("model.min_backoff_ms must be <= model.max_backoff_ms"));
        }
        if self.command.timeout_secs == 0 {
            return Err(anyhow!("command.timeout_secs must be > 0"));
        }
        if self.command.output_limit_bytes == 0 {
            return Err(anyhow!("command.output_limit_bytes must be > 0"));
        }
        if self.command.program.first().is_some_and(|p| p.trim().is_empty()) {
            return Err(anyhow!("command.program must start with a program name"));
        }
        self.status.validate()
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            timeout: Duration::from_secs(self.sandbox.timeout_secs),
            max_observation_length: self.sandbox.max_observation_length,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.model.max_attempts,
            min_backoff: Duration::from_millis(self.model.min_backoff_ms),
            max_backoff: Duration::from_millis(self.model.max_backoff_ms),
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SearchConfig::default()`.
pub fn load_config(path: &Path) -> Result<SearchConfig> {
    if !path.exists() {
        let cfg = SearchConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SearchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
