//! Command-line tools around the single-chain agent loop.
//!
//! Parses model completions, runs scriptlets against a process-backed tool
//! environment, and checks exported run-result documents.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use tracing::debug;

use chain::core::tools::{ToolDeclaration, ToolRegistry};
use chain::core::types::ActionMode;
use chain::exit_codes;
use chain::export::{RunResult, schema_violations};
use chain::io::command_env::CommandEnvironment;
use chain::io::config::load_config;
use chain::io::model::parse_completion;
use chain::io::sandbox::Sandbox;
use chain::logging;

#[derive(Parser)]
#[command(
    name = "chain",
    version,
    about = "Single-chain tool-using agent loop"
)]
struct Cli {
    /// Raise log verbosity (-v, -vv, -vvv); `RUST_LOG` takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Json,
    Code,
}

impl From<Mode> for ActionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Json => ActionMode::JsonAsAction,
            Mode::Code => ActionMode::CodeAsAction,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Parse a model completion and print the resulting message as JSON.
    Parse {
        #[arg(long, value_enum, default_value = "json")]
        mode: Mode,
        /// JSON array of tool declarations.
        #[arg(long)]
        tools: PathBuf,
        /// Completion text (stdin when omitted).
        file: Option<PathBuf>,
    },
    /// Run a scriptlet in the sandbox against the configured tool command.
    Exec {
        /// JSON array of tool declarations.
        #[arg(long)]
        tools: PathBuf,
        /// TOML config; defaults apply when the file is missing.
        #[arg(long, default_value = "chain.toml")]
        config: PathBuf,
        /// Scriptlet source (stdin when omitted).
        file: Option<PathBuf>,
    },
    /// Check a run-result document against the bundled schema.
    Validate { file: PathBuf },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Parse { mode, tools, file } => cmd_parse(mode.into(), &tools, file.as_deref()),
        Command::Exec {
            tools,
            config,
            file,
        } => cmd_exec(&tools, &config, file.as_deref()),
        Command::Validate { file } => cmd_validate(&file),
    }
}

fn cmd_parse(mode: ActionMode, tools: &Path, file: Option<&Path>) -> Result<i32> {
    let registry = ToolRegistry::from_declarations(&read_tools(tools)?)?;
    let text = read_input(file)?;
    let message = parse_completion(mode, &text, &registry);
    println!(
        "{}",
        serde_json::to_string_pretty(&message).context("serialize message")?
    );
    Ok(exit_codes::OK)
}

fn cmd_exec(tools: &Path, config: &Path, file: Option<&Path>) -> Result<i32> {
    let cfg = load_config(config)?;
    let registry = ToolRegistry::from_declarations(&read_tools(tools)?)?;
    let mut env = CommandEnvironment::from_config(&cfg)?;
    let sandbox = Sandbox::new(&registry, cfg.sandbox_config(), cfg.status);
    let code = read_input(file)?;

    let execution = sandbox.run(&mut env, &code)?;
    debug!(tool_calls = env.calls(), "scriptlet finished");
    let report = json!({
        "observation": execution.observation,
        "status": execution.status,
        "timed_out": execution.timed_out,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize execution")?
    );
    Ok(exit_codes::OK)
}

fn cmd_validate(file: &Path) -> Result<i32> {
    let raw = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let document: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", file.display()))?;

    let violations = schema_violations(&document)?;
    if !violations.is_empty() {
        eprintln!("schema validation failed:\n- {}", violations.join("\n- "));
        return Ok(exit_codes::VALIDATION_FAILED);
    }
    serde_json::from_value::<RunResult>(document)
        .with_context(|| format!("deserialize {}", file.display()))?;
    Ok(exit_codes::OK)
}

fn read_tools(path: &Path) -> Result<Vec<ToolDeclaration>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse tools {}", path.display()))
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}
