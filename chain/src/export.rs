//! Run-result document.
//!
//! The document has two optional halves: the search process (`win`, per-try
//! chain dumps, candidates, arguments) flattened at the top level, and an
//! `answer_generation` training record. Serialization is deterministic: the
//! same run always produces byte-identical JSON, and parsing a document back
//! and re-serializing it reproduces it exactly.

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::tools::ToolDeclaration;
use crate::core::tree::{NodeId, Tree};
use crate::core::types::{Message, NodeType};
use crate::io::environment::Environment;

/// Bundled JSON Schema for [`RunResult`] documents.
pub const RUN_RESULT_SCHEMA: &str = include_str!("../schemas/run_result.schema.json");

/// One node of a chain dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub is_terminal: bool,
    pub pruned: bool,
    pub depth: usize,
    pub node_type: NodeType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_code: Option<i32>,
    pub child_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

/// Records for the path from the root (exclusive) down to `leaf`.
pub fn chain_records<E: Environment>(
    tree: &Tree<E>,
    leaf: NodeId,
    with_messages: bool,
) -> Vec<NodeRecord> {
    tree.path_to(leaf)
        .into_iter()
        .skip(1)
        .map(|id| {
            let node = tree.node(id);
            NodeRecord {
                is_terminal: node.is_terminal,
                pruned: node.pruned,
                depth: node.depth(),
                node_type: node.node_type,
                description: node.description.clone(),
                observation: node
                    .node_type
                    .is_execution()
                    .then(|| node.observation.clone()),
                observation_code: node.observation_code,
                child_count: node.children().len(),
                io_state: node.io_state.snapshot(),
                messages: with_messages.then(|| node.messages.clone()),
            }
        })
        .collect()
}

/// Linearized conversation of the node an attempt ended on.
pub fn train_messages<E>(tree: &Tree<E>, leaf: NodeId) -> Vec<Message> {
    tree.node(leaf).messages.clone()
}

/// What survives of an attempt once its tree is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalRecord {
    pub pruned: bool,
    pub succeeded: bool,
    /// Description of the final node (the answer-carrying action for a win).
    pub description: String,
    /// Chain dump without per-node messages.
    pub chain: Vec<NodeRecord>,
    pub train_messages: Vec<Message>,
}

impl TerminalRecord {
    pub fn from_tree<E: Environment>(tree: &Tree<E>, leaf: NodeId) -> Self {
        let node = tree.node(leaf);
        Self {
            pruned: node.pruned,
            succeeded: node.io_state.check_success(),
            description: node.description.clone(),
            chain: chain_records(tree, leaf, false),
            train_messages: train_messages(tree, leaf),
        }
    }
}

/// One attempt's dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryRecord {
    pub chain: Vec<NodeRecord>,
    pub win: bool,
}

/// Arguments of the last `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardArgs {
    pub single_chain_max_step: usize,
    pub pass_at: usize,
    pub answer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub win: bool,
    pub try_count: usize,
    pub trys: Vec<TryRecord>,
    /// Chains of attempts that ended on a non-pruned node.
    pub compare_candidates: Vec<Vec<NodeRecord>>,
    pub forward_args: ForwardArgs,
}

/// Training record built from the first non-pruned attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerGeneration {
    pub valid_data: bool,
    pub final_answer: String,
    pub function: Vec<ToolDeclaration>,
    pub query_count: u64,
    pub total_tokens: u64,
    pub train_messages: Vec<Message>,
    pub chain: Vec<NodeRecord>,
}

impl AnswerGeneration {
    pub fn from_terminals(
        terminals: &[TerminalRecord],
        function: &[ToolDeclaration],
        query_count: u64,
        total_tokens: u64,
    ) -> Self {
        let answered = terminals.iter().find(|t| !t.pruned);
        Self {
            valid_data: answered.is_some(),
            final_answer: answered.map(|t| t.description.clone()).unwrap_or_default(),
            function: function.to_vec(),
            query_count,
            total_tokens,
            train_messages: answered
                .map(|t| t.train_messages.clone())
                .unwrap_or_default(),
            chain: answered.map(|t| t.chain.clone()).unwrap_or_default(),
        }
    }
}

/// Full run-result document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(flatten)]
    pub process: Option<ProcessRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_generation: Option<AnswerGeneration>,
}

impl RunResult {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Check `document` against [`RUN_RESULT_SCHEMA`] (Draft 2020-12).
///
/// Returns one message per violation; empty when the document conforms.
pub fn schema_violations(document: &Value) -> Result<Vec<String>> {
    let schema: Value =
        serde_json::from_str(RUN_RESULT_SCHEMA).context("parse run result schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| anyhow!("invalid schema: {}", err))?;
    Ok(compiled
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect())
}
