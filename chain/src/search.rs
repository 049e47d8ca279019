//! Single-chain decision loop.
//!
//! Each attempt grows one path of a fresh [`Tree`]: the model speaks, its
//! thought and action become nodes, the action runs against a cloned
//! environment snapshot, and the observation is fed back. An attempt ends when
//! its current node is terminal (the task is solved) or pruned (give-up,
//! depth exhausted, or the model could not be reached).

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::status::{HALLUCINATED_NAME_SENTINEL, StatusClass, StatusCodes};
use crate::core::tools::{ToolDeclaration, ToolRegistry};
use crate::core::tree::{NodeId, Tree};
use crate::core::types::{ActionCall, Message, NodeType, Role};
use crate::export::{
    AnswerGeneration, ForwardArgs, ProcessRecord, RunResult, TerminalRecord, TryRecord,
    chain_records,
};
use crate::io::config::SearchConfig;
use crate::io::environment::{Environment, StepOutcome};
use crate::io::model::ModelClient;
use crate::io::prompt::PromptEngine;
use crate::io::sandbox::Sandbox;

/// What the agent is asked to do.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub tools: Vec<ToolDeclaration>,
    pub task_description: String,
    pub input_description: String,
}

/// Driver state across attempts.
pub struct ChainSearch<M, E> {
    model: M,
    initial_env: E,
    task: Task,
    statuses: StatusCodes,
    sandbox: Sandbox,
    prompts: PromptEngine,
    start_messages: Option<Vec<Message>>,
    won: bool,
    query_count: u64,
    total_tokens: u64,
    success_count: usize,
    terminals: Vec<TerminalRecord>,
    tries: Vec<TryRecord>,
    forward_args: ForwardArgs,
}

impl<M: ModelClient, E: Environment> ChainSearch<M, E> {
    /// Validate the tool declarations and configuration and set up a run.
    pub fn new(model: M, initial_env: E, task: Task, cfg: &SearchConfig) -> Result<Self> {
        cfg.validate()?;
        let registry = ToolRegistry::from_declarations(&task.tools)?;
        Ok(Self {
            model,
            initial_env,
            statuses: cfg.status,
            sandbox: Sandbox::new(&registry, cfg.sandbox_config(), cfg.status),
            prompts: PromptEngine::new()?,
            task,
            start_messages: None,
            won: false,
            query_count: 0,
            total_tokens: 0,
            success_count: 0,
            terminals: Vec::new(),
            tries: Vec::new(),
            forward_args: ForwardArgs {
                single_chain_max_step: cfg.max_steps,
                pass_at: cfg.pass_at,
                answer: cfg.answer,
            },
        })
    }

    /// Open every attempt with `messages` instead of the rendered prompts.
    pub fn with_start_messages(mut self, messages: Vec<Message>) -> Self {
        self.start_messages = Some(messages);
        self
    }

    /// 1 once any attempt succeeded, else 0.
    pub fn status(&self) -> u8 {
        u8::from(self.won)
    }

    pub fn query_count(&self) -> u64 {
        self.query_count
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    pub fn terminals(&self) -> &[TerminalRecord] {
        &self.terminals
    }

    pub fn tries(&self) -> &[TryRecord] {
        &self.tries
    }

    /// Run up to `pass_at` attempts; true once `answer` of them succeeded.
    #[instrument(skip(self))]
    pub fn start(&mut self, max_steps: usize, pass_at: usize, answer: usize) -> Result<bool> {
        if max_steps == 0 {
            bail!("max_steps must be > 0");
        }
        self.forward_args = ForwardArgs {
            single_chain_max_step: max_steps,
            pass_at,
            answer,
        };

        for attempt in 1..=pass_at {
            info!(attempt, pass_at, "starting attempt");
            let (tree, out) = self.run_attempt(max_steps)?;
            let succeeded = tree.node(out).io_state.check_success();
            self.tries.push(TryRecord {
                chain: chain_records(&tree, out, true),
                win: succeeded,
            });
            self.terminals.push(TerminalRecord::from_tree(&tree, out));
            info!(
                attempt,
                succeeded,
                depth = tree.node(out).depth(),
                pruned = tree.node(out).pruned,
                "attempt finished"
            );

            if succeeded {
                self.won = true;
                self.success_count += 1;
                if self.success_count >= answer {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Build a fresh tree and drive it to a terminal or pruned node.
    pub fn run_attempt(&mut self, max_steps: usize) -> Result<(Tree<E>, NodeId)> {
        let messages = match &self.start_messages {
            Some(messages) => messages.clone(),
            None => self
                .prompts
                .render_start_messages(&self.task.task_description, &self.task.input_description)?,
        };
        let mut tree = Tree::new(NodeType::ActionInput, self.initial_env.clone(), messages);
        let root = tree.root();
        tree.node_mut(root).is_terminal = tree.node(root).io_state.check_success();
        let out = self.do_chain(&mut tree, root, max_steps)?;
        Ok((tree, out))
    }

    /// Extend the chain from `from` until a node is pruned or terminal.
    pub fn do_chain(&mut self, tree: &mut Tree<E>, from: NodeId, max_steps: usize) -> Result<NodeId> {
        let mut now = from;
        loop {
            if tree.node(now).is_closed() {
                return Ok(now);
            }

            let reply = match self.model.parse(&tree.node(now).messages, &self.task.tools) {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(
                        err = %format!("{err:#}"),
                        depth = tree.node(now).depth(),
                        "model call failed, abandoning attempt"
                    );
                    tree.node_mut(now).pruned = true;
                    return Ok(now);
                }
            };
            self.total_tokens += reply.total_tokens;
            self.query_count += 1;

            let mut message = reply.message;
            if message.role != Role::Assistant {
                bail!("model replied with a {:?} message", message.role);
            }
            let action = message.function_call.take();
            if message.content.is_none() && action.is_none() {
                warn!(
                    depth = tree.node(now).depth(),
                    "model reply has neither thought nor action"
                );
                tree.node_mut(now).pruned = true;
                return Ok(now);
            }

            if let Some(thought) = message.content.clone() {
                now = self.add_node(tree, now, NodeType::Thought, thought, None);
                if reply.error_code != 0 {
                    warn!(error_code = reply.error_code, "model reported a protocol error");
                    let node = tree.node_mut(now);
                    node.observation_code = Some(reply.error_code);
                    node.pruned = true;
                }
                let exhausted = close_if_exhausted(tree, now, max_steps);
                if exhausted || action.is_none() {
                    message.function_call = action;
                    tree.node_mut(now).messages.push(message);
                    if exhausted {
                        return Ok(now);
                    }
                    continue;
                }
            }
            let Some(mut action) = action else {
                continue;
            };

            let outcome = match &action {
                ActionCall::JsonAsAction {
                    name, arguments, ..
                } => {
                    now = self.add_node(tree, now, NodeType::Action, name.clone(), None);
                    if close_if_exhausted(tree, now, max_steps) {
                        None
                    } else {
                        let mut env = tree.node(now).io_state.clone();
                        let outcome = env.step(name, arguments, None);
                        now = self.add_node(
                            tree,
                            now,
                            NodeType::ActionInput,
                            arguments.clone(),
                            Some(env),
                        );
                        Some(outcome)
                    }
                }
                ActionCall::CodeAsAction { code, .. } => {
                    let mut env = tree.node(now).io_state.clone();
                    let execution = self.sandbox.run(&mut env, code)?;
                    now = self.add_node(tree, now, NodeType::CodeAction, code.clone(), Some(env));
                    Some(StepOutcome::new(execution.observation, execution.status))
                }
            };
            let Some(outcome) = outcome else {
                message.function_call = Some(action);
                tree.node_mut(now).messages.push(message);
                return Ok(now);
            };

            match self.statuses.classify(outcome.status) {
                StatusClass::GiveUp => {
                    info!(depth = tree.node(now).depth(), "model gave up, pruning");
                    tree.node_mut(now).pruned = true;
                }
                StatusClass::HallucinatedName => {
                    debug!(name = ?action.function_name(), "unknown tool name");
                    action.rename_function(HALLUCINATED_NAME_SENTINEL);
                }
                StatusClass::Success | StatusClass::Failure => {}
            }

            let observation_message = match &action {
                ActionCall::JsonAsAction { name, .. } => {
                    Message::function(name.clone(), outcome.observation.clone())
                }
                ActionCall::CodeAsAction { .. } => {
                    Message::user(format!("Observation: {}", outcome.observation))
                }
            };
            message.function_call = Some(action);

            let node = tree.node_mut(now);
            node.observation = outcome.observation;
            node.observation_code = Some(outcome.status);
            node.messages.push(message);
            node.messages.push(observation_message);

            if close_if_exhausted(tree, now, max_steps) {
                return Ok(now);
            }
        }
    }

    /// Append a child; `env` defaults to a clone of the father's snapshot.
    fn add_node(
        &self,
        tree: &mut Tree<E>,
        father: NodeId,
        node_type: NodeType,
        description: String,
        env: Option<E>,
    ) -> NodeId {
        let env = env.unwrap_or_else(|| tree.node(father).io_state.clone());
        let is_terminal = env.check_success();
        let id = tree.add_child(father, node_type, description, env);
        let node = tree.node_mut(id);
        node.is_terminal = is_terminal;
        debug!(
            node_type = node_type.as_str(),
            depth = node.depth(),
            is_terminal,
            "node created"
        );
        id
    }

    /// Dump of the last attempt.
    pub fn to_json_single(&self) -> Option<&TryRecord> {
        self.tries.last()
    }

    /// Run-result document with the requested halves.
    pub fn to_result(&self, answer: bool, process: bool) -> RunResult {
        let process = process.then(|| ProcessRecord {
            win: self.won,
            try_count: self.tries.len(),
            trys: self.tries.clone(),
            compare_candidates: self
                .terminals
                .iter()
                .filter(|t| !t.pruned)
                .map(|t| t.chain.clone())
                .collect(),
            forward_args: self.forward_args,
        });
        let answer_generation = answer.then(|| {
            AnswerGeneration::from_terminals(
                &self.terminals,
                &self.task.tools,
                self.query_count,
                self.total_tokens,
            )
        });
        RunResult {
            process,
            answer_generation,
        }
    }
}

/// Depth guard: prune a non-terminal node at `max_steps`. True when the node
/// must not be extended.
fn close_if_exhausted<E>(tree: &mut Tree<E>, id: NodeId, max_steps: usize) -> bool {
    let node = tree.node_mut(id);
    if node.depth() >= max_steps && !node.is_terminal && !node.pruned {
        debug!(depth = node.depth(), "step budget exhausted, pruning");
        node.pruned = true;
    }
    node.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, ToyEnvironment, json_reply, thought_reply};

    fn task(env: &ToyEnvironment) -> Task {
        Task {
            tools: env.declarations(),
            task_description: "Answer questions.".to_string(),
            input_description: "What is x?".to_string(),
        }
    }

    #[test]
    fn thought_only_replies_extend_the_chain() {
        let env = ToyEnvironment::new();
        let model = ScriptedModel::new(vec![thought_reply("hmm")]);
        let mut search =
            ChainSearch::new(&model, env.clone(), task(&env), &SearchConfig::default()).expect("search");
        let (tree, out) = search.run_attempt(3).expect("attempt");

        assert_eq!(tree.node(out).depth(), 3);
        assert!(tree.node(out).pruned);
        assert_eq!(tree.node(out).node_type, NodeType::Thought);
        assert_eq!(search.query_count(), 3);
        assert!(tree.validate().is_empty());
    }

    #[test]
    fn depth_guard_can_stop_between_action_and_input() {
        let env = ToyEnvironment::new().with_tool("search", "hits", 0);
        let model = ScriptedModel::new(vec![json_reply("t", "search", "{}")]);
        let mut search =
            ChainSearch::new(&model, env.clone(), task(&env), &SearchConfig::default()).expect("search");
        let (tree, out) = search.run_attempt(2).expect("attempt");

        let node = tree.node(out);
        assert_eq!(node.node_type, NodeType::Action);
        assert_eq!(node.depth(), 2);
        assert!(node.pruned);
        assert!(node.io_state.calls().is_empty());
    }

    #[test]
    fn model_protocol_error_prunes_the_thought() {
        let env = ToyEnvironment::new().with_tool("search", "hits", 0);
        let mut reply = json_reply("garbled", "search", "{\"query\": \"x\"}");
        reply.error_code = 3;
        let model = ScriptedModel::new(vec![reply]);
        let mut search =
            ChainSearch::new(&model, env.clone(), task(&env), &SearchConfig::default()).expect("search");
        let (tree, out) = search.run_attempt(10).expect("attempt");
        let node = tree.node(out);
        assert_eq!(node.node_type, NodeType::Thought);
        assert_eq!(node.observation_code, Some(3));
        assert!(node.pruned);
        assert!(node.io_state.calls().is_empty());
        assert_eq!(model.seen().len(), 1);
    }

    #[test]
    fn non_assistant_reply_is_an_error() {
        let env = ToyEnvironment::new();
        let mut reply = thought_reply("x");
        reply.message.role = Role::User;
        let model = ScriptedModel::new(vec![reply]);
        let mut search =
            ChainSearch::new(&model, env.clone(), task(&env), &SearchConfig::default()).expect("search");
        assert!(search.run_attempt(4).is_err());
    }

    #[test]
    fn start_messages_override_rendered_prompts() {
        let env = ToyEnvironment::new();
        let model = ScriptedModel::new(vec![thought_reply("x")]);
        let opening = vec![Message::system("reflect"), Message::user("try again")];
        let mut search =
            ChainSearch::new(&model, env.clone(), task(&env), &SearchConfig::default())
                .expect("search")
                .with_start_messages(opening.clone());
        search.run_attempt(1).expect("attempt");
        assert_eq!(model.seen()[0], opening);
    }
}
