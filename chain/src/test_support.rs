//! Test-only collaborators: a scripted model and an in-memory environment.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::protocol::parse_code_call;
use crate::core::status::{GIVE_UP_ACTION, StatusCodes};
use crate::core::tools::{FINISH_TOOL, ToolDeclaration, ToolRegistry};
use crate::core::types::{ActionCall, Message};
use crate::io::environment::{Environment, StepOutcome};
use crate::io::model::{ModelClient, ModelReply};

/// Assistant reply with a thought and a structured call.
pub fn json_reply(thought: &str, name: &str, arguments: &str) -> ModelReply {
    let action = ActionCall::JsonAsAction {
        name: name.to_string(),
        arguments: arguments.to_string(),
        raw_msg: Some(format!(
            "Thought: {thought}\nAction: {name}\nAction Input: {arguments}\nEnd Action"
        )),
    };
    reply(Message::assistant(thought).with_action(action))
}

/// Assistant reply with a thought and a scriptlet.
pub fn code_reply(thought: &str, code: &str) -> ModelReply {
    let action = ActionCall::CodeAsAction {
        code: code.to_string(),
        call: Some(parse_code_call(code, &ToolRegistry::default())),
        raw_msg: Some(format!("Thought: {thought}\nAction: {code}\nEnd Action")),
    };
    reply(Message::assistant(thought).with_action(action))
}

/// Assistant reply carrying only a thought.
pub fn thought_reply(thought: &str) -> ModelReply {
    reply(Message::assistant(thought))
}

fn reply(message: Message) -> ModelReply {
    ModelReply {
        message,
        error_code: 0,
        total_tokens: 5,
    }
}

/// Model that replays queued replies in order.
///
/// Once the queue is drained the last successful reply repeats, so a
/// single reply can drive an attempt until the depth guard stops it.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    queue: RefCell<VecDeque<Result<ModelReply, String>>>,
    last: RefCell<Option<ModelReply>>,
    seen: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            queue: RefCell::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn then(self, reply: ModelReply) -> Self {
        self.queue.borrow_mut().push_back(Ok(reply));
        self
    }

    /// Queue a transport failure.
    pub fn then_error(self, message: &str) -> Self {
        self.queue.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    /// Histories passed to `parse`, in call order.
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.borrow().clone()
    }
}

impl ModelClient for ScriptedModel {
    fn parse(&self, messages: &[Message], _tools: &[ToolDeclaration]) -> Result<ModelReply> {
        self.seen.borrow_mut().push(messages.to_vec());
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(reply)) => {
                *self.last.borrow_mut() = Some(reply.clone());
                Ok(reply)
            }
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .last
                .borrow()
                .clone()
                .ok_or_else(|| anyhow!("scripted model has no replies")),
        }
    }
}

/// In-memory environment with canned tool results.
///
/// `Finish` is built in: `give_answer` solves the task and
/// `give_up_and_restart` answers with the give-up status. Unknown tools answer
/// with the hallucinated-name status.
#[derive(Debug, Clone, Default)]
pub struct ToyEnvironment {
    tools: BTreeMap<String, StepOutcome>,
    solving_tool: Option<String>,
    latency: Duration,
    calls: Vec<(String, String)>,
    solved: bool,
}

impl ToyEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, observation: impl Into<String>, status: i32) -> Self {
        self.tools
            .insert(name.to_string(), StepOutcome::new(observation, status));
        self
    }

    /// Mark the task solved as soon as `name` succeeds once.
    pub fn solved_by(mut self, name: &str) -> Self {
        self.solving_tool = Some(name.to_string());
        self
    }

    /// Make every canned tool take `latency` to answer. A call cut short by
    /// its deadline reports the timeout status.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> &[(String, String)] {
        &self.calls
    }

    /// Declarations for the canned tools plus `Finish`.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut decls: Vec<Value> = self
            .tools
            .keys()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("The description of this function is: {name} tool."),
                    "parameters": {"type": "object", "properties": {"query": {"type": "string"}}}
                })
            })
            .collect();
        decls.push(json!({"name": FINISH_TOOL, "parameters": {}}));
        decls
            .into_iter()
            .filter_map(|d| serde_json::from_value(d).ok())
            .collect()
    }

    fn finish(&mut self, arguments: &str) -> StepOutcome {
        let codes = StatusCodes::default();
        let return_type = serde_json::from_str::<Value>(arguments)
            .ok()
            .and_then(|v| v.get("return_type").and_then(Value::as_str).map(str::to_string));
        match return_type.as_deref() {
            Some("give_answer") => {
                self.solved = true;
                StepOutcome::new(
                    "{\"response\":\"successfully giving the final answer.\"}",
                    codes.success,
                )
            }
            Some(GIVE_UP_ACTION) => StepOutcome::new(
                "{\"response\":\"chose to give up and restart\"}",
                codes.give_up,
            ),
            _ => StepOutcome::new(
                "{\"error\":\"\\\"return_type\\\" is not a valid choice\"}",
                codes.invalid_input,
            ),
        }
    }
}

impl Environment for ToyEnvironment {
    fn step(&mut self, name: &str, arguments: &str, deadline: Option<Instant>) -> StepOutcome {
        self.calls.push((name.to_string(), arguments.to_string()));
        if name == FINISH_TOOL {
            return self.finish(arguments);
        }
        if !self.latency.is_zero() {
            let allowed = deadline.map_or(self.latency, |deadline| {
                self.latency
                    .min(deadline.saturating_duration_since(Instant::now()))
            });
            thread::sleep(allowed);
            if allowed < self.latency {
                return StepOutcome::new(
                    format!("{{\"error\":\"{name} timed out\"}}"),
                    StatusCodes::default().timeout,
                );
            }
        }
        match self.tools.get(name) {
            Some(outcome) => {
                if outcome.status == 0 && self.solving_tool.as_deref() == Some(name) {
                    self.solved = true;
                }
                outcome.clone()
            }
            None => StepOutcome::new(
                format!("{{\"error\":\"No such function name: {name}\"}}"),
                StatusCodes::default().hallucinated_name,
            ),
        }
    }

    fn check_success(&self) -> bool {
        self.solved
    }

    fn snapshot(&self) -> Option<Value> {
        Some(json!({"calls": self.calls.len(), "solved": self.solved}))
    }
}
