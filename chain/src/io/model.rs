//! Model collaborators.
//!
//! The driver talks to a [`ModelClient`], which returns the next assistant
//! message for a conversation. [`TextProtocolModel`] implements it on top of
//! any text-only [`CompletionBackend`] by rendering a tool-listing system
//! prompt and parsing the completion with the marker protocols.
//! [`RetryingBackend`] wraps a backend with bounded, randomized exponential
//! backoff.

use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::core::protocol::{END_ACTION_MARKER, code_split, parse_code_call, react_split};
use crate::core::tools::{ToolDeclaration, ToolRegistry};
use crate::core::types::{ActionCall, ActionMode, Message, Role};
use crate::io::config::SearchConfig;
use crate::io::prompt::PromptEngine;

/// Next assistant message plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub message: Message,
    /// Nonzero for a recoverable protocol problem in the reply.
    pub error_code: i32,
    pub total_tokens: u64,
}

pub trait ModelClient {
    /// Produce the next assistant message for `messages`.
    ///
    /// `Err` means the model could not be reached at all.
    fn parse(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ModelReply>;
}

impl<T: ModelClient + ?Sized> ModelClient for &T {
    fn parse(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ModelReply> {
        (**self).parse(messages, tools)
    }
}

/// Raw completion from a text-only backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub total_tokens: u64,
}

/// Chat-completion transport: plain role/content messages in, text out.
pub trait CompletionBackend {
    fn complete(&self, messages: &[Message]) -> Result<Completion>;
}

impl<T: CompletionBackend + ?Sized> CompletionBackend for &T {
    fn complete(&self, messages: &[Message]) -> Result<Completion> {
        (**self).complete(messages)
    }
}

/// Randomized exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(40),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): uniform between the
    /// minimum and `min * 2^retry`, capped at the maximum.
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let min = self.min_backoff.as_secs_f64();
        let max = self.max_backoff.as_secs_f64().max(min);
        let upper = (min * 2f64.powi(retry.min(30) as i32)).min(max);
        if upper <= min {
            return Duration::from_secs_f64(min);
        }
        Duration::from_secs_f64(rng.gen_range(min..=upper))
    }
}

/// Every retry failed.
#[derive(Debug)]
pub struct ModelCallError {
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

impl fmt::Display for ModelCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "model call failed after {} attempts: {:#}",
            self.attempts, self.last_error
        )
    }
}

impl std::error::Error for ModelCallError {}

/// Backend wrapper retrying failed completions.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: CompletionBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<B: CompletionBackend> CompletionBackend for RetryingBackend<B> {
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts))]
    fn complete(&self, messages: &[Message]) -> Result<Completion> {
        let attempts = self.policy.max_attempts.max(1);
        let mut rng = rand::thread_rng();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.complete(messages) {
                Ok(completion) => return Ok(completion),
                Err(err) if attempt >= attempts => {
                    return Err(ModelCallError {
                        attempts: attempt,
                        last_error: err,
                    }
                    .into());
                }
                Err(err) => {
                    let delay = self.policy.delay(attempt - 1, &mut rng);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        err = %err,
                        "completion failed, retrying"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}

/// [`ModelClient`] over a text-only completion backend.
pub struct TextProtocolModel<B> {
    backend: B,
    mode: ActionMode,
    prompts: PromptEngine,
}

impl<B: CompletionBackend> TextProtocolModel<B> {
    pub fn new(backend: B, mode: ActionMode) -> Result<Self> {
        Ok(Self {
            backend,
            mode,
            prompts: PromptEngine::new()?,
        })
    }


    /// Conversation as sent to the backend: the rendered system prompt, then
    /// the history with observations as user turns and actions as raw text.
    pub fn build_request(
        &self,
        messages: &[Message],
        registry: &ToolRegistry,
    ) -> Result<Vec<Message>> {
        let mut request = vec![Message::system(self.prompts.render_system(self.mode, registry)?)];
        request.extend(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(to_plain_message),
        );
        Ok(request)
    }
}

impl<B: CompletionBackend> TextProtocolModel<RetryingBackend<B>> {
    /// Model for a configured run: `backend` retried per the `[model]` table,
    /// speaking the configured action mode.
    pub fn from_config(backend: B, cfg: &SearchConfig) -> Result<Self> {
        cfg.validate()?;
        Self::new(
            RetryingBackend::new(backend, cfg.retry_policy()),
            cfg.action_mode,
        )
    }
}

impl<B: CompletionBackend> ModelClient for TextProtocolModel<B> {
    #[instrument(skip_all, fields(mode = self.mode.as_str(), history = messages.len()))]
    fn parse(&self, messages: &[Message], tools: &[ToolDeclaration]) -> Result<ModelReply> {
        let registry = ToolRegistry::from_declarations(tools)?;
        let request = self.build_request(messages, &registry)?;
        let completion = self.backend.complete(&request)?;
        debug!(tokens = completion.total_tokens, "completion received");
        Ok(ModelReply {
            message: parse_completion(self.mode, &completion.text, &registry),
            error_code: 0,
            total_tokens: completion.total_tokens,
        })
    }
}

/// Turn completion text into an assistant message carrying the thought, the
/// action for `mode` and the raw text.
pub fn parse_completion(mode: ActionMode, text: &str, registry: &ToolRegistry) -> Message {
    let (thought, action) = match mode {
        ActionMode::JsonAsAction => {
            let parts = react_split(text);
            let arguments = match parts.action_input.find(END_ACTION_MARKER.trim_start()) {
                Some(idx) => parts.action_input[..idx].trim_end().to_string(),
                None => parts.action_input,
            };
            let action = ActionCall::JsonAsAction {
                name: parts.action,
                arguments,
                raw_msg: Some(text.to_string()),
            };
            (parts.thought, action)
        }
        ActionMode::CodeAsAction => {
            let parts = code_split(text);
            let call = parse_code_call(&parts.code, registry);
            let action = ActionCall::CodeAsAction {
                code: parts.code,
                call: Some(call),
                raw_msg: Some(text.to_string()),
            };
            (parts.thought, action)
        }
    };
    Message::assistant(thought).with_action(action)
}

fn to_plain_message(message: &Message) -> Message {
    if message.role == Role::Function {
        return Message::user(format!(
            "Observation: {}",
            message.content.as_deref().unwrap_or("")
        ));
    }
    match message.function_call.as_ref().and_then(ActionCall::raw_msg) {
        Some(raw) => Message::assistant(raw),
        None => Message {
            function_call: None,
            name: None,
            ..message.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;
    use crate::core::types::ParsedAction;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    struct FakeBackend {
        replies: RefCell<VecDeque<Result<Completion, String>>>,
        requests: RefCell<Vec<Vec<Message>>>,
    }

    impl FakeBackend {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: RefCell::new(
                    replies
                        .into_iter()
                        .map(|r| {
                            r.map(|text| Completion {
                                text: text.to_string(),
                                total_tokens: 10,
                            })
                            .map_err(str::to_string)
                        })
                        .collect(),
                ),
                requests: RefCell::new(Vec::new()),
            }
        }
    }

    impl CompletionBackend for FakeBackend {
        fn complete(&self, messages: &[Message]) -> Result<Completion> {
            self.requests.borrow_mut().push(messages.to_vec());
            match self.replies.borrow_mut().pop_front() {
                Some(Ok(completion)) => Ok(completion),
                Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
                None => Err(anyhow::anyhow!("no scripted completion")),
            }
        }
    }

    fn tools() -> Vec<ToolDeclaration> {
        serde_json::from_value(json!([
            {"name": "search", "parameters": {"properties": {"query": {"type": "string"}}}},
            {"name": "Finish", "parameters": {}}
        ]))
        .expect("tools")
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn json_mode_parses_react_completion() {
        let backend = FakeBackend::new(vec![Ok(
            "Thought: look\nAction: search\nAction Input: {\"query\": \"x\"}\nEnd Action",
        )]);
        let model = TextProtocolModel::new(&backend, ActionMode::JsonAsAction).expect("model");
        let reply = model
            .parse(&[Message::system("s"), Message::user("q")], &tools())
            .expect("parse");

        assert_eq!(reply.total_tokens, 10);
        assert_eq!(reply.message.content.as_deref(), Some("look"));
        match reply.message.function_call.expect("action") {
            ActionCall::JsonAsAction {
                name, arguments, ..
            } => {
                assert_eq!(name, "search");
                assert_eq!(arguments, "{\"query\": \"x\"}");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn code_mode_attaches_parsed_call() {
        let backend =
            FakeBackend::new(vec![Ok("Thought: go\nAction: search(\"x\")\nEnd Action")]);
        let model = TextProtocolModel::new(&backend, ActionMode::CodeAsAction).expect("model");
        let reply = model.parse(&[Message::user("q")], &tools()).expect("parse");

        match reply.message.function_call.expect("action") {
            ActionCall::CodeAsAction { code, call, .. } => {
                assert_eq!(code, "search(\"x\")");
                assert_eq!(
                    call,
                    Some(ParsedAction {
                        name: "search".to_string(),
                        arguments: "{\"query\":\"x\"}".to_string(),
                    })
                );
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn request_replaces_system_prompt_and_flattens_history() {
        let backend = FakeBackend::new(vec![Ok("Thought: done")]);
        let model = TextProtocolModel::new(&backend, ActionMode::JsonAsAction).expect("model");
        let action = ActionCall::JsonAsAction {
            name: "search".to_string(),
            arguments: "{}".to_string(),
            raw_msg: Some("Thought: t\nAction: search".to_string()),
        };
        let history = vec![
            Message::system("caller system"),
            Message::user("question"),
            Message::assistant("t").with_action(action),
            Message::function("search", "found it"),
        ];
        model.parse(&history, &tools()).expect("parse");

        let requests = backend.requests.borrow();
        let sent = &requests[0];
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.as_deref().unwrap_or("").starts_with("Answer the following"));
        assert_eq!(sent[1], Message::user("question"));
        assert_eq!(sent[2], Message::assistant("Thought: t\nAction: search"));
        assert_eq!(sent[3], Message::user("Observation: found it"));
    }

    #[test]
    fn retrying_backend_recovers_from_transient_failures() {
        let backend = FakeBackend::new(vec![Err("503"), Ok("Thought: ok")]);
        let retrying = RetryingBackend::new(&backend, no_wait());
        let completion = retrying.complete(&[Message::user("q")]).expect("complete");
        assert_eq!(completion.text, "Thought: ok");
        assert_eq!(backend.requests.borrow().len(), 2);
    }

    #[test]
    fn retrying_backend_gives_up_after_max_attempts() {
        let backend = FakeBackend::new(vec![Err("a"), Err("b"), Err("c"), Ok("late")]);
        let retrying = RetryingBackend::new(&backend, no_wait());
        let err = retrying.complete(&[Message::user("q")]).expect_err("fail");
        let call_err = err.downcast_ref::<ModelCallError>().expect("typed error");
        assert_eq!(call_err.attempts, 3);
        assert_eq!(backend.requests.borrow().len(), 3);
    }

    #[test]
    fn configured_model_retries_and_uses_configured_mode() {
        let backend = FakeBackend::new(vec![
            Err("429"),
            Err("503"),
            Ok("Thought: go\nAction: search(\"x\")\nEnd Action"),
        ]);
        let mut cfg = SearchConfig {
            action_mode: ActionMode::CodeAsAction,
            ..SearchConfig::default()
        };
        cfg.model.max_attempts = 3;
        cfg.model.min_backoff_ms = 0;
        cfg.model.max_backoff_ms = 0;

        let model = TextProtocolModel::from_config(&backend, &cfg).expect("model");
        let reply = model.parse(&[Message::user("q")], &tools()).expect("parse");
        assert_eq!(backend.requests.borrow().len(), 3);
        assert!(matches!(
            reply.message.function_call,
            Some(ActionCall::CodeAsAction { .. })
        ));

        cfg.model.max_attempts = 1;
        let failing = FakeBackend::new(vec![Err("down"), Ok("Thought: late")]);
        let model = TextProtocolModel::from_config(&failing, &cfg).expect("model");
        let err = model.parse(&[Message::user("q")], &tools()).expect_err("fail");
        assert!(err.downcast_ref::<ModelCallError>().is_some());
        assert_eq!(failing.requests.borrow().len(), 1);
    }

    #[test]
    fn retry_delay_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        for retry in 0..8 {
            let delay = policy.delay(retry, &mut rng);
            assert!(delay >= policy.min_backoff);
            assert!(delay <= policy.max_backoff);
        }
        assert_eq!(policy.delay(0, &mut rng), Duration::from_secs(1));
    }
}
