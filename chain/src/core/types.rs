//! Shared deterministic types for the decision loop.
//!
//! These types are the stable contract between the driver, the model adapter
//! and the serializer. They carry no behavior beyond construction helpers.

use serde::{Deserialize, Serialize};

/// Kind of turn a tree node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Thought,
    Action,
    #[serde(rename = "Action Input")]
    ActionInput,
    #[serde(rename = "Code Action")]
    CodeAction,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Thought => "Thought",
            NodeType::Action => "Action",
            NodeType::ActionInput => "Action Input",
            NodeType::CodeAction => "Code Action",
        }
    }

    /// True for nodes produced by executing an action against the environment.
    pub fn is_execution(&self) -> bool {
        matches!(self, NodeType::ActionInput | NodeType::CodeAction)
    }
}

/// Textual protocol the model uses to express actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// `Action: name` / `Action Input: {json}`; executed by a direct `step` call.
    JsonAsAction,
    /// A scriptlet calling tools as functions; executed in the sandbox.
    CodeAsAction,
}

impl ActionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionMode::JsonAsAction => "json_as_action",
            ActionMode::CodeAsAction => "code_as_action",
        }
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// A tool call extracted from scriptlet text: function name plus JSON-encoded
/// keyword arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub name: String,
    pub arguments: String,
}

/// Structured action attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionCall {
    JsonAsAction {
        name: String,
        arguments: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_msg: Option<String>,
    },
    CodeAsAction {
        code: String,
        /// Validated single-call reading of `code`, when the adapter produced one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call: Option<ParsedAction>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_msg: Option<String>,
    },
}

impl ActionCall {
    /// Function name as the model emitted it, if the action names one.
    pub fn function_name(&self) -> Option<&str> {
        match self {
            ActionCall::JsonAsAction { name, .. } => Some(name),
            ActionCall::CodeAsAction { call, .. } => call.as_ref().map(|c| c.name.as_str()),
        }
    }

    /// Overwrite the emitted function name (used to reflect hallucinated names).
    pub fn rename_function(&mut self, replacement: &str) {
        match self {
            ActionCall::JsonAsAction { name, .. } => *name = replacement.to_string(),
            ActionCall::CodeAsAction { call, .. } => {
                if let Some(call) = call {
                    call.name = replacement.to_string();
                }
            }
        }
    }

    /// Raw completion text the action was parsed from, if known.
    pub fn raw_msg(&self) -> Option<&str> {
        match self {
            ActionCall::JsonAsAction { raw_msg, .. } | ActionCall::CodeAsAction { raw_msg, .. } => {
                raw_msg.as_deref()
            }
        }
    }
}

/// One role-tagged conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<ActionCall>,
}

impl Message {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Observation returned to the model for a function-call action.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            content: Some(content.into()),
            name: Some(name.into()),
            function_call: None,
        }
    }

    pub fn with_action(mut self, action: ActionCall) -> Self {
        self.function_call = Some(action);
        self
    }
}
