//! Prompt rendering for the text-protocol model adapter and start messages.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::tools::ToolRegistry;
use crate::core::types::{ActionMode, Message};

const SYSTEM_JSON_TEMPLATE: &str = include_str!("prompts/system_json.md");
const SYSTEM_CODE_TEMPLATE: &str = include_str!("prompts/system_code.md");
const START_SYSTEM_TEMPLATE: &str = include_str!("prompts/start_system.md");
const START_USER_TEMPLATE: &str = include_str!("prompts/start_user.md");

/// One tool line in a system prompt.
#[derive(Debug, Clone, Serialize)]
struct ToolContext {
    name: String,
    summary: String,
    signature: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system_json", SYSTEM_JSON_TEMPLATE)
            .context("load system_json template")?;
        env.add_template("system_code", SYSTEM_CODE_TEMPLATE)
            .context("load system_code template")?;
        env.add_template("start_system", START_SYSTEM_TEMPLATE)
            .context("load start_system template")?;
        env.add_template("start_user", START_USER_TEMPLATE)
            .context("load start_user template")?;
        Ok(Self { env })
    }

    /// System prompt listing the tools in the syntax of `mode`.
    pub fn render_system(&self, mode: ActionMode, registry: &ToolRegistry) -> Result<String> {
        let tools: Vec<ToolContext> = registry
            .bindings()
            .iter()
            .map(|binding| ToolContext {
                name: binding.name.clone(),
                summary: binding.description.trim_end_matches('.').to_string(),
                signature: match mode {
                    ActionMode::JsonAsAction => binding.json_signature(),
                    ActionMode::CodeAsAction => binding.code_signature(),
                },
            })
            .collect();
        let names = registry.names().join(", ");
        let name = match mode {
            ActionMode::JsonAsAction => "system_json",
            ActionMode::CodeAsAction => "system_code",
        };
        let template = self.env.get_template(name)?;
        let rendered = template.render(context! { tools => tools, names => names })?;
        debug!(template = name, len = rendered.len(), "rendered system prompt");
        Ok(rendered)
    }

    /// Default system and user messages opening an attempt.
    pub fn render_start_messages(
        &self,
        task_description: &str,
        input_description: &str,
    ) -> Result<Vec<Message>> {
        let system = self
            .env
            .get_template("start_system")?
            .render(context! { task_description => task_description.trim() })?;
        let user = self
            .env
            .get_template("start_user")?
            .render(context! { input_description => input_description.trim() })?;
        Ok(vec![Message::system(system), Message::user(user)])
    }
}
