//! Tool declarations and the invocation registry.
//!
//! Declarations arrive in the function-calling JSON shape
//! (`{name, description, parameters: {properties, required}}`). The registry
//! turns them, once per run, into [`ToolBinding`] descriptors: the argument
//! names and kinds the sandbox needs to pack positional and keyword arguments
//! into a single JSON object.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name every final-answer tool is exposed under.
pub const FINISH_TOOL: &str = "Finish";

const FINISH_DESCRIPTION: &str = "If you believe that you have obtained a result that can answer the task, please call this function to provide the final answer. ALWAYS call this function at the end of your attempt to answer the question finally.";
const DESCRIPTION_PREFIX: &str = "The description of this function is: ";

/// A tool as declared to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: ToolParameters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Parameter schemas in declaration order.
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl ToolDeclaration {
    /// Short human description shown in prompts.
    pub fn summary(&self) -> &str {
        if is_finish(&self.name) {
            return FINISH_DESCRIPTION;
        }
        match self.description.find(DESCRIPTION_PREFIX) {
            Some(idx) => &self.description[idx + DESCRIPTION_PREFIX.len()..],
            None => &self.description,
        }
    }
}

fn is_finish(name: &str) -> bool {
    name.contains(FINISH_TOOL)
}

/// Argument kind accepted by a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Float,
    Bool,
}

impl ParamKind {
    fn from_json_type(raw: &str) -> Option<Self> {
        match raw {
            "string" => Some(ParamKind::Str),
            "integer" => Some(ParamKind::Int),
            "number" => Some(ParamKind::Float),
            "boolean" => Some(ParamKind::Bool),
            _ => None,
        }
    }

    /// Name used in code-mode signatures (`search(query: str)`).
    pub fn code_name(&self) -> &'static str {
        match self {
            ParamKind::Str => "str",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Bool => "bool",
        }
    }

    /// Name used in JSON-mode argument schemas.
    pub fn json_name(&self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Int => "integer",
            ParamKind::Float => "number",
            ParamKind::Bool => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

/// Invocation descriptor for one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinding {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolBinding {
    /// Pack positional and keyword arguments into a single argument object.
    ///
    /// Positional arguments follow declaration order. A keyword that repeats an
    /// already-bound name is rejected.
    pub fn pack_arguments(
        &self,
        positional: Vec<Value>,
        keyword: Vec<(String, Value)>,
    ) -> Result<Map<String, Value>, String> {
        if positional.len() > self.params.len() {
            return Err(format!(
                "{}() takes {} positional arguments but {} were given",
                self.name,
                self.params.len(),
                positional.len()
            ));
        }
        let mut packed = Map::new();
        for (param, value) in self.params.iter().zip(positional) {
            packed.insert(param.name.clone(), value);
        }
        for (key, value) in keyword {
            if packed.contains_key(&key) {
                return Err(format!("Duplicated argument name: {key}"));
            }
            packed.insert(key, value);
        }
        Ok(packed)
    }

    /// `name(a: str, b: int)` signature for prompts.
    pub fn code_signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.kind.code_name()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.name, params)
    }

    /// `{"a": string, "b": integer}` argument sketch for prompts.
    pub fn json_signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| format!("\"{}\": {}", p.name, p.kind.json_name()))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{params}}}")
    }
}

/// Registry of declared tools, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRegistry {
    bindings: Vec<ToolBinding>,
}

impl ToolRegistry {
    /// Build the registry from declarations.
    ///
    /// Malformed declarations (parameter names that cannot be used as keyword
    /// arguments, unknown JSON types, duplicate tool names) are rejected.
    pub fn from_declarations(declarations: &[ToolDeclaration]) -> Result<Self> {
        let mut bindings: Vec<ToolBinding> = Vec::with_capacity(declarations.len());
        for decl in declarations {
            let binding = bind(decl)?;
            if bindings.iter().any(|b| b.name == binding.name) {
                bail!("duplicate tool name '{}'", binding.name);
            }
            bindings.push(binding);
        }
        Ok(Self { bindings })
    }

    pub fn get(&self, name: &str) -> Option<&ToolBinding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn bindings(&self) -> &[ToolBinding] {
        &self.bindings
    }

    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.name.as_str()).collect()
    }
}

fn bind(decl: &ToolDeclaration) -> Result<ToolBinding> {
    if decl.name.trim().is_empty() {
        bail!("tool declaration with empty name");
    }
    if is_finish(&decl.name) {
        return Ok(ToolBinding {
            name: FINISH_TOOL.to_string(),
            description: decl.summary().to_string(),
            params: vec![
                ParamSpec {
                    name: "return_type".to_string(),
                    kind: ParamKind::Str,
                },
                ParamSpec {
                    name: "final_answer".to_string(),
                    kind: ParamKind::Str,
                },
            ],
        });
    }

    let mut params = Vec::with_capacity(decl.parameters.properties.len());
    for (param_name, schema) in &decl.parameters.properties {
        if param_name.contains(' ') || param_name.contains('-') {
            bail!(
                "tool '{}': parameter '{}' is not a valid argument name",
                decl.name,
                param_name
            );
        }
        let raw_type = schema
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("tool '{}': parameter '{}' has no type", decl.name, param_name))?;
        let kind = ParamKind::from_json_type(raw_type).ok_or_else(|| {
            anyhow!(
                "tool '{}': parameter '{}' has unsupported type '{}'",
                decl.name,
                param_name,
                raw_type
            )
        })?;
        params.push(ParamSpec {
            name: param_name.clone(),
            kind,
        });
    }

    Ok(ToolBinding {
        name: decl.name.clone(),
        description: decl.summary().to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declarations() -> Vec<ToolDeclaration> {
        serde_json::from_value(json!([
            {
                "name": "search",
                "description": "Web search. The description of this function is: Search the web.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "limit": {"type": "integer"}
                    },
                    "required": ["query"]
                }
            },
            {"name": "Finish_tool", "description": "", "parameters": {}}
        ]))
        .expect("declarations")
    }

    #[test]
    fn registry_keeps_declaration_order_and_normalizes_finish() {
        let registry = ToolRegistry::from_declarations(&declarations()).expect("registry");
        assert_eq!(registry.names(), vec!["search", "Finish"]);

        let search = registry.get("search").expect("search");
        let names: Vec<&str> = search.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["query", "limit"]);
        assert_eq!(search.description, "Search the web.");

        let finish = registry.get("Finish").expect("finish");
        assert_eq!(finish.code_signature(), "Finish(return_type: str, final_answer: str)");
    }

    #[test]
    fn registry_rejects_dashed_parameter_names() {
        let decls: Vec<ToolDeclaration> = serde_json::from_value(json!([{
            "name": "lookup",
            "parameters": {"properties": {"user-id": {"type": "string"}}}
        }]))
        .expect("decls");
        let err = ToolRegistry::from_declarations(&decls).expect_err("dash");
        assert!(err.to_string().contains("user-id"));
    }

    #[test]
    fn registry_rejects_unknown_parameter_types() {
        let decls: Vec<ToolDeclaration> = serde_json::from_value(json!([{
            "name": "lookup",
            "parameters": {"properties": {"ids": {"type": "array"}}}
        }]))
        .expect("decls");
        assert!(ToolRegistry::from_declarations(&decls).is_err());
    }

    #[test]
    fn pack_arguments_maps_positional_then_keyword() {
        let registry = ToolRegistry::from_declarations(&declarations()).expect("registry");
        let search = registry.get("search").expect("search");
        let packed = search
            .pack_arguments(vec![json!("rust")], vec![("limit".to_string(), json!(3))])
            .expect("pack");
        assert_eq!(Value::Object(packed), json!({"query": "rust", "limit": 3}));
    }

    #[test]
    fn pack_arguments_rejects_duplicates_and_extra_positionals() {
        let registry = ToolRegistry::from_declarations(&declarations()).expect("registry");
        let search = registry.get("search").expect("search");

        let err = search
            .pack_arguments(vec![json!("a")], vec![("query".to_string(), json!("b"))])
            .expect_err("duplicate");
        assert_eq!(err, "Duplicated argument name: query");

        let err = search
            .pack_arguments(vec![json!(1), json!(2), json!(3)], Vec::new())
            .expect_err("too many");
        assert!(err.contains("takes 2 positional arguments but 3 were given"));
    }
}
