//! Marker-based action protocols.
//!
//! Two textual grammars are supported:
//!
//! - structured call: `Thought: ...\nAction: name\nAction Input: {json}`
//! - code: `Thought: ...\nCode: <scriptlet>\nEnd Action` (`Action:` is accepted
//!   in place of `Code:`)
//!
//! Markers are matched literally, first occurrence wins, and a missing
//! following marker means the field runs to the end of the input.

use serde_json::{Map, Value};

use crate::core::script::parse_program;
use crate::core::tools::ToolRegistry;
use crate::core::types::ParsedAction;

pub const THOUGHT_MARKER: &str = "Thought: ";
pub const ACTION_MARKER: &str = "\nAction: ";
pub const ACTION_INPUT_MARKER: &str = "\nAction Input: ";
pub const CODE_THOUGHT_MARKER: &str = "Thought:";
pub const CODE_MARKERS: [&str; 2] = ["Code:", "Action:"];
pub const END_ACTION_MARKER: &str = "\nEnd Action";

/// Action name produced when a scriptlet is not a single well-formed call.
pub const SYNTAX_ERROR_ACTION: &str = "SyntaxError";

/// Fields of a structured-call completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactParts {
    pub thought: String,
    pub action: String,
    pub action_input: String,
}

/// Fields of a code-protocol completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeParts {
    pub thought: String,
    pub code: String,
}

/// Split a structured-call completion into thought, action name and input.
pub fn react_split(text: &str) -> ReactParts {
    let thought_start = after_marker(text, THOUGHT_MARKER, 0).unwrap_or(0);
    // "Action: " without its leading newline, for a completion that opens
    // with the action line.
    let action_marker = &ACTION_MARKER[1..];
    let thought_end = match find_from(text, ACTION_MARKER, thought_start) {
        Some(idx) => idx,
        None if text[thought_start..].trim_start().starts_with(action_marker) => thought_start,
        None => text.len(),
    };
    let thought = &text[thought_start..thought_end];

    let (action, action_input) = match after_marker(text, action_marker, thought_end) {
        Some(action_start) => {
            let action_end =
                find_from(text, ACTION_INPUT_MARKER, action_start).unwrap_or(text.len());
            let input = match after_marker(text, &ACTION_INPUT_MARKER[1..], action_end) {
                Some(input_start) => &text[input_start..],
                None => "",
            };
            (&text[action_start..action_end], input)
        }
        None => ("", ""),
    };

    ReactParts {
        thought: thought.trim().to_string(),
        action: action.trim().to_string(),
        action_input: action_input.trim().to_string(),
    }
}

/// Split a code-protocol completion into thought and scriptlet.
pub fn code_split(text: &str) -> CodeParts {
    let thought_start = after_marker(text, CODE_THOUGHT_MARKER, 0).unwrap_or(0);
    let code_marker = CODE_MARKERS
        .iter()
        .filter_map(|marker| find_from(text, marker, thought_start).map(|idx| (idx, *marker)))
        .min_by_key(|(idx, _)| *idx);

    let (thought, code) = match code_marker {
        Some((idx, marker)) => {
            let code_start = idx + marker.len();
            let code_end = find_from(text, END_ACTION_MARKER, code_start).unwrap_or(text.len());
            (&text[thought_start..idx], &text[code_start..code_end])
        }
        None => (&text[thought_start..], ""),
    };

    CodeParts {
        thought: thought.trim().to_string(),
        code: unwrap_fence(code.trim()).to_string(),
    }
}

/// Read a scriptlet as a single call to a tool, extracting literal arguments.
///
/// Positional arguments are named by the tool's declared parameter order
/// (ignored for undeclared names, which the environment reports). Anything
/// other than one call with literal arguments yields the [`SYNTAX_ERROR_ACTION`]
/// sentinel carrying the raw code.
pub fn parse_code_call(code: &str, registry: &ToolRegistry) -> ParsedAction {
    try_parse_code_call(code, registry).unwrap_or_else(|_| syntax_error_action(code))
}

/// Sentinel action wrapping unparsable scriptlet text.
pub fn syntax_error_action(code: &str) -> ParsedAction {
    let mut arguments = Map::new();
    arguments.insert("raw_code".to_string(), Value::String(code.to_string()));
    ParsedAction {
        name: SYNTAX_ERROR_ACTION.to_string(),
        arguments: Value::Object(arguments).to_string(),
    }
}

fn try_parse_code_call(code: &str, registry: &ToolRegistry) -> Result<ParsedAction, String> {
    let program = parse_program(code).map_err(|err| err.to_string())?;
    let call = program
        .single_call()
        .ok_or_else(|| "expected exactly one call expression".to_string())?;

    let mut arguments = Map::new();
    if let Some(binding) = registry.get(&call.callee) {
        if call.args.len() > binding.params.len() {
            return Err(format!("too many positional arguments for {}", call.callee));
        }
        for (param, arg) in binding.params.iter().zip(&call.args) {
            let value = arg
                .as_literal()
                .ok_or_else(|| format!("argument '{}' is not a literal", param.name))?;
            arguments.insert(param.name.clone(), value);
        }
    }
    for (key, arg) in &call.kwargs {
        let value = arg
            .as_literal()
            .ok_or_else(|| format!("argument '{key}' is not a literal"))?;
        arguments.insert(key.clone(), value);
    }

    Ok(ParsedAction {
        name: call.callee.clone(),
        arguments: Value::Object(arguments).to_string(),
    })
}

fn find_from(text: &str, marker: &str, from: usize) -> Option<usize> {
    text.get(from..)?.find(marker).map(|idx| from + idx)
}

fn after_marker(text: &str, marker: &str, from: usize) -> Option<usize> {
    find_from(text, marker, from).map(|idx| idx + marker.len())
}

fn unwrap_fence(code: &str) -> &str {
    let Some(rest) = code.strip_prefix("```") else {
        return code;
    };
    // Drop the info string (e.g. "python") on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
