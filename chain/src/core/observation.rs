//! Post-processing of captured scriptlet output before it becomes an observation.

use std::sync::LazyLock;

use regex::Regex;

/// Observation used when a scriptlet produced no output at all.
pub const NO_OUTPUT: &str = "[Executed Successfully with No Output]";

/// Replacement for filesystem paths leaked into output.
pub const HIDDEN_PATH: &str = "<hidden_filepath>";

const TRUNCATION_NOTICE: &str = "\n[...truncated due to length...]\n";

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Function call .* failed with status (-?\d+): .*").expect("status regex is valid")
});

static TRACE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"File (.*)\.\w+:(\d+)").expect("trace path regex is valid"));

static ABS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s("'=])(/(?:[\w.\-]+/)+[\w.\-]+)"#).expect("path regex is valid")
});

/// Error text a failing tool wrapper raises inside a scriptlet.
pub fn tool_failure_message(name: &str, status: i32, observation: &str) -> String {
    format!("Function call {name} failed with status {status}: {observation}")
}

/// First status code embedded by a failing tool wrapper, if any.
pub fn extract_status(output: &str) -> Option<i32> {
    STATUS_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Redact local filesystem paths.
///
/// `File /srv/app/tool.py:30` becomes `File <hidden_filepath>:30`; any other
/// absolute path with at least two components becomes `<hidden_filepath>`.
/// URLs are left alone.
pub fn scrub_paths(output: &str) -> String {
    let traced = TRACE_PATH_RE.replace_all(output, format!("File {HIDDEN_PATH}:$2").as_str());
    ABS_PATH_RE
        .replace_all(&traced, format!("${{1}}{HIDDEN_PATH}").as_str())
        .into_owned()
}

/// Keep the head and tail of an over-long observation. `max_len == 0` disables
/// truncation.
pub fn truncate_middle(output: &str, max_len: usize) -> String {
    if max_len == 0 || output.chars().count() <= max_len {
        return output.to_string();
    }
    let half = max_len / 2;
    let head: String = output.chars().take(half).collect();
    let tail: Vec<char> = output.chars().rev().take(half).collect();
    let tail: String = tail.into_iter().rev().collect();
    format!("{head}{TRUNCATION_NOTICE}{tail}")
}
