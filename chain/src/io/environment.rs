//! Contract for the tool-execution environment the loop acts on.

use std::time::Instant;

use serde_json::Value;

/// Result of invoking one tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub observation: String,
    pub status: i32,
}

impl StepOutcome {
    pub fn new(observation: impl Into<String>, status: i32) -> Self {
        Self {
            observation: observation.into(),
            status,
        }
    }
}

/// Stateful tool environment.
///
/// Every tree node owns its own snapshot, so `Clone` must produce an
/// independent copy: stepping a clone never changes the original.
pub trait Environment: Clone + Send {
    /// Invoke `name` with JSON-encoded arguments.
    ///
    /// With a `deadline`, the call must return by then; an unfinished call
    /// reports the timeout status.
    fn step(&mut self, name: &str, arguments: &str, deadline: Option<Instant>) -> StepOutcome;

    /// Whether the task is complete in this snapshot.
    fn check_success(&self) -> bool;

    /// Serializable view of the snapshot for chain dumps.
    fn snapshot(&self) -> Option<Value> {
        None
    }
}
