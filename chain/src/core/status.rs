//! Status-code taxonomy shared with the environment collaborator.
//!
//! Numeric values are owned by the environment, so they are configuration.
//! The driver only distinguishes success, hallucinated tool names, and the
//! give-up signal; every other code is an ordinary tool failure.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Function name written into history when the model calls a tool that does not exist.
pub const HALLUCINATED_NAME_SENTINEL: &str = "invalid_hallucination_function_name";

/// Tool name the model calls to abandon the current attempt.
pub const GIVE_UP_ACTION: &str = "give_up_and_restart";

/// Configured status values (TOML `[status]` table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusCodes {
    pub success: i32,
    /// The model named a tool that is not declared.
    pub hallucinated_name: i32,
    /// Arguments or scriptlet text could not be parsed.
    pub invalid_input: i32,
    /// The model (or environment) asked to give up and restart.
    pub give_up: i32,
    /// A scriptlet exceeded its wall-clock budget.
    pub timeout: i32,
    /// A tool backend could not be reached.
    pub transport_error: i32,
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            success: 0,
            hallucinated_name: 1,
            invalid_input: 2,
            give_up: 4,
            timeout: 5,
            transport_error: 12,
        }
    }
}

/// Driver-relevant reading of a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    HallucinatedName,
    GiveUp,
    Failure,
}

impl StatusCodes {
    pub fn classify(&self, code: i32) -> StatusClass {
        if code == self.success {
            StatusClass::Success
        } else if code == self.give_up {
            StatusClass::GiveUp
        } else if code == self.hallucinated_name {
            StatusClass::HallucinatedName
        } else {
            StatusClass::Failure
        }
    }

    /// The three structurally significant codes must be distinct, and every
    /// failure code must differ from success.
    pub fn validate(&self) -> Result<()> {
        let significant = [self.success, self.hallucinated_name, self.give_up];
        if significant[0] == significant[1]
            || significant[0] == significant[2]
            || significant[1] == significant[2]
        {
            return Err(anyhow!(
                "status.success, status.hallucinated_name and status.give_up must be distinct"
            ));
        }
        for (field, code) in [
            ("invalid_input", self.invalid_input),
            ("timeout", self.timeout),
            ("transport_error", self.transport_error),
        ] {
            if code == self.success {
                return Err(anyhow!("status.{field} must differ from status.success"));
            }
        }
        Ok(())
    }
}
