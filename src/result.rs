use crate::error::{ArcaError, BuildContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Why the runner reported a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The definition file was missing keys or had the wrong types
    CorruptedDefinition,
    /// The entry point could not be imported or resolved
    Import,
    /// The callable raised
    Exception,
}

/// Outcome of one executed task. This is what the result cache stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        output: Value,
        stdout: String,
        stderr: String,
    },
    Failure {
        reason: FailureReason,
        traceback: String,
    },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            ExecutionResult::Success { output, .. } => Some(output),
            ExecutionResult::Failure { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ExecutionResult::Success { .. } => None,
            ExecutionResult::Failure { reason, .. } => Some(*reason),
        }
    }

    /// The output value, or a build error carrying the runner's traceback.
    pub fn into_output(self) -> Result<Value> {
        match self {
            ExecutionResult::Success { output, .. } => Ok(output),
            ExecutionResult::Failure { reason, traceback } => {
                let message = match reason {
                    FailureReason::CorruptedDefinition => {
                        "Task failed because the definition was corrupted."
                    }
                    FailureReason::Import => {
                        "Task failed because the entry point could not be imported"
                    }
                    FailureReason::Exception => "Task failed",
                };
                Err(ArcaError::build(message, BuildContext::with_traceback(traceback)))
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
