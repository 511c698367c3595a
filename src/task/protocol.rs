//! Wire format between the orchestrator and the runner program.
//!
//! The runner reads a [`TaskDefinition`] from a file, executes the entry point
//! and prints exactly one JSON report on stdout.

use crate::error::{ArcaError, BuildContext, Result};
use crate::result::{ExecutionResult, FailureReason};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Part of every dependency fingerprint, so a runner change rebuilds environments.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source of the runner executed inside the target environment.
pub const RUNNER_SOURCE: &str = include_str!("runner.py");

pub const RUNNER_FILENAME: &str = "runner.py";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPointDefinition {
    pub module_name: String,
    pub object_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub version: String,
    pub entry_point: EntryPointDefinition,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RunnerReport {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    reason: Option<FailureReason>,
    #[serde(default)]
    error: Option<String>,
}

/// Turns the runner's stdout into an [`ExecutionResult`].
///
/// A report the runner produced always yields `Ok`, even when the callable
/// failed. Output that is not a report is a build error.
pub fn parse_runner_output(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> Result<ExecutionResult> {
    let text = String::from_utf8_lossy(stdout);
    let line = text
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let report: RunnerReport = serde_json::from_str(line).map_err(|e| {
        let mut context = BuildContext::from_output(stdout, stderr, exit_code);
        context.traceback = Some(format!("invalid runner output: {}", e));
        ArcaError::build(
            "The build failed (the value returned from the runner was not valid)",
            context,
        )
    })?;

    if report.success {
        Ok(ExecutionResult::Success {
            output: report.result,
            stdout: report.stdout,
            stderr: report.stderr,
        })
    } else {
        Ok(ExecutionResult::Failure {
            reason: report.reason.unwrap_or(FailureReason::Exception),
            traceback: report.error.unwrap_or_default(),
        })
    }
}
