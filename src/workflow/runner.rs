//! Agent runner seam.
//!
//! The executor talks to the coding agent through [`AgentRunner`]. The
//! production implementation spawns an external agent binary through the
//! secure executor, handing it the phase input as a JSON file (file-based
//! hand-off keeps free-form task text away from argv validation). Tests
//! inject scripted runners.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::exec::{ExecPolicy, SecureCommand, SecureExecutor};

// ---------------------------------------------------------------------------
// PhaseInput / PhaseOutput
// ---------------------------------------------------------------------------

/// Everything an agent needs to attempt a phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseInput {
    pub phase_id: String,
    pub phase_name: String,
    pub task_description: String,
    pub phase_description: String,
    /// Phases already completed, for context.
    pub phases_completed: Vec<String>,
    pub workflow_name: String,
    pub attempt: u32,
    /// True from the second attempt on.
    pub is_retry: bool,
    /// Failed-gate reasons from the previous attempt.
    pub retry_feedback: String,
}

/// What the runner reports back. The executor treats this as a claim: the
/// gates decide whether the phase actually passed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub success: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// AgentRunner
// ---------------------------------------------------------------------------

/// A driver for one coding agent.
pub trait AgentRunner {
    /// Run one phase attempt.
    ///
    /// # Errors
    /// Returns [`OrchestratorError::Runner`] for fatal runner failures
    /// (binary missing, crash). Ordinary phase failure is a
    /// `PhaseOutput { success: false, .. }`, not an error.
    fn run_phase(&self, input: &PhaseInput) -> Result<PhaseOutput, OrchestratorError>;
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Runs an external agent binary per phase.
///
/// The phase input is written to a temp file and its path passed as
/// `--input <path>`. The binary's stdout is parsed as a [`PhaseOutput`]
/// JSON document; a zero exit with unparsable output counts as success
/// with the raw output as summary.
#[derive(Debug)]
pub struct CommandRunner {
    executor: SecureExecutor,
    binary: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    /// Create a runner for `binary`, executed inside `working_dir`.
    #[must_use]
    pub fn new(binary: impl Into<String>, working_dir: PathBuf, timeout: Duration) -> Self {
        let binary = binary.into();
        let policy = ExecPolicy::new(vec![binary.clone()]);
        Self {
            executor: SecureExecutor::new(policy),
            binary,
            working_dir,
            timeout,
        }
    }
}

impl AgentRunner for CommandRunner {
    fn run_phase(&self, input: &PhaseInput) -> Result<PhaseOutput, OrchestratorError> {
        let payload = serde_json::to_string_pretty(input)
            .map_err(|e| OrchestratorError::Runner {
                detail: format!("cannot serialize phase input: {e}"),
            })?;
        let input_file = tempfile::Builder::new()
            .prefix("phase-input-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| OrchestratorError::Runner {
                detail: format!("cannot create input file: {e}"),
            })?;
        std::fs::write(input_file.path(), payload)?;

        let cmd = SecureCommand::direct(
            self.binary.clone(),
            vec![
                "--input".to_owned(),
                input_file.path().display().to_string(),
            ],
            self.working_dir.clone(),
            self.timeout,
        );

        let output = match self.executor.run(&cmd) {
            Ok(output) => output,
            Err(OrchestratorError::Io(e)) => {
                return Err(OrchestratorError::Runner {
                    detail: format!("failed to launch '{}': {e}", self.binary),
                });
            }
            Err(OrchestratorError::Timeout { .. }) => {
                return Ok(PhaseOutput {
                    success: false,
                    summary: String::new(),
                    error_message: Some(format!(
                        "agent timed out after {}s",
                        self.timeout.as_secs()
                    )),
                });
            }
            Err(other) => return Err(other),
        };

        if let Ok(parsed) = serde_json::from_str::<PhaseOutput>(output.stdout.trim()) {
            return Ok(parsed);
        }

        Ok(PhaseOutput {
            success: output.success(),
            summary: output.stdout.trim().to_owned(),
            error_message: if output.success() {
                None
            } else {
                Some(output.stderr.trim().to_owned())
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PhaseInput {
        PhaseInput {
            phase_id: "plan".to_owned(),
            phase_name: "Planning".to_owned(),
            task_description: "build the feature".to_owned(),
            phase_description: "write a plan".to_owned(),
            phases_completed: vec![],
            workflow_name: "wf".to_owned(),
            attempt: 1,
            is_retry: false,
            retry_feedback: String::new(),
        }
    }

    #[test]
    fn missing_binary_is_runner_error() {
        let runner = CommandRunner::new(
            "definitely-not-a-real-binary-xyz",
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        let err = runner.run_phase(&input()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Runner { .. }));
    }

    #[test]
    fn phase_output_json_defaults() {
        let parsed: PhaseOutput = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(parsed.success);
        assert!(parsed.summary.is_empty());
        assert!(parsed.error_message.is_none());
    }

    #[test]
    fn phase_input_round_trips() {
        let original = input();
        let json = serde_json::to_string(&original).unwrap();
        let back: PhaseInput = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);
    }
}
