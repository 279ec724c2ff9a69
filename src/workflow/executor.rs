//! The deterministic workflow executor.
//!
//! The orchestrator owns the loop; the agent executes within bounds. Per
//! phase, the executor calls the runner, then validates the phase's gates
//! itself — the runner's `success` claim gets an attempt recorded but never
//! advances a phase on its own. The agent cannot skip phases, self-declare
//! completion, or bypass gate validation.
//!
//! A terminal `mark_complete` and the lock-releasing `cleanup` run on every
//! exit path, including unexpected errors.

use std::time::Instant;

use crate::error::OrchestratorError;
use crate::gates::{self, GateEngine, GateStatus};
use crate::model::types::WorkflowId;

use super::runner::{AgentRunner, PhaseInput};
use super::spec::{PhaseSpec, WorkflowSpec};
use super::state::{PhaseExecution, StateStore, WorkflowStatus};

// ---------------------------------------------------------------------------
// WorkflowResult
// ---------------------------------------------------------------------------

/// Final outcome of a workflow run.
#[derive(Clone, Debug)]
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub phases_completed: Vec<String>,
    pub total_duration_seconds: f64,
    pub error_message: Option<String>,
    pub summary: Option<String>,
}

impl WorkflowResult {
    /// True when the workflow completed all phases.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, WorkflowStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Drives a workflow spec to completion.
pub struct WorkflowExecutor<R: AgentRunner> {
    spec: WorkflowSpec,
    runner: R,
    state_store: StateStore,
    gate_engine: GateEngine,
}

impl<R: AgentRunner> WorkflowExecutor<R> {
    /// Assemble an executor.
    #[must_use]
    pub const fn new(
        spec: WorkflowSpec,
        runner: R,
        state_store: StateStore,
        gate_engine: GateEngine,
    ) -> Self {
        Self {
            spec,
            runner,
            state_store,
            gate_engine,
        }
    }

    /// The runner driving this executor (primarily for inspection in
    /// tests).
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute the workflow from its first phase.
    pub fn run(&mut self, task_description: &str) -> WorkflowResult {
        let start = Instant::now();

        let state = match self.state_store.initialize(&self.spec.name, task_description) {
            Ok(state) => state,
            Err(err) => {
                return WorkflowResult {
                    workflow_id: WorkflowId::generate(),
                    status: WorkflowStatus::Failed,
                    phases_completed: Vec::new(),
                    total_duration_seconds: start.elapsed().as_secs_f64(),
                    error_message: Some(format!("failed to initialize state: {err}")),
                    summary: None,
                };
            }
        };
        let workflow_id = state.workflow_id.clone();

        tracing::info!(
            workflow = %self.spec.name,
            id = %workflow_id,
            task = task_description,
            "starting workflow"
        );

        let first = self.spec.first_phase().map(|p| p.id.clone());
        let result = self.drive(&workflow_id, first, start);
        self.state_store.cleanup();
        result
    }

    /// Resume a paused or interrupted workflow from its current phase.
    pub fn resume(&mut self, workflow_id: &WorkflowId) -> WorkflowResult {
        let start = Instant::now();

        let state = match self.state_store.load(workflow_id) {
            Ok(state) => state,
            Err(err) => {
                return WorkflowResult {
                    workflow_id: workflow_id.clone(),
                    status: WorkflowStatus::Failed,
                    phases_completed: Vec::new(),
                    total_duration_seconds: start.elapsed().as_secs_f64(),
                    error_message: Some(format!("cannot resume: {err}")),
                    summary: None,
                };
            }
        };

        if state.is_complete() {
            self.state_store.cleanup();
            return WorkflowResult {
                workflow_id: workflow_id.clone(),
                status: state.status,
                phases_completed: state.phases_completed,
                total_duration_seconds: 0.0,
                error_message: None,
                summary: Some("workflow already complete".to_owned()),
            };
        }

        tracing::info!(
            workflow = %state.workflow_name,
            id = %workflow_id,
            phase = ?state.current_phase_id,
            "resuming workflow"
        );

        let current = state
            .current_phase_id
            .clone()
            .or_else(|| self.spec.first_phase().map(|p| p.id.clone()));
        let result = self.drive(workflow_id, current, start);
        self.state_store.cleanup();
        result
    }

    /// The main loop. Any unexpected error marks the workflow failed — the
    /// terminal transition is not optional.
    fn drive(
        &mut self,
        workflow_id: &WorkflowId,
        first_phase: Option<String>,
        start: Instant,
    ) -> WorkflowResult {
        let mut current = first_phase.and_then(|id| self.spec.phase(&id).cloned());

        while let Some(phase) = current {
            let passed = match self.execute_phase(&phase) {
                Ok(passed) => passed,
                Err(err) => {
                    tracing::error!(phase = %phase.id, error = %err, "unexpected executor error");
                    let _ = self.state_store.mark_complete(false);
                    return self.result(workflow_id, start, Some(format!("unexpected error: {err}")));
                }
            };

            if passed {
                if let Err(err) = self.state_store.complete_phase(&phase.id) {
                    let _ = self.state_store.mark_complete(false);
                    return self.result(workflow_id, start, Some(format!("state save failed: {err}")));
                }
                current = self.spec.next_phase(&phase.id).cloned();
            } else {
                let _ = self.state_store.mark_complete(false);
                return self.result(
                    workflow_id,
                    start,
                    Some(format!(
                        "phase '{}' failed after {} attempt(s)",
                        phase.id, phase.max_attempts
                    )),
                );
            }
        }

        let _ = self.state_store.mark_complete(true);
        tracing::info!(id = %workflow_id, "workflow completed");
        self.result(workflow_id, start, None)
    }

    /// Execute one phase with retries. `Ok(true)` advances, `Ok(false)`
    /// fails the workflow.
    fn execute_phase(&mut self, phase: &PhaseSpec) -> Result<bool, OrchestratorError> {
        let mut retry_feedback = String::new();

        for attempt in 1..=phase.max_attempts {
            tracing::info!(
                phase = %phase.id,
                attempt,
                max = phase.max_attempts,
                "running phase attempt"
            );
            self.state_store.update_phase(&phase.id, attempt)?;

            let mut execution = PhaseExecution::start(&phase.id, attempt);
            let state = self.state_store.state()?;
            let input = PhaseInput {
                phase_id: phase.id.clone(),
                phase_name: phase.name.clone(),
                task_description: state.task_description.clone(),
                phase_description: phase.description.clone(),
                phases_completed: state.phases_completed.clone(),
                workflow_name: self.spec.name.clone(),
                attempt,
                is_retry: attempt > 1,
                retry_feedback: retry_feedback.clone(),
            };

            let output = match self.runner.run_phase(&input) {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(phase = %phase.id, error = %err, "runner failed");
                    execution.finish("failed");
                    execution.output_summary = Some(format!("runner error: {err}"));
                    self.state_store.record_execution(execution)?;
                    if matches!(phase.on_failure, super::spec::OnFailure::Abort) {
                        return Ok(false);
                    }
                    continue;
                }
            };
            execution.output_summary = Some(output.summary.clone());

            if !output.success {
                tracing::info!(
                    phase = %phase.id,
                    error = ?output.error_message,
                    "phase execution reported failure"
                );
                execution.finish("failed");
                self.state_store.record_execution(execution)?;
                if matches!(phase.on_failure, super::spec::OnFailure::Abort) {
                    return Ok(false);
                }
                continue;
            }

            // The gates decide, not the runner.
            let results = self.gate_engine.validate_all(&phase.gates);
            execution.gate_results.clone_from(&results);

            if gates::all_passed(&results) {
                tracing::info!(phase = %phase.id, "all gates passed");
                execution.finish("passed");
                self.state_store.record_execution(execution)?;
                return Ok(true);
            }

            let failed: Vec<String> = results
                .iter()
                .filter(|r| r.status == GateStatus::Failed)
                .map(|r| {
                    format!(
                        "- {}: {}",
                        r.gate_type,
                        r.reason.as_deref().unwrap_or("failed")
                    )
                })
                .collect();
            tracing::info!(phase = %phase.id, failed = failed.len(), "gates failed");
            retry_feedback = failed.join("\n");
            execution.finish("failed");
            self.state_store.record_execution(execution)?;

            if matches!(phase.on_failure, super::spec::OnFailure::Abort) {
                return Ok(false);
            }
        }

        tracing::warn!(phase = %phase.id, "phase failed after max attempts");
        Ok(false)
    }

    fn result(
        &self,
        workflow_id: &WorkflowId,
        start: Instant,
        error_message: Option<String>,
    ) -> WorkflowResult {
        let (status, phases_completed) = self.state_store.state().map_or(
            (WorkflowStatus::Failed, Vec::new()),
            |state| (state.status, state.phases_completed.clone()),
        );
        let summary = if error_message.is_none() {
            Some(format!(
                "successfully completed {} phase(s)",
                phases_completed.len()
            ))
        } else {
            None
        };
        WorkflowResult {
            workflow_id: workflow_id.clone(),
            status,
            phases_completed,
            total_duration_seconds: start.elapsed().as_secs_f64(),
            error_message,
            summary,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::GateSpec;
    use crate::workflow::runner::PhaseOutput;
    use crate::workflow::spec::parse_workflow_str;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Runner that always claims success and counts its calls; optionally
    /// creates files as a side effect.
    struct ScriptedRunner {
        calls: RefCell<u32>,
        create_file: Option<std::path::PathBuf>,
    }

    impl ScriptedRunner {
        fn succeeding() -> Self {
            Self {
                calls: RefCell::new(0),
                create_file: None,
            }
        }

        fn creating(path: std::path::PathBuf) -> Self {
            Self {
                calls: RefCell::new(0),
                create_file: Some(path),
            }
        }
    }

    impl AgentRunner for ScriptedRunner {
        fn run_phase(&self, _input: &PhaseInput) -> Result<PhaseOutput, OrchestratorError> {
            *self.calls.borrow_mut() += 1;
            if let Some(path) = &self.create_file {
                std::fs::write(path, "made by agent").unwrap();
            }
            Ok(PhaseOutput {
                success: true,
                summary: "done".to_owned(),
                error_message: None,
            })
        }
    }

    fn executor_for(
        dir: &TempDir,
        yaml: &str,
        runner: ScriptedRunner,
    ) -> WorkflowExecutor<ScriptedRunner> {
        let spec = parse_workflow_str(yaml).unwrap();
        let state_store = StateStore::new(dir.path());
        let gate_engine = GateEngine::new(dir.path().to_path_buf());
        WorkflowExecutor::new(spec, runner, state_store, gate_engine)
    }

    /// The runner claims success but never creates the gated file: the
    /// workflow must fail on the gate, not the claim.
    #[test]
    fn gate_validated_by_code_not_agent() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n    max_attempts: 1\n    gates:\n      - type: file_exists\n        path: required.txt\n";
        let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());

        let result = executor.run("make required.txt");
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(!dir.path().join("required.txt").exists());
        assert!(result.error_message.unwrap().contains("p1"));
    }

    /// Three trivial phases: completed in spec order, runner called exactly
    /// three times, state file terminal.
    #[test]
    fn phase_order_enforced() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n  - id: p2\n  - id: p3\n";
        let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());

        let result = executor.run("do it");
        assert!(result.is_success());
        assert_eq!(
            result.phases_completed,
            vec!["p1".to_owned(), "p2".to_owned(), "p3".to_owned()]
        );
        assert_eq!(*executor.runner.calls.borrow(), 3);
    }

    /// A runner that actually satisfies the gate advances the phase.
    #[test]
    fn satisfied_gate_advances() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n    gates:\n      - type: file_exists\n        path: out.txt\n";
        let target = dir.path().join("out.txt");
        let mut executor = executor_for(&dir, yaml, ScriptedRunner::creating(target));

        let result = executor.run("create out.txt");
        assert!(result.is_success());
        assert_eq!(result.phases_completed, vec!["p1".to_owned()]);
    }

    /// Failed gates retry up to max_attempts with feedback, then fail.
    #[test]
    fn retries_then_fails_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n    max_attempts: 3\n    gates:\n      - type: file_exists\n        path: never.txt\n";
        let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());

        let result = executor.run("task");
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(*executor.runner.calls.borrow(), 3);
    }

    /// Resume picks up from the stored current phase.
    #[test]
    fn resume_completed_workflow_reports_complete() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n";
        let workflow_id = {
            let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());
            executor.run("task").workflow_id
        };

        let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());
        let result = executor.resume(&workflow_id);
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.summary.as_deref(), Some("workflow already complete"));
        // The runner was not consulted again.
        assert_eq!(*executor.runner.calls.borrow(), 0);
    }

    #[test]
    fn mark_complete_recorded_on_failure() {
        let dir = TempDir::new().unwrap();
        let yaml = "name: w\nphases:\n  - id: p1\n    max_attempts: 1\n    gates:\n      - type: file_exists\n        path: never.txt\n";
        let workflow_id = {
            let mut executor = executor_for(&dir, yaml, ScriptedRunner::succeeding());
            executor.run("task").workflow_id
        };

        // The persisted state is terminal: a fresh store can lock and load it.
        let mut store = StateStore::new(dir.path());
        let state = store.load(&workflow_id).unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.completed_at.is_some());
    }
}
