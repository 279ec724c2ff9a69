//! Workflow state persistence.
//!
//! State lives at `<wd>/.orchestrator/v4/state_<workflow_id>.json`, guarded
//! by a sibling `.lock` file held with a cross-process exclusive
//! non-blocking lock. A second process attempting the same workflow fails
//! fast; re-attempting is the caller's decision. Writes are atomic
//! (tmp + rename), and a `.gitignore` shields the state directory from the
//! repository.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::gates::GateResult;
use crate::model::types::WorkflowId;

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Workflow execution status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// True for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// PhaseExecution
// ---------------------------------------------------------------------------

/// One attempt at one phase, kept as history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `running`, `passed`, or `failed`.
    pub status: String,
    pub output_summary: Option<String>,
    #[serde(default)]
    pub gate_results: Vec<GateResult>,
}

impl PhaseExecution {
    #[must_use]
    pub fn start(phase_id: &str, attempt: u32) -> Self {
        Self {
            phase_id: phase_id.to_owned(),
            attempt,
            started_at: Utc::now(),
            completed_at: None,
            status: "running".to_owned(),
            output_summary: None,
            gate_results: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: &str) {
        self.status = status.to_owned();
        self.completed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Persistent state of one workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub task_description: String,
    pub status: WorkflowStatus,
    pub current_phase_id: Option<String>,
    pub current_attempt: u32,
    /// Completed phase ids, in completion order.
    pub phases_completed: Vec<String>,
    /// Full attempt history.
    pub phase_executions: Vec<PhaseExecution>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    #[must_use]
    pub fn new(workflow_name: &str, task_description: &str) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: WorkflowId::generate(),
            workflow_name: workflow_name.to_owned(),
            task_description: task_description.to_owned(),
            status: WorkflowStatus::Initialized,
            current_phase_id: None,
            current_attempt: 0,
            phases_completed: Vec::new(),
            phase_executions: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True once the workflow has reached a terminal status.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Manages state files and the cross-process lock for one workflow at a
/// time.
#[derive(Debug)]
pub struct StateStore {
    state_dir: PathBuf,
    state: Option<WorkflowState>,
    lock_handle: Option<File>,
}

impl StateStore {
    /// Create a store rooted at `working_dir`.
    #[must_use]
    pub fn new(working_dir: &Path) -> Self {
        Self {
            state_dir: working_dir.join(".orchestrator").join("v4"),
            state: None,
            lock_handle: None,
        }
    }

    fn ensure_dir(&self) -> Result<(), OrchestratorError> {
        fs::create_dir_all(&self.state_dir)?;
        let gitignore = self.state_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }
        Ok(())
    }

    fn state_file(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.state_dir.join(format!("state_{workflow_id}.json"))
    }

    fn lock_file(&self, workflow_id: &WorkflowId) -> PathBuf {
        self.state_dir.join(format!("state_{workflow_id}.lock"))
    }

    /// Try to take the exclusive lock for a workflow.
    ///
    /// Returns `false` when another process holds it — the caller decides
    /// whether to retry.
    ///
    /// # Errors
    /// Returns an I/O error if the lock file cannot be created.
    pub fn acquire_lock(&mut self, workflow_id: &WorkflowId) -> Result<bool, OrchestratorError> {
        self.ensure_dir()?;
        let handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.lock_file(workflow_id))?;
        if handle.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        self.lock_handle = Some(handle);
        Ok(true)
    }

    /// Release the lock, if held.
    pub fn release_lock(&mut self) {
        if let Some(handle) = self.lock_handle.take() {
            let _ = FileExt::unlock(&handle);
        }
    }

    /// Create and persist a fresh workflow state, taking its lock.
    ///
    /// # Errors
    /// Returns an error if the lock cannot be acquired or the state cannot
    /// be written.
    pub fn initialize(
        &mut self,
        workflow_name: &str,
        task_description: &str,
    ) -> Result<WorkflowState, OrchestratorError> {
        self.ensure_dir()?;
        let state = WorkflowState::new(workflow_name, task_description);
        if !self.acquire_lock(&state.workflow_id)? {
            return Err(OrchestratorError::database(format!(
                "workflow '{}' is locked by another process",
                state.workflow_id
            )));
        }
        self.state = Some(state.clone());
        self.save()?;
        Ok(state)
    }

    /// Load an existing workflow's state, taking its lock.
    ///
    /// # Errors
    /// Returns an error when the state file is missing, unparsable, or
    /// locked by another process.
    pub fn load(&mut self, workflow_id: &WorkflowId) -> Result<WorkflowState, OrchestratorError> {
        let path = self.state_file(workflow_id);
        if !path.exists() {
            return Err(OrchestratorError::database(format!(
                "no state file for workflow '{workflow_id}'"
            )));
        }
        if !self.acquire_lock(workflow_id)? {
            return Err(OrchestratorError::database(format!(
                "workflow '{workflow_id}' is locked by another process"
            )));
        }
        let content = fs::read_to_string(&path)?;
        let state: WorkflowState =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::Config {
                path,
                detail: format!("corrupt state file: {e}"),
            })?;
        self.state = Some(state.clone());
        Ok(state)
    }

    /// The loaded state.
    ///
    /// # Errors
    /// Returns an error when nothing has been initialized or loaded.
    pub fn state(&self) -> Result<&WorkflowState, OrchestratorError> {
        self.state
            .as_ref()
            .ok_or_else(|| OrchestratorError::database("no workflow state loaded"))
    }

    fn state_mut(&mut self) -> Result<&mut WorkflowState, OrchestratorError> {
        self.state
            .as_mut()
            .ok_or_else(|| OrchestratorError::database("no workflow state loaded"))
    }

    /// Persist the current state atomically and bump `updated_at`.
    ///
    /// # Errors
    /// Returns an error when nothing is loaded or the write fails.
    pub fn save(&mut self) -> Result<(), OrchestratorError> {
        let state = self.state_mut()?;
        state.updated_at = Utc::now();
        let state = state.clone();
        let path = self.state_file(&state.workflow_id);
        let tmp = path.with_extension("tmp");
        let pretty = serde_json::to_string_pretty(&state)
            .map_err(|e| OrchestratorError::database(format!("state serialization failed: {e}")))?;
        fs::write(&tmp, pretty)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Record that a phase attempt is starting.
    ///
    /// # Errors
    /// Returns an error if the save fails.
    pub fn update_phase(&mut self, phase_id: &str, attempt: u32) -> Result<(), OrchestratorError> {
        {
            let state = self.state_mut()?;
            state.current_phase_id = Some(phase_id.to_owned());
            state.current_attempt = attempt;
            state.status = WorkflowStatus::Running;
        }
        self.save()
    }

    /// Record a phase execution in the history.
    ///
    /// # Errors
    /// Returns an error if the save fails.
    pub fn record_execution(
        &mut self,
        execution: PhaseExecution,
    ) -> Result<(), OrchestratorError> {
        self.state_mut()?.phase_executions.push(execution);
        self.save()
    }

    /// Mark a phase completed.
    ///
    /// # Errors
    /// Returns an error if the save fails.
    pub fn complete_phase(&mut self, phase_id: &str) -> Result<(), OrchestratorError> {
        {
            let state = self.state_mut()?;
            if !state.phases_completed.iter().any(|p| p == phase_id) {
                state.phases_completed.push(phase_id.to_owned());
            }
            state.current_attempt = 0;
        }
        self.save()
    }

    /// Move the workflow to its terminal status.
    ///
    /// # Errors
    /// Returns an error if the save fails.
    pub fn mark_complete(&mut self, success: bool) -> Result<(), OrchestratorError> {
        {
            let state = self.state_mut()?;
            state.status = if success {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            state.completed_at = Some(Utc::now());
            state.current_phase_id = None;
        }
        self.save()
    }

    /// Release the lock. Always called when a run ends, success or not.
    pub fn cleanup(&mut self) {
        self.release_lock();
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        self.release_lock();
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Find a non-terminal workflow in a working directory, if any.
#[must_use]
pub fn find_active_workflow(working_dir: &Path) -> Option<WorkflowId> {
    let state_dir = working_dir.join(".orchestrator").join("v4");
    let entries = fs::read_dir(state_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("state_") || !name.ends_with(".json") {
            continue;
        }
        let Ok(content) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let Ok(state) = serde_json::from_str::<WorkflowState>(&content) else {
            continue;
        };
        if !state.status.is_terminal() {
            return Some(state.workflow_id);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_creates_state_file_and_gitignore() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        let state = store.initialize("wf", "do the thing").unwrap();

        let state_dir = dir.path().join(".orchestrator/v4");
        assert!(state_dir.join(format!("state_{}.json", state.workflow_id)).exists());
        assert_eq!(
            std::fs::read_to_string(state_dir.join(".gitignore")).unwrap(),
            "*\n"
        );
        assert_eq!(state.status, WorkflowStatus::Initialized);
    }

    #[test]
    fn save_is_atomic_and_pretty_printed() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        let state = store.initialize("wf", "task").unwrap();
        let path = dir
            .path()
            .join(".orchestrator/v4")
            .join(format!("state_{}.json", state.workflow_id));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains('\n'));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn second_store_cannot_lock_same_workflow() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        let state = store.initialize("wf", "task").unwrap();

        let mut other = StateStore::new(dir.path());
        assert!(!other.acquire_lock(&state.workflow_id).unwrap());

        // After cleanup the lock becomes available.
        store.cleanup();
        assert!(other.acquire_lock(&state.workflow_id).unwrap());
    }

    #[test]
    fn load_round_trips_state() {
        let dir = TempDir::new().unwrap();
        let workflow_id = {
            let mut store = StateStore::new(dir.path());
            let state = store.initialize("wf", "task").unwrap();
            store.update_phase("plan", 1).unwrap();
            store.complete_phase("plan").unwrap();
            store.cleanup();
            state.workflow_id
        };

        let mut store = StateStore::new(dir.path());
        let state = store.load(&workflow_id).unwrap();
        assert_eq!(state.workflow_name, "wf");
        assert_eq!(state.phases_completed, vec!["plan".to_owned()]);
        assert_eq!(state.status, WorkflowStatus::Running);
    }

    #[test]
    fn mark_complete_sets_terminal_fields() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        store.initialize("wf", "task").unwrap();
        store.mark_complete(false).unwrap();
        let state = store.state().unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.completed_at.is_some());
        assert!(state.current_phase_id.is_none());
    }

    #[test]
    fn complete_phase_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        store.initialize("wf", "task").unwrap();
        store.complete_phase("p1").unwrap();
        store.complete_phase("p1").unwrap();
        assert_eq!(store.state().unwrap().phases_completed, vec!["p1".to_owned()]);
    }

    #[test]
    fn find_active_workflow_skips_terminal() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        store.initialize("wf", "task").unwrap();
        store.mark_complete(true).unwrap();
        store.cleanup();
        assert!(find_active_workflow(dir.path()).is_none());

        let mut store = StateStore::new(dir.path());
        let state = store.initialize("wf2", "task").unwrap();
        store.update_phase("p1", 1).unwrap();
        store.cleanup();
        assert_eq!(find_active_workflow(dir.path()), Some(state.workflow_id));
    }

    #[test]
    fn load_missing_workflow_errors() {
        let dir = TempDir::new().unwrap();
        let mut store = StateStore::new(dir.path());
        let ghost = WorkflowId::generate();
        assert!(store.load(&ghost).is_err());
    }
}
