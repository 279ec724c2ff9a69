//! Workflow definitions and the YAML loader.
//!
//! A workflow YAML declares `workflow.{version, name, description?,
//! enforcement, phases[]}`. Phases chain through `next` (falling back to
//! file order), and each carries a list of gates. Structural problems — a
//! missing phase `id`, an unknown gate type, an empty phase list — fail the
//! parse before anything executes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::gates::GateSpec;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How strictly a phase is enforced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    /// Cannot be skipped; every gate must pass.
    Strict,
    /// Guidance provided; some flexibility within the phase.
    #[default]
    Guided,
}

/// What happens when a phase exhausts its attempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Retry up to `max_attempts`, then fail the workflow.
    #[default]
    Retry,
    /// Fail the workflow on the first failed attempt.
    Abort,
}

// ---------------------------------------------------------------------------
// PhaseSpec
// ---------------------------------------------------------------------------

const fn default_max_attempts() -> u32 {
    3
}

const fn default_phase_timeout() -> u64 {
    3600
}

/// A single phase definition. Immutable after load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase identifier, unique within the workflow.
    pub id: String,
    /// Human-readable name (defaults to the id).
    #[serde(default)]
    pub name: String,
    /// Enforcement mode.
    #[serde(default)]
    pub phase_type: PhaseType,
    /// What the phase should accomplish.
    #[serde(default)]
    pub description: String,
    /// Post-conditions validated by the gate engine.
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    /// Explicit next phase; file order applies when absent.
    #[serde(default, rename = "next")]
    pub next_phase: Option<String>,
    /// Attempts before the phase is declared failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Phase timeout, seconds.
    #[serde(default = "default_phase_timeout")]
    pub timeout: u64,
    /// Failure handling.
    #[serde(default)]
    pub on_failure: OnFailure,
}

// ---------------------------------------------------------------------------
// EnforcementConfig
// ---------------------------------------------------------------------------

/// Which guarantees are programmatic versus discretionary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub mode: String,
    pub programmatic: Vec<String>,
    pub discretionary: Vec<String>,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            mode: "strict".to_owned(),
            programmatic: vec![
                "phase_order".to_owned(),
                "gate_validation".to_owned(),
                "workflow_completion".to_owned(),
            ],
            discretionary: vec![
                "implementation_approach".to_owned(),
                "task_ordering".to_owned(),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowSpec
// ---------------------------------------------------------------------------

/// A loaded, validated workflow definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Definition format version.
    pub version: String,
    /// Workflow name.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Enforcement configuration.
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    /// Phases in declaration order.
    pub phases: Vec<PhaseSpec>,
}

impl WorkflowSpec {
    /// The first phase.
    #[must_use]
    pub fn first_phase(&self) -> Option<&PhaseSpec> {
        self.phases.first()
    }

    /// Look up a phase by id.
    #[must_use]
    pub fn phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// The phase after `id`: its explicit `next`, or the following phase in
    /// declaration order.
    #[must_use]
    pub fn next_phase(&self, id: &str) -> Option<&PhaseSpec> {
        let current = self.phase(id)?;
        if let Some(next_id) = &current.next_phase {
            return self.phase(next_id);
        }
        let index = self.phases.iter().position(|p| p.id == id)?;
        self.phases.get(index + 1)
    }
}

// ---------------------------------------------------------------------------
// YAML loading
// ---------------------------------------------------------------------------

fn parse_error(detail: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Parse {
        detail: detail.into(),
    }
}

/// Parse a workflow definition from a YAML file.
///
/// # Errors
/// Returns [`OrchestratorError::Parse`] for a missing file, invalid YAML,
/// a missing `name`, phases without `id`, unknown gate types, or an empty
/// phase list.
pub fn parse_workflow_file(path: &Path) -> Result<WorkflowSpec, OrchestratorError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| parse_error(format!("cannot read '{}': {e}", path.display())))?;
    parse_workflow_str(&content)
}

/// Parse a workflow definition from YAML text.
///
/// Accepts both a top-level `workflow:` mapping and a flat document.
///
/// # Errors
/// Returns [`OrchestratorError::Parse`] on any structural problem.
pub fn parse_workflow_str(content: &str) -> Result<WorkflowSpec, OrchestratorError> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| parse_error(format!("invalid YAML: {e}")))?;

    let root = match document.get("workflow") {
        Some(nested) => nested.clone(),
        None => document,
    };
    let serde_yaml::Value::Mapping(_) = &root else {
        return Err(parse_error("workflow YAML must be a mapping at top level"));
    };

    if root.get("name").and_then(serde_yaml::Value::as_str).is_none() {
        return Err(parse_error("workflow missing 'name' field"));
    }

    // Validate phase ids and gate types before the typed deserialization so
    // the error names the actual problem instead of a serde tag mismatch.
    let phases = root
        .get("phases")
        .and_then(serde_yaml::Value::as_sequence)
        .ok_or_else(|| parse_error("workflow must have at least one phase"))?;
    if phases.is_empty() {
        return Err(parse_error("workflow must have at least one phase"));
    }
    for (index, phase) in phases.iter().enumerate() {
        if phase.get("id").and_then(serde_yaml::Value::as_str).is_none() {
            return Err(parse_error(format!("phase at index {index} missing 'id' field")));
        }
        if let Some(gates) = phase.get("gates").and_then(serde_yaml::Value::as_sequence) {
            for gate in gates {
                let gate_type = gate
                    .get("type")
                    .and_then(serde_yaml::Value::as_str)
                    .ok_or_else(|| parse_error("gate missing 'type' field"))?;
                if !matches!(gate_type, "file_exists" | "command" | "no_pattern" | "json_valid") {
                    return Err(parse_error(format!("unknown gate type: {gate_type}")));
                }
            }
        }
    }

    // Fill defaults serde cannot express.
    let mut root = root;
    if root.get("version").is_none() {
        if let serde_yaml::Value::Mapping(map) = &mut root {
            map.insert("version".into(), "4.0".into());
        }
    }

    let mut spec: WorkflowSpec = serde_yaml::from_value(root)
        .map_err(|e| parse_error(format!("invalid workflow structure: {e}")))?;
    for phase in &mut spec.phases {
        if phase.name.is_empty() {
            phase.name.clone_from(&phase.id);
        }
    }
    Ok(spec)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
