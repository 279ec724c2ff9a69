//! Resolution event log.
//!
//! Line-delimited JSON appended to `.workflow_log.jsonl` in the working
//! directory. Each record carries a `type` (`conflict_resolved`,
//! `conflict_escalated`), an optional `workflow_id`, a human-readable
//! `message`, and structured `details`.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;

use crate::error::OrchestratorError;

/// Log file name within the working directory.
pub const LOG_FILE_NAME: &str = ".workflow_log.jsonl";

/// Appends resolution events to the jsonl log.
#[derive(Clone, Debug)]
pub struct ResolutionLogger {
    path: PathBuf,
}

impl ResolutionLogger {
    /// Create a logger writing into `working_dir`.
    #[must_use]
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(LOG_FILE_NAME),
        }
    }

    fn write_record(
        &self,
        event_type: &str,
        workflow_id: Option<&str>,
        message: &str,
        details: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let record = json!({
            "type": event_type,
            "workflow_id": workflow_id,
            "message": message,
            "details": details,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{record}")?;
        Ok(())
    }

    /// Record a successful resolution.
    ///
    /// # Errors
    /// Returns an I/O error if the append fails.
    pub fn log_resolved(
        &self,
        workflow_id: Option<&str>,
        strategy: &str,
        score: f64,
        resolution_time_ms: u64,
        files: &[String],
    ) -> Result<(), OrchestratorError> {
        self.write_record(
            "conflict_resolved",
            workflow_id,
            &format!("resolved via {strategy} (score {score:.2})"),
            json!({
                "strategy": strategy,
                "score": score,
                "resolution_time_ms": resolution_time_ms,
                "files": files,
            }),
        )
    }

    /// Record an escalation.
    ///
    /// # Errors
    /// Returns an I/O error if the append fails.
    pub fn log_escalated(
        &self,
        workflow_id: Option<&str>,
        reason: &str,
        details: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.write_record(
            "conflict_escalated",
            workflow_id,
            &format!("escalated: {reason}"),
            details,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
