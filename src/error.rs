//! Unified error types for the orchestrator.
//!
//! Defines [`OrchestratorError`], the domain error for all orchestrator
//! operations. Error messages are designed to be operator-friendly: each
//! variant includes a clear description of what went wrong and actionable
//! guidance on how to fix it.
//!
//! Propagation policy: pipeline stages convert failures into structured
//! results (a failed gate, an escalated resolution) rather than raising;
//! only genuinely unexpected conditions travel as errors, and the workflow
//! executor and chat session catch those at their boundaries.

use std::fmt;
use std::path::PathBuf;

use crate::model::types::ValidationError;

// ---------------------------------------------------------------------------
// OrchestratorError
// ---------------------------------------------------------------------------

/// Unified error type for orchestrator operations.
///
/// Each variant is self-contained: a caller receiving this error should be
/// able to understand what happened and what to do next without additional
/// context.
#[derive(Debug)]
pub enum OrchestratorError {
    /// A security check failed: disallowed executable, shell metacharacter,
    /// unpinned container image, or sandbox misconfiguration.
    ///
    /// Always fatal to the operation; never retried.
    Security {
        /// What was rejected and why.
        reason: String,
    },

    /// A user-supplied path attempted to escape its base directory.
    ///
    /// Fatal to the gate or resolution step that triggered it.
    PathTraversal {
        /// The offending path as provided.
        path: String,
        /// Which rule it violated.
        reason: String,
    },

    /// Optimistic concurrency conflict on an event stream.
    ///
    /// The caller may reload the stream and retry.
    Concurrency {
        /// The stream that was being appended to.
        stream_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The version the stream is actually at.
        actual: u64,
    },

    /// A persistent database failure after bounded retry.
    Database {
        /// Description of the failure.
        detail: String,
    },

    /// A subprocess or LLM call exceeded its timeout.
    Timeout {
        /// What was running.
        operation: String,
        /// The timeout that expired, in seconds.
        seconds: u64,
    },

    /// A token reservation failed because the budget cannot cover it.
    BudgetExhausted {
        /// The budget that refused the reservation.
        budget_id: String,
        /// Tokens requested.
        requested: u64,
        /// Tokens available.
        available: u64,
    },

    /// The external agent runner failed fatally (binary missing, etc.).
    Runner {
        /// Description of the failure.
        detail: String,
    },

    /// An LLM provider call failed after retries.
    Llm {
        /// Description of the failure.
        detail: String,
    },

    /// A workflow definition could not be parsed or validated.
    ///
    /// Fatal before execution; includes unknown gate types and missing
    /// phase ids.
    Parse {
        /// Description of the problem.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the problem.
        detail: String,
    },

    /// An identifier failed validation.
    Validation(ValidationError),

    /// An I/O error occurred.
    Io(std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Build a [`OrchestratorError::Security`] from anything printable.
    pub fn security(reason: impl Into<String>) -> Self {
        Self::Security {
            reason: reason.into(),
        }
    }

    /// Build a [`OrchestratorError::Database`] from anything printable.
    pub fn database(detail: impl Into<String>) -> Self {
        Self::Database {
            detail: detail.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Display — operator-friendly error messages
// ---------------------------------------------------------------------------

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Security { reason } => {
                write!(
                    f,
                    "security violation: {reason}\n  This operation was refused and will not be retried."
                )
            }
            Self::PathTraversal { path, reason } => {
                write!(
                    f,
                    "path traversal rejected for '{path}': {reason}\n  Paths must stay inside the working directory and contain no traversal sequences."
                )
            }
            Self::Concurrency {
                stream_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "concurrency conflict on stream '{stream_id}': expected version {expected}, stream is at {actual}\n  To fix: reload the stream and retry the append."
                )
            }
            Self::Database { detail } => {
                write!(
                    f,
                    "database operation failed: {detail}\n  To fix: check that no other process holds the database and that the disk is writable."
                )
            }
            Self::Timeout { operation, seconds } => {
                write!(f, "{operation} timed out after {seconds}s")
            }
            Self::BudgetExhausted {
                budget_id,
                requested,
                available,
            } => {
                write!(
                    f,
                    "token budget '{budget_id}' exhausted: requested {requested}, only {available} available\n  To fix: raise the budget limit or wait for in-flight reservations to settle."
                )
            }
            Self::Runner { detail } => {
                write!(
                    f,
                    "agent runner failed: {detail}\n  To fix: check that the runner binary is installed and on PATH."
                )
            }
            Self::Llm { detail } => {
                write!(
                    f,
                    "LLM provider call failed: {detail}\n  To fix: check provider credentials and availability, then retry."
                )
            }
            Self::Parse { detail } => {
                write!(
                    f,
                    "workflow definition invalid: {detail}\n  To fix: correct the workflow YAML and re-run."
                )
            }
            Self::Config { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {}\n  To fix: edit the config file and correct the issue.",
                    path.display(),
                    detail
                )
            }
            Self::Validation(err) => write!(f, "{err}"),
            Self::Io(err) => {
                write!(
                    f,
                    "I/O error: {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database {
            detail: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
