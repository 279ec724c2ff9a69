//! Core identifier types for the orchestrator.
//!
//! Foundation newtypes used throughout the crate: workflow identifiers,
//! agent identifiers, budget identifiers, and validated VCS refs. Every
//! identifier that crosses a process boundary (state files, the event
//! store, git argv) is validated at construction so the rest of the code
//! can treat it as trusted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which identifier type failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    WorkflowId,
    AgentId,
    BudgetId,
    BranchRef,
    StreamId,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WorkflowId => "workflow id",
            Self::AgentId => "agent id",
            Self::BudgetId => "budget id",
            Self::BranchRef => "branch ref",
            Self::StreamId => "stream id",
        };
        f.write_str(name)
    }
}

/// An identifier failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Which identifier type was being validated.
    pub kind: ErrorKind,
    /// The invalid value that was provided.
    pub value: String,
    /// Why the value is invalid.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} '{}': {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

fn invalid(kind: ErrorKind, value: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError {
        kind,
        value: value.to_owned(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// WorkflowId
// ---------------------------------------------------------------------------

/// A validated workflow identifier.
///
/// Workflow ids are lowercase alphanumeric with hyphens and underscores,
/// 1–64 characters. Generated ids look like `wf-3f9a1c2e8b4d`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkflowId(String);

impl WorkflowId {
    /// The maximum length of a workflow id.
    pub const MAX_LEN: usize = 64;

    /// Create a `WorkflowId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or contains invalid
    /// characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Generate a fresh workflow id from a random UUID.
    #[must_use]
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("wf-{}", &hex[..12]))
    }

    /// Return the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() {
            return Err(invalid(ErrorKind::WorkflowId, s, "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(invalid(
                ErrorKind::WorkflowId,
                s,
                format!("must be at most {} characters, got {}", Self::MAX_LEN, s.len()),
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid(
                ErrorKind::WorkflowId,
                s,
                "must contain only lowercase alphanumerics, hyphens, and underscores",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorkflowId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<WorkflowId> for String {
    fn from(id: WorkflowId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// AgentId
// ---------------------------------------------------------------------------

/// A validated agent identifier.
///
/// Agent names are lowercase alphanumeric with hyphens, 1–64 characters.
/// Examples: `agent-1`, `feature-auth`, `bugfix-123`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId(String);

impl AgentId {
    /// The maximum length of an agent id.
    pub const MAX_LEN: usize = 64;

    /// Create an `AgentId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the name is empty, too long, or contains invalid
    /// characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the agent name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() {
            return Err(invalid(ErrorKind::AgentId, s, "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(invalid(
                ErrorKind::AgentId,
                s,
                format!("must be at most {} characters, got {}", Self::MAX_LEN, s.len()),
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid(
                ErrorKind::AgentId,
                s,
                "must contain only lowercase alphanumerics and hyphens",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AgentId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// BudgetId
// ---------------------------------------------------------------------------

/// A validated token-budget identifier.
///
/// Budget ids are alphanumeric with hyphens and underscores, 1–64
/// characters. The event stream for a budget is `budget:<id>`, so colons
/// are not allowed inside the id itself.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BudgetId(String);

impl BudgetId {
    /// The maximum length of a budget id.
    pub const MAX_LEN: usize = 64;

    /// Create a `BudgetId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or contains invalid
    /// characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The event stream id for this budget.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        StreamId::budget(self)
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() {
            return Err(invalid(ErrorKind::BudgetId, s, "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(invalid(
                ErrorKind::BudgetId,
                s,
                format!("must be at most {} characters, got {}", Self::MAX_LEN, s.len()),
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                ErrorKind::BudgetId,
                s,
                "must contain only alphanumerics, hyphens, and underscores",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BudgetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BudgetId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BudgetId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<BudgetId> for String {
    fn from(id: BudgetId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// BranchRef
// ---------------------------------------------------------------------------

/// A validated VCS ref or branch name.
///
/// Branches and refs are untrusted input: they are interpolated into git
/// argv by the detection and resolution pipelines. A `BranchRef` is
/// guaranteed to start with an alphanumeric, contain only
/// `[a-zA-Z0-9/_.-]`, never contain `..`, and be at most 255 characters.
/// This rules out flag injection (`-D`), rev-range tricks (`a..b`), and
/// traversal through ref paths.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchRef(String);

impl BranchRef {
    /// The maximum length of a ref name.
    pub const MAX_LEN: usize = 255;

    /// Create a `BranchRef` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the ref is empty, too long, starts with a
    /// non-alphanumeric, contains `..`, or contains invalid characters.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the ref as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() {
            return Err(invalid(ErrorKind::BranchRef, s, "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(invalid(
                ErrorKind::BranchRef,
                s,
                format!("must be at most {} characters, got {}", Self::MAX_LEN, s.len()),
            ));
        }
        if s.contains("..") {
            return Err(invalid(ErrorKind::BranchRef, s, "must not contain '..'"));
        }
        let mut chars = s.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphanumeric() => {}
            _ => {
                return Err(invalid(
                    ErrorKind::BranchRef,
                    s,
                    "must start with an alphanumeric character",
                ));
            }
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'))
        {
            return Err(invalid(
                ErrorKind::BranchRef,
                s,
                "must contain only alphanumerics and '/', '_', '.', '-'",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BranchRef {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchRef {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<BranchRef> for String {
    fn from(r: BranchRef) -> Self {
        r.0
    }
}

// ---------------------------------------------------------------------------
// StreamId
// ---------------------------------------------------------------------------

/// A validated event-stream identifier.
///
/// Streams are named as colon-separated segments (`budget:<id>`,
/// `chat:<session>`); each segment is alphanumeric with hyphens and
/// underscores. Validating at construction keeps the category prefix
/// parseable: no segment can be empty and no id can smuggle a `:` of its
/// own.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    /// The maximum length of a stream id.
    pub const MAX_LEN: usize = 128;

    /// Create a `StreamId` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error if the id is empty, too long, or has an empty or
    /// malformed segment.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// The stream for a budget: `budget:<id>`.
    ///
    /// Infallible: a [`BudgetId`] is already colon-free and within length.
    #[must_use]
    pub fn budget(id: &BudgetId) -> Self {
        Self(format!("budget:{id}"))
    }

    /// The stream for a chat session: `chat:<session_id>`.
    ///
    /// # Errors
    /// Returns an error if the session id is empty, too long, or contains
    /// characters outside alphanumerics, hyphens, and underscores.
    pub fn chat(session_id: &str) -> Result<Self, ValidationError> {
        if session_id.is_empty() {
            return Err(invalid(ErrorKind::StreamId, session_id, "session id must not be empty"));
        }
        if session_id.len() > 64 {
            return Err(invalid(
                ErrorKind::StreamId,
                session_id,
                format!("session id must be at most 64 characters, got {}", session_id.len()),
            ));
        }
        if !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid(
                ErrorKind::StreamId,
                session_id,
                "session id must contain only alphanumerics, hyphens, and underscores",
            ));
        }
        Ok(Self(format!("chat:{session_id}")))
    }

    /// Return the stream id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() {
            return Err(invalid(ErrorKind::StreamId, s, "must not be empty"));
        }
        if s.len() > Self::MAX_LEN {
            return Err(invalid(
                ErrorKind::StreamId,
                s,
                format!("must be at most {} characters, got {}", Self::MAX_LEN, s.len()),
            ));
        }
        for segment in s.split(':') {
            if segment.is_empty() {
                return Err(invalid(ErrorKind::StreamId, s, "segments must not be empty"));
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(invalid(
                    ErrorKind::StreamId,
                    s,
                    "segments must contain only alphanumerics, hyphens, and underscores",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StreamId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- WorkflowId --

    #[test]
    fn workflow_id_accepts_valid() {
        assert!(WorkflowId::new("wf-abc123").is_ok());
        assert!(WorkflowId::new("deploy_2").is_ok());
    }

    #[test]
    fn workflow_id_rejects_empty() {
        assert!(WorkflowId::new("").is_err());
    }

    #[test]
    fn workflow_id_rejects_uppercase() {
        assert!(WorkflowId::new("Workflow").is_err());
    }

    #[test]
    fn workflow_id_rejects_too_long() {
        assert!(WorkflowId::new(&"a".repeat(65)).is_err());
    }

    #[test]
    fn workflow_id_generate_is_valid() {
        let id = WorkflowId::generate();
        assert!(WorkflowId::new(id.as_str()).is_ok());
        assert!(id.as_str().starts_with("wf-"));
    }

    // -- AgentId --

    #[test]
    fn agent_id_accepts_valid() {
        assert!(AgentId::new("agent-1").is_ok());
        assert!(AgentId::new("feature-auth").is_ok());
    }

    #[test]
    fn agent_id_rejects_underscore() {
        assert!(AgentId::new("agent_1").is_err());
    }

    #[test]
    fn agent_id_rejects_slash() {
        assert!(AgentId::new("agent/1").is_err());
    }

    // -- BudgetId --

    #[test]
    fn budget_id_stream_prefix() {
        let id = BudgetId::new("workflow_budget").unwrap();
        assert_eq!(id.stream_id().as_str(), "budget:workflow_budget");
    }

    #[test]
    fn budget_id_rejects_colon() {
        assert!(BudgetId::new("budget:x").is_err());
    }

    // -- StreamId --

    #[test]
    fn stream_id_accepts_segmented_names() {
        assert!(StreamId::new("budget:workflow_budget").is_ok());
        assert!(StreamId::new("chat:session-1").is_ok());
        assert!(StreamId::new("s1").is_ok());
    }

    #[test]
    fn stream_id_rejects_empty_segments() {
        assert!(StreamId::new("").is_err());
        assert!(StreamId::new("chat:").is_err());
        assert!(StreamId::new(":chat").is_err());
        assert!(StreamId::new("a::b").is_err());
    }

    #[test]
    fn stream_id_rejects_bad_characters() {
        assert!(StreamId::new("chat:has space").is_err());
        assert!(StreamId::new("chat:../up").is_err());
    }

    #[test]
    fn stream_id_chat_validates_session_id() {
        assert_eq!(
            StreamId::chat("session-1").unwrap().as_str(),
            "chat:session-1"
        );
        assert!(StreamId::chat("").is_err());
        assert!(StreamId::chat("a:b").is_err());
        assert!(StreamId::chat("no spaces").is_err());
        assert!(StreamId::chat(&"x".repeat(65)).is_err());
    }

    #[test]
    fn stream_id_budget_matches_budget_prefix() {
        let id = BudgetId::new("b1").unwrap();
        assert_eq!(StreamId::budget(&id), id.stream_id());
    }

    #[test]
    fn serde_rejects_invalid_stream_id() {
        let result: Result<StreamId, _> = serde_json::from_str("\"bad stream\"");
        assert!(result.is_err());
    }

    // -- BranchRef --

    #[test]
    fn branch_ref_accepts_valid() {
        assert!(BranchRef::new("main").is_ok());
        assert!(BranchRef::new("feature/auth-v2").is_ok());
        assert!(BranchRef::new("resolution/candidate-1a2b3c").is_ok());
        assert!(BranchRef::new("release-1.2.3").is_ok());
    }

    #[test]
    fn branch_ref_rejects_leading_dash() {
        // `-D` as a ref would be parsed by git as a flag.
        assert!(BranchRef::new("-D").is_err());
        assert!(BranchRef::new("--force").is_err());
    }

    #[test]
    fn branch_ref_rejects_dotdot() {
        assert!(BranchRef::new("main..feature").is_err());
        assert!(BranchRef::new("a/../b").is_err());
    }

    #[test]
    fn branch_ref_rejects_metacharacters() {
        assert!(BranchRef::new("main;rm").is_err());
        assert!(BranchRef::new("a b").is_err());
        assert!(BranchRef::new("x`y`").is_err());
    }

    #[test]
    fn branch_ref_rejects_too_long() {
        assert!(BranchRef::new(&"a".repeat(256)).is_err());
    }

    // -- serde round-trips --

    #[test]
    fn serde_round_trip_branch_ref() {
        let r = BranchRef::new("feature/x").unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: BranchRef = serde_json::from_str(&json).unwrap();
        assert_eq!(r, back);
    }

    #[test]
    fn serde_rejects_invalid_branch_ref() {
        let result: Result<BranchRef, _> = serde_json::from_str("\"-D\"");
        assert!(result.is_err());
    }
}
