//! Interactive chat sessions with crash recovery.
//!
//! A session is an event stream (`chat:<session_id>`): every message,
//! checkpoint, restore, and pin is persisted as an event before it is
//! applied to memory, so a crashed session rebuilds from the latest
//! checkpoint plus replay. Context compression is guarded by a
//! deterministic validator — a summary that loses entities or decisions is
//! discarded in favor of plain truncation.

pub mod commands;
pub mod context;
pub mod session;
pub mod validator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use commands::{MetaCommand, parse_meta_command};
pub use context::ContextManager;
pub use session::ChatSession;
pub use validator::{SummaryValidator, ValidationReport};

// ---------------------------------------------------------------------------
// Event type tags
// ---------------------------------------------------------------------------

/// A message was appended to the conversation.
pub const EVENT_MESSAGE_ADDED: &str = "message_added";
/// A checkpoint snapshot was taken.
pub const EVENT_CHECKPOINT_CREATED: &str = "checkpoint_created";
/// The session was restored to a checkpoint.
pub const EVENT_SESSION_RESTORED: &str = "session_restored";
/// A message was pinned against summarization.
pub const EVENT_MESSAGE_PINNED: &str = "message_pinned";

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    /// The wire name used in LLM requests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One message in a conversation. Append-only within a session stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message id (`msg_` + 12 hex chars).
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Model/usage metadata and similar annotations.
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a generated id.
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("msg_{}", &hex[..12]),
            role,
            content: content.into(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Tuning for a chat session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Context window budget, tokens.
    pub max_tokens: u64,
    /// Compress above this fraction of the window.
    pub summarization_threshold: f64,
    /// Checkpoint after this many messages.
    pub checkpoint_interval_messages: u32,
    /// Checkpoint after this many minutes.
    pub checkpoint_interval_minutes: i64,
    /// Always keep this many recent messages.
    pub recent_messages_to_keep: usize,
    /// Model used for conversation turns.
    pub model: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            summarization_threshold: 0.7,
            checkpoint_interval_messages: 20,
            checkpoint_interval_minutes: 10,
            recent_messages_to_keep: 20,
            model: "convoy-chat-default".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
