//! The chat session.
//!
//! State lives event-first: every transition (message, checkpoint,
//! restore, pin) is appended to the session's stream before it is applied
//! to memory. Recovery loads the latest checkpoint and replays everything
//! after it; `/restore` jumps to an explicit checkpoint and records the
//! jump as a new event at the stream head.
//!
//! A turn never throws at the user: budget exhaustion answers with a fixed
//! message without touching the model, and unexpected failures come back
//! as readable error text.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::budget::BudgetTracker;
use crate::error::OrchestratorError;
use crate::llm::{LlmInterceptor, LlmMessage, LlmRequest};
use crate::model::types::{BudgetId, StreamId};
use crate::store::{Checkpoint, Event, EventStore};

use super::commands::MetaCommand;
use super::context::ContextManager;
use super::{
    EVENT_CHECKPOINT_CREATED, EVENT_MESSAGE_ADDED, EVENT_MESSAGE_PINNED, EVENT_SESSION_RESTORED,
    Message, MessageRole, SessionConfig, parse_meta_command,
};

// ---------------------------------------------------------------------------
// ChatSession
// ---------------------------------------------------------------------------

/// A persistent, recoverable chat session.
pub struct ChatSession {
    session_id: String,
    stream: StreamId,
    store: Arc<EventStore>,
    tracker: Arc<BudgetTracker>,
    budget_id: BudgetId,
    interceptor: LlmInterceptor,
    context_manager: ContextManager,
    config: SessionConfig,

    messages: Vec<Message>,
    pinned_ids: Vec<String>,
    event_version: u64,
    messages_since_checkpoint: u32,
    last_checkpoint_at: DateTime<Utc>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("session_id", &self.session_id)
            .field("messages", &self.messages.len())
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Create a session handle. Call [`ChatSession::recover`] to rebuild
    /// state from a previous run of the same `session_id`.
    ///
    /// # Errors
    /// Returns a validation error when the session id cannot form a stream
    /// id (empty, too long, or bad characters).
    pub fn new(
        session_id: &str,
        store: Arc<EventStore>,
        tracker: Arc<BudgetTracker>,
        budget_id: BudgetId,
        interceptor: LlmInterceptor,
        context_manager: ContextManager,
        config: SessionConfig,
    ) -> Result<Self, OrchestratorError> {
        let stream = StreamId::chat(session_id)?;
        Ok(Self {
            session_id: session_id.to_owned(),
            stream,
            store,
            tracker,
            budget_id,
            interceptor,
            context_manager,
            config,
            messages: Vec::new(),
            pinned_ids: Vec::new(),
            event_version: 0,
            messages_since_checkpoint: 0,
            last_checkpoint_at: Utc::now(),
        })
    }

    /// The session's event stream id.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream
    }

    /// Messages currently in memory.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Pinned message ids.
    #[must_use]
    pub fn pinned_ids(&self) -> &[String] {
        &self.pinned_ids
    }

    // -- the turn --

    /// Process one user turn: meta-command, or message → model → reply.
    ///
    /// Never returns an error to the caller; failures become readable
    /// response text.
    pub fn send(&mut self, user_input: &str) -> String {
        if let Some(command) = parse_meta_command(user_input) {
            return self.execute_command(&command);
        }
        match self.send_message(user_input) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(error = %err, "chat turn failed");
                format!("Error: {err}")
            }
        }
    }

    fn send_message(&mut self, content: &str) -> Result<String, OrchestratorError> {
        let user_message = Message::new(MessageRole::User, content);
        self.persist_message(&user_message)?;
        self.messages.push(user_message);

        // Budget check before any model traffic.
        if let Some(status) = self.tracker.get_status(&self.budget_id)? {
            if status.exceeded {
                let reply = format!(
                    "Token budget exhausted. Used: {}/{}",
                    status.used, status.limit
                );
                tracing::warn!(used = status.used, limit = status.limit, "budget exhausted");
                return Ok(reply);
            }
        }

        let window =
            self.context_manager
                .prepare_context(&self.messages, &self.pinned_ids, &self.interceptor);

        let mut request = LlmRequest::new(
            &self.config.model,
            window
                .iter()
                .map(|m| LlmMessage::new(m.role.as_str(), m.content.clone()))
                .collect(),
        );
        request.correlation_id = Some(self.session_id.clone());

        let response = match self.interceptor.call(&request) {
            Ok(response) => response,
            Err(OrchestratorError::BudgetExhausted {
                requested,
                available,
                ..
            }) => {
                return Ok(format!(
                    "Token budget exhausted: requested {requested}, available {available}"
                ));
            }
            Err(other) => return Err(other),
        };

        let mut assistant_message = Message::new(MessageRole::Assistant, &response.content);
        assistant_message.metadata = json!({
            "model": response.model,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            },
        });
        self.persist_message(&assistant_message)?;
        self.messages.push(assistant_message);

        self.maybe_checkpoint()?;
        Ok(response.content)
    }

    // -- meta-commands --

    fn execute_command(&mut self, command: &MetaCommand) -> String {
        let outcome = match command {
            MetaCommand::Status => self.command_status(),
            MetaCommand::Checkpoint { message } => self
                .checkpoint(message.as_deref())
                .map(|id| format!("Checkpoint created: {id}")),
            MetaCommand::Restore { checkpoint_id } => self
                .restore(checkpoint_id.as_deref())
                .map(|()| "Session restored from checkpoint".to_owned()),
            MetaCommand::Pin { message_id } => self
                .pin(message_id)
                .map(|()| format!("Message {message_id} pinned")),
            MetaCommand::History { count } => Ok(self.command_history(*count)),
        };
        outcome.unwrap_or_else(|err| format!("Error: {err}"))
    }

    fn command_status(&self) -> Result<String, OrchestratorError> {
        let mut lines = vec![
            format!("Session: {}", self.session_id),
            format!("Messages: {}", self.messages.len()),
            format!("Pinned: {}", self.pinned_ids.len()),
        ];
        if let Some(status) = self.tracker.get_status(&self.budget_id)? {
            lines.push(format!(
                "Budget: {}/{} tokens ({:.1}%)",
                status.used, status.limit, status.percent_used
            ));
        }
        let checkpoints = self.store.list_checkpoints(self.stream.as_str())?;
        lines.push(format!("Checkpoints: {}", checkpoints.len()));
        Ok(lines.join("\n"))
    }

    fn command_history(&self, count: usize) -> String {
        if self.messages.is_empty() {
            return "No messages".to_owned();
        }
        let start = self.messages.len().saturating_sub(count);
        self.messages[start..]
            .iter()
            .map(|m| {
                let content = if m.content.len() > 100 {
                    let mut end = 100;
                    while !m.content.is_char_boundary(end) {
                        end -= 1;
                    }
                    format!("{}...", &m.content[..end])
                } else {
                    m.content.clone()
                };
                format!("[{}] {}: {}", m.id, m.role.as_str().to_uppercase(), content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // -- checkpointing and recovery --

    /// Snapshot the session state.
    ///
    /// # Errors
    /// Returns a database error if the snapshot or its event cannot be
    /// persisted.
    pub fn checkpoint(&mut self, label: Option<&str>) -> Result<String, OrchestratorError> {
        let state = json!({
            "messages": self.messages,
            "pinned_ids": self.pinned_ids,
            "message_count": self.messages.len(),
        });
        let mut checkpoint = Checkpoint::new(self.stream.as_str(), self.event_version, state);
        if let Some(label) = label {
            checkpoint.metadata = json!({"message": label});
        }
        self.store.save_checkpoint(&checkpoint)?;

        self.append_event(
            EVENT_CHECKPOINT_CREATED,
            json!({
                "session_id": self.session_id,
                "checkpoint_id": checkpoint.id,
                "message_count": self.messages.len(),
            }),
        )?;
        self.messages_since_checkpoint = 0;
        self.last_checkpoint_at = Utc::now();
        tracing::info!(checkpoint = %checkpoint.id, "checkpoint created");
        Ok(checkpoint.id)
    }

    /// Restore to a specific or the latest checkpoint, recording the jump.
    ///
    /// # Errors
    /// Returns an error when no matching checkpoint exists.
    pub fn restore(&mut self, checkpoint_id: Option<&str>) -> Result<(), OrchestratorError> {
        let checkpoint = match checkpoint_id {
            Some(id) => self
                .store
                .list_checkpoints(self.stream.as_str())?
                .into_iter()
                .find(|c| c.id == id),
            None => self.store.load_latest_checkpoint(self.stream.as_str())?,
        };
        let Some(checkpoint) = checkpoint else {
            return Err(OrchestratorError::database(format!(
                "checkpoint not found: {}",
                checkpoint_id.unwrap_or("latest")
            )));
        };

        self.apply_checkpoint(&checkpoint);
        // The restore itself is an event at the current stream head.
        self.event_version = self.store.stream_version(self.stream.as_str())?;
        self.append_event(
            EVENT_SESSION_RESTORED,
            json!({
                "session_id": self.session_id,
                "checkpoint_id": checkpoint.id,
            }),
        )?;
        tracing::info!(checkpoint = %checkpoint.id, "session restored");
        Ok(())
    }

    /// Rebuild state after a crash: latest checkpoint plus event replay.
    ///
    /// # Errors
    /// Returns a database error if the stream cannot be read.
    pub fn recover(&mut self) -> Result<(), OrchestratorError> {
        let from_version = match self.store.load_latest_checkpoint(self.stream.as_str())? {
            Some(checkpoint) => {
                self.apply_checkpoint(&checkpoint);
                checkpoint.version
            }
            None => {
                self.messages.clear();
                self.pinned_ids.clear();
                0
            }
        };
        self.event_version = from_version;

        for event in self.store.read(self.stream.as_str(), from_version)? {
            self.apply_event(&event);
            self.event_version = event.version;
        }
        tracing::info!(
            messages = self.messages.len(),
            version = self.event_version,
            "session recovered"
        );
        Ok(())
    }

    /// Pin a message against summarization.
    ///
    /// # Errors
    /// Returns an error when the message id is unknown.
    pub fn pin(&mut self, message_id: &str) -> Result<(), OrchestratorError> {
        if !self.messages.iter().any(|m| m.id == message_id) {
            return Err(OrchestratorError::database(format!(
                "no such message: {message_id}"
            )));
        }
        self.append_event(
            EVENT_MESSAGE_PINNED,
            json!({
                "session_id": self.session_id,
                "message_id": message_id,
            }),
        )?;
        if !self.pinned_ids.iter().any(|id| id == message_id) {
            self.pinned_ids.push(message_id.to_owned());
        }
        Ok(())
    }

    // -- internals --

    fn persist_message(&mut self, message: &Message) -> Result<(), OrchestratorError> {
        self.append_event(
            EVENT_MESSAGE_ADDED,
            json!({
                "session_id": self.session_id,
                "message_id": message.id,
                "role": message.role.as_str(),
                "content": message.content,
                "metadata": message.metadata,
            }),
        )?;
        self.messages_since_checkpoint += 1;
        Ok(())
    }

    fn append_event(
        &mut self,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let stream = self.stream.clone();
        let version = self.event_version + 1;
        let event = Event::new(stream.as_str(), event_type, version, data)
            .with_correlation(self.session_id.clone());
        self.store.append(stream.as_str(), &[event], Some(self.event_version))?;
        self.event_version = version;
        Ok(())
    }

    fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) {
        self.messages = serde_json::from_value(checkpoint.state["messages"].clone())
            .unwrap_or_default();
        self.pinned_ids = serde_json::from_value(checkpoint.state["pinned_ids"].clone())
            .unwrap_or_default();
        self.messages_since_checkpoint = 0;
        self.last_checkpoint_at = Utc::now();
    }

    fn apply_event(&mut self, event: &Event) {
        match event.event_type.as_str() {
            EVENT_MESSAGE_ADDED => {
                let role = match event.data["role"].as_str() {
                    Some("assistant") => MessageRole::Assistant,
                    Some("system") => MessageRole::System,
                    _ => MessageRole::User,
                };
                self.messages.push(Message {
                    id: event.data["message_id"].as_str().unwrap_or_default().to_owned(),
                    role,
                    content: event.data["content"].as_str().unwrap_or_default().to_owned(),
                    metadata: event.data["metadata"].clone(),
                    timestamp: event.timestamp,
                });
            }
            EVENT_MESSAGE_PINNED => {
                if let Some(id) = event.data["message_id"].as_str() {
                    if !self.pinned_ids.iter().any(|p| p == id) {
                        self.pinned_ids.push(id.to_owned());
                    }
                }
            }
            // Checkpoint/restore markers carry no in-memory state change.
            _ => {}
        }
        // Replay can introduce duplicates when a checkpoint overlaps the
        // event tail; last write wins by id.
        let mut seen = BTreeSet::new();
        self.messages.retain(|m| seen.insert(m.id.clone()));
    }

    fn maybe_checkpoint(&mut self) -> Result<(), OrchestratorError> {
        let by_count =
            self.messages_since_checkpoint >= self.config.checkpoint_interval_messages;
        let by_time = Utc::now() - self.last_checkpoint_at
            >= Duration::minutes(self.config.checkpoint_interval_minutes);
        if by_count || by_time {
            tracing::debug!(by_count, by_time, "automatic checkpoint");
            self.checkpoint(Some("auto-checkpoint"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
