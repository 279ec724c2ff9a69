//! Event log and checkpoint store.
//!
//! An append-only event store backed by SQLite, with optimistic
//! concurrency per stream and a monotonic global position across streams.
//! Checkpoints snapshot a stream's derived state so recovery replays only
//! the events appended after the snapshot.
//!
//! Write path:
//!
//! 1. `BEGIN IMMEDIATE` — take the write lock before reading.
//! 2. Read the stream's current max version.
//! 3. Enforce contiguity (`events[i].version == current + i + 1`) and the
//!    caller's `expected_version`, if supplied.
//! 4. Insert and commit.
//!
//! Transient "database is locked" failures are retried a bounded number of
//! times; anything persistent surfaces as a database error.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// SQLite busy timeout, milliseconds.
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Attempts for transient lock failures.
const MAX_RETRIES: u32 = 3;

/// Backoff between lock retries.
const RETRY_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Immutable event envelope.
///
/// `(stream_id, version)` is unique; versions within a stream are
/// contiguous starting at 1. `global_position` is assigned by the store at
/// insert and is `None` on events that have not been persisted yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (`evt_` + 12 hex chars).
    pub id: String,
    /// The stream this event belongs to.
    pub stream_id: String,
    /// Event type tag (e.g. `tokens_reserved`, `message_added`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Position within the stream, starting at 1.
    pub version: u64,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Links related events across streams.
    pub correlation_id: String,
    /// The event that caused this one, if any.
    pub causation_id: Option<String>,
    /// Event payload.
    pub data: serde_json::Value,
    /// Producer-supplied metadata.
    pub metadata: serde_json::Value,
    /// Cross-stream insert order; assigned by the store.
    pub global_position: Option<u64>,
}

impl Event {
    /// Create an event ready for appending.
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        version: u64,
        data: serde_json::Value,
    ) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("evt_{}", &hex[..12]),
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            version,
            timestamp: Utc::now(),
            correlation_id: format!("corr_{}", &hex[12..20]),
            causation_id: None,
            data,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            global_position: None,
        }
    }

    /// Set the correlation id, keeping the builder style of construction.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// A point-in-time snapshot of a stream's derived state.
///
/// Loading the latest checkpoint and replaying events with
/// `version > checkpoint.version` reconstructs current state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id (`cp_` + 12 hex chars).
    pub id: String,
    /// The stream this checkpoint belongs to.
    pub stream_id: String,
    /// Stream version the snapshot was taken at.
    pub version: u64,
    /// The serialized state.
    pub state: serde_json::Value,
    /// Producer-supplied metadata.
    pub metadata: serde_json::Value,
    /// When the checkpoint was created.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint ready for saving.
    #[must_use]
    pub fn new(stream_id: impl Into<String>, version: u64, state: serde_json::Value) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("cp_{}", &hex[..12]),
            stream_id: stream_id.into(),
            version,
            state,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

/// SQLite-backed event store for single-node deployment.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    /// Open (or create) a file-backed store.
    ///
    /// # Errors
    /// Returns a database error if the file cannot be opened or the schema
    /// cannot be initialized.
    pub fn open(db_path: &Path) -> Result<Self, OrchestratorError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, false)
    }

    /// Open an in-memory store (tests, ephemeral runs).
    ///
    /// # Errors
    /// Returns a database error if initialization fails.
    pub fn in_memory() -> Result<Self, OrchestratorError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, true)
    }

    fn init(conn: Connection, in_memory: bool) -> Result<Self, OrchestratorError> {
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)?;
        if !in_memory {
            // WAL only applies to file-backed databases.
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                 global_position INTEGER PRIMARY KEY AUTOINCREMENT,
                 id TEXT NOT NULL UNIQUE,
                 stream_id TEXT NOT NULL,
                 type TEXT NOT NULL,
                 version INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 correlation_id TEXT NOT NULL,
                 causation_id TEXT,
                 data TEXT NOT NULL,
                 metadata TEXT NOT NULL,
                 UNIQUE(stream_id, version)
             );
             CREATE INDEX IF NOT EXISTS idx_events_stream_id
                 ON events(stream_id, version);
             CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
             CREATE INDEX IF NOT EXISTS idx_events_correlation
                 ON events(correlation_id);
             CREATE TABLE IF NOT EXISTS checkpoints (
                 id TEXT PRIMARY KEY,
                 stream_id TEXT NOT NULL,
                 version INTEGER NOT NULL,
                 state TEXT NOT NULL,
                 metadata TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_checkpoints_stream
                 ON checkpoints(stream_id, version);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, OrchestratorError> {
        self.conn
            .lock()
            .map_err(|_| OrchestratorError::database("event store mutex poisoned"))
    }

    /// Append events to a stream with optimistic concurrency.
    ///
    /// Events must carry contiguous versions starting at the stream's
    /// current version + 1. If `expected_version` is supplied it must equal
    /// the stream's current version.
    ///
    /// # Errors
    /// - [`OrchestratorError::Concurrency`] on a version mismatch.
    /// - [`OrchestratorError::Database`] on a persistent database failure.
    pub fn append(
        &self,
        stream_id: &str,
        events: &[Event],
        expected_version: Option<u64>,
    ) -> Result<(), OrchestratorError> {
        for attempt in 0..MAX_RETRIES {
            match self.try_append(stream_id, events, expected_version) {
                Ok(()) => return Ok(()),
                Err(AppendError::Locked) if attempt < MAX_RETRIES - 1 => {
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(AppendError::Locked) => {
                    return Err(OrchestratorError::database(
                        "database is locked after bounded retry",
                    ));
                }
                Err(AppendError::Fatal(e)) => return Err(e),
            }
        }
        unreachable!("append retry loop always returns")
    }

    fn try_append(
        &self,
        stream_id: &str,
        events: &[Event],
        expected_version: Option<u64>,
    ) -> Result<(), AppendError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(classify)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM events WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
            .map_err(classify)?;
        let current = u64::try_from(current.unwrap_or(0)).unwrap_or(0);

        if let Some(expected) = expected_version {
            if current != expected {
                return Err(AppendError::Fatal(OrchestratorError::Concurrency {
                    stream_id: stream_id.to_owned(),
                    expected,
                    actual: current,
                }));
            }
        }

        for (i, event) in events.iter().enumerate() {
            let required = current + i as u64 + 1;
            if event.version != required {
                return Err(AppendError::Fatal(OrchestratorError::Concurrency {
                    stream_id: stream_id.to_owned(),
                    expected: required,
                    actual: event.version,
                }));
            }
        }

        for event in events {
            tx.execute(
                "INSERT INTO events
                     (id, stream_id, type, version, timestamp,
                      correlation_id, causation_id, data, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.id,
                    stream_id,
                    event.event_type,
                    event.version,
                    event.timestamp.to_rfc3339(),
                    event.correlation_id,
                    event.causation_id,
                    event.data.to_string(),
                    event.metadata.to_string(),
                ],
            )
            .map_err(classify)?;
        }

        tx.commit().map_err(classify)?;
        Ok(())
    }

    /// Read a stream's events with `version > from_version`, in version
    /// order.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn read(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT global_position, id, stream_id, type, version, timestamp,
                    correlation_id, causation_id, data, metadata
             FROM events
             WHERE stream_id = ?1 AND version > ?2
             ORDER BY version",
        )?;
        let rows = stmt.query_map(params![stream_id, from_version], row_to_event)?;
        collect_events(rows)
    }

    /// Read across all streams with `global_position > from_position`,
    /// optionally filtered by event type, in global-position order.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn read_all(
        &self,
        from_position: u64,
        event_types: Option<&[&str]>,
    ) -> Result<Vec<Event>, OrchestratorError> {
        let conn = self.lock()?;
        match event_types {
            Some(types) if !types.is_empty() => {
                let placeholders = (0..types.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!(
                    "SELECT global_position, id, stream_id, type, version, timestamp,
                            correlation_id, causation_id, data, metadata
                     FROM events
                     WHERE global_position > ?1 AND type IN ({placeholders})
                     ORDER BY global_position"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
                    vec![Box::new(i64::try_from(from_position).unwrap_or(i64::MAX))];
                for t in types {
                    bound.push(Box::new((*t).to_owned()));
                }
                let refs: Vec<&dyn rusqlite::ToSql> = bound.iter().map(AsRef::as_ref).collect();
                let rows = stmt.query_map(refs.as_slice(), row_to_event)?;
                collect_events(rows)
            }
            _ => {
                let mut stmt = conn.prepare(
                    "SELECT global_position, id, stream_id, type, version, timestamp,
                            correlation_id, causation_id, data, metadata
                     FROM events
                     WHERE global_position > ?1
                     ORDER BY global_position",
                )?;
                let rows = stmt.query_map(params![from_position], row_to_event)?;
                collect_events(rows)
            }
        }
    }

    /// Current max version of a stream (0 when empty).
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn stream_version(&self, stream_id: &str) -> Result<u64, OrchestratorError> {
        let conn = self.lock()?;
        let current: Option<i64> = conn.query_row(
            "SELECT MAX(version) FROM events WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(current.unwrap_or(0)).unwrap_or(0))
    }

    // -- checkpoints --

    /// Persist a checkpoint.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), OrchestratorError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints
                 (id, stream_id, version, state, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.id,
                checkpoint.stream_id,
                checkpoint.version,
                checkpoint.state.to_string(),
                checkpoint.metadata.to_string(),
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The highest-version checkpoint for a stream, if any.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn load_latest_checkpoint(
        &self,
        stream_id: &str,
    ) -> Result<Option<Checkpoint>, OrchestratorError> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                "SELECT id, stream_id, version, state, metadata, created_at
                 FROM checkpoints
                 WHERE stream_id = ?1
                 ORDER BY version DESC, created_at DESC
                 LIMIT 1",
                params![stream_id],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(result)
    }

    /// The latest checkpoint with `version <= max_version`, if any.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn load_checkpoint_at(
        &self,
        stream_id: &str,
        max_version: u64,
    ) -> Result<Option<Checkpoint>, OrchestratorError> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                "SELECT id, stream_id, version, state, metadata, created_at
                 FROM checkpoints
                 WHERE stream_id = ?1 AND version <= ?2
                 ORDER BY version DESC, created_at DESC
                 LIMIT 1",
                params![stream_id, max_version],
                row_to_checkpoint,
            )
            .optional()?;
        Ok(result)
    }

    /// All checkpoints for a stream, newest first.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn list_checkpoints(&self, stream_id: &str) -> Result<Vec<Checkpoint>, OrchestratorError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, stream_id, version, state, metadata, created_at
             FROM checkpoints
             WHERE stream_id = ?1
             ORDER BY version DESC, created_at DESC",
        )?;
        let rows = stmt.query_map(params![stream_id], row_to_checkpoint)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Row mapping and error classification
// ---------------------------------------------------------------------------

enum AppendError {
    /// Transient lock contention — the caller retries with backoff.
    Locked,
    /// Everything else, surfaced as-is.
    Fatal(OrchestratorError),
}

impl From<OrchestratorError> for AppendError {
    fn from(err: OrchestratorError) -> Self {
        Self::Fatal(err)
    }
}

fn classify(err: rusqlite::Error) -> AppendError {
    if let rusqlite::Error::SqliteFailure(ffi, _) = &err {
        if matches!(
            ffi.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return AppendError::Locked;
        }
    }
    AppendError::Fatal(err.into())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let timestamp: String = row.get(5)?;
    let data: String = row.get(8)?;
    let metadata: String = row.get(9)?;
    Ok(Event {
        global_position: row.get::<_, Option<i64>>(0)?.map(|p| p.max(0).unsigned_abs()),
        id: row.get(1)?,
        stream_id: row.get(2)?,
        event_type: row.get(3)?,
        version: row.get::<_, i64>(4)?.max(0).unsigned_abs(),
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
        correlation_id: row.get(6)?,
        causation_id: row.get(7)?,
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let state: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(Checkpoint {
        id: row.get(0)?,
        stream_id: row.get(1)?,
        version: row.get::<_, i64>(2)?.max(0).unsigned_abs(),
        state: serde_json::from_str(&state).unwrap_or(serde_json::Value::Null),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

fn collect_events(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Event>>,
) -> Result<Vec<Event>, OrchestratorError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
