//! Atomic budget tracker.
//!
//! Persists budgets and live reservations in SQLite and records every
//! mutation as an event on the budget's stream. All writes run inside
//! `BEGIN IMMEDIATE` transactions so reserve/commit/rollback are atomic
//! against concurrent callers.
//!
//! Expired reservations are swept before any read of budget state: a
//! reservation that was neither committed nor rolled back within its
//! timeout releases its tokens with a `tokens_released{reason: "timeout"}`
//! event.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::json;

use crate::error::OrchestratorError;
use crate::model::types::BudgetId;
use crate::store::{Event, EventStore};

use super::{
    BudgetDecision, BudgetStatus, EVENT_BUDGET_CREATED, EVENT_BUDGET_EXHAUSTED,
    EVENT_TOKENS_COMMITTED, EVENT_TOKENS_RELEASED, EVENT_TOKENS_RESERVED, Reservation,
    ReservationOutcome, Thresholds, TokenBudget,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default reservation timeout.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::minutes(5);

// ---------------------------------------------------------------------------
// BudgetTracker
// ---------------------------------------------------------------------------

/// Thread-safe budget tracking with persistence and event sourcing.
pub struct BudgetTracker {
    conn: Mutex<Connection>,
    events: Arc<EventStore>,
    reservation_timeout: Duration,
}

impl fmt::Debug for BudgetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetTracker")
            .field("reservation_timeout", &self.reservation_timeout)
            .finish_non_exhaustive()
    }
}

impl BudgetTracker {
    /// Open (or create) a file-backed tracker.
    ///
    /// # Errors
    /// Returns a database error if the database cannot be opened.
    pub fn open(db_path: &Path, events: Arc<EventStore>) -> Result<Self, OrchestratorError> {
        let conn = Connection::open(db_path)?;
        Self::init(conn, events)
    }

    /// Open an in-memory tracker (tests, ephemeral runs).
    ///
    /// # Errors
    /// Returns a database error if initialization fails.
    pub fn in_memory(events: Arc<EventStore>) -> Result<Self, OrchestratorError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, events)
    }

    fn init(conn: Connection, events: Arc<EventStore>) -> Result<Self, OrchestratorError> {
        conn.pragma_update(None, "busy_timeout", 5000_u64)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS budgets (
                 id TEXT PRIMARY KEY,
                 limit_tokens INTEGER NOT NULL,
                 used INTEGER NOT NULL DEFAULT 0,
                 reserved INTEGER NOT NULL DEFAULT 0,
                 soft_threshold REAL NOT NULL DEFAULT 0.8,
                 hard_threshold REAL NOT NULL DEFAULT 1.0,
                 emergency_threshold REAL NOT NULL DEFAULT 1.2,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS reservations (
                 id TEXT PRIMARY KEY,
                 budget_id TEXT NOT NULL,
                 tokens INTEGER NOT NULL,
                 created_at TEXT NOT NULL,
                 expires_at TEXT NOT NULL,
                 FOREIGN KEY (budget_id) REFERENCES budgets(id)
             );
             CREATE INDEX IF NOT EXISTS idx_reservations_budget
                 ON reservations(budget_id);
             CREATE INDEX IF NOT EXISTS idx_reservations_expires
                 ON reservations(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            events,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
        })
    }

    /// Override the reservation timeout.
    #[must_use]
    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, OrchestratorError> {
        self.conn
            .lock()
            .map_err(|_| OrchestratorError::database("budget tracker mutex poisoned"))
    }

    fn emit(
        &self,
        budget_id: &BudgetId,
        event_type: &str,
        data: serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let stream = budget_id.stream_id();
        let version = self.events.stream_version(stream.as_str())? + 1;
        let mut event = Event::new(stream.as_str(), event_type, version, data);
        if let Some(corr) = correlation_id {
            event = event.with_correlation(corr);
        }
        self.events.append(stream.as_str(), &[event], None)
    }

    // -- create --

    /// Create a new budget and record `budget_created` at stream version 1.
    ///
    /// # Errors
    /// Returns a database error if the budget already exists or the insert
    /// fails.
    pub fn create_budget(
        &self,
        budget_id: &BudgetId,
        limit: u64,
        thresholds: Option<Thresholds>,
    ) -> Result<TokenBudget, OrchestratorError> {
        let thresholds = thresholds.unwrap_or_default();
        let now = Utc::now();
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO budgets
                     (id, limit_tokens, used, reserved,
                      soft_threshold, hard_threshold, emergency_threshold,
                      created_at, updated_at)
                 VALUES (?1, ?2, 0, 0, ?3, ?4, ?5, ?6, ?6)",
                params![
                    budget_id.as_str(),
                    limit,
                    thresholds.soft,
                    thresholds.hard,
                    thresholds.emergency,
                    now.to_rfc3339(),
                ],
            )?;
        }
        self.emit(
            budget_id,
            EVENT_BUDGET_CREATED,
            json!({"budget_id": budget_id.as_str(), "limit": limit}),
            None,
        )?;
        Ok(TokenBudget {
            id: budget_id.as_str().to_owned(),
            limit,
            used: 0,
            reserved: 0,
            thresholds,
            created_at: now,
            updated_at: now,
        })
    }

    // -- reserve --

    /// Reserve tokens against a budget.
    ///
    /// Sweeps expired reservations first. Refusal is a structured outcome,
    /// not an error: the interceptor converts a refusal into a budget
    /// exhaustion error at its own boundary.
    ///
    /// # Errors
    /// Returns a database error if the budget does not exist or the write
    /// fails.
    pub fn reserve(
        &self,
        budget_id: &BudgetId,
        tokens: u64,
        correlation_id: Option<&str>,
    ) -> Result<ReservationOutcome, OrchestratorError> {
        self.sweep_expired(budget_id)?;

        let reservation = Reservation::create(budget_id.as_str(), tokens, self.reservation_timeout);
        let outcome = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let budget = read_budget(&tx, budget_id)?.ok_or_else(|| {
                OrchestratorError::database(format!("budget '{budget_id}' does not exist"))
            })?;

            if tokens > budget.available() {
                let status = status_of(&budget);
                tx.commit()?;
                ReservationOutcome {
                    success: false,
                    reservation_id: None,
                    reason: Some(format!(
                        "insufficient budget: requested {tokens}, available {}",
                        status.available
                    )),
                    status: Some(status),
                }
            } else {
                tx.execute(
                    "INSERT INTO reservations (id, budget_id, tokens, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        reservation.id,
                        reservation.budget_id,
                        reservation.tokens,
                        reservation.created_at.to_rfc3339(),
                        reservation.expires_at.to_rfc3339(),
                    ],
                )?;
                tx.execute(
                    "UPDATE budgets SET reserved = reserved + ?1, updated_at = ?2 WHERE id = ?3",
                    params![tokens, Utc::now().to_rfc3339(), budget_id.as_str()],
                )?;
                tx.commit()?;
                ReservationOutcome {
                    success: true,
                    reservation_id: Some(reservation.id.clone()),
                    reason: None,
                    status: None,
                }
            }
        };

        if outcome.success {
            self.emit(
                budget_id,
                EVENT_TOKENS_RESERVED,
                json!({
                    "reservation_id": reservation.id,
                    "tokens": tokens,
                    "expires_at": reservation.expires_at.to_rfc3339(),
                }),
                correlation_id,
            )?;
        }
        Ok(outcome)
    }

    // -- commit --

    /// Commit a reservation with the actual token count.
    ///
    /// Removes the reservation, adds `actual_tokens` to `used`, and
    /// releases the reserved amount. A second commit for the same
    /// reservation fails because the reservation is gone.
    ///
    /// # Errors
    /// Returns a database error if the reservation is missing or the write
    /// fails.
    pub fn commit(
        &self,
        reservation_id: &str,
        actual_tokens: u64,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let (budget_id, reserved_tokens, exhausted, limit, used) = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some((budget_id, reserved_tokens)) = read_reservation(&tx, reservation_id)? else {
                return Err(OrchestratorError::database(format!(
                    "reservation '{reservation_id}' not found (already committed, rolled back, or expired)"
                )));
            };

            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![reservation_id],
            )?;
            tx.execute(
                "UPDATE budgets
                 SET used = used + ?1,
                     reserved = MAX(0, reserved - ?2),
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    actual_tokens,
                    reserved_tokens,
                    Utc::now().to_rfc3339(),
                    budget_id,
                ],
            )?;
            let (limit, used): (u64, u64) = tx.query_row(
                "SELECT limit_tokens, used FROM budgets WHERE id = ?1",
                params![budget_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.commit()?;
            (budget_id, reserved_tokens, used >= limit, limit, used)
        };

        let budget_id = BudgetId::new(&budget_id)?;
        self.emit(
            &budget_id,
            EVENT_TOKENS_COMMITTED,
            json!({
                "reservation_id": reservation_id,
                "reserved_tokens": reserved_tokens,
                "actual_tokens": actual_tokens,
            }),
            correlation_id,
        )?;
        if exhausted {
            self.emit(
                &budget_id,
                EVENT_BUDGET_EXHAUSTED,
                json!({"limit": limit, "used": used}),
                correlation_id,
            )?;
        }
        Ok(())
    }

    // -- rollback --

    /// Release a reservation without committing usage.
    ///
    /// Idempotent: rolling back an absent reservation is a no-op.
    ///
    /// # Errors
    /// Returns a database error if the write fails.
    pub fn rollback(
        &self,
        reservation_id: &str,
        reason: &str,
        correlation_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let released = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some((budget_id, tokens)) = read_reservation(&tx, reservation_id)? else {
                return Ok(());
            };
            tx.execute(
                "DELETE FROM reservations WHERE id = ?1",
                params![reservation_id],
            )?;
            tx.execute(
                "UPDATE budgets
                 SET reserved = MAX(0, reserved - ?1), updated_at = ?2
                 WHERE id = ?3",
                params![tokens, Utc::now().to_rfc3339(), budget_id],
            )?;
            tx.commit()?;
            (budget_id, tokens)
        };

        let budget_id = BudgetId::new(&released.0)?;
        self.emit(
            &budget_id,
            EVENT_TOKENS_RELEASED,
            json!({
                "reservation_id": reservation_id,
                "tokens": released.1,
                "reason": reason,
            }),
            correlation_id,
        )
    }

    // -- reads --

    /// Current status of a budget, after sweeping expired reservations.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn get_status(
        &self,
        budget_id: &BudgetId,
    ) -> Result<Option<BudgetStatus>, OrchestratorError> {
        self.sweep_expired(budget_id)?;
        let conn = self.lock()?;
        let budget = read_budget(&conn, budget_id)?;
        Ok(budget.map(|b| status_of(&b)))
    }

    /// Pre-flight check without reserving.
    ///
    /// # Errors
    /// Returns a database error if the budget does not exist.
    pub fn pre_check(
        &self,
        budget_id: &BudgetId,
        estimated: u64,
    ) -> Result<BudgetDecision, OrchestratorError> {
        self.sweep_expired(budget_id)?;
        let conn = self.lock()?;
        let budget = read_budget(&conn, budget_id)?.ok_or_else(|| {
            OrchestratorError::database(format!("budget '{budget_id}' does not exist"))
        })?;
        Ok(budget.check(estimated))
    }

    // -- sweep --

    /// Release every expired reservation for a budget, emitting
    /// `tokens_released{reason: "timeout"}` for each.
    ///
    /// # Errors
    /// Returns a database error on failure.
    pub fn sweep_expired(&self, budget_id: &BudgetId) -> Result<(), OrchestratorError> {
        let expired: Vec<(String, u64)> = {
            let mut conn = self.lock()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now().to_rfc3339();
            let expired = {
                let mut stmt = tx.prepare(
                    "SELECT id, tokens FROM reservations
                     WHERE budget_id = ?1 AND expires_at < ?2",
                )?;
                let rows = stmt.query_map(params![budget_id.as_str(), now], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;
                let mut expired = Vec::new();
                for row in rows {
                    expired.push(row?);
                }
                expired
            };
            for (id, tokens) in &expired {
                tx.execute("DELETE FROM reservations WHERE id = ?1", params![id])?;
                tx.execute(
                    "UPDATE budgets
                     SET reserved = MAX(0, reserved - ?1), updated_at = ?2
                     WHERE id = ?3",
                    params![tokens, now, budget_id.as_str()],
                )?;
            }
            tx.commit()?;
            expired
        };

        for (id, tokens) in expired {
            self.emit(
                budget_id,
                EVENT_TOKENS_RELEASED,
                json!({
                    "reservation_id": id,
                    "tokens": tokens,
                    "reason": "timeout",
                }),
                None,
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn read_budget(
    conn: &Connection,
    budget_id: &BudgetId,
) -> Result<Option<TokenBudget>, OrchestratorError> {
    let result = conn
        .query_row(
            "SELECT id, limit_tokens, used, reserved,
                    soft_threshold, hard_threshold, emergency_threshold,
                    created_at, updated_at
             FROM budgets WHERE id = ?1",
            params![budget_id.as_str()],
            |row| {
                let created: String = row.get(7)?;
                let updated: String = row.get(8)?;
                Ok(TokenBudget {
                    id: row.get(0)?,
                    limit: row.get(1)?,
                    used: row.get(2)?,
                    reserved: row.get(3)?,
                    thresholds: Thresholds {
                        soft: row.get(4)?,
                        hard: row.get(5)?,
                        emergency: row.get(6)?,
                    },
                    created_at: parse_time(&created),
                    updated_at: parse_time(&updated),
                })
            },
        )
        .optional()?;
    Ok(result)
}

fn read_reservation(
    conn: &Connection,
    reservation_id: &str,
) -> Result<Option<(String, u64)>, OrchestratorError> {
    let result = conn
        .query_row(
            "SELECT budget_id, tokens FROM reservations WHERE id = ?1",
            params![reservation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(result)
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn status_of(budget: &TokenBudget) -> BudgetStatus {
    BudgetStatus {
        budget_id: budget.id.clone(),
        limit: budget.limit,
        used: budget.used,
        reserved: budget.reserved,
        available: budget.available(),
        percent_used: budget.percent_used(),
        decision: budget.check(0),
        exceeded: budget.used >= budget.limit,
        warning: budget.check(0) != BudgetDecision::Ok,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (Arc<EventStore>, BudgetTracker) {
        let events = Arc::new(EventStore::in_memory().unwrap());
        let tracker = BudgetTracker::in_memory(Arc::clone(&events)).unwrap();
        (events, tracker)
    }

    fn bid(s: &str) -> BudgetId {
        BudgetId::new(s).unwrap()
    }

    // -- the canonical reserve/commit ledger --

    #[test]
    fn reserve_commit_ledger() {
        let (events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();

        let outcome = tracker.reserve(&budget, 400, None).unwrap();
        assert!(outcome.success);
        let res_id = outcome.reservation_id.unwrap();

        tracker.commit(&res_id, 350, None).unwrap();

        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert_eq!(status.used, 350);
        assert_eq!(status.reserved, 0);
        assert_eq!(status.available, 650);

        // Event stream: budget_created(v1), tokens_reserved(v2),
        // tokens_committed(v3), in order.
        let stream = budget.stream_id();
        let log = events.read(stream.as_str(), 0).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].event_type, EVENT_BUDGET_CREATED);
        assert_eq!(log[0].version, 1);
        assert_eq!(log[1].event_type, EVENT_TOKENS_RESERVED);
        assert_eq!(log[1].data["tokens"], 400);
        assert_eq!(log[2].event_type, EVENT_TOKENS_COMMITTED);
        assert_eq!(log[2].data["actual_tokens"], 350);
    }

    #[test]
    fn reserve_refused_when_insufficient() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 100, None).unwrap();

        let outcome = tracker.reserve(&budget, 500, None).unwrap();
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("insufficient"));
        let status = outcome.status.unwrap();
        assert_eq!(status.available, 100);
    }

    #[test]
    fn reserve_zero_tokens_succeeds() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 100, None).unwrap();

        let outcome = tracker.reserve(&budget, 0, None).unwrap();
        assert!(outcome.success);
        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.used, 0);
    }

    #[test]
    fn double_commit_fails() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();
        let res = tracker.reserve(&budget, 100, None).unwrap();
        let res_id = res.reservation_id.unwrap();

        tracker.commit(&res_id, 90, None).unwrap();
        let err = tracker.commit(&res_id, 90, None).unwrap_err();
        assert!(format!("{err}").contains("not found"));
    }

    #[test]
    fn rollback_is_idempotent() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();
        let res = tracker.reserve(&budget, 250, None).unwrap();
        let res_id = res.reservation_id.unwrap();

        tracker.rollback(&res_id, "api error", None).unwrap();
        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.used, 0);

        // Second rollback: no-op, budget unchanged.
        tracker.rollback(&res_id, "api error", None).unwrap();
        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert_eq!(status.reserved, 0);
    }

    #[test]
    fn exhaustion_event_emitted_at_limit() {
        let (events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 100, None).unwrap();
        let res = tracker.reserve(&budget, 100, None).unwrap();
        tracker.commit(&res.reservation_id.unwrap(), 120, None).unwrap();

        let log = events.read(budget.stream_id().as_str(), 0).unwrap();
        assert_eq!(log.last().unwrap().event_type, EVENT_BUDGET_EXHAUSTED);
        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert!(status.exceeded);
    }

    #[test]
    fn expired_reservation_swept_with_timeout_event() {
        let (events, tracker) = tracker();
        let tracker = tracker.with_reservation_timeout(Duration::milliseconds(-1));
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();

        // Negative timeout: the reservation is born expired.
        let res = tracker.reserve(&budget, 300, None).unwrap();
        assert!(res.success);

        // The next read sweeps it.
        let status = tracker.get_status(&budget).unwrap().unwrap();
        assert_eq!(status.reserved, 0);
        assert_eq!(status.available, 1000);

        let log = events.read(budget.stream_id().as_str(), 0).unwrap();
        let released = log
            .iter()
            .find(|e| e.event_type == EVENT_TOKENS_RELEASED)
            .unwrap();
        assert_eq!(released.data["reason"], "timeout");
    }

    #[test]
    fn pre_check_decision_bands() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();
        assert_eq!(tracker.pre_check(&budget, 100).unwrap(), BudgetDecision::Ok);
        assert_eq!(
            tracker.pre_check(&budget, 850).unwrap(),
            BudgetDecision::Warning
        );
        assert_eq!(
            tracker.pre_check(&budget, 1000).unwrap(),
            BudgetDecision::Blocked
        );
        assert_eq!(
            tracker.pre_check(&budget, 1300).unwrap(),
            BudgetDecision::EmergencyStop
        );
    }

    #[test]
    fn invariant_used_plus_reserved_within_emergency() {
        let (_events, tracker) = tracker();
        let budget = bid("b1");
        tracker.create_budget(&budget, 1000, None).unwrap();

        // Fill to the brim through several reserve/commit cycles.
        for _ in 0..4 {
            let res = tracker.reserve(&budget, 200, None).unwrap();
            if let Some(id) = res.reservation_id {
                tracker.commit(&id, 200, None).unwrap();
            }
        }
        let status = tracker.get_status(&budget).unwrap().unwrap();
        let ceiling = (status.limit as f64 * 1.2) as u64;
        assert!(status.used + status.reserved <= ceiling);
    }
}
