//! Token budget tracking.
//!
//! A budget is a hard cap on token spend, mutated only through the
//! reserve/commit/rollback protocol in [`tracker::BudgetTracker`]:
//! tokens are reserved atomically before an LLM call, the actual usage is
//! committed afterwards, and reservations are released on failure or
//! timeout. Every mutation is also recorded as an event on the budget's
//! stream, so the full history can be audited or replayed.

pub mod tracker;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use tracker::BudgetTracker;

// ---------------------------------------------------------------------------
// Event type tags
// ---------------------------------------------------------------------------

/// Event type for budget creation (always version 1 of the stream).
pub const EVENT_BUDGET_CREATED: &str = "budget_created";
/// Event type for a successful reservation.
pub const EVENT_TOKENS_RESERVED: &str = "tokens_reserved";
/// Event type for a committed reservation.
pub const EVENT_TOKENS_COMMITTED: &str = "tokens_committed";
/// Event type for a released reservation (rollback or timeout).
pub const EVENT_TOKENS_RELEASED: &str = "tokens_released";
/// Event type emitted when committed usage reaches the limit.
pub const EVENT_BUDGET_EXHAUSTED: &str = "budget_exhausted";

// ---------------------------------------------------------------------------
// BudgetDecision
// ---------------------------------------------------------------------------

/// Decision from a pre-flight budget check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDecision {
    /// Projected usage is below the soft threshold.
    Ok,
    /// Projected usage is in the warning band (soft..hard).
    Warning,
    /// Projected usage is in the blocked band (hard..emergency).
    Blocked,
    /// Projected usage is at or beyond the emergency threshold.
    EmergencyStop,
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Budget alarm thresholds, as fractions of the limit.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Warn above this fraction.
    pub soft: f64,
    /// Block above this fraction.
    pub hard: f64,
    /// Hard stop at this fraction — nothing may push past it.
    pub emergency: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            soft: 0.8,
            hard: 1.0,
            emergency: 1.2,
        }
    }
}

// ---------------------------------------------------------------------------
// TokenBudget
// ---------------------------------------------------------------------------

/// A token budget with soft/hard/emergency thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    /// Budget identifier.
    pub id: String,
    /// Maximum tokens allowed.
    pub limit: u64,
    /// Tokens already committed.
    pub used: u64,
    /// Tokens reserved but not yet committed.
    pub reserved: u64,
    /// Alarm thresholds.
    pub thresholds: Thresholds,
    /// When the budget was created.
    pub created_at: DateTime<Utc>,
    /// When the budget was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl TokenBudget {
    /// Tokens available for reservation.
    #[must_use]
    pub const fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used).saturating_sub(self.reserved)
    }

    /// Tokens remaining against committed usage only.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Percentage of the limit already committed.
    #[must_use]
    pub fn percent_used(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64 * 100.0
        }
    }

    /// Pre-flight check: can `requested` tokens be allocated?
    #[must_use]
    pub fn check(&self, requested: u64) -> BudgetDecision {
        let projected = (self.used + self.reserved + requested) as f64;
        let ratio = if self.limit == 0 {
            f64::INFINITY
        } else {
            projected / self.limit as f64
        };
        if ratio >= self.thresholds.emergency {
            BudgetDecision::EmergencyStop
        } else if ratio >= self.thresholds.hard {
            BudgetDecision::Blocked
        } else if ratio >= self.thresholds.soft {
            BudgetDecision::Warning
        } else {
            BudgetDecision::Ok
        }
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A provisional claim on a budget.
///
/// A live reservation contributes exactly `tokens` to its budget's
/// `reserved`; it is destroyed on commit, rollback, or expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id (`res_` + 12 hex chars).
    pub id: String,
    /// The budget this reservation belongs to.
    pub budget_id: String,
    /// Tokens held.
    pub tokens: u64,
    /// When the reservation was created.
    pub created_at: DateTime<Utc>,
    /// When the reservation lapses if neither committed nor rolled back.
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Create a reservation expiring after `timeout`.
    #[must_use]
    pub fn create(budget_id: &str, tokens: u64, timeout: Duration) -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        Self {
            id: format!("res_{}", &hex[..12]),
            budget_id: budget_id.to_owned(),
            tokens,
            created_at: now,
            expires_at: now + timeout,
        }
    }

    /// True once the expiry time has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// BudgetStatus / ReservationOutcome
// ---------------------------------------------------------------------------

/// Snapshot of a budget's state with a derived decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_id: String,
    pub limit: u64,
    pub used: u64,
    pub reserved: u64,
    pub available: u64,
    pub percent_used: f64,
    pub decision: BudgetDecision,
    /// Committed usage has reached the limit.
    pub exceeded: bool,
    /// Projected usage is past the soft threshold.
    pub warning: bool,
}

/// Result of a reserve attempt.
#[derive(Clone, Debug)]
pub struct ReservationOutcome {
    /// Whether the reservation was granted.
    pub success: bool,
    /// The reservation id, when granted.
    pub reservation_id: Option<String>,
    /// Refusal reason, when denied.
    pub reason: Option<String>,
    /// Budget status at decision time.
    pub status: Option<BudgetStatus>,
}

// ---------------------------------------------------------------------------
// TokenUsage
// ---------------------------------------------------------------------------

/// Token usage for a single model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Total tokens consumed.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limit: u64, used: u64, reserved: u64) -> TokenBudget {
        TokenBudget {
            id: "b".to_owned(),
            limit,
            used,
            reserved,
            thresholds: Thresholds::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn available_subtracts_used_and_reserved() {
        assert_eq!(budget(1000, 300, 200).available(), 500);
    }

    #[test]
    fn available_saturates_at_zero() {
        assert_eq!(budget(100, 90, 30).available(), 0);
    }

    #[test]
    fn check_bands() {
        let b = budget(1000, 0, 0);
        assert_eq!(b.check(100), BudgetDecision::Ok);
        assert_eq!(b.check(800), BudgetDecision::Warning);
        assert_eq!(b.check(1000), BudgetDecision::Blocked);
        assert_eq!(b.check(1200), BudgetDecision::EmergencyStop);
    }

    #[test]
    fn check_counts_used_and_reserved() {
        let b = budget(1000, 500, 200);
        // 500 + 200 + 150 = 850 → warning band.
        assert_eq!(b.check(150), BudgetDecision::Warning);
    }

    #[test]
    fn check_zero_limit_is_emergency() {
        assert_eq!(budget(0, 0, 0).check(1), BudgetDecision::EmergencyStop);
    }

    #[test]
    fn reservation_expiry() {
        let r = Reservation::create("b", 100, Duration::minutes(5));
        assert!(!r.is_expired());
        let stale = Reservation {
            expires_at: Utc::now() - Duration::seconds(1),
            ..r
        };
        assert!(stale.is_expired());
    }

    #[test]
    fn usage_total() {
        let u = TokenUsage {
            input_tokens: 120,
            output_tokens: 80,
        };
        assert_eq!(u.total(), 200);
    }
}
