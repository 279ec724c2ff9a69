//! Flaky-test tracking.
//!
//! Keeps a bounded outcome history per test and scores flakiness by
//! pass/fail alternation: `transitions / (len - 1)`. A test at or above
//! 0.3 is flaky (eligible for retries); at or above 0.8 it is quarantined
//! and its failures no longer count against candidates. The record map is
//! persisted as JSON and survives across resolution runs.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Outcomes kept per test (FIFO).
pub const MAX_HISTORY: usize = 20;

/// Flakiness score at which a test becomes flaky.
pub const FLAKINESS_THRESHOLD: f64 = 0.3;

/// Flakiness score at which a test is quarantined.
pub const QUARANTINE_THRESHOLD: f64 = 0.8;

/// Maximum retries for a flaky test.
pub const MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// FlakyTestRecord
// ---------------------------------------------------------------------------

/// Outcome history for one test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlakyTestRecord {
    pub test_name: String,
    /// Most recent outcomes, oldest first, bounded at [`MAX_HISTORY`].
    pub outcomes: VecDeque<bool>,
    pub last_updated: DateTime<Utc>,
}

impl FlakyTestRecord {
    #[must_use]
    pub fn new(test_name: &str) -> Self {
        Self {
            test_name: test_name.to_owned(),
            outcomes: VecDeque::new(),
            last_updated: Utc::now(),
        }
    }

    /// Pass/fail alternation rate, in `[0, 1]`.
    #[must_use]
    pub fn flakiness_score(&self) -> f64 {
        if self.outcomes.len() < 2 {
            return 0.0;
        }
        let transitions = self
            .outcomes
            .iter()
            .zip(self.outcomes.iter().skip(1))
            .filter(|(a, b)| a != b)
            .count();
        transitions as f64 / (self.outcomes.len() - 1) as f64
    }
}

// ---------------------------------------------------------------------------
// FlakyTestHandler
// ---------------------------------------------------------------------------

/// Tracks, retries, and down-weights flaky tests.
#[derive(Debug)]
pub struct FlakyTestHandler {
    db_path: PathBuf,
    max_retries: u32,
    records: BTreeMap<String, FlakyTestRecord>,
}

impl FlakyTestHandler {
    /// Load (or start fresh) from the given database file.
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        let records = std::fs::read_to_string(&db_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            db_path,
            max_retries: MAX_RETRIES,
            records,
        }
    }

    /// Persist the record map.
    ///
    /// # Errors
    /// Returns an I/O error if the write fails.
    pub fn save(&self) -> Result<(), OrchestratorError> {
        let content = serde_json::to_string_pretty(&self.records)
            .map_err(|e| OrchestratorError::database(format!("flaky db serialization: {e}")))?;
        std::fs::write(&self.db_path, content)?;
        Ok(())
    }

    /// Record one outcome for a test.
    pub fn record_outcome(&mut self, test_name: &str, passed: bool) {
        let record = self
            .records
            .entry(test_name.to_owned())
            .or_insert_with(|| FlakyTestRecord::new(test_name));
        record.outcomes.push_back(passed);
        while record.outcomes.len() > MAX_HISTORY {
            record.outcomes.pop_front();
        }
        record.last_updated = Utc::now();
    }

    /// Outcome history for a test, oldest first.
    #[must_use]
    pub fn history(&self, test_name: &str) -> Vec<bool> {
        self.records
            .get(test_name)
            .map(|r| r.outcomes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Flakiness score for a test (0.0 when unknown).
    #[must_use]
    pub fn flakiness_score(&self, test_name: &str) -> f64 {
        self.records
            .get(test_name)
            .map_or(0.0, FlakyTestRecord::flakiness_score)
    }

    /// Whether a test has crossed the flaky threshold.
    #[must_use]
    pub fn is_flaky(&self, test_name: &str) -> bool {
        self.flakiness_score(test_name) >= FLAKINESS_THRESHOLD
    }

    /// Whether a test has crossed the quarantine threshold.
    #[must_use]
    pub fn is_quarantined(&self, test_name: &str) -> bool {
        self.flakiness_score(test_name) >= QUARANTINE_THRESHOLD
    }

    /// Whether a failed test should be retried (known flaky, attempts left).
    #[must_use]
    pub fn should_retry(&self, test_name: &str, current_attempt: u32) -> bool {
        current_attempt < self.max_retries && self.is_flaky(test_name)
    }

    /// Weight of a failure when aggregated by the candidate scorer.
    ///
    /// Quarantined failures barely count, flaky failures count half, stable
    /// failures count fully.
    #[must_use]
    pub fn failure_weight(&self, test_name: &str) -> f64 {
        let score = self.flakiness_score(test_name);
        if score >= QUARANTINE_THRESHOLD {
            0.1
        } else if score >= FLAKINESS_THRESHOLD {
            0.5
        } else {
            1.0
        }
    }

    /// All tests past the flaky threshold.
    #[must_use]
    pub fn flaky_tests(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.flakiness_score() >= FLAKINESS_THRESHOLD)
            .map(|r| r.test_name.clone())
            .collect()
    }

    /// All quarantined tests.
    #[must_use]
    pub fn quarantined_tests(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.flakiness_score() >= QUARANTINE_THRESHOLD)
            .map(|r| r.test_name.clone())
            .collect()
    }

    /// Run a test, recording outcomes and retrying failures while the test
    /// is known flaky. Returns the final outcome.
    pub fn run_with_retry(
        &mut self,
        test_name: &str,
        mut run_fn: impl FnMut() -> bool,
    ) -> bool {
        let mut passed = false;
        for attempt in 1..=self.max_retries {
            passed = run_fn();
            self.record_outcome(test_name, passed);
            if passed {
                return true;
            }
            if !self.should_retry(test_name, attempt) {
                break;
            }
            tracing::info!(test = test_name, attempt, "retrying flaky test");
        }
        passed
    }

    /// Override quarantined failures to passes.
    ///
    /// Returns the adjusted map and the list of quarantined tests whose
    /// failures were ignored. Non-quarantined failures keep their verdict.
    #[must_use]
    pub fn adjust_test_results(
        &self,
        results: &BTreeMap<String, bool>,
    ) -> (BTreeMap<String, bool>, Vec<String>) {
        let mut adjusted = BTreeMap::new();
        let mut quarantined = Vec::new();
        for (test_name, passed) in results {
            if !passed && self.is_quarantined(test_name) {
                tracing::warn!(
                    test = test_name,
                    score = self.flakiness_score(test_name),
                    "ignoring quarantined test failure"
                );
                adjusted.insert(test_name.clone(), true);
                quarantined.push(test_name.clone());
            } else {
                adjusted.insert(test_name.clone(), *passed);
            }
        }
        (adjusted, quarantined)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
