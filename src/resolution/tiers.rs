//! Stage 5: tiered candidate validation.
//!
//! Progressive fail-fast tiers: smoke (build only), lint (informational
//! score), targeted tests (related to the modified files, 5-minute
//! budget), comprehensive (full suite, 10-minute budget). A candidate that
//! fails an early tier never reaches the expensive ones. Candidates that
//! touch high-risk paths are validated at the comprehensive tier no matter
//! what. Test failures are routed through the flaky-test handler before
//! they count: quarantined failures are forgiven.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::exec::{ExecPolicy, SecureCommand, SecureExecutor};
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

use super::candidates::ResolutionCandidate;
use super::flaky::FlakyTestHandler;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Paths that force comprehensive validation.
const HIGH_RISK_PATTERNS: [&str; 9] = [
    r"auth",
    r"security",
    r"payment",
    r"billing",
    r"migration",
    r"\bapi\b|api/",
    r"credential",
    r"secret",
    r"\.github/workflows/",
];

/// Executables validation may run.
const VALIDATION_EXECUTABLES: [&str; 12] = [
    "cargo", "npm", "node", "go", "pip", "pytest", "make", "cmake", "ctest", "ruff", "eslint",
    "git",
];

/// Targeted-test budget.
const TARGETED_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Full-suite budget.
const FULL_TEST_TIMEOUT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// ValidationTier
// ---------------------------------------------------------------------------

/// Validation depth, cheapest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationTier {
    Smoke,
    Lint,
    Targeted,
    Comprehensive,
}

/// Pick the tier a candidate must clear, based on the files it touches.
#[must_use]
pub fn determine_tier(files_modified: &[String]) -> ValidationTier {
    for file in files_modified {
        let lower = file.to_lowercase();
        for pattern in HIGH_RISK_PATTERNS {
            if Regex::new(pattern).is_ok_and(|re| re.is_match(&lower)) {
                tracing::info!(file, pattern, "high-risk path forces comprehensive validation");
                return ValidationTier::Comprehensive;
            }
        }
    }
    ValidationTier::Targeted
}

// ---------------------------------------------------------------------------
// TieredValidationResult
// ---------------------------------------------------------------------------

/// Parsed test counts and failing test names from one run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failed_names: Vec<String>,
}

/// Per-candidate validation record.
#[derive(Clone, Debug, Default)]
pub struct TieredValidationResult {
    pub candidate_id: String,
    pub tier_reached: Option<ValidationTier>,
    pub build_passed: bool,
    pub build_time_ms: u64,
    pub lint_score: f64,
    pub targeted: TestCounts,
    pub full: TestCounts,
    /// Tests whose failures were forgiven by quarantine.
    pub quarantined: Vec<String>,
}

// ---------------------------------------------------------------------------
// TieredValidator
// ---------------------------------------------------------------------------

/// Validates candidates through progressive tiers.
#[derive(Debug)]
pub struct TieredValidator {
    vcs: Vcs,
    executor: SecureExecutor,
    build_command: Option<String>,
    lint_command: Option<String>,
    test_command: Option<String>,
}

impl TieredValidator {
    #[must_use]
    pub fn new(vcs: Vcs) -> Self {
        let policy = ExecPolicy::new(
            VALIDATION_EXECUTABLES
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        );
        Self {
            vcs,
            executor: SecureExecutor::new(policy),
            build_command: None,
            lint_command: None,
            test_command: None,
        }
    }

    /// Configure explicit build/lint/test commands.
    #[must_use]
    pub fn with_commands(
        mut self,
        build: Option<String>,
        lint: Option<String>,
        test: Option<String>,
    ) -> Self {
        self.build_command = build;
        self.lint_command = lint;
        self.test_command = test;
        self
    }

    /// Validate every candidate, updating its build/lint/test fields, and
    /// return the per-candidate records.
    pub fn validate_all(
        &self,
        candidates: &mut [ResolutionCandidate],
        flaky: &mut FlakyTestHandler,
    ) -> Vec<TieredValidationResult> {
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter_mut() {
            let tier = determine_tier(&candidate.files_modified);
            let result = self.validate_candidate(candidate, tier, flaky);

            candidate.build_passed = result.build_passed;
            candidate.lint_score = result.lint_score;
            candidate.tests_passed = result.targeted.passed + result.full.passed;
            candidate.tests_failed = result.targeted.failed + result.full.failed;
            candidate.tests_skipped = result.targeted.skipped + result.full.skipped;

            results.push(result);
        }
        results
    }

    /// Validate one candidate up to `target_tier`, stopping at the first
    /// failed gate.
    pub fn validate_candidate(
        &self,
        candidate: &ResolutionCandidate,
        target_tier: ValidationTier,
        flaky: &mut FlakyTestHandler,
    ) -> TieredValidationResult {
        let mut result = TieredValidationResult {
            candidate_id: candidate.id.clone(),
            ..TieredValidationResult::default()
        };

        if self.checkout(&candidate.branch).is_err() {
            return result;
        }

        // Tier 1: smoke.
        let start = Instant::now();
        result.build_passed = self.run_build();
        result.build_time_ms = start.elapsed().as_millis() as u64;
        result.tier_reached = Some(ValidationTier::Smoke);
        if !result.build_passed || target_tier == ValidationTier::Smoke {
            return result;
        }

        // Tier 2: lint (informational).
        result.lint_score = self.run_lint();
        result.tier_reached = Some(ValidationTier::Lint);
        if target_tier == ValidationTier::Lint {
            return result;
        }

        // Tier 3: targeted tests.
        let targeted = self.run_tests(
            self.targeted_command(&candidate.files_modified),
            TARGETED_TEST_TIMEOUT,
        );
        let (targeted, mut quarantined) = forgive_quarantined(targeted, flaky);
        result.targeted = targeted;
        result.quarantined.append(&mut quarantined);
        result.tier_reached = Some(ValidationTier::Targeted);
        if result.targeted.failed > 0 || target_tier == ValidationTier::Targeted {
            return result;
        }

        // Tier 4: comprehensive.
        let full = self.run_tests(self.test_command_or_detect(), FULL_TEST_TIMEOUT);
        let (full, mut quarantined) = forgive_quarantined(full, flaky);
        result.full = full;
        result.quarantined.append(&mut quarantined);
        result.tier_reached = Some(ValidationTier::Comprehensive);
        result
    }

    fn checkout(&self, branch: &BranchRef) -> Result<(), ()> {
        self.vcs.checkout(branch).map_err(|err| {
            tracing::error!(branch = %branch, error = %err, "cannot check out candidate");
        })
    }

    fn run_build(&self) -> bool {
        let Some(command) = self.build_command.clone().or_else(|| self.detect_build()) else {
            return true;
        };
        self.run(&command, Duration::from_secs(300))
            .map(|(success, _)| success)
            .unwrap_or(false)
    }

    /// Lint score in `[0, 1]`: 1.0 for a clean run, decreasing with issue
    /// count.
    fn run_lint(&self) -> f64 {
        let Some(command) = self.lint_command.clone().or_else(|| self.detect_lint()) else {
            return 1.0;
        };
        match self.run(&command, Duration::from_secs(120)) {
            Ok((true, _)) => 1.0,
            Ok((false, output)) => {
                let issues = output
                    .lines()
                    .filter(|l| l.contains("warning") || l.contains("error"))
                    .count();
                (1.0 - issues as f64 * 0.05).max(0.0)
            }
            Err(_) => 0.5,
        }
    }

    fn run_tests(&self, command: Option<String>, timeout: Duration) -> TestCounts {
        let Some(command) = command else {
            return TestCounts::default();
        };
        match self.run(&command, timeout) {
            Ok((success, output)) => {
                let mut counts = parse_test_counts(&output);
                if !success && counts.failed == 0 {
                    // The runner failed without parsable counts; count one
                    // anonymous failure so the candidate is not viable.
                    counts.failed = 1;
                }
                counts
            }
            Err(_) => TestCounts {
                failed: 1,
                ..TestCounts::default()
            },
        }
    }

    fn targeted_command(&self, files_modified: &[String]) -> Option<String> {
        let base = self.test_command_or_detect()?;
        let test_files: Vec<&String> = files_modified
            .iter()
            .filter(|f| f.to_lowercase().contains("test"))
            .collect();
        if test_files.is_empty() || !base.contains("pytest") {
            return Some(base);
        }
        let joined = test_files
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Some(format!("pytest {joined}"))
    }

    fn test_command_or_detect(&self) -> Option<String> {
        self.test_command.clone().or_else(|| self.detect_test())
    }

    fn run(&self, command: &str, timeout: Duration) -> Result<(bool, String), ()> {
        let mut tokens = command.split_whitespace();
        let executable = tokens.next().ok_or(())?.to_owned();
        let args: Vec<String> = tokens.map(ToOwned::to_owned).collect();
        let cmd = SecureCommand::direct(
            executable,
            args,
            self.vcs.repo_path().to_path_buf(),
            timeout,
        );
        match self.executor.run(&cmd) {
            Ok(output) => Ok((
                output.success(),
                format!("{}{}", output.stdout, output.stderr),
            )),
            Err(err) => {
                tracing::warn!(command, error = %err, "validation command failed to run");
                Err(())
            }
        }
    }

    fn detect_build(&self) -> Option<String> {
        let root = self.vcs.repo_path();
        if root.join("Cargo.toml").exists() {
            Some("cargo build".to_owned())
        } else if root.join("package.json").exists() {
            Some("npm run build".to_owned())
        } else if root.join("go.mod").exists() {
            Some("go build ./...".to_owned())
        } else {
            None
        }
    }

    fn detect_lint(&self) -> Option<String> {
        let root = self.vcs.repo_path();
        if root.join("Cargo.toml").exists() {
            Some("cargo clippy".to_owned())
        } else if root.join("ruff.toml").exists() || root.join("pyproject.toml").exists() {
            Some("ruff check .".to_owned())
        } else {
            None
        }
    }

    fn detect_test(&self) -> Option<String> {
        let root = self.vcs.repo_path();
        if root.join("Cargo.toml").exists() {
            Some("cargo test".to_owned())
        } else if root.join("package.json").exists() {
            Some("npm test".to_owned())
        } else if root.join("pyproject.toml").exists() || root.join("requirements.txt").exists() {
            Some("pytest".to_owned())
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Flaky routing
// ---------------------------------------------------------------------------

/// Record outcomes with the flaky handler and forgive quarantined
/// failures.
fn forgive_quarantined(
    mut counts: TestCounts,
    flaky: &mut FlakyTestHandler,
) -> (TestCounts, Vec<String>) {
    if counts.failed_names.is_empty() {
        return (counts, Vec::new());
    }

    let results: BTreeMap<String, bool> = counts
        .failed_names
        .iter()
        .map(|name| (name.clone(), false))
        .collect();
    for name in &counts.failed_names {
        flaky.record_outcome(name, false);
    }
    let (adjusted, quarantined) = flaky.adjust_test_results(&results);

    let forgiven = adjusted.values().filter(|passed| **passed).count() as u32;
    counts.failed = counts.failed.saturating_sub(forgiven);
    counts.passed += forgiven;
    counts
        .failed_names
        .retain(|name| !quarantined.contains(name));
    (counts, quarantined)
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse pass/fail/skip counts and failing test names from common test
/// runner output (pytest, cargo test).
#[must_use]
pub fn parse_test_counts(output: &str) -> TestCounts {
    let mut counts = TestCounts::default();

    let passed_re = Regex::new(r"(\d+)\s+passed").expect("static regex");
    let failed_re = Regex::new(r"(\d+)\s+failed").expect("static regex");
    let skipped_re = Regex::new(r"(\d+)\s+(?:skipped|ignored)").expect("static regex");

    for captures in passed_re.captures_iter(output) {
        counts.passed += captures[1].parse::<u32>().unwrap_or(0);
    }
    for captures in failed_re.captures_iter(output) {
        counts.failed += captures[1].parse::<u32>().unwrap_or(0);
    }
    for captures in skipped_re.captures_iter(output) {
        counts.skipped += captures[1].parse::<u32>().unwrap_or(0);
    }

    // pytest: "FAILED tests/test_x.py::test_name"
    let pytest_failed = Regex::new(r"(?m)^FAILED\s+(\S+)").expect("static regex");
    for captures in pytest_failed.captures_iter(output) {
        counts.failed_names.push(captures[1].to_owned());
    }
    // cargo: "test module::name ... FAILED"
    let cargo_failed = Regex::new(r"(?m)^test\s+(\S+)\s+\.\.\.\s+FAILED").expect("static regex");
    for captures in cargo_failed.captures_iter(output) {
        counts.failed_names.push(captures[1].to_owned());
    }

    counts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // -- tier determination --

    #[test]
    fn plain_files_get_targeted_tier() {
        let files = vec!["src/parser.rs".to_owned(), "README.md".to_owned()];
        assert_eq!(determine_tier(&files), ValidationTier::Targeted);
    }

    #[test]
    fn risky_files_force_comprehensive() {
        for risky in [
            "src/auth/session.rs",
            "billing/invoice.py",
            "db/migrations/0001.sql",
            ".github/workflows/release.yml",
            "config/credentials.yaml",
        ] {
            assert_eq!(
                determine_tier(&[risky.to_owned()]),
                ValidationTier::Comprehensive,
                "{risky} should force comprehensive"
            );
        }
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(ValidationTier::Smoke < ValidationTier::Lint);
        assert!(ValidationTier::Lint < ValidationTier::Targeted);
        assert!(ValidationTier::Targeted < ValidationTier::Comprehensive);
    }

    // -- output parsing --

    #[test]
    fn parses_pytest_summary() {
        let output = "collected 12 items\n\nFAILED tests/test_auth.py::test_login\n= 1 failed, 10 passed, 1 skipped in 2.31s =\n";
        let counts = parse_test_counts(output);
        assert_eq!(counts.passed, 10);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.failed_names, vec!["tests/test_auth.py::test_login".to_owned()]);
    }

    #[test]
    fn parses_cargo_test_summary() {
        let output = "test budget::tests::reserve ... ok\ntest store::tests::append ... FAILED\n\ntest result: FAILED. 41 passed; 1 failed; 2 ignored\n";
        let counts = parse_test_counts(output);
        assert_eq!(counts.passed, 41);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 2);
        assert_eq!(counts.failed_names, vec!["store::tests::append".to_owned()]);
    }

    #[test]
    fn empty_output_parses_to_zero() {
        assert_eq!(parse_test_counts(""), TestCounts::default());
    }

    // -- flaky routing --

    #[test]
    fn quarantined_failures_are_forgiven() {
        let dir = TempDir::new().unwrap();
        let mut flaky = FlakyTestHandler::new(dir.path().join("flaky.json"));
        // Build an alternating (quarantined) history for one test.
        for i in 0..10 {
            flaky.record_outcome("tests/test_net.py::test_timeout", i % 2 == 0);
        }

        let counts = TestCounts {
            passed: 5,
            failed: 2,
            skipped: 0,
            failed_names: vec![
                "tests/test_net.py::test_timeout".to_owned(),
                "tests/test_core.py::test_math".to_owned(),
            ],
        };
        let (adjusted, quarantined) = forgive_quarantined(counts, &mut flaky);
        assert_eq!(quarantined, vec!["tests/test_net.py::test_timeout".to_owned()]);
        assert_eq!(adjusted.failed, 1);
        assert_eq!(adjusted.passed, 6);
        assert_eq!(adjusted.failed_names, vec!["tests/test_core.py::test_math".to_owned()]);
    }

    #[test]
    fn stable_failures_keep_their_verdict() {
        let dir = TempDir::new().unwrap();
        let mut flaky = FlakyTestHandler::new(dir.path().join("flaky.json"));
        let counts = TestCounts {
            passed: 3,
            failed: 1,
            skipped: 0,
            failed_names: vec!["tests/test_core.py::test_math".to_owned()],
        };
        let (adjusted, quarantined) = forgive_quarantined(counts, &mut flaky);
        assert!(quarantined.is_empty());
        assert_eq!(adjusted.failed, 1);
    }
}
