//! Programmatic gate validation.
//!
//! Gates are post-conditions on workflow phases, checked by code — the
//! agent's self-report is never consulted. Each gate evaluates to a
//! [`GateResult`]; timeouts, security violations, and traversal attempts
//! become `failed` results, never propagated errors, so the engine always
//! returns one result per gate.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::exec::{ExecPolicy, SecureCommand, SecureExecutor};
use crate::sandbox;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Executables gate commands may invoke.
const GATE_EXECUTABLES: [&str; 15] = [
    "python", "python3", "pip", "npm", "node", "npx", "cargo", "go", "make", "pytest", "ruff",
    "flake8", "pylint", "which", "git",
];

/// How many sample matches a `no_pattern` gate reports per file.
const MAX_SAMPLE_MATCHES: usize = 5;

/// How much captured output a failed command gate reports.
const MAX_OUTPUT_CHARS: usize = 1000;

const fn default_exit_code() -> i32 {
    0
}

const fn default_command_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// GateSpec
// ---------------------------------------------------------------------------

/// A single gate definition.
///
/// Serialized with a `type` tag matching the workflow YAML vocabulary:
/// `file_exists`, `command`, `no_pattern`, `json_valid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateSpec {
    /// A file must exist (and be a regular file).
    FileExists {
        /// Path relative to the working directory.
        path: String,
    },

    /// A command must exit with the expected code.
    Command {
        /// The command line; the first whitespace token is the executable,
        /// the rest are argv. No shell is ever involved.
        cmd: String,
        /// Expected exit code.
        #[serde(default = "default_exit_code")]
        exit_code: i32,
        /// Timeout in seconds.
        #[serde(default = "default_command_timeout")]
        timeout: u64,
        /// Additionally require empty stdout.
        #[serde(default)]
        expect_empty: bool,
    },

    /// No file matching the globs may contain the pattern.
    NoPattern {
        /// Regex that must not match.
        pattern: String,
        /// Glob patterns (relative, validated) selecting files to scan.
        paths: Vec<String>,
    },

    /// A file must exist and parse as JSON.
    JsonValid {
        /// Path relative to the working directory.
        path: String,
    },
}

impl GateSpec {
    /// The type tag, as it appears in workflow YAML and results.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::FileExists { .. } => "file_exists",
            Self::Command { .. } => "command",
            Self::NoPattern { .. } => "no_pattern",
            Self::JsonValid { .. } => "json_valid",
        }
    }
}

// ---------------------------------------------------------------------------
// GateResult
// ---------------------------------------------------------------------------

/// Outcome of a single gate evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of validating one gate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// The gate's type tag.
    pub gate_type: String,
    /// Pass/fail/skip.
    pub status: GateStatus,
    /// Failure reason, when failed.
    pub reason: Option<String>,
    /// Structured details for reporting.
    pub details: serde_json::Value,
}

impl GateResult {
    fn passed(gate_type: &str, details: serde_json::Value) -> Self {
        Self {
            gate_type: gate_type.to_owned(),
            status: GateStatus::Passed,
            reason: None,
            details,
        }
    }

    fn failed(gate_type: &str, reason: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            gate_type: gate_type.to_owned(),
            status: GateStatus::Failed,
            reason: Some(reason.into()),
            details,
        }
    }

    /// True when this gate passed.
    #[must_use]
    pub fn is_passed(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

/// True when every result passed.
#[must_use]
pub fn all_passed(results: &[GateResult]) -> bool {
    results.iter().all(GateResult::is_passed)
}

// ---------------------------------------------------------------------------
// GateEngine
// ---------------------------------------------------------------------------

/// Validates gates against a working directory.
#[derive(Debug)]
pub struct GateEngine {
    working_dir: PathBuf,
    executor: SecureExecutor,
}

impl GateEngine {
    /// Create an engine rooted at `working_dir`.
    #[must_use]
    pub fn new(working_dir: PathBuf) -> Self {
        let policy = ExecPolicy::new(
            GATE_EXECUTABLES
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        );
        Self {
            working_dir,
            executor: SecureExecutor::new(policy),
        }
    }

    /// Create an engine with a caller-supplied execution policy.
    #[must_use]
    pub const fn with_policy(working_dir: PathBuf, executor: SecureExecutor) -> Self {
        Self {
            working_dir,
            executor,
        }
    }

    /// Validate all gates, producing one result per gate.
    #[must_use]
    pub fn validate_all(&self, gates: &[GateSpec]) -> Vec<GateResult> {
        gates.iter().map(|gate| self.validate(gate)).collect()
    }

    /// Validate a single gate. Never panics, never raises: every failure
    /// mode is a `failed` result.
    #[must_use]
    pub fn validate(&self, gate: &GateSpec) -> GateResult {
        match gate {
            GateSpec::FileExists { path } => self.validate_file_exists(path),
            GateSpec::Command {
                cmd,
                exit_code,
                timeout,
                expect_empty,
            } => self.validate_command(cmd, *exit_code, *timeout, *expect_empty),
            GateSpec::NoPattern { pattern, paths } => self.validate_no_pattern(pattern, paths),
            GateSpec::JsonValid { path } => self.validate_json(path),
        }
    }

    // -- file_exists --

    fn validate_file_exists(&self, path: &str) -> GateResult {
        let gate_type = "file_exists";
        let resolved = match sandbox::safe_path(&self.working_dir, path) {
            Ok(p) => p,
            Err(err) => return GateResult::failed(gate_type, err.to_string(), json!({"path": path})),
        };
        if resolved.is_file() {
            GateResult::passed(gate_type, json!({"path": resolved.display().to_string()}))
        } else {
            GateResult::failed(
                gate_type,
                format!("file not found: {path}"),
                json!({"path": resolved.display().to_string()}),
            )
        }
    }

    // -- command --

    fn validate_command(
        &self,
        cmd: &str,
        expected_exit: i32,
        timeout_secs: u64,
        expect_empty: bool,
    ) -> GateResult {
        let gate_type = "command";
        let mut tokens = cmd.split_whitespace();
        let Some(executable) = tokens.next() else {
            return GateResult::failed(gate_type, "empty command", json!({"cmd": cmd}));
        };
        let args: Vec<String> = tokens.map(ToOwned::to_owned).collect();

        let command = SecureCommand::direct(
            executable,
            args,
            self.working_dir.clone(),
            Duration::from_secs(timeout_secs),
        );

        let output = match self.executor.run(&command) {
            Ok(output) => output,
            Err(err) => {
                // Timeouts and security violations are failed gates, not
                // propagated errors.
                return GateResult::failed(gate_type, err.to_string(), json!({"cmd": cmd}));
            }
        };

        if output.exit_code != expected_exit {
            return GateResult::failed(
                gate_type,
                format!(
                    "command exited with {}, expected {expected_exit}",
                    output.exit_code
                ),
                json!({
                    "cmd": cmd,
                    "exit_code": output.exit_code,
                    "stdout": truncate(&output.stdout, MAX_OUTPUT_CHARS),
                    "stderr": truncate(&output.stderr, MAX_OUTPUT_CHARS),
                }),
            );
        }

        if expect_empty && !output.stdout.trim().is_empty() {
            return GateResult::failed(
                gate_type,
                format!(
                    "expected empty output but got: {}",
                    truncate(output.stdout.trim(), 200)
                ),
                json!({"cmd": cmd, "stdout": truncate(&output.stdout, MAX_OUTPUT_CHARS)}),
            );
        }

        GateResult::passed(gate_type, json!({"cmd": cmd, "exit_code": output.exit_code}))
    }

    // -- no_pattern --

    fn validate_no_pattern(&self, pattern: &str, paths: &[String]) -> GateResult {
        let gate_type = "no_pattern";
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(err) => {
                return GateResult::failed(
                    gate_type,
                    format!("invalid regex pattern: {err}"),
                    json!({"pattern": pattern}),
                );
            }
        };

        let mut matches_found = Vec::new();
        for glob_pattern in paths {
            if !sandbox::validate_glob_pattern(glob_pattern) {
                return GateResult::failed(
                    gate_type,
                    format!("unsafe glob pattern: {glob_pattern}"),
                    json!({"pattern": glob_pattern}),
                );
            }
            let full = format!("{}/{}", self.working_dir.display(), glob_pattern);
            let Ok(entries) = glob::glob(&full) else {
                return GateResult::failed(
                    gate_type,
                    format!("invalid glob pattern: {glob_pattern}"),
                    json!({"pattern": glob_pattern}),
                );
            };
            for entry in entries.flatten() {
                if !entry.is_file() {
                    continue;
                }
                // Binary and unreadable files are skipped, not failures.
                let Ok(content) = std::fs::read_to_string(&entry) else {
                    continue;
                };
                let samples: Vec<&str> = regex
                    .find_iter(&content)
                    .take(MAX_SAMPLE_MATCHES)
                    .map(|m| m.as_str())
                    .collect();
                if !samples.is_empty() {
                    let relative = entry
                        .strip_prefix(&self.working_dir)
                        .unwrap_or(&entry)
                        .display()
                        .to_string();
                    matches_found.push(json!({"file": relative, "matches": samples}));
                }
            }
        }

        if matches_found.is_empty() {
            GateResult::passed(gate_type, json!({"pattern": pattern, "paths_checked": paths}))
        } else {
            GateResult::failed(
                gate_type,
                format!(
                    "pattern '{pattern}' found in {} file(s)",
                    matches_found.len()
                ),
                json!({"matches": matches_found}),
            )
        }
    }

    // -- json_valid --

    fn validate_json(&self, path: &str) -> GateResult {
        let gate_type = "json_valid";
        let resolved = match sandbox::safe_path(&self.working_dir, path) {
            Ok(p) => p,
            Err(err) => return GateResult::failed(gate_type, err.to_string(), json!({"path": path})),
        };
        if !resolved.is_file() {
            return GateResult::failed(
                gate_type,
                format!("file not found: {path}"),
                json!({"path": path}),
            );
        }
        let content = match std::fs::read_to_string(&resolved) {
            Ok(c) => c,
            Err(err) => {
                return GateResult::failed(
                    gate_type,
                    format!("unreadable file: {err}"),
                    json!({"path": path}),
                );
            }
        };
        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(_) => GateResult::passed(gate_type, json!({"path": path})),
            Err(err) => GateResult::failed(
                gate_type,
                format!("invalid JSON: {err}"),
                json!({"path": path}),
            ),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
