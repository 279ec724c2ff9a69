//! Security boundaries exercised end-to-end: path traversal, encoded
//! metacharacters, and gate-level containment of violations.

use std::time::Duration;

use convoy::error::OrchestratorError;
use convoy::exec::{ExecPolicy, SecureCommand, SecureExecutor};
use convoy::gates::{GateEngine, GateSpec, GateStatus};
use convoy::sandbox::{safe_path, validate_glob_pattern};
use tempfile::TempDir;

/// The canonical double-encoded traversal: `%252e%252e` hides `..` behind
/// two rounds of decoding. Rejected without touching the filesystem.
#[test]
fn double_encoded_traversal_rejected() {
    let base = TempDir::new().unwrap();
    let err = safe_path(base.path(), "foo/%252e%252e/etc/passwd").unwrap_err();
    assert!(matches!(err, OrchestratorError::PathTraversal { .. }));
    // Nothing was created along the probed path.
    assert!(!base.path().join("foo").exists());
}

/// Single-encoded traversal is caught by the first decode round.
#[test]
fn single_encoded_traversal_rejected() {
    let base = TempDir::new().unwrap();
    assert!(safe_path(base.path(), "foo/%2e%2e/secret").is_err());
}

/// An intermediate symlink that escapes the base poisons the whole path,
/// even though the final component never exists.
#[cfg(unix)]
#[test]
fn intermediate_symlink_escape_rejected() {
    let outside = TempDir::new().unwrap();
    let base = TempDir::new().unwrap();
    std::fs::create_dir(base.path().join("inner")).unwrap();
    std::os::unix::fs::symlink(outside.path(), base.path().join("inner/exit")).unwrap();

    let err = safe_path(base.path(), "inner/exit/back/inside.txt").unwrap_err();
    assert!(format!("{err}").contains("symlink"));
}

/// `%25%3B` decodes to `%3B` and then to `;` — the executor rejects it at
/// every decoding depth.
#[test]
fn double_encoded_semicolon_argument_rejected() {
    let executor = SecureExecutor::new(ExecPolicy::new(vec!["echo".to_owned()]));
    for payload in ["%25%3B", "%253B", ";", "%3B"] {
        let cmd = SecureCommand::direct(
            "echo",
            vec![payload.to_owned()],
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        let err = executor.run(&cmd).unwrap_err();
        assert!(
            matches!(err, OrchestratorError::Security { .. }),
            "payload {payload:?} must be rejected"
        );
    }
}

/// Gates never raise on violations; they report failed results so the
/// workflow executor can retry or fail the phase cleanly.
#[test]
fn gate_engine_contains_violations_as_results() {
    let dir = TempDir::new().unwrap();
    let engine = GateEngine::new(dir.path().to_path_buf());

    let results = engine.validate_all(&[
        GateSpec::FileExists {
            path: "../../etc/passwd".to_owned(),
        },
        GateSpec::Command {
            cmd: "rm -rf /".to_owned(),
            exit_code: 0,
            timeout: 5,
            expect_empty: false,
        },
        GateSpec::NoPattern {
            pattern: "x".to_owned(),
            paths: vec!["/etc/*".to_owned()],
        },
    ]);

    assert_eq!(results.len(), 3);
    for result in &results {
        assert_eq!(result.status, GateStatus::Failed);
        assert!(result.reason.is_some());
    }
}

/// Glob validation rejects everything that could reach outside the
/// working tree.
#[test]
fn unsafe_globs_rejected() {
    for bad in ["../*", "/etc/*", "~/.ssh/*", "**/../up", "C:/Windows/*"] {
        assert!(!validate_glob_pattern(bad), "{bad} should be rejected");
    }
    for good in ["src/**/*.rs", "*.json", "tests/fixtures/*.yaml"] {
        assert!(validate_glob_pattern(good), "{good} should be accepted");
    }
}
