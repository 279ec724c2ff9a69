//! Build and test of the merged tree.
//!
//! Git can call a merge clean while the result does not compile. This
//! stage materializes the merged tree on an ephemeral branch, runs a
//! detected (or configured) build command, and then the test command,
//! optionally narrowed to test files related to the change-set. The
//! ephemeral branch is deleted on every path out.

use std::time::Duration;

use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::exec::{ExecPolicy, SecureCommand, SecureExecutor};
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

// ---------------------------------------------------------------------------
// Build-system detection
// ---------------------------------------------------------------------------

/// Executables the build/test stage may run.
const BUILD_EXECUTABLES: [&str; 10] = [
    "npm", "node", "cargo", "go", "pip", "pytest", "make", "cmake", "ctest", "git",
];

/// Detection table: indicator file, build command, test command.
const BUILD_SYSTEMS: [(&str, Option<&str>, &str); 8] = [
    ("package.json", Some("npm run build"), "npm test"),
    ("Cargo.toml", Some("cargo build"), "cargo test"),
    ("go.mod", Some("go build ./..."), "go test ./..."),
    ("pyproject.toml", Some("pip install -e . -q"), "pytest"),
    ("setup.py", Some("pip install -e . -q"), "pytest"),
    ("requirements.txt", None, "pytest"),
    ("Makefile", Some("make"), "make test"),
    ("CMakeLists.txt", Some("cmake --build ."), "ctest"),
];

// ---------------------------------------------------------------------------
// BuildTestResult
// ---------------------------------------------------------------------------

/// Outcome of building and testing the merged tree.
#[derive(Clone, Debug, Default)]
pub struct BuildTestResult {
    pub build_passed: bool,
    pub tests_passed: bool,
    pub build_output: String,
    pub test_output: String,
    /// Set when the stage could not even run (merge failed, etc.).
    pub error: Option<String>,
}

impl BuildTestResult {
    /// True when both build and tests passed.
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.build_passed && self.tests_passed
    }

    fn clean() -> Self {
        Self {
            build_passed: true,
            tests_passed: true,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// MergeBuildTester
// ---------------------------------------------------------------------------

/// Builds and tests the merged result of a branch set.
#[derive(Debug)]
pub struct MergeBuildTester {
    vcs: Vcs,
    base: BranchRef,
    executor: SecureExecutor,
    build_command: Option<String>,
    test_command: Option<String>,
    timeout: Duration,
}

impl MergeBuildTester {
    #[must_use]
    pub fn new(vcs: Vcs, base: BranchRef) -> Self {
        let policy = ExecPolicy::new(
            BUILD_EXECUTABLES
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        );
        Self {
            vcs,
            base,
            executor: SecureExecutor::new(policy),
            build_command: None,
            test_command: None,
            timeout: Duration::from_secs(300),
        }
    }

    /// Override auto-detection with explicit commands.
    #[must_use]
    pub fn with_commands(
        mut self,
        build_command: Option<String>,
        test_command: Option<String>,
    ) -> Self {
        self.build_command = build_command;
        self.test_command = test_command;
        self
    }

    /// Override the per-command timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Merge `branches` onto an ephemeral branch and build/test the result.
    ///
    /// # Errors
    /// Returns an error only for VCS-level failures; build and test
    /// failures are data in the result.
    pub fn test(
        &self,
        branches: &[BranchRef],
        modified_files: &[String],
    ) -> Result<BuildTestResult, OrchestratorError> {
        if branches.is_empty() {
            return Ok(BuildTestResult::clean());
        }

        let temp_name = format!("temp-merge-test-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let temp = BranchRef::new(&temp_name)?;
        let original = BranchRef::new(&self.vcs.current_branch()?)?;

        self.vcs.checkout_new_branch(&temp, &self.base)?;
        let result = self.run_on_merged(branches, modified_files);

        // Cleanup always runs: abort any half-merge, restore, delete.
        let _ = self.vcs.merge_abort();
        self.vcs.checkout(&original)?;
        let _ = self.vcs.delete_branch(&temp);

        result
    }

    fn run_on_merged(
        &self,
        branches: &[BranchRef],
        modified_files: &[String],
    ) -> Result<BuildTestResult, OrchestratorError> {
        for branch in branches {
            let merge = self.vcs.merge_no_commit(branch)?;
            if !merge.success() {
                let _ = self.vcs.merge_abort();
                return Ok(BuildTestResult {
                    error: Some("merge failed: textual conflicts exist".to_owned()),
                    ..BuildTestResult::default()
                });
            }
            self.vcs.commit(&format!("temp merge of {branch}"))?;
        }

        let build = self.run_build();
        if !build.build_passed {
            return Ok(build);
        }

        let tests = self.run_tests(modified_files);
        Ok(BuildTestResult {
            build_passed: build.build_passed,
            tests_passed: tests.tests_passed,
            build_output: build.build_output,
            test_output: tests.test_output,
            error: None,
        })
    }

    fn run_build(&self) -> BuildTestResult {
        let Some(command) = self
            .build_command
            .clone()
            .or_else(|| self.detect_build_command())
        else {
            // Nothing to build.
            return BuildTestResult::clean();
        };

        tracing::info!(command, "running build on merged tree");
        match self.run_command(&command) {
            Ok((success, output)) => BuildTestResult {
                build_passed: success,
                tests_passed: true,
                build_output: output,
                ..BuildTestResult::default()
            },
            Err(err) => BuildTestResult {
                build_passed: false,
                tests_passed: false,
                build_output: err.to_string(),
                error: Some(err.to_string()),
                ..BuildTestResult::default()
            },
        }
    }

    fn run_tests(&self, modified_files: &[String]) -> BuildTestResult {
        let Some(mut command) = self
            .test_command
            .clone()
            .or_else(|| self.detect_test_command())
        else {
            return BuildTestResult::clean();
        };

        if let Some(targeted) = targeted_test_command(&command, modified_files) {
            command = targeted;
        }

        tracing::info!(command, "running tests on merged tree");
        match self.run_command(&command) {
            Ok((success, output)) => BuildTestResult {
                build_passed: true,
                tests_passed: success,
                test_output: output,
                ..BuildTestResult::default()
            },
            Err(err) => BuildTestResult {
                build_passed: true,
                tests_passed: false,
                test_output: err.to_string(),
                error: Some(err.to_string()),
                ..BuildTestResult::default()
            },
        }
    }

    fn run_command(&self, command: &str) -> Result<(bool, String), OrchestratorError> {
        let mut tokens = command.split_whitespace();
        let executable = tokens.next().unwrap_or_default().to_owned();
        let args: Vec<String> = tokens.map(ToOwned::to_owned).collect();
        let cmd = SecureCommand::direct(
            executable,
            args,
            self.vcs.repo_path().to_path_buf(),
            self.timeout,
        );
        let output = self.executor.run(&cmd)?;
        Ok((
            output.success(),
            format!("{}{}", output.stdout, output.stderr),
        ))
    }

    fn detect_build_command(&self) -> Option<String> {
        BUILD_SYSTEMS
            .iter()
            .find(|(indicator, _, _)| self.vcs.repo_path().join(indicator).exists())
            .and_then(|(_, build, _)| build.map(ToOwned::to_owned))
    }

    fn detect_test_command(&self) -> Option<String> {
        BUILD_SYSTEMS
            .iter()
            .find(|(indicator, _, _)| self.vcs.repo_path().join(indicator).exists())
            .map(|(_, _, test)| (*test).to_owned())
    }
}

// ---------------------------------------------------------------------------
// Targeted tests
// ---------------------------------------------------------------------------

/// Narrow a test command to the test files in the change-set, when the
/// framework supports file arguments.
fn targeted_test_command(base_command: &str, modified_files: &[String]) -> Option<String> {
    let test_files: Vec<&String> = modified_files
        .iter()
        .filter(|f| {
            let lower = f.to_lowercase();
            lower.contains("test") || lower.ends_with("_test.py") || lower.ends_with("_test.go")
        })
        .collect();
    if test_files.is_empty() {
        return None;
    }

    if base_command.contains("pytest") {
        let joined = test_files
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        return Some(format!("pytest {joined}"));
    }
    if base_command.contains("go test") {
        let mut packages: Vec<String> = test_files
            .iter()
            .map(|f| {
                let parent = std::path::Path::new(f.as_str())
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                format!("./{parent}/...")
            })
            .collect();
        packages.sort();
        packages.dedup();
        return Some(format!("go test {}", packages.join(" ")));
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
