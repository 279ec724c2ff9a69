//! Fixed-vocabulary VCS surface.
//!
//! The orchestrator drives an external git installation through the secure
//! executor with a small, fixed set of subcommands: `diff`, `merge --no-ff
//! --no-commit`, `merge --abort`, `show <ref>:<path>`, `rev-parse`,
//! `ls-tree`, `checkout`, `branch -D`, `add`, and `commit -m`. Nothing else
//! is ever passed to git.
//!
//! Branches and refs are untrusted input: every ref that reaches this
//! module arrives as a validated [`BranchRef`], so flag injection and
//! rev-range tricks are ruled out before argv is assembled.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::exec::{CommandOutput, ExecPolicy, SecureCommand, SecureExecutor};
use crate::model::types::BranchRef;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default timeout for a single git invocation.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Vcs
// ---------------------------------------------------------------------------

/// Handle to a repository driven through subprocess git.
#[derive(Clone, Debug)]
pub struct Vcs {
    executor: SecureExecutor,
    repo_path: PathBuf,
    timeout: Duration,
}

impl Vcs {
    /// Create a VCS handle for the repository at `repo_path`.
    #[must_use]
    pub fn new(repo_path: PathBuf) -> Self {
        let policy = ExecPolicy::new(vec!["git".to_owned()]);
        Self {
            executor: SecureExecutor::new(policy),
            repo_path,
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    /// Override the per-invocation timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The repository path this handle operates on.
    #[must_use]
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput, OrchestratorError> {
        let cmd = SecureCommand::direct(
            "git",
            args.iter().map(|s| (*s).to_owned()).collect(),
            self.repo_path.clone(),
            self.timeout,
        );
        self.executor.run(&cmd)
    }

    fn git_ok(&self, args: &[&str]) -> Result<CommandOutput, OrchestratorError> {
        let out = self.git(args)?;
        if out.success() {
            Ok(out)
        } else {
            Err(OrchestratorError::database(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or(""),
                out.stderr.trim()
            )))
        }
    }

    // -- read operations --

    /// Resolve a ref to its commit SHA.
    ///
    /// # Errors
    /// Returns an error if the ref does not resolve.
    pub fn rev_parse(&self, r: &BranchRef) -> Result<String, OrchestratorError> {
        let out = self.git_ok(&["rev-parse", r.as_str()])?;
        Ok(out.stdout.trim().to_owned())
    }

    /// The currently checked-out branch name.
    ///
    /// # Errors
    /// Returns an error if HEAD cannot be resolved.
    pub fn current_branch(&self) -> Result<String, OrchestratorError> {
        let out = self.git_ok(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.stdout.trim().to_owned())
    }

    /// Unified diff between `base...branch`.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn diff(&self, base: &BranchRef, branch: &BranchRef) -> Result<String, OrchestratorError> {
        let range = format!("{}...{}", base.as_str(), branch.as_str());
        let out = self.git_ok(&["diff", &range])?;
        Ok(out.stdout)
    }

    /// Names of files changed between `base...branch`.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn changed_files(
        &self,
        base: &BranchRef,
        branch: &BranchRef,
    ) -> Result<Vec<String>, OrchestratorError> {
        let range = format!("{}...{}", base.as_str(), branch.as_str());
        let out = self.git_ok(&["diff", "--name-only", &range])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Read a file's contents as of a ref, or `None` if it does not exist
    /// there.
    ///
    /// # Errors
    /// Returns an error only for executor-level failures; a missing path is
    /// `Ok(None)`.
    pub fn show_file(
        &self,
        r: &BranchRef,
        path: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let spec = format!("{}:{path}", r.as_str());
        let out = self.git(&["show", &spec])?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            Ok(None)
        }
    }

    /// All file paths reachable from a ref.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn ls_tree(&self, r: &BranchRef) -> Result<Vec<String>, OrchestratorError> {
        let out = self.git_ok(&["ls-tree", "-r", "--name-only", r.as_str()])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    // -- branch and merge operations --

    /// Check out an existing ref.
    ///
    /// # Errors
    /// Returns an error if the checkout fails.
    pub fn checkout(&self, r: &BranchRef) -> Result<(), OrchestratorError> {
        self.git_ok(&["checkout", r.as_str()])?;
        Ok(())
    }

    /// Create and check out a new branch rooted at `from`.
    ///
    /// # Errors
    /// Returns an error if the branch cannot be created.
    pub fn checkout_new_branch(
        &self,
        name: &BranchRef,
        from: &BranchRef,
    ) -> Result<(), OrchestratorError> {
        self.git_ok(&["checkout", "-b", name.as_str(), from.as_str()])?;
        Ok(())
    }

    /// Delete a branch unconditionally. Failures are reported in the result
    /// rather than raised, since cleanup paths call this best-effort.
    ///
    /// # Errors
    /// Returns an error only for executor-level failures.
    pub fn delete_branch(&self, name: &BranchRef) -> Result<CommandOutput, OrchestratorError> {
        self.git(&["branch", "-D", name.as_str()])
    }

    /// Attempt `merge --no-ff --no-commit <branch>` into the current HEAD.
    ///
    /// Returns the raw output; a non-zero exit indicates textual conflicts
    /// (the caller decides whether to resolve or abort).
    ///
    /// # Errors
    /// Returns an error only for executor-level failures.
    pub fn merge_no_commit(&self, branch: &BranchRef) -> Result<CommandOutput, OrchestratorError> {
        self.git(&["merge", "--no-ff", "--no-commit", branch.as_str()])
    }

    /// Abort an in-progress merge. Best-effort.
    ///
    /// # Errors
    /// Returns an error only for executor-level failures.
    pub fn merge_abort(&self) -> Result<CommandOutput, OrchestratorError> {
        self.git(&["merge", "--abort"])
    }

    /// Resolve all current conflicts toward the current side ("ours") and
    /// stage the result.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn resolve_ours(&self) -> Result<(), OrchestratorError> {
        self.git_ok(&["checkout", "--ours", "."])?;
        self.git_ok(&["add", "-A"])?;
        Ok(())
    }

    /// Stage everything and commit with a message.
    ///
    /// An empty commit (e.g. after an already-up-to-date merge) is not an
    /// error.
    ///
    /// # Errors
    /// Returns an error if the commit fails for any other reason.
    pub fn commit(&self, message: &str) -> Result<(), OrchestratorError> {
        self.git_ok(&["add", "-A"])?;
        let out = self.git(&["commit", "-m", message])?;
        if out.success()
            || out.stdout.contains("nothing to commit")
            || out.stderr.contains("nothing to commit")
        {
            Ok(())
        } else {
            Err(OrchestratorError::database(format!(
                "git commit failed: {}",
                out.stderr.trim()
            )))
        }
    }

    /// Paths currently in a conflicted (unmerged) state.
    ///
    /// # Errors
    /// Returns an error if git fails.
    pub fn conflicted_files(&self) -> Result<Vec<String>, OrchestratorError> {
        let out = self.git_ok(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
