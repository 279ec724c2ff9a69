//! Textual conflict detection via merge preview.
//!
//! Creates an ephemeral branch off the base, merges each input branch in
//! sequence with `--no-ff --no-commit`, and records the first conflicting
//! merge: the conflicted paths with per-file conflict-hunk counts. The
//! ephemeral branch is always cleaned up, conflict or not.

use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

use super::{RiskFlag, Severity, detect_risk_flags};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// One conflicted file in the merge preview.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConflictingFile {
    /// Path relative to the repository root.
    pub path: String,
    /// Number of conflict hunks in the file.
    pub hunks: usize,
}

/// Result of the textual stage.
#[derive(Clone, Debug, Default)]
pub struct TextualConflictReport {
    /// Whether any merge in the sequence conflicted.
    pub has_conflicts: bool,
    /// Conflicted files from the first conflicting merge.
    pub conflicting_files: Vec<ConflictingFile>,
    /// Severity derived from risk flags and hunk volume.
    pub severity: Option<Severity>,
    /// Risk flags raised by the conflicting paths.
    pub risk_flags: Vec<RiskFlag>,
}

impl TextualConflictReport {
    /// Number of conflicted files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.conflicting_files.len()
    }
}

// ---------------------------------------------------------------------------
// TextualDetector
// ---------------------------------------------------------------------------

/// Severity scale for hunk volume when no risk flag applies.
const HIGH_HUNKS: usize = 20;
const MEDIUM_HUNKS: usize = 5;

/// Detects textual conflicts between branches by merge preview.
#[derive(Debug)]
pub struct TextualDetector {
    vcs: Vcs,
    base: BranchRef,
}

impl TextualDetector {
    #[must_use]
    pub const fn new(vcs: Vcs, base: BranchRef) -> Self {
        Self { vcs, base }
    }

    /// Run the merge preview over `branches`.
    ///
    /// # Errors
    /// Returns an error only for VCS-level failures; conflicts are data,
    /// not errors.
    pub fn detect(&self, branches: &[BranchRef]) -> Result<TextualConflictReport, OrchestratorError> {
        if branches.is_empty() {
            return Ok(TextualConflictReport::default());
        }

        let preview_name = format!("preview-merge-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let preview = BranchRef::new(&preview_name)?;
        let original = self.vcs.current_branch()?;
        let original = BranchRef::new(&original)?;

        self.vcs.checkout_new_branch(&preview, &self.base)?;
        let outcome = self.preview_merges(branches);

        // Cleanup runs regardless of the preview outcome.
        let _ = self.vcs.merge_abort();
        self.vcs.checkout(&original)?;
        let _ = self.vcs.delete_branch(&preview);

        outcome
    }

    fn preview_merges(
        &self,
        branches: &[BranchRef],
    ) -> Result<TextualConflictReport, OrchestratorError> {
        for branch in branches {
            let merge = self.vcs.merge_no_commit(branch)?;
            if merge.success() {
                self.vcs.commit(&format!("preview merge of {branch}"))?;
                continue;
            }

            // First conflicting merge: gather the conflicted paths and the
            // conflict-marker hunk counts from the working tree.
            let conflicted = self.vcs.conflicted_files()?;
            let mut conflicting_files = Vec::with_capacity(conflicted.len());
            for path in conflicted {
                let hunks = self.count_hunks(&path);
                conflicting_files.push(ConflictingFile { path, hunks });
            }

            let paths: Vec<String> = conflicting_files.iter().map(|f| f.path.clone()).collect();
            let risk_flags = detect_risk_flags(&paths);
            let total_hunks: usize = conflicting_files.iter().map(|f| f.hunks).sum();
            let severity = if !risk_flags.is_empty() {
                Severity::Critical
            } else if total_hunks > HIGH_HUNKS {
                Severity::High
            } else if total_hunks > MEDIUM_HUNKS {
                Severity::Medium
            } else {
                Severity::Low
            };

            return Ok(TextualConflictReport {
                has_conflicts: true,
                conflicting_files,
                severity: Some(severity),
                risk_flags,
            });
        }

        Ok(TextualConflictReport::default())
    }

    fn count_hunks(&self, path: &str) -> usize {
        let full = self.vcs.repo_path().join(path);
        std::fs::read_to_string(full)
            .map(|content| content.lines().filter(|l| l.starts_with("<<<<<<<")).count())
            .unwrap_or(1)
            .max(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &TempDir, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {:?}", out);
    }

    fn repo() -> (TempDir, Vcs) {
        let dir = TempDir::new().unwrap();
        git(&dir, &["init", "-b", "main"]);
        git(&dir, &["config", "user.email", "t@example.com"]);
        git(&dir, &["config", "user.name", "T"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        git(&dir, &["add", "-A"]);
        git(&dir, &["commit", "-m", "init"]);
        let vcs = Vcs::new(dir.path().to_path_buf());
        (dir, vcs)
    }

    fn branch(name: &str) -> BranchRef {
        BranchRef::new(name).unwrap()
    }

    fn make_branch(dir: &TempDir, name: &str, file: &str, content: &str) {
        git(dir, &["checkout", "-b", name, "main"]);
        std::fs::write(dir.path().join(file), content).unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-m", name]);
        git(dir, &["checkout", "main"]);
    }

    #[test]
    fn disjoint_branches_do_not_conflict() {
        let (dir, vcs) = repo();
        make_branch(&dir, "a", "a.txt", "from a\n");
        make_branch(&dir, "b", "b.txt", "from b\n");

        let detector = TextualDetector::new(vcs.clone(), branch("main"));
        let report = detector.detect(&[branch("a"), branch("b")]).unwrap();
        assert!(!report.has_conflicts);
        // Preview branch cleaned up, original branch restored.
        assert_eq!(vcs.current_branch().unwrap(), "main");
    }

    #[test]
    fn overlapping_edits_conflict() {
        let (dir, vcs) = repo();
        make_branch(&dir, "a", "shared.txt", "from a\n");
        make_branch(&dir, "b", "shared.txt", "from b\n");

        let detector = TextualDetector::new(vcs.clone(), branch("main"));
        let report = detector.detect(&[branch("a"), branch("b")]).unwrap();
        assert!(report.has_conflicts);
        assert_eq!(report.file_count(), 1);
        assert_eq!(report.conflicting_files[0].path, "shared.txt");
        assert!(report.conflicting_files[0].hunks >= 1);
        assert_eq!(report.severity, Some(Severity::Low));
        assert_eq!(vcs.current_branch().unwrap(), "main");
    }

    #[test]
    fn risky_conflicting_path_is_critical() {
        let (dir, vcs) = repo();
        // Seed an auth file on main so both branches edit the same path.
        git(&dir, &["checkout", "main"]);
        std::fs::create_dir_all(dir.path().join("src/auth")).unwrap();
        std::fs::write(dir.path().join("src/auth/login.py"), "base\n").unwrap();
        git(&dir, &["add", "-A"]);
        git(&dir, &["commit", "-m", "auth file"]);
        make_branch(&dir, "a", "src/auth/login.py", "variant a\n");
        make_branch(&dir, "b", "src/auth/login.py", "variant b\n");

        let detector = TextualDetector::new(vcs, branch("main"));
        let report = detector.detect(&[branch("a"), branch("b")]).unwrap();
        assert!(report.has_conflicts);
        assert_eq!(report.severity, Some(Severity::Critical));
        assert!(report.risk_flags.contains(&RiskFlag::Auth));
    }
}
