//! End-to-end conflict detection over a real repository: dependency
//! divergence and textual conflicts drive the recommended action.

use std::process::Command;

use convoy::conflict::dependency::DependencyConflictKind;
use convoy::conflict::{ConflictKind, DetectionPipeline, RecommendedAction, Severity};
use convoy::model::types::BranchRef;
use convoy::vcs::Vcs;
use tempfile::TempDir;

fn git(dir: &TempDir, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert!(out.status.success(), "git {args:?}: {out:?}");
}

fn init_repo(dir: &TempDir) {
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "t@example.com"]);
    git(dir, &["config", "user.name", "T"]);
}

fn commit_all(dir: &TempDir, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-m", message]);
}

fn branch(name: &str) -> BranchRef {
    BranchRef::new(name).unwrap()
}

/// Branch A pins lodash ^4, branch B pins lodash ^3: exactly one
/// incompatible high-severity conflict, and the pipeline escalates.
#[test]
fn incompatible_dependency_pins_escalate() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    // Base does not pin lodash; the divergence is purely between agents.
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name": "app", "dependencies": {}}"#,
    )
    .unwrap();
    commit_all(&dir, "init");

    git(&dir, &["checkout", "-b", "agent-a", "main"]);
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name": "app", "dependencies": {"lodash": "^4.17.0"}}"#,
    )
    .unwrap();
    commit_all(&dir, "bump lodash 4.17");
    git(&dir, &["checkout", "main"]);

    git(&dir, &["checkout", "-b", "agent-b", "main"]);
    std::fs::write(
        dir.path().join("package.json"),
        r#"{"name": "app", "dependencies": {"lodash": "^3.10.0"}}"#,
    )
    .unwrap();
    commit_all(&dir, "downgrade lodash 3.10");
    git(&dir, &["checkout", "main"]);

    let vcs = Vcs::new(dir.path().to_path_buf());
    let pipeline = DetectionPipeline::new(&vcs, branch("main")).skip_build_test(true);
    let result = pipeline.run(&[branch("agent-a"), branch("agent-b")], &[]).unwrap();

    assert!(result.has_conflicts);
    let lodash: Vec<_> = result
        .dependency_conflicts
        .iter()
        .filter(|c| c.package == "lodash")
        .collect();
    assert_eq!(lodash.len(), 1);
    assert_eq!(lodash[0].conflict_type, DependencyConflictKind::Incompatible);
    assert_eq!(lodash[0].severity, Severity::High);
    assert_eq!(result.recommended_action, RecommendedAction::Escalate);
}

/// Disjoint changes sail through as a fast merge.
#[test]
fn disjoint_branches_fast_merge() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    std::fs::write(dir.path().join("README.md"), "base\n").unwrap();
    commit_all(&dir, "init");

    for (name, file) in [("agent-a", "left.txt"), ("agent-b", "right.txt")] {
        git(&dir, &["checkout", "-b", name, "main"]);
        std::fs::write(dir.path().join(file), "content\n").unwrap();
        commit_all(&dir, name);
        git(&dir, &["checkout", "main"]);
    }

    let vcs = Vcs::new(dir.path().to_path_buf());
    let pipeline = DetectionPipeline::new(&vcs, branch("main"))
        .skip_build_test(true)
        .skip_semantic(true);
    let result = pipeline.run(&[branch("agent-a"), branch("agent-b")], &[]).unwrap();

    assert!(result.is_fast_path());
    assert_eq!(result.recommended_action, RecommendedAction::FastMerge);
    // The preview left no residue: original branch, no stray refs.
    assert_eq!(vcs.current_branch().unwrap(), "main");
}

/// Both agents editing an auth file is a critical textual conflict: the
/// pipeline short-circuits to escalation with the risk flag attached.
#[test]
fn critical_auth_conflict_short_circuits() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    std::fs::create_dir_all(dir.path().join("src/auth")).unwrap();
    std::fs::write(dir.path().join("src/auth/session.py"), "base\n").unwrap();
    commit_all(&dir, "init");

    for (name, body) in [("agent-a", "variant a\n"), ("agent-b", "variant b\n")] {
        git(&dir, &["checkout", "-b", name, "main"]);
        std::fs::write(dir.path().join("src/auth/session.py"), body).unwrap();
        commit_all(&dir, name);
        git(&dir, &["checkout", "main"]);
    }

    let vcs = Vcs::new(dir.path().to_path_buf());
    let pipeline = DetectionPipeline::new(&vcs, branch("main"));
    let result = pipeline.run(&[branch("agent-a"), branch("agent-b")], &[]).unwrap();

    assert!(result.has_conflicts);
    assert_eq!(result.conflict_type, ConflictKind::Textual);
    assert_eq!(result.severity, Some(Severity::Critical));
    assert_eq!(result.recommended_action, RecommendedAction::Escalate);
    // Short-circuit: the expensive stages never ran.
    assert!(result.build.is_none());
    assert!(result.semantic.is_none());
}

/// Plain textual overlap in an unremarkable file stays auto-resolvable.
#[test]
fn ordinary_textual_conflict_auto_resolves() {
    let dir = TempDir::new().unwrap();
    init_repo(&dir);
    std::fs::write(dir.path().join("notes.txt"), "base\n").unwrap();
    commit_all(&dir, "init");

    for (name, body) in [("agent-a", "from a\n"), ("agent-b", "from b\n")] {
        git(&dir, &["checkout", "-b", name, "main"]);
        std::fs::write(dir.path().join("notes.txt"), body).unwrap();
        commit_all(&dir, name);
        git(&dir, &["checkout", "main"]);
    }

    let vcs = Vcs::new(dir.path().to_path_buf());
    let pipeline = DetectionPipeline::new(&vcs, branch("main"))
        .skip_build_test(true)
        .skip_semantic(true);
    let result = pipeline.run(&[branch("agent-a"), branch("agent-b")], &[]).unwrap();

    assert!(result.has_conflicts);
    assert_eq!(result.conflict_type, ConflictKind::Textual);
    assert_eq!(result.recommended_action, RecommendedAction::AutoResolve);
}
