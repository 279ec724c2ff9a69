//! Stage 4: multi-candidate generation.
//!
//! Produces up to N resolution candidates, each on its own ephemeral
//! branch off the base, using distinct strategies: primary-agent merges
//! (one per agent order), convention-led merging, and — when the intents
//! genuinely conflict — a fresh synthesis. When a later merge in a
//! strategy's sequence conflicts textually, the conflict is resolved
//! toward the current side ("ours") and the number of auto-resolved hunks
//! is recorded on the candidate so the selector can down-weight it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

use super::context::ConflictContext;
use super::intent::{IntentAnalysis, IntentRelationship};

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// A candidate-generation strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Merge the first agent first; remaining conflicts resolve toward it.
    Agent1Primary,
    /// Merge the second agent first; remaining conflicts resolve toward it.
    Agent2Primary,
    /// Resolve toward repository conventions.
    ConventionPrimary,
    /// Re-synthesize from base when the intents are mutually exclusive.
    FreshSynthesis,
}

impl Strategy {
    /// The strategy's wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent1Primary => "agent1_primary",
            Self::Agent2Primary => "agent2_primary",
            Self::ConventionPrimary => "convention_primary",
            Self::FreshSynthesis => "fresh_synthesis",
        }
    }
}

/// Default strategy order.
pub const DEFAULT_STRATEGIES: [Strategy; 3] = [
    Strategy::Agent1Primary,
    Strategy::Agent2Primary,
    Strategy::ConventionPrimary,
];

// ---------------------------------------------------------------------------
// ResolutionCandidate
// ---------------------------------------------------------------------------

/// Quality scores assigned during selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateScores {
    pub correctness: f64,
    pub simplicity: f64,
    pub convention: f64,
    pub intent_satisfaction: f64,
    pub total: f64,
}

/// One generated resolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    pub id: String,
    pub strategy: Strategy,
    /// The ephemeral branch holding the resolved tree.
    pub branch: BranchRef,
    pub diff_from_base: String,
    pub files_modified: Vec<String>,
    pub summary: String,
    /// Hunks silently resolved with "ours" during generation. Non-zero
    /// values cost score at selection time.
    pub auto_resolved_hunks: usize,

    // Filled in by the tiered validator.
    pub build_passed: bool,
    pub lint_score: f64,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,

    // Filled in by the selector.
    pub scores: CandidateScores,
}

impl ResolutionCandidate {
    /// A candidate is viable when it builds and no tests fail.
    #[must_use]
    pub const fn is_viable(&self) -> bool {
        self.build_passed && self.tests_failed == 0
    }

    /// Bare candidate for unit tests of downstream stages.
    #[doc(hidden)]
    #[must_use]
    pub fn for_tests(id: &str, strategy: Strategy, diff: &str) -> Self {
        Self {
            id: id.to_owned(),
            strategy,
            branch: BranchRef::new("main").unwrap_or_else(|_| unreachable!()),
            diff_from_base: diff.to_owned(),
            files_modified: Vec::new(),
            summary: String::new(),
            auto_resolved_hunks: 0,
            build_passed: false,
            lint_score: 0.0,
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            scores: CandidateScores::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// MultiCandidateGenerator
// ---------------------------------------------------------------------------

/// Generates candidates on ephemeral branches.
#[derive(Debug)]
pub struct MultiCandidateGenerator {
    vcs: Vcs,
    base: BranchRef,
    max_candidates: usize,
}

impl MultiCandidateGenerator {
    #[must_use]
    pub const fn new(vcs: Vcs, base: BranchRef) -> Self {
        Self {
            vcs,
            base,
            max_candidates: 3,
        }
    }

    /// Override the candidate cap.
    #[must_use]
    pub const fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates;
        self
    }

    /// Generate candidates for the context under the selected strategies.
    ///
    /// # Errors
    /// Returns an error only for unrecoverable VCS failures; a strategy
    /// that cannot produce a branch is skipped.
    pub fn generate(
        &self,
        context: &ConflictContext,
        intents: &IntentAnalysis,
    ) -> Result<Vec<ResolutionCandidate>, OrchestratorError> {
        let strategies = select_strategies(intents, self.max_candidates);
        tracing::info!(?strategies, "generating resolution candidates");

        let original = BranchRef::new(&self.vcs.current_branch()?)?;
        let mut candidates = Vec::new();

        for strategy in strategies {
            match self.generate_one(strategy, context) {
                Ok(Some(candidate)) => {
                    tracing::info!(id = %candidate.id, strategy = strategy.as_str(), "candidate generated");
                    candidates.push(candidate);
                }
                Ok(None) => {
                    tracing::warn!(strategy = strategy.as_str(), "strategy produced no candidate");
                }
                Err(err) => {
                    tracing::warn!(strategy = strategy.as_str(), error = %err, "candidate generation failed");
                }
            }
            // Each strategy leaves HEAD somewhere; always return home.
            let _ = self.vcs.merge_abort();
            self.vcs.checkout(&original)?;
        }

        Ok(candidates)
    }

    fn generate_one(
        &self,
        strategy: Strategy,
        context: &ConflictContext,
    ) -> Result<Option<ResolutionCandidate>, OrchestratorError> {
        let branches: Vec<BranchRef> = context.agent_branches.values().cloned().collect();
        if branches.len() < 2 {
            return Ok(None);
        }

        let id = format!("candidate-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let branch = BranchRef::new(&format!("resolution/{id}"))?;

        self.vcs.checkout_new_branch(&branch, &self.base)?;

        let order: Vec<&BranchRef> = match strategy {
            Strategy::Agent1Primary | Strategy::ConventionPrimary | Strategy::FreshSynthesis => {
                branches.iter().collect()
            }
            Strategy::Agent2Primary => branches.iter().rev().collect(),
        };

        let mut auto_resolved_hunks = 0_usize;
        for (index, merge_branch) in order.iter().enumerate() {
            let allow_conflicts = index > 0 || strategy == Strategy::FreshSynthesis;
            let merge = self.vcs.merge_no_commit(merge_branch)?;
            if merge.success() {
                self.vcs.commit(&format!("merge {merge_branch}"))?;
                continue;
            }
            if !allow_conflicts {
                // The primary merge must apply cleanly for this strategy.
                let _ = self.vcs.merge_abort();
                let _ = self.vcs.checkout(&self.base);
                let _ = self.vcs.delete_branch(&branch);
                return Ok(None);
            }
            let conflicted = self.vcs.conflicted_files()?;
            auto_resolved_hunks += conflicted
                .iter()
                .map(|path| self.count_hunks(path))
                .sum::<usize>();
            self.vcs.resolve_ours()?;
            self.vcs
                .commit(&format!("merge {merge_branch} (auto-resolved toward current side)"))?;
        }

        let diff_from_base = self.vcs.diff(&self.base, &branch)?;
        let files_modified = self.vcs.changed_files(&self.base, &branch)?;
        let summary = summarize(strategy, context);

        Ok(Some(ResolutionCandidate {
            id,
            strategy,
            branch,
            diff_from_base,
            files_modified,
            summary,
            auto_resolved_hunks,
            build_passed: false,
            lint_score: 0.0,
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            scores: CandidateScores::default(),
        }))
    }

    fn count_hunks(&self, path: &str) -> usize {
        std::fs::read_to_string(self.vcs.repo_path().join(path))
            .map(|content| content.lines().filter(|l| l.starts_with("<<<<<<<")).count())
            .unwrap_or(1)
            .max(1)
    }

    /// Delete the ephemeral branches of rejected candidates.
    pub fn cleanup(&self, candidates: &[ResolutionCandidate]) {
        for candidate in candidates {
            let _ = self.vcs.delete_branch(&candidate.branch);
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy selection
// ---------------------------------------------------------------------------

/// Pick strategies for this run: the defaults, `fresh_synthesis` appended
/// when intents conflict, reordered so the higher-confidence agent's
/// primary strategy goes first.
#[must_use]
pub fn select_strategies(intents: &IntentAnalysis, max_candidates: usize) -> Vec<Strategy> {
    let mut strategies: Vec<Strategy> = DEFAULT_STRATEGIES.to_vec();

    if intents
        .comparison
        .as_ref()
        .is_some_and(|c| c.relationship == IntentRelationship::Conflicting)
    {
        strategies.push(Strategy::FreshSynthesis);
    }

    if intents.intents.len() >= 2 {
        let first = intents.intents[0].confidence;
        let second = intents.intents[1].confidence;
        if second > first {
            strategies.retain(|s| *s != Strategy::Agent2Primary);
            strategies.insert(0, Strategy::Agent2Primary);
        } else if first > second && strategies.first() != Some(&Strategy::Agent1Primary) {
            strategies.retain(|s| *s != Strategy::Agent1Primary);
            strategies.insert(0, Strategy::Agent1Primary);
        }
    }

    strategies.truncate(max_candidates.max(1));
    strategies
}

fn summarize(strategy: Strategy, context: &ConflictContext) -> String {
    let agents = context.agent_ids();
    let first = agents.first().map(ToString::to_string).unwrap_or_default();
    let second = agents.get(1).map(ToString::to_string).unwrap_or_default();
    match strategy {
        Strategy::Agent1Primary => format!(
            "resolution prioritizes {first}'s architecture, adapting {second}'s features to fit"
        ),
        Strategy::Agent2Primary => format!(
            "resolution prioritizes {second}'s architecture, adapting {first}'s features to fit"
        ),
        Strategy::ConventionPrimary => {
            "resolution follows existing codebase conventions, adapting both agents' changes".to_owned()
        }
        Strategy::FreshSynthesis => {
            "resolution synthesizes a fresh combination of both agents' conflicting intents".to_owned()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::AgentId;
    use crate::resolution::intent::{Confidence as C, ExtractedIntent, IntentComparison};
    use std::collections::BTreeMap;
    use std::process::Command;
    use tempfile::TempDir;

    fn analysis(
        first: C,
        second: C,
        relationship: Option<IntentRelationship>,
    ) -> IntentAnalysis {
        let intent = |agent: &str, confidence: C| ExtractedIntent {
            agent_id: AgentId::new(agent).unwrap(),
            primary_intent: String::new(),
            hard_constraints: vec![],
            soft_constraints: vec![],
            secondary_effects: vec![],
            assumptions: vec![],
            evidence: vec![],
            confidence,
            confidence_reasons: vec![],
        };
        IntentAnalysis {
            intents: vec![intent("agent-a", first), intent("agent-b", second)],
            comparison: relationship.map(|relationship| IntentComparison {
                relationship,
                shared_constraints: vec![],
                conflicting_constraints: vec![],
                suggested_resolution: String::new(),
                requires_human_judgment: false,
                confidence: C::Medium,
            }),
            overall_confidence: C::Medium,
        }
    }

    // -- strategy selection --

    #[test]
    fn default_strategies_when_balanced() {
        let strategies = select_strategies(&analysis(C::Medium, C::Medium, None), 3);
        assert_eq!(strategies, DEFAULT_STRATEGIES.to_vec());
    }

    #[test]
    fn conflicting_intents_add_fresh_synthesis() {
        let strategies = select_strategies(
            &analysis(C::Medium, C::Medium, Some(IntentRelationship::Conflicting)),
            4,
        );
        assert!(strategies.contains(&Strategy::FreshSynthesis));
    }

    #[test]
    fn higher_confidence_agent_goes_first() {
        let strategies = select_strategies(&analysis(C::Low, C::High, None), 3);
        assert_eq!(strategies[0], Strategy::Agent2Primary);
    }

    #[test]
    fn cap_respected() {
        let strategies = select_strategies(
            &analysis(C::Medium, C::Medium, Some(IntentRelationship::Conflicting)),
            2,
        );
        assert_eq!(strategies.len(), 2);
    }

    // -- generation against a real repository --

    fn git(dir: &TempDir, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {out:?}");
    }

    fn conflicted_repo() -> (TempDir, Vcs, ConflictContext) {
        let dir = TempDir::new().unwrap();
        git(&dir, &["init", "-b", "main"]);
        git(&dir, &["config", "user.email", "t@example.com"]);
        git(&dir, &["config", "user.name", "T"]);
        std::fs::write(dir.path().join("shared.txt"), "base\n").unwrap();
        git(&dir, &["add", "-A"]);
        git(&dir, &["commit", "-m", "init"]);
        for (name, body) in [("agent-a", "from a\n"), ("agent-b", "from b\n")] {
            git(&dir, &["checkout", "-b", name, "main"]);
            std::fs::write(dir.path().join("shared.txt"), body).unwrap();
            git(&dir, &["add", "-A"]);
            git(&dir, &["commit", "-m", name]);
            git(&dir, &["checkout", "main"]);
        }

        let mut context = ConflictContext::default();
        let mut agent_branches = BTreeMap::new();
        agent_branches.insert(
            AgentId::new("agent-a").unwrap(),
            BranchRef::new("agent-a").unwrap(),
        );
        agent_branches.insert(
            AgentId::new("agent-b").unwrap(),
            BranchRef::new("agent-b").unwrap(),
        );
        context.agent_branches = agent_branches;
        context.conflicting_files = vec!["shared.txt".to_owned()];

        let vcs = Vcs::new(dir.path().to_path_buf());
        (dir, vcs, context)
    }

    #[test]
    fn generates_candidates_with_auto_resolution_metadata() {
        let (dir, vcs, context) = conflicted_repo();
        let generator =
            MultiCandidateGenerator::new(vcs.clone(), BranchRef::new("main").unwrap());
        let candidates = generator
            .generate(&context, &analysis(C::Medium, C::Medium, None))
            .unwrap();

        assert!(!candidates.is_empty());
        for candidate in &candidates {
            // Later merges conflicted and were resolved "ours" — the
            // candidate must say so.
            assert!(candidate.auto_resolved_hunks >= 1);
            assert!(candidate.branch.as_str().starts_with("resolution/"));
            assert!(!candidate.diff_from_base.is_empty());
            assert_eq!(candidate.files_modified, vec!["shared.txt".to_owned()]);
        }
        // HEAD restored to the original branch.
        assert_eq!(vcs.current_branch().unwrap(), "main");

        // Agent-primary candidates resolve toward different sides.
        let a_first = candidates
            .iter()
            .find(|c| c.strategy == Strategy::Agent1Primary);
        if let Some(candidate) = a_first {
            let content = vcs
                .show_file(&candidate.branch, "shared.txt")
                .unwrap()
                .unwrap();
            assert_eq!(content, "from a\n");
        }
        drop(dir);
    }

    #[test]
    fn cleanup_deletes_candidate_branches() {
        let (_dir, vcs, context) = conflicted_repo();
        let generator =
            MultiCandidateGenerator::new(vcs.clone(), BranchRef::new("main").unwrap());
        let candidates = generator
            .generate(&context, &analysis(C::Medium, C::Medium, None))
            .unwrap();
        assert!(!candidates.is_empty());

        generator.cleanup(&candidates);
        for candidate in &candidates {
            assert!(vcs.rev_parse(&candidate.branch).is_err());
        }
    }

    #[test]
    fn fewer_than_two_branches_yields_nothing() {
        let (_dir, vcs, mut context) = conflicted_repo();
        context.agent_branches.clear();
        let generator = MultiCandidateGenerator::new(vcs, BranchRef::new("main").unwrap());
        let candidates = generator
            .generate(&context, &analysis(C::Medium, C::Medium, None))
            .unwrap();
        assert!(candidates.is_empty());
    }
}
