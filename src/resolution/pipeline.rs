//! The resolution pipeline: six stages with early-exit semantics.
//!
//! 1. Context assembly   — materialize everything from the VCS.
//! 2. Intent extraction  — low confidence escalates before any code moves.
//! 3. Harmonization      — reconcile interface-level divergence.
//! 4. Candidate generation — distinct strategies on ephemeral branches.
//! 5. Tiered validation + diversity — fail fast, reject look-alike sets.
//! 6. Selection          — weighted scoring, thresholds, self-critic veto.
//!
//! Every stage failure becomes a structured escalation naming the stage —
//! nothing propagates a bare error past the pipeline boundary. Rejected
//! candidate branches are deleted before returning.

use std::collections::BTreeMap;
use std::time::Instant;

use uuid::Uuid;

use crate::config::UserConfig;
use crate::conflict::{PipelineResult, RiskFlag};
use crate::model::types::{AgentId, BranchRef};
use crate::vcs::Vcs;

use super::candidates::{MultiCandidateGenerator, ResolutionCandidate};
use super::context::ContextAssembler;
use super::critic::SelfCritic;
use super::diversity::DiversityChecker;
use super::flaky::FlakyTestHandler;
use super::intent::{Confidence, IntentExtractor};
use super::harmonize::InterfaceHarmonizer;
use super::log::ResolutionLogger;
use super::tiers::TieredValidator;

// ---------------------------------------------------------------------------
// Scoring constants
// ---------------------------------------------------------------------------

/// Minimum total score for auto-application.
const MIN_WINNER_SCORE: f64 = 0.6;

/// Strategies attempted per run (leaves room for `fresh_synthesis`).
const MAX_GENERATED_CANDIDATES: usize = 4;

/// Candidates carried into selection after diversity thinning.
const TARGET_CANDIDATES: usize = 3;

/// Runner-up closeness that triggers escalation under critical risk.
const RUNNER_UP_RATIO: f64 = 0.95;

/// Score penalty per silently auto-resolved hunk, and its cap.
const AUTO_RESOLVE_PENALTY_PER_HUNK: f64 = 0.05;
const AUTO_RESOLVE_PENALTY_CAP: f64 = 0.2;

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Final outcome of a resolution run.
#[derive(Clone, Debug)]
pub struct Resolution {
    pub resolution_id: String,
    pub needs_escalation: bool,
    pub escalation_reason: Option<String>,
    pub winning_candidate: Option<ResolutionCandidate>,
    pub all_candidates: Vec<ResolutionCandidate>,
}

impl Resolution {
    fn escalate(resolution_id: String, reason: &str, candidates: Vec<ResolutionCandidate>) -> Self {
        Self {
            resolution_id,
            needs_escalation: true,
            escalation_reason: Some(reason.to_owned()),
            winning_candidate: None,
            all_candidates: candidates,
        }
    }
}

// ---------------------------------------------------------------------------
// ResolutionPipeline
// ---------------------------------------------------------------------------

/// Runs all six stages and produces a [`Resolution`].
pub struct ResolutionPipeline<'a> {
    vcs: Vcs,
    base: BranchRef,
    config: UserConfig,
    critic: SelfCritic<'a>,
    logger: ResolutionLogger,
    validator: TieredValidator,
    diversity: DiversityChecker,
}

impl std::fmt::Debug for ResolutionPipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionPipeline")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl<'a> ResolutionPipeline<'a> {
    /// Assemble a pipeline for the repository behind `vcs`.
    #[must_use]
    pub fn new(vcs: Vcs, base: BranchRef, config: UserConfig, critic: SelfCritic<'a>) -> Self {
        let logger = ResolutionLogger::new(vcs.repo_path());
        let validator = TieredValidator::new(vcs.clone());
        Self {
            vcs,
            base,
            config,
            critic,
            logger,
            validator,
            diversity: DiversityChecker::default(),
        }
    }

    /// Run the pipeline over a detection result.
    ///
    /// `agents` maps agent ids to branches; `tasks` carries coordinator
    /// task descriptions used as intent hints.
    #[must_use]
    pub fn resolve(
        &self,
        detection: &PipelineResult,
        agents: &BTreeMap<AgentId, BranchRef>,
        tasks: &BTreeMap<AgentId, String>,
        flaky: &mut FlakyTestHandler,
    ) -> Resolution {
        let resolution_id = format!("resolution-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let start = Instant::now();
        tracing::info!(id = %resolution_id, "starting resolution pipeline");

        if !detection.has_conflicts {
            return Resolution {
                resolution_id,
                needs_escalation: false,
                escalation_reason: None,
                winning_candidate: None,
                all_candidates: Vec::new(),
            };
        }

        if detection.textual.as_ref().is_some_and(|t| {
            t.file_count() > self.config.resolution.max_conflicts_for_llm
        }) {
            return self.escalated(resolution_id, "conflict_count_exceeds_limit", Vec::new());
        }

        // Stage 1: context assembly.
        tracing::info!("stage 1: context assembly");
        let assembler =
            ContextAssembler::new(self.vcs.clone(), self.base.clone(), self.config.clone());
        let context = match assembler.assemble(detection, agents, tasks) {
            Ok(context) => context,
            Err(err) => {
                tracing::error!(error = %err, "stage 1 failed");
                return self.escalated(resolution_id, "stage_1_context_assembly_failed", Vec::new());
            }
        };

        // Stage 2: intent extraction. Low confidence stops here.
        tracing::info!("stage 2: intent extraction");
        let intents = IntentExtractor.extract(&context);
        if intents.overall_confidence == Confidence::Low {
            tracing::warn!("low intent confidence; escalating before generating code");
            return self.escalated(resolution_id, "low_intent_confidence", Vec::new());
        }

        // Stage 3: interface harmonization.
        tracing::info!("stage 3: interface harmonization");
        let harmonized = InterfaceHarmonizer::default().harmonize(&context, || true);
        if !harmonized.build_passes {
            tracing::warn!(
                decisions = harmonized.decisions.len(),
                "harmonization left the tree unbuildable; proceeding to candidates"
            );
        }

        // Stage 4: candidate generation.
        tracing::info!("stage 4: candidate generation");
        let generator = MultiCandidateGenerator::new(self.vcs.clone(), self.base.clone())
            .with_max_candidates(MAX_GENERATED_CANDIDATES);
        let mut candidates = match generator.generate(&context, &intents) {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::error!(error = %err, "stage 4 failed");
                return self.escalated(resolution_id, "stage_4_candidate_generation_failed", Vec::new());
            }
        };
        if candidates.is_empty() {
            return self.escalated(resolution_id, "no_candidates_generated", Vec::new());
        }

        // Stage 5: tiered validation, then diversity over the validated set.
        tracing::info!(count = candidates.len(), "stage 5: tiered validation");
        let _records = self.validator.validate_all(&mut candidates, flaky);
        if let Err(err) = self.vcs.checkout(&self.base) {
            tracing::warn!(error = %err, "could not restore base checkout after validation");
        }

        let diversity = self.diversity.check(&candidates);
        if !diversity.meets_threshold && candidates.len() > 1 {
            tracing::warn!(
                min = diversity.min_diversity,
                "candidate set below diversity threshold"
            );
            generator.cleanup(&candidates);
            return self.escalated(resolution_id, "insufficient_candidate_diversity", candidates);
        }
        if candidates.len() > TARGET_CANDIDATES {
            let selected = self
                .diversity
                .most_diverse_subset(&candidates, TARGET_CANDIDATES);
            let dropped: Vec<ResolutionCandidate> = candidates
                .iter()
                .filter(|c| !selected.iter().any(|s| s.id == c.id))
                .cloned()
                .collect();
            tracing::info!(dropped = dropped.len(), "thinning candidate set for diversity");
            generator.cleanup(&dropped);
            candidates = selected;
        }

        // Stage 6: selection.
        tracing::info!("stage 6: selection");
        let resolution = self.select(resolution_id, candidates, &detection.risk_flags);

        // Losing branches are deleted; the winner's branch is the output.
        let losers: Vec<ResolutionCandidate> = resolution
            .all_candidates
            .iter()
            .filter(|c| {
                resolution
                    .winning_candidate
                    .as_ref()
                    .is_none_or(|w| w.id != c.id)
            })
            .cloned()
            .collect();
        generator.cleanup(&losers);

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match (&resolution.winning_candidate, &resolution.escalation_reason) {
            (Some(winner), _) => {
                let _ = self.logger.log_resolved(
                    None,
                    winner.strategy.as_str(),
                    winner.scores.total,
                    elapsed_ms,
                    &winner.files_modified,
                );
            }
            (None, Some(reason)) => {
                let _ = self.logger.log_escalated(
                    None,
                    reason,
                    serde_json::json!({
                        "candidates": resolution.all_candidates.len(),
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
            (None, None) => {}
        }
        resolution
    }

    fn escalated(
        &self,
        resolution_id: String,
        reason: &str,
        candidates: Vec<ResolutionCandidate>,
    ) -> Resolution {
        let _ = self.logger.log_escalated(
            None,
            reason,
            serde_json::json!({"candidates": candidates.len()}),
        );
        Resolution::escalate(resolution_id, reason, candidates)
    }

    /// Stage 6: score, rank, threshold, critic.
    fn select(
        &self,
        resolution_id: String,
        mut candidates: Vec<ResolutionCandidate>,
        risk_flags: &[RiskFlag],
    ) -> Resolution {
        for candidate in &mut candidates {
            candidate.scores = score_candidate(candidate);
        }

        let mut viable: Vec<&ResolutionCandidate> =
            candidates.iter().filter(|c| c.is_viable()).collect();
        if viable.is_empty() {
            return Resolution::escalate(resolution_id, "no_viable_candidates", candidates);
        }
        viable.sort_by(|a, b| b.scores.total.total_cmp(&a.scores.total));

        let winner = viable[0].clone();
        if winner.scores.total < MIN_WINNER_SCORE {
            tracing::warn!(
                score = winner.scores.total,
                "best candidate below score threshold"
            );
            return Resolution::escalate(resolution_id, "low_confidence_resolution", candidates);
        }

        // A near-tie under critical risk is a judgment call, not a coin
        // flip.
        if viable.len() > 1 {
            let runner_up = viable[1];
            let close = runner_up.scores.total > winner.scores.total * RUNNER_UP_RATIO;
            if close && risk_flags.iter().any(|f| f.is_critical()) {
                tracing::warn!(
                    winner = winner.scores.total,
                    runner_up = runner_up.scores.total,
                    "close candidates under critical risk"
                );
                return Resolution::escalate(
                    resolution_id,
                    "close_candidates_under_critical_risk",
                    candidates,
                );
            }
        }

        let critique = self.critic.critique(&winner);
        if !critique.approved {
            tracing::warn!(issues = ?critique.issues, "self-critic vetoed the winner");
            return Resolution::escalate(resolution_id, "self_critic_veto", candidates);
        }

        tracing::info!(
            id = %winner.id,
            strategy = winner.strategy.as_str(),
            score = winner.scores.total,
            "winner selected"
        );
        Resolution {
            resolution_id,
            needs_escalation: false,
            escalation_reason: None,
            winning_candidate: Some(winner),
            all_candidates: candidates,
        }
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Weighted candidate score:
/// `0.4·correctness + 0.2·simplicity + 0.2·convention + 0.2·intent`,
/// with a penalty for silently auto-resolved hunks.
#[must_use]
pub fn score_candidate(candidate: &ResolutionCandidate) -> super::candidates::CandidateScores {
    let correctness = if !candidate.build_passed {
        0.0
    } else if candidate.tests_failed == 0 {
        1.0
    } else {
        let total = candidate.tests_passed + candidate.tests_failed;
        if total == 0 {
            0.0
        } else {
            f64::from(candidate.tests_passed) / f64::from(total)
        }
    };

    let simplicity = 1.0 / (1.0 + 0.1 * candidate.files_modified.len() as f64);
    let convention = candidate.lint_score.clamp(0.0, 1.0);
    let intent_satisfaction = if candidate.tests_failed == 0 { 1.0 } else { 0.5 };

    let mut total = 0.4 * correctness
        + 0.2 * simplicity
        + 0.2 * convention
        + 0.2 * intent_satisfaction;

    let penalty = (candidate.auto_resolved_hunks as f64 * AUTO_RESOLVE_PENALTY_PER_HUNK)
        .min(AUTO_RESOLVE_PENALTY_CAP);
    total *= 1.0 - penalty;

    super::candidates::CandidateScores {
        correctness,
        simplicity,
        convention,
        intent_satisfaction,
        total,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
