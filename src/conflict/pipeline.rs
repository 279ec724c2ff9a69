//! The detection pipeline.
//!
//! Runs the four analyses in order — textual, build/test, dependency,
//! semantic — short-circuiting only when the textual stage reports a
//! critical conflict. The combined result carries a recommended action:
//! `fast_merge` when nothing conflicts, `auto_resolve` when resolution
//! looks tractable, `escalate` when a human must decide. Escalation is
//! forced on critical severity and on critical risk flags
//! (security / auth / db_migration).

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

use super::build::{BuildTestResult, MergeBuildTester};
use super::dependency::{DependencyAnalyzer, DependencyConflict};
use super::semantic::{SemanticAnalysisResult, SemanticAnalyzer, SemanticRisk};
use super::textual::{TextualConflictReport, TextualDetector};
use super::{ConflictKind, RiskFlag, Severity};

// ---------------------------------------------------------------------------
// PipelineResult
// ---------------------------------------------------------------------------

/// What the coordinator should do with this branch set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    /// No conflicts; merge directly.
    #[default]
    FastMerge,
    /// Conflicts exist but the resolution pipeline should handle them.
    AutoResolve,
    /// A human must decide.
    Escalate,
}

/// Combined result of all detection stages.
#[derive(Clone, Debug, Default)]
pub struct PipelineResult {
    pub has_conflicts: bool,
    pub conflict_type: ConflictKind,
    pub severity: Option<Severity>,

    pub textual: Option<TextualConflictReport>,
    pub build: Option<BuildTestResult>,
    pub dependency_conflicts: Vec<DependencyConflict>,
    pub semantic: Option<SemanticAnalysisResult>,

    /// The branches that were analyzed.
    pub branches: Vec<BranchRef>,
    pub risk_flags: Vec<RiskFlag>,

    pub recommended_action: RecommendedAction,
    pub confidence: f64,
}

impl PipelineResult {
    /// Can this branch set merge without any resolution work?
    #[must_use]
    pub fn is_fast_path(&self) -> bool {
        !self.has_conflicts && self.conflict_type == ConflictKind::None
    }

    /// Human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Conflict type: {:?}", self.conflict_type),
            format!("Severity: {:?}", self.severity),
            format!("Recommended: {:?}", self.recommended_action),
        ];
        if !self.risk_flags.is_empty() {
            lines.push(format!("Risk flags: {:?}", self.risk_flags));
        }
        if !self.dependency_conflicts.is_empty() {
            lines.push(format!(
                "Dependency conflicts: {}",
                self.dependency_conflicts.len()
            ));
        }
        if self
            .semantic
            .as_ref()
            .is_some_and(|s| s.has_semantic_conflicts)
        {
            lines.push("Semantic conflicts: yes".to_owned());
        }
        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// DetectionPipeline
// ---------------------------------------------------------------------------

/// Orchestrates the four detection stages.
#[derive(Debug)]
pub struct DetectionPipeline {
    base: BranchRef,
    textual: TextualDetector,
    build: MergeBuildTester,
    dependency: DependencyAnalyzer,
    semantic: SemanticAnalyzer,
    skip_build_test: bool,
    skip_semantic: bool,
}

impl DetectionPipeline {
    /// Build a pipeline for `base` in the given repository.
    #[must_use]
    pub fn new(vcs: &Vcs, base: BranchRef) -> Self {
        Self {
            textual: TextualDetector::new(vcs.clone(), base.clone()),
            build: MergeBuildTester::new(vcs.clone(), base.clone()),
            dependency: DependencyAnalyzer::new(vcs.clone()),
            semantic: SemanticAnalyzer::new(vcs.clone()),
            base,
            skip_build_test: false,
            skip_semantic: false,
        }
    }

    /// Skip the expensive build/test stage (used for quick scans).
    #[must_use]
    pub const fn skip_build_test(mut self, skip: bool) -> Self {
        self.skip_build_test = skip;
        self
    }

    /// Skip the semantic stage.
    #[must_use]
    pub const fn skip_semantic(mut self, skip: bool) -> Self {
        self.skip_semantic = skip;
        self
    }

    /// Run all stages over `branches`.
    ///
    /// # Errors
    /// Returns an error only for VCS-level failures; detection findings are
    /// data in the result.
    pub fn run(
        &self,
        branches: &[BranchRef],
        modified_files: &[String],
    ) -> Result<PipelineResult, OrchestratorError> {
        tracing::info!(branches = branches.len(), "running detection pipeline");
        let mut result = PipelineResult {
            branches: branches.to_vec(),
            confidence: 1.0,
            ..PipelineResult::default()
        };

        // Stage 1: textual merge preview.
        tracing::debug!("stage 1: textual conflicts");
        let textual = self.textual.detect(branches)?;
        if textual.has_conflicts {
            result.has_conflicts = true;
            result.conflict_type = ConflictKind::Textual;
            result.severity = textual.severity;
            result.risk_flags.clone_from(&textual.risk_flags);

            if textual.severity == Some(Severity::Critical) {
                // Critical textual conflict: nothing downstream changes the
                // answer, stop here.
                result.textual = Some(textual);
                result.recommended_action = RecommendedAction::Escalate;
                result.confidence = 0.9;
                return Ok(result);
            }
        }
        result.textual = Some(textual);

        // Stages 2–3: build and test the merged tree.
        if !self.skip_build_test {
            tracing::debug!("stages 2-3: build/test of merged tree");
            let build = self.build.test(branches, modified_files)?;
            if !build.all_passed() {
                result.has_conflicts = true;
                if result.conflict_type == ConflictKind::None {
                    result.conflict_type = ConflictKind::Semantic;
                }
                if result.severity.is_none_or(|s| s < Severity::High) {
                    result.severity = Some(Severity::High);
                }
                result.confidence = 0.7;
            }
            result.build = Some(build);
        }

        // Stage 4: dependency divergence.
        tracing::debug!("stage 4: dependency conflicts");
        let dep_conflicts = self.dependency.analyze(branches, &self.base)?;
        if !dep_conflicts.is_empty() {
            result.has_conflicts = true;
            if result.conflict_type == ConflictKind::None {
                result.conflict_type = ConflictKind::Dependency;
            }
            if dep_conflicts.iter().any(|c| c.severity == Severity::High) {
                result.severity = Some(Severity::High);
            }
        }
        result.dependency_conflicts = dep_conflicts;

        // Stage 5: semantic overlap.
        if !self.skip_semantic {
            tracing::debug!("stage 5: semantic analysis");
            let semantic = self.semantic.analyze(branches, &self.base)?;
            if semantic.has_semantic_conflicts {
                if semantic.risk_level() == SemanticRisk::High {
                    result.has_conflicts = true;
                    if result.conflict_type == ConflictKind::None {
                        result.conflict_type = ConflictKind::Semantic;
                    }
                    result.severity = Some(Severity::High);
                }
                // Overlapping API surfaces count as a risk signal.
                if !semantic.api_changes.is_empty()
                    && !result.risk_flags.contains(&RiskFlag::PublicApi)
                {
                    result.risk_flags.push(RiskFlag::PublicApi);
                }
            }
            result.semantic = Some(semantic);
        }

        result.recommended_action = recommend(&result);
        result.confidence = confidence(&result);
        tracing::info!(
            conflict_type = ?result.conflict_type,
            severity = ?result.severity,
            action = ?result.recommended_action,
            "detection pipeline complete"
        );
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Recommendation and confidence
// ---------------------------------------------------------------------------

fn recommend(result: &PipelineResult) -> RecommendedAction {
    if !result.has_conflicts {
        return RecommendedAction::FastMerge;
    }
    if result.severity == Some(Severity::Critical) {
        return RecommendedAction::Escalate;
    }
    if result
        .dependency_conflicts
        .iter()
        .any(|c| c.severity == Severity::High)
    {
        // Incompatible pins need a human to pick a version.
        return RecommendedAction::Escalate;
    }
    if result.severity == Some(Severity::High) {
        if result.risk_flags.iter().any(|f| f.is_critical()) {
            return RecommendedAction::Escalate;
        }
        // A broken build with clean text can still be auto-resolved; a
        // build that cannot even merge cannot.
        if result
            .build
            .as_ref()
            .is_some_and(|b| !b.build_passed && b.error.is_some())
        {
            return RecommendedAction::Escalate;
        }
        return RecommendedAction::AutoResolve;
    }
    RecommendedAction::AutoResolve
}

fn confidence(result: &PipelineResult) -> f64 {
    let mut confidence: f64 = 1.0;
    if let Some(semantic) = &result.semantic {
        if semantic.has_semantic_conflicts {
            confidence *= semantic.confidence;
        }
    }
    if result.build.as_ref().is_some_and(|b| !b.all_passed()) {
        confidence *= 0.8;
    }
    match result.severity {
        Some(Severity::High) => confidence *= 0.9,
        Some(Severity::Critical) => confidence *= 0.7,
        _ => {}
    }
    (confidence * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::dependency::DependencyConflictKind;

    fn dep_conflict(severity: Severity) -> DependencyConflict {
        DependencyConflict {
            package: "lodash".to_owned(),
            version1: "^4.17.0".to_owned(),
            version2: "^3.10.0".to_owned(),
            package_manager: "npm".to_owned(),
            conflict_type: DependencyConflictKind::Incompatible,
            severity,
        }
    }

    #[test]
    fn no_conflicts_recommends_fast_merge() {
        let result = PipelineResult::default();
        assert_eq!(recommend(&result), RecommendedAction::FastMerge);
        assert!(result.is_fast_path());
    }

    #[test]
    fn critical_severity_escalates() {
        let result = PipelineResult {
            has_conflicts: true,
            severity: Some(Severity::Critical),
            ..PipelineResult::default()
        };
        assert_eq!(recommend(&result), RecommendedAction::Escalate);
    }

    #[test]
    fn high_severity_with_critical_flag_escalates() {
        let result = PipelineResult {
            has_conflicts: true,
            severity: Some(Severity::High),
            risk_flags: vec![RiskFlag::Security],
            ..PipelineResult::default()
        };
        assert_eq!(recommend(&result), RecommendedAction::Escalate);
    }

    #[test]
    fn high_severity_without_critical_flag_auto_resolves() {
        let result = PipelineResult {
            has_conflicts: true,
            severity: Some(Severity::High),
            risk_flags: vec![RiskFlag::Ci],
            ..PipelineResult::default()
        };
        assert_eq!(recommend(&result), RecommendedAction::AutoResolve);
    }

    #[test]
    fn incompatible_dependency_escalates() {
        let result = PipelineResult {
            has_conflicts: true,
            conflict_type: ConflictKind::Dependency,
            severity: Some(Severity::High),
            dependency_conflicts: vec![dep_conflict(Severity::High)],
            ..PipelineResult::default()
        };
        // High severity from an incompatible pin, no critical flags: the
        // dependency rule forces escalation.
        assert_eq!(recommend(&result), RecommendedAction::Escalate);
    }

    #[test]
    fn low_severity_conflicts_auto_resolve() {
        let result = PipelineResult {
            has_conflicts: true,
            conflict_type: ConflictKind::Textual,
            severity: Some(Severity::Low),
            ..PipelineResult::default()
        };
        assert_eq!(recommend(&result), RecommendedAction::AutoResolve);
    }

    #[test]
    fn confidence_degrades_with_findings() {
        let clean = PipelineResult::default();
        assert!((confidence(&clean) - 1.0).abs() < f64::EPSILON);

        let broken_build = PipelineResult {
            has_conflicts: true,
            severity: Some(Severity::High),
            build: Some(BuildTestResult {
                build_passed: false,
                tests_passed: false,
                ..BuildTestResult::default()
            }),
            ..PipelineResult::default()
        };
        let c = confidence(&broken_build);
        assert!(c < 0.8);
        assert!(c > 0.0);
    }

    #[test]
    fn summary_mentions_key_findings() {
        let result = PipelineResult {
            has_conflicts: true,
            conflict_type: ConflictKind::Dependency,
            severity: Some(Severity::High),
            dependency_conflicts: vec![dep_conflict(Severity::High)],
            recommended_action: RecommendedAction::Escalate,
            ..PipelineResult::default()
        };
        let summary = result.summary();
        assert!(summary.contains("Dependency"));
        assert!(summary.contains("Escalate"));
        assert!(summary.contains("Dependency conflicts: 1"));
    }
}
