//! Conflict detection across agent branches.
//!
//! The detection pipeline layers four analyses over a set of branches
//! headed for the same base: textual (merge preview), build/test of the
//! merged tree, declared-dependency divergence, and semantic overlap
//! (symbols, domains, API surface). Git saying "clean" is necessary but
//! not sufficient — the later stages exist to catch merges that are
//! textually clean and still broken.

pub mod build;
pub mod dependency;
pub mod pipeline;
pub mod semantic;
pub mod textual;

use serde::{Deserialize, Serialize};

pub use build::{BuildTestResult, MergeBuildTester};
pub use dependency::{DependencyAnalyzer, DependencyConflict};
pub use pipeline::{DetectionPipeline, PipelineResult, RecommendedAction};
pub use semantic::{SemanticAnalysisResult, SemanticAnalyzer};
pub use textual::{TextualConflictReport, TextualDetector};

// ---------------------------------------------------------------------------
// Severity / conflict kind
// ---------------------------------------------------------------------------

/// How bad a detected conflict is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The dominant kind of conflict a pipeline run found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    #[default]
    None,
    Textual,
    Semantic,
    Dependency,
}

// ---------------------------------------------------------------------------
// Risk flags
// ---------------------------------------------------------------------------

/// A labeled risk property that escalates conflict severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    Security,
    Auth,
    DbMigration,
    PublicApi,
    Ci,
}

impl RiskFlag {
    /// Flags that force escalation regardless of other scores.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self, Self::Security | Self::Auth | Self::DbMigration)
    }
}

/// Map changed-file paths to risk flags by path pattern.
#[must_use]
pub fn detect_risk_flags(files: &[String]) -> Vec<RiskFlag> {
    let mut flags = Vec::new();
    let mut push = |flag: RiskFlag| {
        if !flags.contains(&flag) {
            flags.push(flag);
        }
    };

    for file in files {
        let lower = file.to_lowercase();
        if lower.contains("security") || lower.contains("crypto") || lower.contains("credential") {
            push(RiskFlag::Security);
        }
        if lower.contains("auth") || lower.contains("session") {
            push(RiskFlag::Auth);
        }
        if lower.contains("migration") || lower.contains("schema") {
            push(RiskFlag::DbMigration);
        }
        if lower.contains("api/") || lower.contains("routes") || lower.contains("endpoint") {
            push(RiskFlag::PublicApi);
        }
        if lower.contains(".github/workflows") || lower.contains(".gitlab-ci") {
            push(RiskFlag::Ci);
        }
    }
    flags
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
