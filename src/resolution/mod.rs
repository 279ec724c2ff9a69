//! Conflict resolution.
//!
//! Turns a detection result into either an applied-ready winning candidate
//! or a structured escalation. The pipeline assembles context straight
//! from the VCS, extracts and compares agent intents, harmonizes diverging
//! interfaces, generates strategy-diverse candidates on ephemeral
//! branches, validates them through progressive tiers with flaky-test
//! handling, and scores the survivors.

pub mod candidates;
pub mod context;
pub mod critic;
pub mod diversity;
pub mod flaky;
pub mod harmonize;
pub mod intent;
pub mod log;
pub mod pipeline;
pub mod tiers;

pub use candidates::{MultiCandidateGenerator, ResolutionCandidate, Strategy};
pub use context::{ConflictContext, ContextAssembler, FileVersion};
pub use critic::SelfCritic;
pub use diversity::DiversityChecker;
pub use flaky::{FlakyTestHandler, FlakyTestRecord};
pub use harmonize::{HarmonizedResult, InterfaceHarmonizer};
pub use intent::{IntentAnalysis, IntentExtractor};
pub use log::ResolutionLogger;
pub use pipeline::{Resolution, ResolutionPipeline};
pub use tiers::{TieredValidator, ValidationTier};
