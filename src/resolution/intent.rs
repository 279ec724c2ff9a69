//! Stage 2: intent extraction and comparison.
//!
//! Builds a per-agent picture of what the agent was trying to do: hard and
//! soft constraints mined from the task text by regex, implicit constraints
//! mined from the changed files, and a confidence grade. Intents are then
//! compared pairwise; opposed constraints (`add` vs `remove`, `enable` vs
//! `disable`) make the relationship `conflicting`, shared constraints make
//! it `compatible`, otherwise the agents are `orthogonal`.
//!
//! Low overall confidence is a hard stop: the pipeline escalates rather
//! than generating code from a guess.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::types::AgentId;

use super::context::ConflictContext;

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

/// Hard-constraint patterns over task text.
const HARD_PATTERNS: [(&str, &str); 8] = [
    (r"must\s+\w+", "must requirement"),
    (r"required\s+to", "required"),
    (r"cannot\s+\w+", "prohibition"),
    (r"always\s+\w+", "always rule"),
    (r"never\s+\w+", "never rule"),
    (r"security", "security constraint"),
    (r"authentication|authorization", "auth constraint"),
    (r"backward[s]?[\s-]*compatible", "compatibility constraint"),
];

/// Soft-constraint patterns over task text.
const SOFT_PATTERNS: [(&str, &str); 5] = [
    (r"should\s+\w+", "preference"),
    (r"prefer(?:ably)?", "preference"),
    (r"ideally", "ideal"),
    (r"try\s+to", "attempt"),
    (r"if\s+possible", "optional"),
];

/// Opposed verb pairs that make two constraints conflicting.
const OPPOSED_PAIRS: [(&str, &str); 6] = [
    ("add", "remove"),
    ("enable", "disable"),
    ("allow", "deny"),
    ("increase", "decrease"),
    ("sync", "async"),
    ("cache", "uncache"),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Confidence grade for an extracted intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A single mined constraint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// The matched text or derived description.
    pub description: String,
    /// `hard` or `soft`.
    pub constraint_type: String,
    /// Where it was found.
    pub evidence: String,
    /// `task`, `code`, or `tests`.
    pub source: String,
}

/// One agent's extracted intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractedIntent {
    pub agent_id: AgentId,
    pub primary_intent: String,
    pub hard_constraints: Vec<Constraint>,
    pub soft_constraints: Vec<Constraint>,
    pub secondary_effects: Vec<String>,
    pub assumptions: Vec<String>,
    pub evidence: Vec<String>,
    pub confidence: Confidence,
    pub confidence_reasons: Vec<String>,
}

/// How two agents' intents relate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentRelationship {
    Compatible,
    Conflicting,
    Orthogonal,
}

/// Pairwise comparison of two intents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentComparison {
    pub relationship: IntentRelationship,
    pub shared_constraints: Vec<String>,
    pub conflicting_constraints: Vec<(String, String)>,
    pub suggested_resolution: String,
    pub requires_human_judgment: bool,
    pub confidence: Confidence,
}

/// Full stage output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intents: Vec<ExtractedIntent>,
    pub comparison: Option<IntentComparison>,
    pub overall_confidence: Confidence,
}

// ---------------------------------------------------------------------------
// IntentExtractor
// ---------------------------------------------------------------------------

/// Extracts and compares agent intents. Pure heuristics — no model calls.
#[derive(Debug, Default)]
pub struct IntentExtractor;

impl IntentExtractor {
    /// Extract per-agent intents from the context and compare them.
    #[must_use]
    pub fn extract(&self, context: &ConflictContext) -> IntentAnalysis {
        let mut intents = Vec::new();
        for agent_id in context.agent_ids() {
            intents.push(self.extract_single(context, &agent_id));
        }

        let comparison = compare_all_intents(&intents);

        let overall_confidence = overall_confidence(&intents, comparison.as_ref());
        tracing::info!(
            agents = intents.len(),
            confidence = ?overall_confidence,
            "intent extraction complete"
        );

        IntentAnalysis {
            intents,
            comparison,
            overall_confidence,
        }
    }

    fn extract_single(&self, context: &ConflictContext, agent_id: &AgentId) -> ExtractedIntent {
        let task_text = context
            .task_descriptions
            .get(agent_id)
            .cloned()
            .unwrap_or_default();
        let has_manifest = !task_text.is_empty();
        let primary_intent = if has_manifest {
            task_text.clone()
        } else {
            format!("unknown task for {agent_id}")
        };

        let mut hard = mine_constraints(&task_text, &HARD_PATTERNS, "hard", "task");
        let mut soft = mine_constraints(&task_text, &SOFT_PATTERNS, "soft", "task");

        let empty = Vec::new();
        let files = context.agent_files.get(agent_id).unwrap_or(&empty);
        let (code_hard, code_soft) = constraints_from_code(files);
        hard.extend(code_hard);
        soft.extend(code_soft);
        dedup_constraints(&mut hard);
        dedup_constraints(&mut soft);

        let file_count = context
            .changed_files
            .get(agent_id)
            .map_or(0, Vec::len);
        let (confidence, confidence_reasons) =
            grade_confidence(has_manifest, hard.len() + soft.len(), file_count);

        let secondary_effects = files
            .iter()
            .filter(|f| !context.conflicting_files.contains(&f.path))
            .map(|f| format!("touches {}", f.path))
            .collect();

        ExtractedIntent {
            agent_id: agent_id.clone(),
            primary_intent,
            hard_constraints: hard,
            soft_constraints: soft,
            secondary_effects,
            assumptions: Vec::new(),
            evidence: Vec::new(),
            confidence,
            confidence_reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// Mining helpers
// ---------------------------------------------------------------------------

fn mine_constraints(
    text: &str,
    patterns: &[(&str, &str)],
    constraint_type: &str,
    source: &str,
) -> Vec<Constraint> {
    let mut constraints = Vec::new();
    for (pattern, _label) in patterns {
        let Ok(regex) = Regex::new(&format!("(?i){pattern}")) else {
            continue;
        };
        for found in regex.find_iter(text) {
            constraints.push(Constraint {
                description: found.as_str().to_lowercase(),
                constraint_type: constraint_type.to_owned(),
                evidence: format!("found in task: '{}'", found.as_str()),
                source: source.to_owned(),
            });
        }
    }
    constraints
}

/// Implicit constraints from changed file contents.
fn constraints_from_code(
    files: &[super::context::FileVersion],
) -> (Vec<Constraint>, Vec<Constraint>) {
    let mut hard = Vec::new();
    let mut soft = Vec::new();
    let checks: [(&str, &str, bool); 4] = [
        (
            r"(?i)(password|secret|token|api_key|\bauth)",
            "security-sensitive code changes",
            true,
        ),
        (
            r"(?i)(CREATE TABLE|ALTER TABLE|migration|schema)",
            "database schema changes",
            true,
        ),
        (
            r#"(?i)(@app\.route|endpoint|fn\s+handle_|def\s+(?:get|post|put|delete)_)"#,
            "API endpoint changes",
            true,
        ),
        (
            r"(?i)(def test_|#\[test\]|@pytest|describe\(|it\()",
            "test coverage expected",
            false,
        ),
    ];

    for file in files {
        let Some(content) = &file.content else {
            continue;
        };
        for (pattern, description, is_hard) in checks {
            let Ok(regex) = Regex::new(pattern) else {
                continue;
            };
            if regex.is_match(content) {
                let constraint = Constraint {
                    description: description.to_owned(),
                    constraint_type: if is_hard { "hard" } else { "soft" }.to_owned(),
                    evidence: format!("patterns in {}", file.path),
                    source: if is_hard { "code" } else { "tests" }.to_owned(),
                };
                if is_hard {
                    hard.push(constraint);
                } else {
                    soft.push(constraint);
                }
            }
        }
    }
    (hard, soft)
}

fn dedup_constraints(constraints: &mut Vec<Constraint>) {
    let mut seen = BTreeSet::new();
    constraints.retain(|c| seen.insert((c.description.clone(), c.source.clone())));
}

fn grade_confidence(
    has_manifest: bool,
    constraint_count: usize,
    file_count: usize,
) -> (Confidence, Vec<String>) {
    let mut score = 0_u32;
    let mut reasons = Vec::new();
    if has_manifest {
        score += 2;
        reasons.push("task description present".to_owned());
    } else {
        reasons.push("no task description".to_owned());
    }
    if constraint_count > 0 {
        score += 1;
        reasons.push(format!("{constraint_count} constraint(s) extracted"));
    }
    if file_count > 0 && file_count <= 10 {
        score += 1;
        reasons.push(format!("focused change-set ({file_count} files)"));
    } else if file_count > 10 {
        reasons.push(format!("sprawling change-set ({file_count} files)"));
    } else {
        reasons.push("empty change-set".to_owned());
    }

    let grade = match score {
        4 => Confidence::High,
        2..=3 => Confidence::Medium,
        _ => Confidence::Low,
    };
    (grade, reasons)
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Tokens that carry meaning in constraint descriptions.
fn significant_tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() > 3)
        .map(str::to_lowercase)
        .collect()
}

/// Compare two intents' constraints.
#[must_use]
pub fn compare_intents(a: &ExtractedIntent, b: &ExtractedIntent) -> IntentComparison {
    let mut shared = Vec::new();
    let mut conflicting = Vec::new();

    for left in &a.hard_constraints {
        for right in &b.hard_constraints {
            let left_norm = left.description.trim().to_lowercase();
            let right_norm = right.description.trim().to_lowercase();
            if left_norm == right_norm {
                shared.push(left.description.clone());
                continue;
            }
            // Opposed verbs win over token overlap: "enable batching" and
            // "disable batching" share tokens and still pull apart.
            let opposed = OPPOSED_PAIRS.iter().any(|(verb_a, verb_b)| {
                (left_norm.contains(verb_a) && right_norm.contains(verb_b))
                    || (left_norm.contains(verb_b) && right_norm.contains(verb_a))
            });
            if opposed {
                conflicting.push((left.description.clone(), right.description.clone()));
                continue;
            }
            let left_tokens = significant_tokens(&left_norm);
            let right_tokens = significant_tokens(&right_norm);
            if left_tokens.intersection(&right_tokens).count() >= 2 {
                shared.push(left.description.clone());
            }
        }
    }
    shared.dedup();

    let relationship = classify(&shared, &conflicting);
    let (suggested_resolution, requires_human_judgment) = guidance(relationship);
    let confidence = a.confidence.min(b.confidence);

    IntentComparison {
        relationship,
        shared_constraints: shared,
        conflicting_constraints: conflicting,
        suggested_resolution,
        requires_human_judgment,
        confidence,
    }
}

/// Compare every pair of intents and fold the results into one
/// [`IntentComparison`]: any conflicting pair makes the whole set
/// conflicting, any shared constraint makes it compatible, and the lowest
/// pairwise confidence wins. With three or more agents this is what keeps
/// a conflict between the later agents from being silently dropped.
#[must_use]
pub fn compare_all_intents(intents: &[ExtractedIntent]) -> Option<IntentComparison> {
    if intents.len() < 2 {
        return None;
    }

    let mut shared = Vec::new();
    let mut conflicting = Vec::new();
    let mut confidence = Confidence::High;
    for (i, left) in intents.iter().enumerate() {
        for right in &intents[i + 1..] {
            let pair = compare_intents(left, right);
            shared.extend(pair.shared_constraints);
            conflicting.extend(pair.conflicting_constraints);
            confidence = confidence.min(pair.confidence);
        }
    }
    shared.sort();
    shared.dedup();

    let relationship = classify(&shared, &conflicting);
    let (suggested_resolution, requires_human_judgment) = guidance(relationship);

    Some(IntentComparison {
        relationship,
        shared_constraints: shared,
        conflicting_constraints: conflicting,
        suggested_resolution,
        requires_human_judgment,
        confidence,
    })
}

fn classify(shared: &[String], conflicting: &[(String, String)]) -> IntentRelationship {
    if !conflicting.is_empty() {
        IntentRelationship::Conflicting
    } else if shared.is_empty() {
        IntentRelationship::Orthogonal
    } else {
        IntentRelationship::Compatible
    }
}

fn guidance(relationship: IntentRelationship) -> (String, bool) {
    match relationship {
        IntentRelationship::Orthogonal => ("merge both change-sets".to_owned(), false),
        IntentRelationship::Compatible => {
            ("merge, preserving the shared constraints".to_owned(), false)
        }
        IntentRelationship::Conflicting => (
            "synthesize a resolution honoring both, or pick a side".to_owned(),
            true,
        ),
    }
}

fn overall_confidence(
    intents: &[ExtractedIntent],
    comparison: Option<&IntentComparison>,
) -> Confidence {
    let lowest = intents
        .iter()
        .map(|i| i.confidence)
        .min()
        .unwrap_or(Confidence::Low);
    comparison.map_or(lowest, |c| lowest.min(c.confidence))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::context::FileVersion;

    fn intent_with(
        agent: &str,
        hard: &[&str],
        confidence: Confidence,
    ) -> ExtractedIntent {
        ExtractedIntent {
            agent_id: AgentId::new(agent).unwrap(),
            primary_intent: String::new(),
            hard_constraints: hard
                .iter()
                .map(|d| Constraint {
                    description: (*d).to_owned(),
                    constraint_type: "hard".to_owned(),
                    evidence: String::new(),
                    source: "task".to_owned(),
                })
                .collect(),
            soft_constraints: vec![],
            secondary_effects: vec![],
            assumptions: vec![],
            evidence: vec![],
            confidence,
            confidence_reasons: vec![],
        }
    }

    // -- mining --

    #[test]
    fn mines_hard_and_soft_constraints() {
        let text = "Must validate all inputs. The change should keep the API backward compatible. Prefer small diffs.";
        let hard = mine_constraints(text, &HARD_PATTERNS, "hard", "task");
        let soft = mine_constraints(text, &SOFT_PATTERNS, "soft", "task");
        assert!(hard.iter().any(|c| c.description.starts_with("must")));
        assert!(hard.iter().any(|c| c.description.contains("compatible")));
        assert!(soft.iter().any(|c| c.description.starts_with("should")));
        assert!(soft.iter().any(|c| c.description.starts_with("prefer")));
    }

    #[test]
    fn mines_code_constraints() {
        let files = vec![FileVersion {
            path: "src/auth.py".to_owned(),
            content: Some("def login(password):\n    pass\n\ndef test_login():\n    pass\n".to_owned()),
            source_tag: "agent-a".to_owned(),
            sha: String::new(),
        }];
        let (hard, soft) = constraints_from_code(&files);
        assert!(hard.iter().any(|c| c.description.contains("security")));
        assert!(soft.iter().any(|c| c.description.contains("test coverage")));
    }

    #[test]
    fn elided_files_contribute_nothing() {
        let files = vec![FileVersion {
            path: "secrets/key.pem".to_owned(),
            content: None,
            source_tag: "agent-a".to_owned(),
            sha: String::new(),
        }];
        let (hard, soft) = constraints_from_code(&files);
        assert!(hard.is_empty());
        assert!(soft.is_empty());
    }

    // -- confidence --

    #[test]
    fn confidence_grades() {
        assert_eq!(grade_confidence(true, 3, 2).0, Confidence::High);
        assert_eq!(grade_confidence(true, 0, 0).0, Confidence::Medium);
        assert_eq!(grade_confidence(false, 0, 0).0, Confidence::Low);
        assert_eq!(grade_confidence(false, 1, 50).0, Confidence::Low);
    }

    // -- comparison --

    #[test]
    fn identical_constraints_are_compatible() {
        let a = intent_with("agent-a", &["must validate inputs"], Confidence::High);
        let b = intent_with("agent-b", &["must validate inputs"], Confidence::High);
        let cmp = compare_intents(&a, &b);
        assert_eq!(cmp.relationship, IntentRelationship::Compatible);
        assert_eq!(cmp.shared_constraints.len(), 1);
        assert!(!cmp.requires_human_judgment);
    }

    #[test]
    fn token_overlap_counts_as_shared() {
        let a = intent_with("agent-a", &["must validate request inputs"], Confidence::High);
        let b = intent_with("agent-b", &["always validate inputs strictly"], Confidence::High);
        let cmp = compare_intents(&a, &b);
        assert_eq!(cmp.relationship, IntentRelationship::Compatible);
    }

    #[test]
    fn opposed_verbs_conflict() {
        let a = intent_with("agent-a", &["must enable request batching"], Confidence::High);
        let b = intent_with("agent-b", &["must disable batching for writes"], Confidence::High);
        let cmp = compare_intents(&a, &b);
        assert_eq!(cmp.relationship, IntentRelationship::Conflicting);
        assert!(cmp.requires_human_judgment);
        assert_eq!(cmp.conflicting_constraints.len(), 1);
    }

    #[test]
    fn unrelated_constraints_are_orthogonal() {
        let a = intent_with("agent-a", &["must paginate listings"], Confidence::High);
        let b = intent_with("agent-b", &["never log payloads"], Confidence::High);
        let cmp = compare_intents(&a, &b);
        assert_eq!(cmp.relationship, IntentRelationship::Orthogonal);
    }

    #[test]
    fn comparison_confidence_is_the_minimum() {
        let a = intent_with("agent-a", &[], Confidence::High);
        let b = intent_with("agent-b", &[], Confidence::Low);
        let cmp = compare_intents(&a, &b);
        assert_eq!(cmp.confidence, Confidence::Low);
    }

    #[test]
    fn overall_confidence_takes_the_floor() {
        let intents = vec![
            intent_with("agent-a", &[], Confidence::High),
            intent_with("agent-b", &[], Confidence::Medium),
        ];
        let cmp = compare_intents(&intents[0], &intents[1]);
        assert_eq!(overall_confidence(&intents, Some(&cmp)), Confidence::Medium);
    }

    // -- multi-agent folding --

    /// The first pair is orthogonal; only the second and third agents
    /// collide. The folded comparison must still come out conflicting.
    #[test]
    fn three_agent_conflict_beyond_first_pair_detected() {
        let intents = vec![
            intent_with("agent-a", &["must paginate listings"], Confidence::High),
            intent_with("agent-b", &["must enable request batching"], Confidence::High),
            intent_with(
                "agent-c",
                &["must disable batching for writes"],
                Confidence::High,
            ),
        ];
        let cmp = compare_all_intents(&intents).unwrap();
        assert_eq!(cmp.relationship, IntentRelationship::Conflicting);
        assert!(cmp.requires_human_judgment);
        assert_eq!(cmp.conflicting_constraints.len(), 1);
    }

    #[test]
    fn fold_takes_minimum_confidence_across_all_pairs() {
        let intents = vec![
            intent_with("agent-a", &[], Confidence::High),
            intent_with("agent-b", &[], Confidence::High),
            intent_with("agent-c", &[], Confidence::Low),
        ];
        let cmp = compare_all_intents(&intents).unwrap();
        assert_eq!(cmp.confidence, Confidence::Low);
    }

    #[test]
    fn single_intent_has_no_comparison() {
        let intents = vec![intent_with("agent-a", &[], Confidence::High)];
        assert!(compare_all_intents(&intents).is_none());
    }

    #[test]
    fn extract_detects_conflict_among_three_agents() {
        use crate::model::types::BranchRef;
        use crate::resolution::context::ConflictContext;
        use std::collections::BTreeMap;

        let mut agent_branches = BTreeMap::new();
        let mut tasks = BTreeMap::new();
        for (agent, branch, task) in [
            ("agent-a", "feature/pagination", "paginate the listing endpoints"),
            ("agent-b", "feature/batch-on", "must enable request batching"),
            ("agent-c", "feature/batch-off", "must disable batching for writes"),
        ] {
            agent_branches.insert(AgentId::new(agent).unwrap(), BranchRef::new(branch).unwrap());
            tasks.insert(AgentId::new(agent).unwrap(), task.to_owned());
        }
        let context = ConflictContext {
            agent_branches,
            task_descriptions: tasks,
            ..ConflictContext::default()
        };

        let analysis = IntentExtractor.extract(&context);
        assert_eq!(analysis.intents.len(), 3);
        let cmp = analysis.comparison.unwrap();
        assert_eq!(cmp.relationship, IntentRelationship::Conflicting);
    }
}
