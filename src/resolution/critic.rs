//! Optional self-critique of the selected candidate.
//!
//! A separate model call reviews the winning diff before delivery. The
//! critique response is scanned against fixed security and critical-bug
//! patterns; a match vetoes the candidate. A critic failure never blocks a
//! resolution — the candidate is approved with the failure noted.
//!
//! Candidate text is sanitized before it enters the prompt: length-capped
//! and stripped of sequences that could smuggle instructions.

use regex::Regex;

use crate::llm::{LlmInterceptor, LlmMessage, LlmRequest};

use super::candidates::ResolutionCandidate;

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// Critique phrases that indicate a security problem.
const SECURITY_PATTERNS: [&str; 10] = [
    r"sql.?injection",
    r"\bxss\b",
    r"cross.?site",
    r"command.?injection",
    r"path.?traversal",
    r"insecure",
    r"vulnerab",
    r"credential",
    r"password.?exposure",
    r"authentication.?bypass",
];

/// Critique phrases that indicate a critical bug.
const CRITICAL_BUG_PATTERNS: [&str; 8] = [
    r"data.?loss",
    r"corruption",
    r"race.?condition",
    r"deadlock",
    r"infinite.?loop",
    r"\bcrash",
    r"null.?pointer",
    r"undefined.?behavior",
];

/// Prompt-side cap on embedded candidate text.
const MAX_EMBED_CHARS: usize = 4000;

// ---------------------------------------------------------------------------
// CritiqueResult
// ---------------------------------------------------------------------------

/// Outcome of a critique.
#[derive(Clone, Debug)]
pub struct CritiqueResult {
    pub approved: bool,
    pub issues: Vec<String>,
}

impl CritiqueResult {
    fn approved() -> Self {
        Self {
            approved: true,
            issues: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SelfCritic
// ---------------------------------------------------------------------------

/// Model-backed candidate reviewer.
pub struct SelfCritic<'a> {
    interceptor: Option<&'a LlmInterceptor>,
    model: String,
}

impl std::fmt::Debug for SelfCritic<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfCritic")
            .field("enabled", &self.interceptor.is_some())
            .field("model", &self.model)
            .finish()
    }
}

impl<'a> SelfCritic<'a> {
    /// A critic wired to an interceptor; `None` disables critique.
    #[must_use]
    pub fn new(interceptor: Option<&'a LlmInterceptor>, model: impl Into<String>) -> Self {
        Self {
            interceptor,
            model: model.into(),
        }
    }

    /// Critique a candidate. Disabled or failing critics auto-approve.
    #[must_use]
    pub fn critique(&self, candidate: &ResolutionCandidate) -> CritiqueResult {
        let Some(interceptor) = self.interceptor else {
            return CritiqueResult::approved();
        };

        let prompt = build_prompt(candidate);
        let mut request = LlmRequest::new(&self.model, vec![LlmMessage::new("user", prompt)]);
        request.max_tokens = 1024;
        request.temperature = 0.2;

        match interceptor.call(&request) {
            Ok(response) => evaluate_response(&response.content),
            Err(err) => {
                tracing::warn!(error = %err, "self-critique failed; approving with note");
                CritiqueResult {
                    approved: true,
                    issues: vec![format!("self-critique unavailable: {err}")],
                }
            }
        }
    }
}

fn build_prompt(candidate: &ResolutionCandidate) -> String {
    format!(
        "Review this merge resolution for security issues, data loss, and \
         critical bugs. Answer with APPROVED or a list of concrete issues.\n\n\
         Strategy: {}\nSummary: {}\n\nDiff:\n{}",
        candidate.strategy.as_str(),
        sanitize(&candidate.summary),
        sanitize(&candidate.diff_from_base),
    )
}

/// Length-cap and neutralize text destined for a prompt.
fn sanitize(text: &str) -> String {
    let mut cleaned: String = text
        .chars()
        .take(MAX_EMBED_CHARS)
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    // Fence markers inside embedded content can terminate the surrounding
    // structure in downstream templating.
    cleaned = cleaned.replace("```", "'''");
    cleaned
}

/// Scan the critique response for veto patterns.
#[must_use]
pub fn evaluate_response(response: &str) -> CritiqueResult {
    let lower = response.to_lowercase();
    let mut issues = Vec::new();

    for pattern in SECURITY_PATTERNS {
        if Regex::new(pattern).is_ok_and(|re| re.is_match(&lower)) {
            issues.push(format!("security concern matched '{pattern}'"));
        }
    }
    for pattern in CRITICAL_BUG_PATTERNS {
        if Regex::new(pattern).is_ok_and(|re| re.is_match(&lower)) {
            issues.push(format!("critical-bug concern matched '{pattern}'"));
        }
    }

    CritiqueResult {
        approved: issues.is_empty(),
        issues,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
