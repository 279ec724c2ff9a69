//! Deterministic summary validation.
//!
//! A compressed summary is only trusted if it provably preserves the
//! load-bearing content of the originals: every file path, function
//! reference, and URL must reappear verbatim (case-insensitive), and every
//! decision sentence must reappear as its decision verb plus a non-trivial
//! share of its context words. No model is involved — running the
//! validator twice on the same input always yields the same verdict.

use std::collections::BTreeSet;

use regex::Regex;

use super::Message;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Verbs that mark a sentence as recording a decision.
pub const DECISION_KEYWORDS: [&str; 12] = [
    "decided",
    "chose",
    "chosen",
    "selected",
    "picked",
    "approved",
    "rejected",
    "accepted",
    "declined",
    "agreed",
    "confirmed",
    "determined",
];

/// Context words shorter than this carry no validation weight.
const SIGNIFICANT_WORD_LEN: usize = 5;

// ---------------------------------------------------------------------------
// ValidationReport
// ---------------------------------------------------------------------------

/// Outcome of validating a summary against its originals.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub missing_entities: Vec<String>,
    pub missing_decisions: Vec<String>,
}

// ---------------------------------------------------------------------------
// SummaryValidator
// ---------------------------------------------------------------------------

/// Regex-based entity and decision extraction plus the validation verdict.
#[derive(Debug)]
pub struct SummaryValidator {
    file_path: Regex,
    function_ref: Regex,
    url: Regex,
    decision_sentence: Regex,
}

impl Default for SummaryValidator {
    fn default() -> Self {
        let keywords = DECISION_KEYWORDS.join("|");
        Self {
            // Paths starting with '/' or '.', ending in an extension.
            file_path: Regex::new(r#"(?:^|[\s'"(])([./][\w./\-]*\.[A-Za-z0-9]+)"#)
                .expect("static regex"),
            // name() and Receiver.method() references.
            function_ref: Regex::new(r"([A-Za-z_][\w.]*\(\))").expect("static regex"),
            url: Regex::new(r#"(https?://[^\s<>"']+)"#).expect("static regex"),
            decision_sentence: Regex::new(&format!(
                r"(?i)([^.!?]*\b(?:{keywords})\b[^.!?]*[.!?])"
            ))
            .expect("static regex"),
        }
    }
}

impl SummaryValidator {
    /// Extract the entity set (paths, function refs, URLs) from text.
    #[must_use]
    pub fn extract_entities(&self, text: &str) -> BTreeSet<String> {
        let mut entities = BTreeSet::new();
        for captures in self.file_path.captures_iter(text) {
            entities.insert(trim_trailing_punctuation(&captures[1]).to_owned());
        }
        for captures in self.function_ref.captures_iter(text) {
            entities.insert(captures[1].trim().to_owned());
        }
        for captures in self.url.captures_iter(text) {
            entities.insert(trim_trailing_punctuation(&captures[1]).to_owned());
        }
        entities
    }

    /// Extract decision sentences from text.
    #[must_use]
    pub fn extract_decisions(&self, text: &str) -> Vec<String> {
        self.decision_sentence
            .captures_iter(text)
            .filter_map(|captures| {
                let sentence = captures[1].trim().to_owned();
                (sentence.len() > 10).then_some(sentence)
            })
            .collect()
    }

    /// Validate a candidate summary against the original messages.
    #[must_use]
    pub fn validate(&self, originals: &[Message], summary: &str) -> ValidationReport {
        if originals.is_empty() {
            return ValidationReport {
                is_valid: true,
                ..ValidationReport::default()
            };
        }

        let original_text = originals
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let summary_lower = summary.to_lowercase();

        let mut missing_entities = Vec::new();
        for entity in self.extract_entities(&original_text) {
            if !summary.contains(&entity) && !summary_lower.contains(&entity.to_lowercase()) {
                missing_entities.push(entity);
            }
        }

        let mut missing_decisions = Vec::new();
        for decision in self.extract_decisions(&original_text) {
            if !decision_preserved(&decision, &summary_lower) {
                missing_decisions.push(decision);
            }
        }

        ValidationReport {
            is_valid: missing_entities.is_empty() && missing_decisions.is_empty(),
            missing_entities,
            missing_decisions,
        }
    }
}

/// A decision survives when its verb reappears alongside at least one
/// significant context word (or the decision carried no significant
/// context at all).
fn decision_preserved(decision: &str, summary_lower: &str) -> bool {
    let words: BTreeSet<String> = decision
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let keywords: Vec<&String> = words
        .iter()
        .filter(|w| DECISION_KEYWORDS.contains(&w.as_str()))
        .collect();
    if keywords.is_empty() {
        return true;
    }

    for keyword in keywords {
        if !summary_lower.contains(keyword.as_str()) {
            continue;
        }
        let context: Vec<&String> = words
            .iter()
            .filter(|w| {
                !DECISION_KEYWORDS.contains(&w.as_str()) && w.len() >= SIGNIFICANT_WORD_LEN
            })
            .collect();
        if context.is_empty() {
            // Nothing substantive to check beyond the verb itself.
            return true;
        }
        if context.iter().any(|w| summary_lower.contains(w.as_str())) {
            return true;
        }
    }
    false
}

fn trim_trailing_punctuation(s: &str) -> &str {
    s.trim_end_matches(['.', ',', ';', ':', ')', '\'', '"'])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageRole;

    fn msg(content: &str) -> Message {
        Message::new(MessageRole::User, content)
    }

    fn validator() -> SummaryValidator {
        SummaryValidator::default()
    }

    // -- entity extraction --

    #[test]
    fn extracts_file_paths() {
        let entities =
            validator().extract_entities("Edit /src/config.py and ./scripts/run.sh first.");
        assert!(entities.contains("/src/config.py"));
        assert!(entities.contains("./scripts/run.sh"));
    }

    #[test]
    fn extracts_function_refs() {
        let entities = validator().extract_entities("Call setup() before Store.append() runs.");
        assert!(entities.contains("setup()"));
        assert!(entities.contains("Store.append()"));
    }

    #[test]
    fn extracts_urls() {
        let entities =
            validator().extract_entities("Docs at https://example.com/guide, read them.");
        assert!(entities.contains("https://example.com/guide"));
    }

    #[test]
    fn plain_prose_has_no_entities() {
        assert!(validator()
            .extract_entities("We talked about the weather.")
            .is_empty());
    }

    // -- decision extraction --

    #[test]
    fn extracts_decision_sentences() {
        let decisions = validator().extract_decisions(
            "We decided to use SQLite for persistence. The weather is nice. \
             They rejected the caching proposal.",
        );
        assert_eq!(decisions.len(), 2);
        assert!(decisions[0].contains("decided"));
        assert!(decisions[1].contains("rejected"));
    }

    #[test]
    fn short_fragments_skipped() {
        assert!(validator().extract_decisions("agreed.").is_empty());
    }

    // -- validation --

    #[test]
    fn valid_when_everything_preserved() {
        let originals = vec![
            msg("We decided to use SQLite for /src/storage.py."),
            msg("Also update init() in /src/main.py."),
        ];
        let summary = "Decided on SQLite for storage (/src/storage.py); init() in /src/main.py needs updating.";
        let report = validator().validate(&originals, summary);
        assert!(report.is_valid, "{report:?}");
    }

    /// The canonical fallback scenario: a summary dropping one of two file
    /// paths fails with exactly that path missing.
    #[test]
    fn missing_file_path_invalidates() {
        let originals = vec![msg("Files touched: /src/config.py and /src/main.py.")];
        let summary = "Work happened in /src/main.py.";
        let report = validator().validate(&originals, summary);
        assert!(!report.is_valid);
        assert_eq!(report.missing_entities, vec!["/src/config.py".to_owned()]);
    }

    #[test]
    fn missing_decision_invalidates() {
        let originals = vec![msg("We decided to disable retries for webhook deliveries.")];
        let summary = "General discussion about webhooks.";
        let report = validator().validate(&originals, summary);
        assert!(!report.is_valid);
        assert_eq!(report.missing_decisions.len(), 1);
    }

    #[test]
    fn decision_verb_with_context_passes() {
        let originals = vec![msg("We decided to disable retries for webhook deliveries.")];
        let summary = "It was decided that webhook retries are disabled.";
        let report = validator().validate(&originals, summary);
        assert!(report.is_valid, "{report:?}");
    }

    #[test]
    fn decision_verb_without_context_fails() {
        let originals = vec![msg("We decided to disable retries for webhook deliveries.")];
        // The verb appears, but none of the decision's substance does.
        let summary = "Many things were decided about the database schema.";
        let report = validator().validate(&originals, summary);
        assert!(!report.is_valid);
    }

    #[test]
    fn case_insensitive_entity_match() {
        let originals = vec![msg("See /SRC/Config.py for details.")];
        let summary = "see /src/config.py for details.";
        assert!(validator().validate(&originals, summary).is_valid);
    }

    #[test]
    fn empty_originals_are_trivially_valid() {
        assert!(validator().validate(&[], "anything").is_valid);
    }

    /// Determinism: the same inputs always produce the same verdict.
    #[test]
    fn validation_is_deterministic() {
        let originals = vec![msg("We chose /a/b.rs and approved the plan() change.")];
        let summary = "Chose /a/b.rs.";
        let first = validator().validate(&originals, summary);
        let second = validator().validate(&originals, summary);
        assert_eq!(first, second);
    }
}
