//! Candidate diversity checking.
//!
//! Candidates that differ only cosmetically waste validation budget and
//! give the selector a false sense of choice. Diversity is measured as the
//! Jaccard distance between the candidates' changed-line sets; a candidate
//! set whose minimum pairwise diversity falls below the threshold is
//! rejected, and an oversized set is thinned to the subset that maximizes
//! minimum pairwise diversity (greedy).

use std::collections::BTreeSet;

use super::candidates::ResolutionCandidate;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default minimum pairwise Jaccard distance.
pub const DEFAULT_MIN_DIVERSITY: f64 = 0.3;

// ---------------------------------------------------------------------------
// DiversityReport
// ---------------------------------------------------------------------------

/// Outcome of a diversity check over a candidate set.
#[derive(Clone, Debug)]
pub struct DiversityReport {
    pub meets_threshold: bool,
    pub min_diversity: f64,
    pub avg_diversity: f64,
    /// Pairwise scores keyed by candidate id pair.
    pub pairwise: Vec<((String, String), f64)>,
    pub recommendation: Option<String>,
}

// ---------------------------------------------------------------------------
// DiversityChecker
// ---------------------------------------------------------------------------

/// Measures and enforces candidate diversity.
#[derive(Clone, Copy, Debug)]
pub struct DiversityChecker {
    min_diversity: f64,
}

impl Default for DiversityChecker {
    fn default() -> Self {
        Self {
            min_diversity: DEFAULT_MIN_DIVERSITY,
        }
    }
}

impl DiversityChecker {
    #[must_use]
    pub const fn new(min_diversity: f64) -> Self {
        Self { min_diversity }
    }

    /// Check a candidate set against the threshold.
    #[must_use]
    pub fn check(&self, candidates: &[ResolutionCandidate]) -> DiversityReport {
        if candidates.len() < 2 {
            return DiversityReport {
                meets_threshold: true,
                min_diversity: 1.0,
                avg_diversity: 1.0,
                pairwise: Vec::new(),
                recommendation: None,
            };
        }

        let mut pairwise = Vec::new();
        let mut scores = Vec::new();
        for (i, left) in candidates.iter().enumerate() {
            for right in &candidates[i + 1..] {
                let score = pairwise_diversity(left, right);
                pairwise.push(((left.id.clone(), right.id.clone()), score));
                scores.push(score);
            }
        }

        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        let meets = min >= self.min_diversity;

        let recommendation = if meets {
            None
        } else {
            let low: Vec<&(String, String)> = pairwise
                .iter()
                .filter(|(_, score)| *score < self.min_diversity)
                .map(|(pair, _)| pair)
                .collect();
            Some(format!(
                "candidates too similar (low-diversity pairs: {low:?}); regenerate with different strategies"
            ))
        };

        DiversityReport {
            meets_threshold: meets,
            min_diversity: min,
            avg_diversity: avg,
            pairwise,
            recommendation,
        }
    }

    /// Pick the `target_count` subset that maximizes minimum pairwise
    /// diversity. Greedy: start with the first candidate, repeatedly add
    /// the one farthest from everything selected.
    #[must_use]
    pub fn most_diverse_subset(
        &self,
        candidates: &[ResolutionCandidate],
        target_count: usize,
    ) -> Vec<ResolutionCandidate> {
        if candidates.len() <= target_count {
            return candidates.to_vec();
        }

        let mut selected: Vec<&ResolutionCandidate> = vec![&candidates[0]];
        while selected.len() < target_count {
            let best = candidates
                .iter()
                .filter(|c| !selected.iter().any(|s| s.id == c.id))
                .map(|c| {
                    let min_to_selected = selected
                        .iter()
                        .map(|s| pairwise_diversity(c, s))
                        .fold(f64::INFINITY, f64::min);
                    (c, min_to_selected)
                })
                .max_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((candidate, _)) => selected.push(candidate),
                None => break,
            }
        }
        selected.into_iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Pairwise distance
// ---------------------------------------------------------------------------

/// Jaccard distance between two candidates' changed-line sets: 0.0 for
/// identical diffs, 1.0 for completely disjoint ones.
#[must_use]
pub fn pairwise_diversity(a: &ResolutionCandidate, b: &ResolutionCandidate) -> f64 {
    let lines_a = changed_lines(&a.diff_from_base);
    let lines_b = changed_lines(&b.diff_from_base);

    if lines_a.is_empty() && lines_b.is_empty() {
        return 0.0;
    }
    if lines_a.is_empty() || lines_b.is_empty() {
        return 1.0;
    }

    let intersection = lines_a.intersection(&lines_b).count();
    let union = lines_a.union(&lines_b).count();
    if union == 0 {
        return 0.0;
    }
    1.0 - intersection as f64 / union as f64
}

/// Added/removed lines from a unified diff, headers and context stripped.
fn changed_lines(diff: &str) -> BTreeSet<String> {
    let mut lines = BTreeSet::new();
    for line in diff.lines() {
        if line.starts_with("+++")
            || line.starts_with("---")
            || line.starts_with("@@")
            || line.starts_with("diff ")
            || line.starts_with("index ")
        {
            continue;
        }
        if let Some(content) = line.strip_prefix('+').or_else(|| line.strip_prefix('-')) {
            let content = content.trim();
            if !content.is_empty() {
                lines.insert(content.to_owned());
            }
        }
    }
    lines
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
