//! Semantic overlap analysis.
//!
//! Goes beyond textual conflicts: two branches working in the same
//! conceptual area can both merge cleanly and still fight. This stage
//! extracts top-level symbols from each branch's changed files, classifies
//! changed files into a fixed domain vocabulary by path pattern, and flags
//! public-API surface changes.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Domain classification patterns: domain name → path regexes.
const DOMAIN_PATTERNS: [(&str, &[&str]); 10] = [
    ("auth", &[r"auth", r"login", r"logout", r"session", r"token", r"permission"]),
    ("database", &[r"database", r"\bdb\b", r"models?", r"migrations?", r"schema"]),
    ("api", &[r"api/", r"routes?", r"endpoints?", r"handlers?", r"controllers?"]),
    ("ui", &[r"components?/", r"views?/", r"pages?/", r"templates?/", r"\.tsx?$", r"\.vue$"]),
    ("payments", &[r"payment", r"billing", r"checkout", r"stripe", r"invoice"]),
    ("notifications", &[r"notification", r"email", r"\bsms\b", r"push", r"alert"]),
    ("search", &[r"search", r"elastic", r"solr", r"index"]),
    ("cache", &[r"cache", r"redis", r"memcache"]),
    ("config", &[r"config", r"settings", r"\benv\b"]),
    ("tests", &[r"tests?/", r"spec/", r"__tests__"]),
];

/// Symbol extraction patterns per file extension.
const SYMBOL_PATTERNS: [(&str, &[&str]); 6] = [
    (".py", &[r"(?m)^(?:def|class|async def)\s+(\w+)"]),
    (
        ".js",
        &[
            r"(?:function|const|let|var|class)\s+(\w+)",
            r"(\w+)\s*[=:]\s*(?:function|\(.*\)\s*=>)",
        ],
    ),
    (
        ".ts",
        &[
            r"(?:function|const|let|var|class|interface|type)\s+(\w+)",
            r"(\w+)\s*[=:]\s*(?:function|\(.*\)\s*=>)",
        ],
    ),
    (
        ".go",
        &[
            r"(?m)^func\s+(?:\(\w+\s+\*?\w+\)\s+)?(\w+)",
            r"(?m)^type\s+(\w+)",
        ],
    ),
    (".rs", &[r"(?m)^(?:pub\s+)?(?:fn|struct|enum|trait)\s+(\w+)"]),
    (
        ".java",
        &[r"(?:public|private|protected)?\s*(?:static\s+)?(?:class|interface|enum)\s+(\w+)"],
    ),
];

/// Paths that declare a public API surface.
const API_PATH_PATTERNS: [&str; 5] = [
    r"api/.*\.(py|js|ts|go)$",
    r"routes?\.(py|js|ts|go)$",
    r"endpoints?\.(py|js|ts|go)$",
    r"openapi\.(yaml|json)$",
    r"swagger\.(yaml|json)$",
];

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Symbols both branches define in the same files.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SymbolOverlap {
    pub has_overlap: bool,
    pub overlapping_symbols: Vec<String>,
    pub overlapping_files: Vec<String>,
}

/// Domains touched by more than one branch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DomainOverlap {
    pub overlapping_domains: Vec<String>,
    pub domain_files: BTreeMap<String, Vec<String>>,
}

/// Combined semantic analysis result.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SemanticAnalysisResult {
    pub has_semantic_conflicts: bool,
    pub symbol_overlap: SymbolOverlap,
    pub domain_overlap: DomainOverlap,
    /// `branch: path` entries for changed API surfaces.
    pub api_changes: Vec<String>,
    pub confidence: f64,
}

/// Risk level derived from the analysis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticRisk {
    Low,
    Medium,
    High,
}

impl SemanticAnalysisResult {
    /// Assess overall risk.
    #[must_use]
    pub fn risk_level(&self) -> SemanticRisk {
        if !self.has_semantic_conflicts {
            return SemanticRisk::Low;
        }
        if self.symbol_overlap.overlapping_symbols.len() > 3 || !self.api_changes.is_empty() {
            return SemanticRisk::High;
        }
        if self.domain_overlap.overlapping_domains.len() > 1 {
            return SemanticRisk::Medium;
        }
        SemanticRisk::Low
    }
}

// ---------------------------------------------------------------------------
// SemanticAnalyzer
// ---------------------------------------------------------------------------

/// Analyzes symbol, domain, and API overlap across branches.
#[derive(Debug)]
pub struct SemanticAnalyzer {
    vcs: Vcs,
}

impl SemanticAnalyzer {
    #[must_use]
    pub const fn new(vcs: Vcs) -> Self {
        Self { vcs }
    }

    /// Run the analysis over `branches` relative to `base`.
    ///
    /// # Errors
    /// Returns an error only for VCS-level failures.
    pub fn analyze(
        &self,
        branches: &[BranchRef],
        base: &BranchRef,
    ) -> Result<SemanticAnalysisResult, OrchestratorError> {
        let mut branch_files: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut branch_symbols: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();

        for branch in branches {
            let files = self.vcs.changed_files(base, branch)?;
            let mut symbols = BTreeMap::new();
            for file in &files {
                if let Some(content) = self.vcs.show_file(branch, file)? {
                    let found = extract_symbols(file, &content);
                    if !found.is_empty() {
                        symbols.insert(file.clone(), found);
                    }
                }
            }
            branch_files.insert(branch.to_string(), files);
            branch_symbols.insert(branch.to_string(), symbols);
        }

        let symbol_overlap = pairwise_symbol_overlap(&branch_symbols);
        let domain_overlap = pairwise_domain_overlap(&branch_files);
        let api_changes = detect_api_changes(&branch_files);

        let has_conflicts = symbol_overlap.has_overlap
            || !domain_overlap.overlapping_domains.is_empty()
            || !api_changes.is_empty();

        Ok(SemanticAnalysisResult {
            has_semantic_conflicts: has_conflicts,
            symbol_overlap,
            domain_overlap,
            api_changes,
            confidence: if has_conflicts { 0.7 } else { 0.9 },
        })
    }
}

// ---------------------------------------------------------------------------
// Extraction and overlap (pure functions)
// ---------------------------------------------------------------------------

/// Extract top-level symbol names from a file, by extension.
#[must_use]
pub fn extract_symbols(path: &str, content: &str) -> Vec<String> {
    let Some(extension) = std::path::Path::new(path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
    else {
        return Vec::new();
    };
    let Some((_, patterns)) = SYMBOL_PATTERNS.iter().find(|(ext, _)| *ext == extension) else {
        return Vec::new();
    };

    let mut symbols = Vec::new();
    for pattern in *patterns {
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        for captures in regex.captures_iter(content) {
            if let Some(symbol) = captures.get(1) {
                let name = symbol.as_str();
                if !name.starts_with('_') && !symbols.iter().any(|s| s == name) {
                    symbols.push(name.to_owned());
                }
            }
        }
    }
    symbols
}

/// Classify files into domains by path pattern.
#[must_use]
pub fn classify_domains(files: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut domains: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in files {
        let lower = file.to_lowercase();
        for (domain, patterns) in DOMAIN_PATTERNS {
            let matched = patterns.iter().any(|pattern| {
                Regex::new(pattern).is_ok_and(|re| re.is_match(&lower))
            });
            if matched {
                domains.entry(domain.to_owned()).or_default().push(file.clone());
                break;
            }
        }
    }
    domains
}

fn pairwise_symbol_overlap(
    branch_symbols: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
) -> SymbolOverlap {
    let mut overlapping_symbols = BTreeSet::new();
    let mut overlapping_files = BTreeSet::new();

    let branches: Vec<&String> = branch_symbols.keys().collect();
    for (i, left) in branches.iter().enumerate() {
        for right in &branches[i + 1..] {
            let left_map = &branch_symbols[*left];
            let right_map = &branch_symbols[*right];
            for (file, left_symbols) in left_map {
                let Some(right_symbols) = right_map.get(file) else {
                    continue;
                };
                let left_set: BTreeSet<&String> = left_symbols.iter().collect();
                let shared: Vec<&String> = right_symbols
                    .iter()
                    .filter(|s| left_set.contains(s))
                    .collect();
                if !shared.is_empty() {
                    overlapping_files.insert(file.clone());
                    for symbol in shared {
                        overlapping_symbols.insert(symbol.clone());
                    }
                }
            }
        }
    }

    SymbolOverlap {
        has_overlap: !overlapping_symbols.is_empty(),
        overlapping_symbols: overlapping_symbols.into_iter().collect(),
        overlapping_files: overlapping_files.into_iter().collect(),
    }
}

fn pairwise_domain_overlap(branch_files: &BTreeMap<String, Vec<String>>) -> DomainOverlap {
    let per_branch: Vec<BTreeMap<String, Vec<String>>> =
        branch_files.values().map(|files| classify_domains(files)).collect();

    let mut overlapping = BTreeSet::new();
    let mut domain_files: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (i, left) in per_branch.iter().enumerate() {
        for right in &per_branch[i + 1..] {
            for (domain, left_files) in left {
                let Some(right_files) = right.get(domain) else {
                    continue;
                };
                overlapping.insert(domain.clone());
                let entry = domain_files.entry(domain.clone()).or_default();
                for file in left_files.iter().chain(right_files) {
                    if !entry.contains(file) {
                        entry.push(file.clone());
                    }
                }
            }
        }
    }

    DomainOverlap {
        overlapping_domains: overlapping.into_iter().collect(),
        domain_files,
    }
}

fn detect_api_changes(branch_files: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut api_changes = Vec::new();
    for (branch, files) in branch_files {
        for file in files {
            let lower = file.to_lowercase();
            let is_api = API_PATH_PATTERNS
                .iter()
                .any(|pattern| Regex::new(pattern).is_ok_and(|re| re.is_match(&lower)));
            if is_api {
                api_changes.push(format!("{branch}: {file}"));
            }
        }
    }
    api_changes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- symbol extraction --

    #[test]
    fn extracts_python_symbols() {
        let content = "def login(user):\n    pass\n\nclass SessionStore:\n    pass\n\ndef _private():\n    pass\n";
        let symbols = extract_symbols("app/auth.py", content);
        assert!(symbols.contains(&"login".to_owned()));
        assert!(symbols.contains(&"SessionStore".to_owned()));
        assert!(!symbols.iter().any(|s| s == "_private"));
    }

    #[test]
    fn extracts_rust_symbols() {
        let content = "pub fn resolve() {}\nstruct Inner;\npub trait Merge {}\n";
        let symbols = extract_symbols("src/merge.rs", content);
        assert_eq!(
            symbols,
            vec!["resolve".to_owned(), "Inner".to_owned(), "Merge".to_owned()]
        );
    }

    #[test]
    fn extracts_go_methods() {
        let content = "func (s *Server) Handle() {}\nfunc New() {}\ntype Server struct{}\n";
        let symbols = extract_symbols("server.go", content);
        assert!(symbols.contains(&"Handle".to_owned()));
        assert!(symbols.contains(&"New".to_owned()));
        assert!(symbols.contains(&"Server".to_owned()));
    }

    #[test]
    fn unknown_extension_yields_nothing() {
        assert!(extract_symbols("notes.md", "# fn heading").is_empty());
    }

    // -- domain classification --

    #[test]
    fn classifies_domains_by_path() {
        let files = vec![
            "src/auth/login.py".to_owned(),
            "db/migrations/001.sql".to_owned(),
            "web/components/Button.tsx".to_owned(),
            "plain/util.c".to_owned(),
        ];
        let domains = classify_domains(&files);
        assert!(domains.contains_key("auth"));
        assert!(domains.contains_key("database"));
        assert!(domains.contains_key("ui"));
        assert_eq!(domains.values().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn one_domain_per_file() {
        // First matching domain wins; the file is not double-counted.
        let files = vec!["api/auth_routes.py".to_owned()];
        let domains = classify_domains(&files);
        assert_eq!(domains.len(), 1);
    }

    // -- overlap --

    fn symbols_for(
        branch: &str,
        file: &str,
        names: &[&str],
    ) -> (String, BTreeMap<String, Vec<String>>) {
        let mut map = BTreeMap::new();
        map.insert(
            file.to_owned(),
            names.iter().map(|s| (*s).to_owned()).collect(),
        );
        (branch.to_owned(), map)
    }

    #[test]
    fn same_symbol_same_file_overlaps() {
        let branch_symbols: BTreeMap<_, _> = [
            symbols_for("a", "svc.py", &["handle", "setup"]),
            symbols_for("b", "svc.py", &["handle", "teardown"]),
        ]
        .into_iter()
        .collect();
        let overlap = pairwise_symbol_overlap(&branch_symbols);
        assert!(overlap.has_overlap);
        assert_eq!(overlap.overlapping_symbols, vec!["handle".to_owned()]);
        assert_eq!(overlap.overlapping_files, vec!["svc.py".to_owned()]);
    }

    #[test]
    fn same_symbol_different_files_does_not_overlap() {
        let branch_symbols: BTreeMap<_, _> = [
            symbols_for("a", "left.py", &["handle"]),
            symbols_for("b", "right.py", &["handle"]),
        ]
        .into_iter()
        .collect();
        assert!(!pairwise_symbol_overlap(&branch_symbols).has_overlap);
    }

    #[test]
    fn domain_overlap_across_branches() {
        let branch_files: BTreeMap<String, Vec<String>> = [
            ("a".to_owned(), vec!["src/auth/login.py".to_owned()]),
            ("b".to_owned(), vec!["lib/auth/token.py".to_owned()]),
        ]
        .into_iter()
        .collect();
        let overlap = pairwise_domain_overlap(&branch_files);
        assert_eq!(overlap.overlapping_domains, vec!["auth".to_owned()]);
        assert_eq!(overlap.domain_files["auth"].len(), 2);
    }

    // -- risk --

    #[test]
    fn api_changes_raise_risk_to_high() {
        let result = SemanticAnalysisResult {
            has_semantic_conflicts: true,
            api_changes: vec!["a: api/users.py".to_owned()],
            ..SemanticAnalysisResult::default()
        };
        assert_eq!(result.risk_level(), SemanticRisk::High);
    }

    #[test]
    fn many_shared_symbols_raise_risk_to_high() {
        let result = SemanticAnalysisResult {
            has_semantic_conflicts: true,
            symbol_overlap: SymbolOverlap {
                has_overlap: true,
                overlapping_symbols: ["a", "b", "c", "d"]
                    .iter()
                    .map(|s| (*s).to_owned())
                    .collect(),
                overlapping_files: vec![],
            },
            ..SemanticAnalysisResult::default()
        };
        assert_eq!(result.risk_level(), SemanticRisk::High);
    }

    #[test]
    fn no_conflicts_is_low_risk() {
        assert_eq!(
            SemanticAnalysisResult::default().risk_level(),
            SemanticRisk::Low
        );
    }
}
