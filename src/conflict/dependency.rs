//! Declared-dependency conflict analysis.
//!
//! Two branches can merge cleanly while pinning the same package at
//! incompatible versions. This stage reads each package manifest format
//! (npm, pip, cargo, go modules) from the base and every branch, diffs the
//! declared versions, and flags divergence: a major-level difference is an
//! incompatibility, a minor-level difference a softer warning.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::model::types::BranchRef;
use crate::vcs::Vcs;

use super::Severity;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How two declared versions relate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyConflictKind {
    /// Major versions differ — the branches cannot both be right.
    Incompatible,
    /// Minor versions differ — usually reconcilable.
    MinorDiff,
}

/// A single dependency divergence between two sources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConflict {
    pub package: String,
    pub version1: String,
    pub version2: String,
    /// Which manifest ecosystem the package belongs to.
    pub package_manager: String,
    pub conflict_type: DependencyConflictKind,
    pub severity: Severity,
}

impl DependencyConflict {
    /// Human-readable one-liner.
    #[must_use]
    pub fn description(&self) -> String {
        format!(
            "{}: {} vs {} ({:?})",
            self.package, self.version1, self.version2, self.conflict_type
        )
    }
}

/// Declared dependencies per ecosystem: `manager → package → version`.
type DependencyMap = BTreeMap<String, BTreeMap<String, String>>;

/// Manifest files per ecosystem.
const DEPENDENCY_FILES: [(&str, &[&str]); 4] = [
    ("npm", &["package.json"]),
    ("pip", &["requirements.txt", "pyproject.toml"]),
    ("cargo", &["Cargo.toml"]),
    ("go", &["go.mod"]),
];

// ---------------------------------------------------------------------------
// DependencyAnalyzer
// ---------------------------------------------------------------------------

/// Diffs declared dependency versions across branches.
#[derive(Debug)]
pub struct DependencyAnalyzer {
    vcs: Vcs,
}

impl DependencyAnalyzer {
    #[must_use]
    pub const fn new(vcs: Vcs) -> Self {
        Self { vcs }
    }

    /// Analyze dependency conflicts between `branches` and `base`, and
    /// between the branches themselves.
    ///
    /// # Errors
    /// Returns an error only for VCS-level failures.
    pub fn analyze(
        &self,
        branches: &[BranchRef],
        base: &BranchRef,
    ) -> Result<Vec<DependencyConflict>, OrchestratorError> {
        let mut per_source: Vec<(String, DependencyMap)> = Vec::new();
        per_source.push((base.to_string(), self.branch_dependencies(base)?));
        for branch in branches {
            per_source.push((branch.to_string(), self.branch_dependencies(branch)?));
        }

        let mut conflicts = Vec::new();
        // Base vs each branch, then branches pairwise.
        for i in 1..per_source.len() {
            conflicts.extend(compare_sources(&per_source[0].1, &per_source[i].1));
        }
        for i in 1..per_source.len() {
            for j in i + 1..per_source.len() {
                conflicts.extend(compare_sources(&per_source[i].1, &per_source[j].1));
            }
        }

        // Deduplicate on (package, version pair).
        let mut seen = std::collections::BTreeSet::new();
        conflicts.retain(|c| {
            seen.insert((
                c.package.clone(),
                c.version1.clone(),
                c.version2.clone(),
            ))
        });
        Ok(conflicts)
    }

    fn branch_dependencies(&self, branch: &BranchRef) -> Result<DependencyMap, OrchestratorError> {
        let mut map = DependencyMap::new();
        for (manager, files) in DEPENDENCY_FILES {
            for file in files {
                let Some(content) = self.vcs.show_file(branch, file)? else {
                    continue;
                };
                let parsed = parse_dependency_file(&content, file);
                if !parsed.is_empty() {
                    map.entry(manager.to_owned()).or_default().extend(parsed);
                }
            }
        }
        Ok(map)
    }
}

/// Compare two dependency maps, ecosystem by ecosystem.
fn compare_sources(a: &DependencyMap, b: &DependencyMap) -> Vec<DependencyConflict> {
    let mut conflicts = Vec::new();
    for (manager, packages_a) in a {
        let Some(packages_b) = b.get(manager) else {
            continue;
        };
        conflicts.extend(compare_deps(packages_a, packages_b, manager));
    }
    conflicts
}

/// Compare two package sets for one ecosystem.
#[must_use]
pub fn compare_deps(
    deps1: &BTreeMap<String, String>,
    deps2: &BTreeMap<String, String>,
    package_manager: &str,
) -> Vec<DependencyConflict> {
    let mut conflicts = Vec::new();
    for (package, v1) in deps1 {
        let Some(v2) = deps2.get(package) else {
            continue;
        };
        if v1 == v2 {
            continue;
        }
        if let Some((conflict_type, severity)) = check_version_conflict(v1, v2) {
            conflicts.push(DependencyConflict {
                package: package.clone(),
                version1: v1.clone(),
                version2: v2.clone(),
                package_manager: package_manager.to_owned(),
                conflict_type,
                severity,
            });
        }
    }
    conflicts
}

// ---------------------------------------------------------------------------
// Version comparison
// ---------------------------------------------------------------------------

fn numeric_parts(version: &str) -> Vec<u64> {
    let cleaned: String = version
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Classify a version divergence.
///
/// Major difference is incompatible/high; minor difference is medium, or
/// low when both sides use caret ranges (caret allows minor drift).
fn check_version_conflict(v1: &str, v2: &str) -> Option<(DependencyConflictKind, Severity)> {
    let parts1 = numeric_parts(v1);
    let parts2 = numeric_parts(v2);
    if parts1.is_empty() || parts2.is_empty() {
        return None;
    }

    let major1 = parts1.first().copied().unwrap_or(0);
    let major2 = parts2.first().copied().unwrap_or(0);
    if major1 != major2 {
        return Some((DependencyConflictKind::Incompatible, Severity::High));
    }

    let minor1 = parts1.get(1).copied().unwrap_or(0);
    let minor2 = parts2.get(1).copied().unwrap_or(0);
    if minor1 != minor2 {
        if v1.contains('^') && v2.contains('^') {
            return Some((DependencyConflictKind::MinorDiff, Severity::Low));
        }
        return Some((DependencyConflictKind::MinorDiff, Severity::Medium));
    }

    None
}

// ---------------------------------------------------------------------------
// Manifest parsers
// ---------------------------------------------------------------------------

/// Parse one manifest file into `package → version`.
#[must_use]
pub fn parse_dependency_file(content: &str, file_name: &str) -> BTreeMap<String, String> {
    match file_name {
        "package.json" => parse_package_json(content),
        "requirements.txt" => parse_requirements_txt(content),
        "pyproject.toml" => parse_pyproject_toml(content),
        "Cargo.toml" => parse_cargo_toml(content),
        "go.mod" => parse_go_mod(content),
        _ => BTreeMap::new(),
    }
}

fn parse_package_json(content: &str) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();
    let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
        return deps;
    };
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(map) = value.get(section).and_then(serde_json::Value::as_object) {
            for (package, version) in map {
                if let Some(version) = version.as_str() {
                    deps.insert(package.clone(), version.to_owned());
                }
            }
        }
    }
    deps
}

fn parse_requirements_txt(content: &str) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();
    let line_re = Regex::new(r"^([a-zA-Z0-9_.\-]+)\s*([<>=!~]+.+)?$").expect("static regex");
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        if let Some(captures) = line_re.captures(line) {
            let package = captures[1].to_owned();
            let version = captures
                .get(2)
                .map_or_else(|| "*".to_owned(), |m| m.as_str().trim().to_owned());
            deps.insert(package, version);
        }
    }
    deps
}

fn parse_pyproject_toml(content: &str) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();
    let Ok(value) = content.parse::<toml::Table>() else {
        return deps;
    };
    // PEP 621: project.dependencies is a list of requirement strings.
    if let Some(list) = value
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(toml::Value::as_array)
    {
        let req_re = Regex::new(r"^([a-zA-Z0-9_.\-]+)\s*(.*)$").expect("static regex");
        for item in list {
            if let Some(requirement) = item.as_str() {
                if let Some(captures) = req_re.captures(requirement.trim()) {
                    let version = captures[2].trim();
                    deps.insert(
                        captures[1].to_owned(),
                        if version.is_empty() {
                            "*".to_owned()
                        } else {
                            version.to_owned()
                        },
                    );
                }
            }
        }
    }
    // Poetry: tool.poetry.dependencies is a table.
    if let Some(table) = value
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .and_then(toml::Value::as_table)
    {
        for (package, version) in table {
            if let Some(version) = toml_version(version) {
                deps.insert(package.clone(), version);
            }
        }
    }
    deps
}

fn parse_cargo_toml(content: &str) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();
    let Ok(value) = content.parse::<toml::Table>() else {
        return deps;
    };
    for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
        if let Some(table) = value.get(section).and_then(toml::Value::as_table) {
            for (package, version) in table {
                if let Some(version) = toml_version(version) {
                    deps.insert(package.clone(), version);
                }
            }
        }
    }
    deps
}

/// Version from either `pkg = "1.2"` or `pkg = { version = "1.2", … }`.
fn toml_version(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Table(t) => t
            .get("version")
            .and_then(toml::Value::as_str)
            .map(ToOwned::to_owned),
        _ => None,
    }
}

fn parse_go_mod(content: &str) -> BTreeMap<String, String> {
    let mut deps = BTreeMap::new();
    let req_re = Regex::new(r"^\s*([^\s]+)\s+(v[\d.]+)").expect("static regex");
    let mut in_require = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == "require (" {
            in_require = true;
            continue;
        }
        if trimmed == ")" && in_require {
            in_require = false;
            continue;
        }
        let candidate = if in_require {
            trimmed
        } else if let Some(rest) = trimmed.strip_prefix("require ") {
            rest
        } else {
            continue;
        };
        if let Some(captures) = req_re.captures(candidate) {
            deps.insert(captures[1].to_owned(), captures[2].to_owned());
        }
    }
    deps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    // -- the canonical lodash scenario --

    #[test]
    fn major_divergence_is_incompatible_high() {
        let a = deps(&[("lodash", "^4.17.0")]);
        let b = deps(&[("lodash", "^3.10.0")]);
        let conflicts = compare_deps(&a, &b, "npm");
        assert_eq!(conflicts.len(), 1);
        let c = &conflicts[0];
        assert_eq!(c.package, "lodash");
        assert_eq!(c.conflict_type, DependencyConflictKind::Incompatible);
        assert_eq!(c.severity, Severity::High);
    }

    #[test]
    fn identical_versions_do_not_conflict() {
        let a = deps(&[("serde", "1.0.200")]);
        let b = deps(&[("serde", "1.0.200")]);
        assert!(compare_deps(&a, &b, "cargo").is_empty());
    }

    #[test]
    fn caret_minor_divergence_is_low() {
        let a = deps(&[("react", "^18.2.0")]);
        let b = deps(&[("react", "^18.3.0")]);
        let conflicts = compare_deps(&a, &b, "npm");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Low);
    }

    #[test]
    fn pinned_minor_divergence_is_medium() {
        let a = deps(&[("requests", "==2.31.0")]);
        let b = deps(&[("requests", "==2.28.0")]);
        let conflicts = compare_deps(&a, &b, "pip");
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, DependencyConflictKind::MinorDiff);
        assert_eq!(conflicts[0].severity, Severity::Medium);
    }

    #[test]
    fn disjoint_packages_do_not_conflict() {
        let a = deps(&[("left", "1.0")]);
        let b = deps(&[("right", "2.0")]);
        assert!(compare_deps(&a, &b, "npm").is_empty());
    }

    // -- parsers --

    #[test]
    fn parses_package_json_sections() {
        let content = r#"{
            "dependencies": {"lodash": "^4.17.0"},
            "devDependencies": {"jest": "^29.0.0"}
        }"#;
        let parsed = parse_dependency_file(content, "package.json");
        assert_eq!(parsed["lodash"], "^4.17.0");
        assert_eq!(parsed["jest"], "^29.0.0");
    }

    #[test]
    fn parses_requirements_txt() {
        let content = "# comment\nrequests==2.31.0\nflask>=2.0\n-r other.txt\nbare\n";
        let parsed = parse_dependency_file(content, "requirements.txt");
        assert_eq!(parsed["requests"], "==2.31.0");
        assert_eq!(parsed["flask"], ">=2.0");
        assert_eq!(parsed["bare"], "*");
    }

    #[test]
    fn parses_cargo_toml_both_forms() {
        let content = "[dependencies]\nserde = \"1.0\"\ntokio = { version = \"1.35\", features = [\"full\"] }\n\n[dev-dependencies]\ntempfile = \"3\"\n";
        let parsed = parse_dependency_file(content, "Cargo.toml");
        assert_eq!(parsed["serde"], "1.0");
        assert_eq!(parsed["tokio"], "1.35");
        assert_eq!(parsed["tempfile"], "3");
    }

    #[test]
    fn parses_go_mod_block_and_inline() {
        let content = "module example.com/app\n\nrequire github.com/pkg/errors v0.9.1\n\nrequire (\n\tgolang.org/x/sync v0.5.0\n)\n";
        let parsed = parse_dependency_file(content, "go.mod");
        assert_eq!(parsed["github.com/pkg/errors"], "v0.9.1");
        assert_eq!(parsed["golang.org/x/sync"], "v0.5.0");
    }

    #[test]
    fn parses_pyproject_pep621() {
        let content = "[project]\nname = \"app\"\ndependencies = [\"requests>=2.31\", \"click\"]\n";
        let parsed = parse_dependency_file(content, "pyproject.toml");
        assert_eq!(parsed["requests"], ">=2.31");
        assert_eq!(parsed["click"], "*");
    }

    #[test]
    fn malformed_manifest_yields_nothing() {
        assert!(parse_dependency_file("{broken", "package.json").is_empty());
        assert!(parse_dependency_file("[unclosed", "Cargo.toml").is_empty());
    }
}
