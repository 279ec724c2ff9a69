//! Stage 3: interface harmonization.
//!
//! When agents change the same interface in incompatible ways, the merged
//! code will not build no matter how the text is combined. This stage
//! identifies interface-level changes (function signatures, types,
//! exports) per file, groups them by `(file, name)`, and picks one
//! canonical version per group: the base version when it still exists,
//! otherwise the variant that changed the signature, otherwise the first
//! seen. A temporary compatibility shim can bridge the losing side's call
//! sites, and every decision is recorded.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context::{ConflictContext, FileVersion};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One interface-level declaration found in a file version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceChange {
    pub file: String,
    pub name: String,
    /// `function`, `type`, or `export`.
    pub kind: String,
    /// The full declaration line.
    pub signature: String,
    /// Which source declared it (`base` or an agent id).
    pub source: String,
}

/// A recorded harmonization decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarmonizationDecision {
    pub file: String,
    pub name: String,
    pub chosen_source: String,
    pub chosen_signature: String,
    pub reason: String,
}

/// A temporary shim bridging old call sites to the canonical signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityShim {
    pub file: String,
    pub content: String,
}

/// Output of the harmonization stage.
#[derive(Clone, Debug, Default)]
pub struct HarmonizedResult {
    pub decisions: Vec<HarmonizationDecision>,
    pub shims: Vec<CompatibilityShim>,
    /// Whether the post-harmonization check passed.
    pub build_passes: bool,
}

// ---------------------------------------------------------------------------
// Signature extraction
// ---------------------------------------------------------------------------

/// Declaration patterns: kind, regex with the name in group 1.
const SIGNATURE_PATTERNS: [(&str, &str); 5] = [
    ("function", r"(?m)^\s*(?:pub\s+)?(?:async\s+)?fn\s+(\w+)\s*\([^)]*\)[^{\n]*"),
    ("function", r"(?m)^\s*(?:async\s+)?def\s+(\w+)\s*\([^)]*\).*"),
    ("function", r"(?m)^\s*(?:export\s+)?function\s+(\w+)\s*\([^)]*\).*"),
    ("type", r"(?m)^\s*(?:pub\s+)?(?:struct|enum|trait|class|interface)\s+(\w+).*"),
    ("export", r"(?m)^\s*(?:pub\s+use|export)\s+.*?\b(\w+)\s*;?\s*$"),
];

/// Extract interface declarations from a file version.
#[must_use]
pub fn extract_interfaces(version: &FileVersion) -> Vec<InterfaceChange> {
    let Some(content) = &version.content else {
        return Vec::new();
    };
    let mut changes = Vec::new();
    for (kind, pattern) in SIGNATURE_PATTERNS {
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        for captures in regex.captures_iter(content) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let signature = whole.as_str().trim().to_owned();
            let name = name.as_str().to_owned();
            if changes
                .iter()
                .any(|c: &InterfaceChange| c.name == name && c.signature == signature)
            {
                continue;
            }
            changes.push(InterfaceChange {
                file: version.path.clone(),
                name,
                kind: kind.to_owned(),
                signature,
                source: version.source_tag.clone(),
            });
        }
    }
    changes
}

// ---------------------------------------------------------------------------
// InterfaceHarmonizer
// ---------------------------------------------------------------------------

/// Harmonizes interface changes across agent versions.
#[derive(Debug)]
pub struct InterfaceHarmonizer {
    emit_shims: bool,
}

impl Default for InterfaceHarmonizer {
    fn default() -> Self {
        Self { emit_shims: true }
    }
}

impl InterfaceHarmonizer {
    #[must_use]
    pub const fn new(emit_shims: bool) -> Self {
        Self { emit_shims }
    }

    /// Run harmonization. `build_check` verifies the project still builds
    /// after harmonization (a language-appropriate syntax check at
    /// minimum); pass a closure wired to the build tester, or a constant
    /// for contexts where the check happens downstream.
    pub fn harmonize(
        &self,
        context: &ConflictContext,
        build_check: impl FnOnce() -> bool,
    ) -> HarmonizedResult {
        // Collect declarations per (file, name) across all sources.
        let mut groups: BTreeMap<(String, String), Vec<InterfaceChange>> = BTreeMap::new();
        for version in &context.base_files {
            for change in extract_interfaces(version) {
                groups
                    .entry((change.file.clone(), change.name.clone()))
                    .or_default()
                    .push(change);
            }
        }
        for versions in context.agent_files.values() {
            for version in versions {
                for change in extract_interfaces(version) {
                    groups
                        .entry((change.file.clone(), change.name.clone()))
                        .or_default()
                        .push(change);
                }
            }
        }

        let mut decisions = Vec::new();
        let mut shims = Vec::new();

        for ((file, name), changes) in groups {
            let distinct: Vec<&InterfaceChange> = {
                let mut seen = Vec::new();
                for change in &changes {
                    if !seen
                        .iter()
                        .any(|s: &&InterfaceChange| s.signature == change.signature)
                    {
                        seen.push(change);
                    }
                }
                seen
            };
            if distinct.len() < 2 {
                // Everyone agrees; nothing to decide.
                continue;
            }

            let (canonical, reason) = pick_canonical(&distinct);
            decisions.push(HarmonizationDecision {
                file: file.clone(),
                name: name.clone(),
                chosen_source: canonical.source.clone(),
                chosen_signature: canonical.signature.clone(),
                reason: reason.to_owned(),
            });

            if self.emit_shims {
                // Bridge each losing variant to the canonical signature.
                for loser in distinct
                    .iter()
                    .filter(|c| c.signature != canonical.signature && c.source != "base")
                {
                    shims.push(CompatibilityShim {
                        file: file.clone(),
                        content: shim_text(&name, &loser.signature, &canonical.signature),
                    });
                }
            }
        }

        let build_passes = build_check();
        tracing::info!(
            decisions = decisions.len(),
            shims = shims.len(),
            build_passes,
            "interface harmonization complete"
        );

        HarmonizedResult {
            decisions,
            shims,
            build_passes,
        }
    }
}

/// Preference order: base version, then a signature-changed agent variant,
/// then the first seen.
fn pick_canonical<'a>(distinct: &[&'a InterfaceChange]) -> (&'a InterfaceChange, &'static str) {
    if let Some(base) = distinct.iter().find(|c| c.source == "base") {
        // Agents that kept the base signature win by default; agents that
        // changed it get shimmed.
        return (base, "base signature still present");
    }
    if let Some(changed) = distinct.iter().find(|c| c.source != "base") {
        return (changed, "signature-changed variant preferred");
    }
    (distinct[0], "first variant seen")
}

fn shim_text(name: &str, old_signature: &str, canonical_signature: &str) -> String {
    format!(
        "// TEMPORARY COMPATIBILITY SHIM for `{name}` — remove after call sites migrate.\n\
         // was:  {old_signature}\n\
         // now:  {canonical_signature}\n"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::AgentId;

    fn version(path: &str, source: &str, content: &str) -> FileVersion {
        FileVersion {
            path: path.to_owned(),
            content: Some(content.to_owned()),
            source_tag: source.to_owned(),
            sha: String::new(),
        }
    }

    fn context_with(base: &str, a: &str, b: &str) -> ConflictContext {
        let mut context = ConflictContext {
            conflicting_files: vec!["src/svc.rs".to_owned()],
            base_files: vec![version("src/svc.rs", "base", base)],
            ..ConflictContext::default()
        };
        context.agent_files.insert(
            AgentId::new("agent-a").unwrap(),
            vec![version("src/svc.rs", "agent-a", a)],
        );
        context.agent_files.insert(
            AgentId::new("agent-b").unwrap(),
            vec![version("src/svc.rs", "agent-b", b)],
        );
        context
    }

    // -- extraction --

    #[test]
    fn extracts_rust_signatures() {
        let v = version(
            "src/x.rs",
            "base",
            "pub fn handle(req: Request) -> Response {\npub struct Config {\n",
        );
        let interfaces = extract_interfaces(&v);
        assert!(interfaces.iter().any(|i| i.name == "handle" && i.kind == "function"));
        assert!(interfaces.iter().any(|i| i.name == "Config" && i.kind == "type"));
    }

    #[test]
    fn extracts_python_signatures() {
        let v = version("x.py", "base", "def handle(req, timeout=30):\n    pass\n");
        let interfaces = extract_interfaces(&v);
        assert_eq!(interfaces[0].name, "handle");
        assert!(interfaces[0].signature.contains("timeout=30"));
    }

    #[test]
    fn elided_version_extracts_nothing() {
        let v = FileVersion {
            path: "k.pem".to_owned(),
            content: None,
            source_tag: "base".to_owned(),
            sha: String::new(),
        };
        assert!(extract_interfaces(&v).is_empty());
    }

    // -- harmonization --

    #[test]
    fn agreeing_sources_need_no_decision() {
        let same = "pub fn handle(req: Request) -> Response {\n";
        let context = context_with(same, same, same);
        let result = InterfaceHarmonizer::default().harmonize(&context, || true);
        assert!(result.decisions.is_empty());
        assert!(result.build_passes);
    }

    #[test]
    fn base_signature_wins_when_present() {
        let context = context_with(
            "pub fn handle(req: Request) -> Response {\n",
            "pub fn handle(req: Request) -> Response {\n",
            "pub fn handle(req: Request, retries: u32) -> Response {\n",
        );
        let result = InterfaceHarmonizer::default().harmonize(&context, || true);
        assert_eq!(result.decisions.len(), 1);
        let decision = &result.decisions[0];
        assert_eq!(decision.name, "handle");
        assert_eq!(decision.chosen_source, "base");
        assert!(decision.reason.contains("base"));
    }

    #[test]
    fn shim_emitted_for_losing_variant() {
        let context = context_with(
            "pub fn handle(req: Request) -> Response {\n",
            "pub fn handle(req: Request) -> Response {\n",
            "pub fn handle(req: Request, retries: u32) -> Response {\n",
        );
        let result = InterfaceHarmonizer::default().harmonize(&context, || true);
        assert_eq!(result.shims.len(), 1);
        let shim = &result.shims[0];
        assert!(shim.content.contains("TEMPORARY COMPATIBILITY SHIM"));
        assert!(shim.content.contains("retries"));
    }

    #[test]
    fn shims_can_be_disabled() {
        let context = context_with(
            "pub fn handle(a: A) {\n",
            "pub fn handle(a: A) {\n",
            "pub fn handle(a: A, b: B) {\n",
        );
        let result = InterfaceHarmonizer::new(false).harmonize(&context, || true);
        assert!(!result.decisions.is_empty());
        assert!(result.shims.is_empty());
    }

    #[test]
    fn changed_variant_wins_when_base_gone() {
        // Base no longer declares the function; the agents disagree.
        let context = context_with(
            "// removed\n",
            "pub fn handle(req: Request) -> Response {\n",
            "pub fn handle(req: Request, retries: u32) -> Response {\n",
        );
        let result = InterfaceHarmonizer::default().harmonize(&context, || true);
        assert_eq!(result.decisions.len(), 1);
        assert_ne!(result.decisions[0].chosen_source, "base");
    }

    #[test]
    fn build_check_result_recorded() {
        let context = context_with(
            "pub fn f() {\n",
            "pub fn f(x: u32) {\n",
            "pub fn f(y: i64) {\n",
        );
        let result = InterfaceHarmonizer::default().harmonize(&context, || false);
        assert!(!result.build_passes);
    }
}
