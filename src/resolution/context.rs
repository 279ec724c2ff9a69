//! Stage 1: context assembly.
//!
//! Materializes everything later stages need: base and per-agent SHAs, a
//! [`FileVersion`] per source for every conflicting file, related files
//! (module siblings and importers, capped), and detected project
//! conventions. Changed-file sets are always derived from the VCS diff —
//! agent-supplied manifests are hints, never trusted.
//!
//! Files matching a sensitive glob are carried with their content elided:
//! they exist in the context for bookkeeping but never reach a prompt.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::UserConfig;
use crate::conflict::PipelineResult;
use crate::error::OrchestratorError;
use crate::model::types::{AgentId, BranchRef};
use crate::vcs::Vcs;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Cap on harvested related files.
const RELATED_FILES_CAP: usize = 20;

/// Lint/style configuration files that signal conventions.
const CONVENTION_FILES: [&str; 8] = [
    ".eslintrc.json",
    ".eslintrc.js",
    "rustfmt.toml",
    "clippy.toml",
    ".editorconfig",
    "ruff.toml",
    ".flake8",
    ".prettierrc",
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One version of one file from one source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Repository-relative path.
    pub path: String,
    /// File content; `None` when the file is sensitive or unreadable.
    pub content: Option<String>,
    /// Which source produced this version (`base` or an agent id).
    pub source_tag: String,
    /// SHA-256 of the content (empty when content is elided).
    pub sha: String,
}

impl FileVersion {
    fn new(path: &str, content: Option<String>, source_tag: &str) -> Self {
        let sha = content.as_ref().map_or_else(String::new, |c| {
            let mut hasher = Sha256::new();
            hasher.update(c.as_bytes());
            format!("{:x}", hasher.finalize())
        });
        Self {
            path: path.to_owned(),
            content,
            source_tag: source_tag.to_owned(),
            sha,
        }
    }

    /// True when the content was withheld by the sensitive-file policy.
    #[must_use]
    pub const fn is_elided(&self) -> bool {
        self.content.is_none()
    }
}

/// A file related to the conflict but not itself conflicting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedFile {
    pub path: String,
    /// Why it was harvested (`sibling`, `importer`).
    pub relation: String,
}

/// A detected project convention.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConvention {
    pub kind: String,
    pub detail: String,
}

/// Snapshot for one merge-resolution attempt. Built fresh per run and
/// discarded after; references up the tree go through lookup keys
/// (`agent_id`), never pointers.
#[derive(Clone, Debug, Default)]
pub struct ConflictContext {
    pub base_branch: Option<BranchRef>,
    pub base_sha: String,
    pub agent_branches: BTreeMap<AgentId, BranchRef>,
    pub agent_shas: BTreeMap<AgentId, String>,
    /// Files the merge preview found conflicting.
    pub conflicting_files: Vec<String>,
    /// Base version of each conflicting file.
    pub base_files: Vec<FileVersion>,
    /// Per-agent versions of the conflicting files.
    pub agent_files: BTreeMap<AgentId, Vec<FileVersion>>,
    /// Changed-file sets derived from the VCS diff (authoritative).
    pub changed_files: BTreeMap<AgentId, Vec<String>>,
    /// Task descriptions supplied by the coordinator (hints).
    pub task_descriptions: BTreeMap<AgentId, String>,
    pub related_files: Vec<RelatedFile>,
    pub conventions: Vec<ProjectConvention>,
}

impl ConflictContext {
    /// Agent ids in deterministic order.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agent_branches.keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// ContextAssembler
// ---------------------------------------------------------------------------

/// Builds a [`ConflictContext`] from a detection result.
#[derive(Debug)]
pub struct ContextAssembler {
    vcs: Vcs,
    base: BranchRef,
    config: UserConfig,
}

impl ContextAssembler {
    #[must_use]
    pub const fn new(vcs: Vcs, base: BranchRef, config: UserConfig) -> Self {
        Self { vcs, base, config }
    }

    /// Assemble the full context.
    ///
    /// `agents` maps agent ids to their branches; `tasks` carries the
    /// coordinator's task descriptions (used as intent hints only).
    ///
    /// # Errors
    /// Returns an error for VCS-level failures.
    pub fn assemble(
        &self,
        detection: &PipelineResult,
        agents: &BTreeMap<AgentId, BranchRef>,
        tasks: &BTreeMap<AgentId, String>,
    ) -> Result<ConflictContext, OrchestratorError> {
        let mut context = ConflictContext {
            base_branch: Some(self.base.clone()),
            base_sha: self.vcs.rev_parse(&self.base)?,
            agent_branches: agents.clone(),
            task_descriptions: tasks.clone(),
            ..ConflictContext::default()
        };

        for (agent_id, branch) in agents {
            context
                .agent_shas
                .insert(agent_id.clone(), self.vcs.rev_parse(branch)?);
            // The diff is the source of truth for what an agent changed.
            context
                .changed_files
                .insert(agent_id.clone(), self.vcs.changed_files(&self.base, branch)?);
        }

        context.conflicting_files = detection
            .textual
            .as_ref()
            .map(|t| t.conflicting_files.iter().map(|f| f.path.clone()).collect())
            .unwrap_or_default();

        for path in &context.conflicting_files {
            context
                .base_files
                .push(self.file_version(&self.base, path, "base")?);
            for (agent_id, branch) in agents {
                let version = self.file_version(branch, path, agent_id.as_str())?;
                context
                    .agent_files
                    .entry(agent_id.clone())
                    .or_default()
                    .push(version);
            }
        }

        context.related_files = self.harvest_related(&context)?;
        context.conventions = self.detect_conventions()?;
        Ok(context)
    }

    fn file_version(
        &self,
        branch: &BranchRef,
        path: &str,
        source_tag: &str,
    ) -> Result<FileVersion, OrchestratorError> {
        if self.config.is_sensitive(path) {
            tracing::warn!(path, "eliding sensitive file from resolution context");
            return Ok(FileVersion::new(path, None, source_tag));
        }
        let content = self.vcs.show_file(branch, path)?;
        Ok(FileVersion::new(path, content, source_tag))
    }

    /// Related files: siblings in the same module directory, then files in
    /// the agents' change-sets that import a conflicting file's stem.
    fn harvest_related(
        &self,
        context: &ConflictContext,
    ) -> Result<Vec<RelatedFile>, OrchestratorError> {
        let mut related: Vec<RelatedFile> = Vec::new();
        let tree = self.vcs.ls_tree(&self.base)?;

        for conflicting in &context.conflicting_files {
            let parent = std::path::Path::new(conflicting)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            for path in &tree {
                if related.len() >= RELATED_FILES_CAP {
                    return Ok(related);
                }
                if path == conflicting || context.conflicting_files.contains(path) {
                    continue;
                }
                let same_dir = std::path::Path::new(path)
                    .parent()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
                    == parent;
                if same_dir && !related.iter().any(|r| &r.path == path) {
                    related.push(RelatedFile {
                        path: path.clone(),
                        relation: "sibling".to_owned(),
                    });
                }
            }

            let stem = std::path::Path::new(conflicting)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stem.is_empty() {
                continue;
            }
            for versions in context.agent_files.values() {
                for version in versions {
                    if related.len() >= RELATED_FILES_CAP {
                        return Ok(related);
                    }
                    let Some(content) = &version.content else {
                        continue;
                    };
                    if version.path != *conflicting
                        && imports_module(content, &stem)
                        && !related.iter().any(|r| r.path == version.path)
                    {
                        related.push(RelatedFile {
                            path: version.path.clone(),
                            relation: "importer".to_owned(),
                        });
                    }
                }
            }
        }
        Ok(related)
    }

    fn detect_conventions(&self) -> Result<Vec<ProjectConvention>, OrchestratorError> {
        let mut conventions = Vec::new();
        let tree = self.vcs.ls_tree(&self.base)?;

        for config_file in CONVENTION_FILES {
            if tree.iter().any(|p| p == config_file) {
                conventions.push(ProjectConvention {
                    kind: "lint_config".to_owned(),
                    detail: config_file.to_owned(),
                });
            }
        }

        // Dominant file-name casing among source files.
        let stems: Vec<String> = tree
            .iter()
            .filter(|p| {
                std::path::Path::new(p)
                    .extension()
                    .is_some_and(|e| matches!(e.to_str(), Some("rs" | "py" | "go" | "js" | "ts")))
            })
            .filter_map(|p| {
                std::path::Path::new(p)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .collect();
        if !stems.is_empty() {
            let snake = stems
                .iter()
                .filter(|s| s.chars().all(|c| c.is_ascii_lowercase() || c == '_' || c.is_ascii_digit()))
                .count();
            let detail = if snake * 2 >= stems.len() {
                "snake_case file names"
            } else {
                "mixed-case file names"
            };
            conventions.push(ProjectConvention {
                kind: "naming".to_owned(),
                detail: detail.to_owned(),
            });
        }
        Ok(conventions)
    }
}

/// Cheap import heuristic: the module stem appears in an import-like line.
fn imports_module(content: &str, stem: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim_start();
        (trimmed.starts_with("use ")
            || trimmed.starts_with("import ")
            || trimmed.starts_with("from ")
            || trimmed.contains("require("))
            && trimmed.contains(stem)
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
