//! User configuration.
//!
//! Loaded once at startup from `~/.orchestrator/config.yaml`, deep-merged
//! over built-in defaults, and passed by value to every consumer — there is
//! no global. The sensitive-glob list is the security-critical part: a file
//! whose path matches is never sent to an external LLM and never appears
//! verbatim in a prompt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How a generated file is handled when it conflicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedFilePolicy {
    /// Drop the file; it will be rebuilt.
    Delete,
    /// Keep the current side.
    Ours,
    /// Take the incoming side.
    Theirs,
    /// Delete and re-run the generator.
    Regenerate,
}

/// Resolution tuning knobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Disable all model-assisted resolution (air-gapped environments).
    pub disable_llm: bool,
    /// Skip the LLM when any file exceeds this size, bytes.
    pub max_file_size_for_llm: u64,
    /// Skip the LLM when the conflict count exceeds this.
    pub max_conflicts_for_llm: usize,
    /// Per-file LLM timeout, seconds.
    pub timeout_per_file: u64,
    /// Minimum score to auto-apply a candidate.
    pub auto_apply_threshold: f64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            disable_llm: false,
            max_file_size_for_llm: 10 * 1024 * 1024,
            max_conflicts_for_llm: 50,
            timeout_per_file: 120,
            auto_apply_threshold: 0.8,
        }
    }
}

// ---------------------------------------------------------------------------
// UserConfig
// ---------------------------------------------------------------------------

/// Process-wide user configuration, loaded once and treated as read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Globs marking files whose content must never leave the process
    /// toward an LLM.
    pub sensitive_globs: Vec<String>,
    /// Per-glob handling for generated files.
    pub generated_files: BTreeMap<String, GeneratedFilePolicy>,
    /// Per-file conflict-resolution overrides (user wins over defaults).
    pub file_policies: BTreeMap<String, String>,
    /// Resolution tuning.
    pub resolution: ResolutionConfig,
}

impl Default for UserConfig {
    fn default() -> Self {
        let mut generated_files = BTreeMap::new();
        for lock in ["package-lock.json", "yarn.lock", "Cargo.lock", "poetry.lock"] {
            generated_files.insert(lock.to_owned(), GeneratedFilePolicy::Regenerate);
        }
        generated_files.insert("*.pyc".to_owned(), GeneratedFilePolicy::Delete);
        generated_files.insert("__pycache__/*".to_owned(), GeneratedFilePolicy::Delete);

        Self {
            sensitive_globs: [
                "secrets/*",
                "*.pem",
                ".env*",
                "*.key",
                "*.p12",
                ".aws/*",
                ".gcp/*",
                "*credential*",
                "*password*",
            ]
            .iter()
            .map(|s| (*s).to_owned())
            .collect(),
            generated_files,
            file_policies: BTreeMap::new(),
            resolution: ResolutionConfig::default(),
        }
    }
}

impl UserConfig {
    /// The default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".orchestrator").join("config.yaml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file is absent.
    ///
    /// # Errors
    /// Returns a config error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self, OrchestratorError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path, deep-merging over defaults.
    ///
    /// # Errors
    /// Returns a config error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self, OrchestratorError> {
        let content = std::fs::read_to_string(path).map_err(|e| OrchestratorError::Config {
            path: path.to_path_buf(),
            detail: format!("cannot read: {e}"),
        })?;
        let user: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| OrchestratorError::Config {
                path: path.to_path_buf(),
                detail: format!("invalid YAML: {e}"),
            })?;
        let defaults = serde_yaml::to_value(Self::default()).map_err(|e| {
            OrchestratorError::Config {
                path: path.to_path_buf(),
                detail: format!("internal default serialization failed: {e}"),
            }
        })?;
        let merged = deep_merge(defaults, user);
        serde_yaml::from_value(merged).map_err(|e| OrchestratorError::Config {
            path: path.to_path_buf(),
            detail: format!("invalid configuration: {e}"),
        })
    }

    /// Whether model-assisted resolution is enabled.
    #[must_use]
    pub const fn llm_enabled(&self) -> bool {
        !self.resolution.disable_llm
    }

    /// Whether a path matches any sensitive glob.
    ///
    /// Both the full path and the basename are checked, so `*.pem` catches
    /// `deploy/certs/server.pem`.
    #[must_use]
    pub fn is_sensitive(&self, path: &str) -> bool {
        let basename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.sensitive_globs.iter().any(|g| {
            glob::Pattern::new(g)
                .is_ok_and(|pattern| pattern.matches(path) || pattern.matches(&basename))
        })
    }

    /// The policy for a generated file, if any glob matches.
    #[must_use]
    pub fn generated_file_policy(&self, path: &str) -> Option<GeneratedFilePolicy> {
        self.generated_files.iter().find_map(|(pattern, policy)| {
            glob::Pattern::new(pattern)
                .is_ok_and(|p| p.matches(path))
                .then_some(*policy)
        })
    }

    /// The user's per-file resolution override, if any glob matches.
    #[must_use]
    pub fn file_policy(&self, path: &str) -> Option<&str> {
        self.file_policies.iter().find_map(|(pattern, policy)| {
            glob::Pattern::new(pattern)
                .is_ok_and(|p| p.matches(path))
                .then_some(policy.as_str())
        })
    }
}

// ---------------------------------------------------------------------------
// Deep merge
// ---------------------------------------------------------------------------

/// Merge `user` over `base`, recursing into mappings.
fn deep_merge(base: serde_yaml::Value, user: serde_yaml::Value) -> serde_yaml::Value {
    match (base, user) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(user_map)) => {
            for (key, user_value) in user_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, user_value),
                    None => user_value,
                };
                base_map.insert(key, merged);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, user) => user,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mark_obvious_secrets_sensitive() {
        let config = UserConfig::default();
        assert!(config.is_sensitive("secrets/api.txt"));
        assert!(config.is_sensitive("deploy/certs/server.pem"));
        assert!(config.is_sensitive(".env.production"));
        assert!(config.is_sensitive("config/signing.key"));
        assert!(config.is_sensitive("aws_credentials.json"));
    }

    #[test]
    fn ordinary_files_are_not_sensitive() {
        let config = UserConfig::default();
        assert!(!config.is_sensitive("src/main.rs"));
        assert!(!config.is_sensitive("README.md"));
    }

    #[test]
    fn lockfiles_regenerate_by_default() {
        let config = UserConfig::default();
        assert_eq!(
            config.generated_file_policy("Cargo.lock"),
            Some(GeneratedFilePolicy::Regenerate)
        );
        assert_eq!(
            config.generated_file_policy("cache.pyc"),
            Some(GeneratedFilePolicy::Delete)
        );
        assert_eq!(config.generated_file_policy("src/lib.rs"), None);
    }

    #[test]
    fn user_file_overrides_defaults_and_keeps_the_rest() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "resolution:\n  disable_llm: true\nsensitive_globs:\n  - 'vault/*'\n",
        )
        .unwrap();

        let config = UserConfig::load_from(&path).unwrap();
        // Overridden scalar inside a nested mapping.
        assert!(!config.llm_enabled());
        // Untouched sibling keys keep their defaults.
        assert_eq!(config.resolution.max_conflicts_for_llm, 50);
        assert_eq!(config.resolution.timeout_per_file, 120);
        // Sequences are replaced, not appended.
        assert_eq!(config.sensitive_globs, vec!["vault/*".to_owned()]);
        assert!(config.is_sensitive("vault/root-token"));
        assert!(!config.is_sensitive("secrets/api.txt"));
    }

    #[test]
    fn file_policies_match_by_glob() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "file_policies:\n  'docs/*.md': ours\n").unwrap();
        let config = UserConfig::load_from(&path).unwrap();
        assert_eq!(config.file_policy("docs/guide.md"), Some("ours"));
        assert_eq!(config.file_policy("src/main.rs"), None);
    }

    #[test]
    fn invalid_yaml_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "resolution: [unclosed").unwrap();
        let err = UserConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, OrchestratorError::Config { .. }));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = UserConfig::default();
        assert!(config.llm_enabled());
        assert_eq!(config.resolution.max_file_size_for_llm, 10 * 1024 * 1024);
    }
}
