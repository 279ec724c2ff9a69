//! Path sandbox: traversal-safe resolution of user-supplied paths.
//!
//! Every path that originates outside the process (gate specs, workflow
//! YAML, agent manifests) is resolved through [`safe_path`] before any
//! filesystem access. The checks run in a fixed order, cheapest first, and
//! the only filesystem access is the component-by-component symlink walk:
//!
//! 1. null byte, tilde prefix, absolute path / Windows drive prefix
//! 2. URL-encoded traversal revealed by one or two rounds of decoding
//! 3. Unicode dot/slash look-alikes
//! 4. literal `..` anywhere, and per-component `..` prefixes/suffixes
//! 5. symlinks at any component whose resolution leaves the base directory
//!
//! [`validate_glob_pattern`] applies the same structural rules to glob
//! patterns used by gates and the sensitive-file configuration.

use std::path::{Path, PathBuf};

use crate::error::OrchestratorError;

// ---------------------------------------------------------------------------
// Unicode look-alikes
// ---------------------------------------------------------------------------

/// Characters that render like an ASCII dot but are not one.
const UNICODE_DOT_VARIANTS: [char; 5] = [
    '\u{ff0e}', // FULLWIDTH FULL STOP
    '\u{2024}', // ONE DOT LEADER
    '\u{fe52}', // SMALL FULL STOP
    '\u{0701}', // SYRIAC SUPRALINEAR FULL STOP
    '\u{0702}', // SYRIAC SUBLINEAR FULL STOP
];

/// Characters that render like a slash but are not one.
const UNICODE_SLASH_VARIANTS: [char; 4] = [
    '\u{ff0f}', // FULLWIDTH SOLIDUS
    '\u{2044}', // FRACTION SLASH
    '\u{2215}', // DIVISION SLASH
    '\u{29f8}', // BIG SOLIDUS
];

/// Percent-encoded spellings of `..` that survive a naive single decode.
const SUSPICIOUS_ENCODED_PATTERNS: [&str; 5] = [".%2e", "%2e.", "%2e%2e", "%252e", "%%32%65"];

// ---------------------------------------------------------------------------
// Percent decoding
// ---------------------------------------------------------------------------

/// Decode one round of `%XX` percent-encoding.
///
/// Invalid escapes are passed through unchanged, matching lenient URL
/// decoders: the caller compares decoded output against the input, so a
/// malformed escape simply fails to reveal anything new.
#[must_use]
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(s) = std::str::from_utf8(hex) {
                    if let Ok(byte) = u8::from_str_radix(s, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// safe_path
// ---------------------------------------------------------------------------

fn traversal(path: &str, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::PathTraversal {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

/// Resolve `user_path` safely inside `base_dir`.
///
/// Returns the resolved path, guaranteed not to escape `base_dir` through
/// traversal sequences, encoding tricks, Unicode look-alikes, or symlinks
/// at any intermediate component. The returned path may not exist; callers
/// that require existence check separately.
///
/// # Errors
/// Returns [`OrchestratorError::PathTraversal`] if any rule is violated.
pub fn safe_path(base_dir: &Path, user_path: &str) -> Result<PathBuf, OrchestratorError> {
    if user_path.contains('\0') {
        return Err(traversal(user_path, "contains a null byte"));
    }
    if user_path.starts_with('~') {
        return Err(traversal(user_path, "tilde expansion is not allowed"));
    }
    if user_path.starts_with('/') || is_windows_drive(user_path) {
        return Err(traversal(user_path, "absolute paths are not allowed"));
    }

    // One and two rounds of percent-decoding: traversal that only appears
    // after decoding means the caller tried to smuggle it past the checks.
    let decoded = percent_decode(user_path);
    if decoded.contains("..") && !user_path.contains("..") {
        return Err(traversal(user_path, "URL-encoded traversal detected"));
    }
    let double_decoded = percent_decode(&decoded);
    if double_decoded.contains("..") && !decoded.contains("..") {
        return Err(traversal(user_path, "double-encoded traversal detected"));
    }

    for variant in UNICODE_DOT_VARIANTS {
        if decoded.contains(variant) {
            return Err(traversal(user_path, "Unicode dot look-alike detected"));
        }
    }
    for variant in UNICODE_SLASH_VARIANTS {
        if decoded.contains(variant) {
            return Err(traversal(user_path, "Unicode slash look-alike detected"));
        }
    }

    let normalized = decoded.replace('\\', "/");

    if normalized.contains("..") {
        return Err(traversal(user_path, "contains '..' traversal"));
    }
    let lower = normalized.to_lowercase();
    for pattern in SUSPICIOUS_ENCODED_PATTERNS {
        if lower.contains(pattern) {
            return Err(traversal(user_path, "suspicious encoded pattern detected"));
        }
    }

    validate_components(user_path, &normalized)?;

    let base = base_dir
        .canonicalize()
        .unwrap_or_else(|_| base_dir.to_path_buf());
    check_symlink_escape(&base, &normalized, user_path)?;

    let mut target = base;
    for component in normalized.split('/').filter(|c| !c.is_empty() && *c != ".") {
        target.push(component);
    }
    Ok(target)
}

fn is_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() > 1 && bytes[1] == b':'
}

/// Validate each path component individually.
///
/// Catches components that smuggle `..` as a prefix or suffix even when the
/// whole-string check has been bypassed by normalization.
fn validate_components(original: &str, normalized: &str) -> Result<(), OrchestratorError> {
    for component in normalized.split('/') {
        if component.is_empty() {
            continue;
        }
        if component == ".." {
            return Err(traversal(original, "path component is '..'"));
        }
        if (component.starts_with("..") || component.ends_with("..")) && component.contains("..") {
            return Err(traversal(
                original,
                format!("suspicious path component '{component}'"),
            ));
        }
    }
    Ok(())
}

/// Walk the path component-by-component and reject any symlink whose target
/// resolves outside the base directory.
///
/// Runs before final resolution so an intermediate escape is caught even
/// when the final path nominally lands back inside the base.
fn check_symlink_escape(
    base: &Path,
    normalized: &str,
    original: &str,
) -> Result<(), OrchestratorError> {
    let mut current = base.to_path_buf();
    for component in normalized.split('/').filter(|c| !c.is_empty() && *c != ".") {
        current.push(component);
        let Ok(meta) = current.symlink_metadata() else {
            // Component does not exist yet; nothing to follow.
            continue;
        };
        if meta.file_type().is_symlink() {
            let resolved = current
                .canonicalize()
                .map_err(|e| traversal(original, format!("unresolvable symlink: {e}")))?;
            if !resolved.starts_with(base) {
                return Err(traversal(
                    original,
                    format!(
                        "symlink '{component}' escapes the base directory (resolves to {})",
                        resolved.display()
                    ),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Glob validation
// ---------------------------------------------------------------------------

/// Check that a glob pattern cannot match outside the working directory.
///
/// Applies the same structural rules as [`safe_path`]: no `..`, no absolute
/// paths, no Windows drive prefixes, no tilde expansion.
#[must_use]
pub fn validate_glob_pattern(pattern: &str) -> bool {
    if pattern.contains("..") {
        return false;
    }
    if pattern.starts_with('/') || is_windows_drive(pattern) {
        return false;
    }
    if pattern.starts_with('~') {
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> TempDir {
        TempDir::new().unwrap()
    }

    // -- percent decoding --

    #[test]
    fn decode_single_round() {
        assert_eq!(percent_decode("%2e%2e"), "..");
        assert_eq!(percent_decode("a%2fb"), "a/b");
    }

    #[test]
    fn decode_passes_through_invalid_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    // -- string-level rejections (no filesystem involved) --

    #[test]
    fn rejects_null_byte() {
        let dir = base();
        assert!(safe_path(dir.path(), "foo\0bar").is_err());
    }

    #[test]
    fn rejects_tilde() {
        let dir = base();
        assert!(safe_path(dir.path(), "~/secrets").is_err());
    }

    #[test]
    fn rejects_absolute() {
        let dir = base();
        assert!(safe_path(dir.path(), "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_windows_drive() {
        let dir = base();
        assert!(safe_path(dir.path(), "C:\\Windows").is_err());
    }

    #[test]
    fn rejects_plain_dotdot() {
        let dir = base();
        assert!(safe_path(dir.path(), "../outside").is_err());
        assert!(safe_path(dir.path(), "a/../../b").is_err());
    }

    #[test]
    fn rejects_dotdot_component_affixes() {
        let dir = base();
        assert!(safe_path(dir.path(), "..hidden/x").is_err());
        assert!(safe_path(dir.path(), "x/trailing../y").is_err());
    }

    #[test]
    fn rejects_encoded_traversal() {
        let dir = base();
        assert!(safe_path(dir.path(), "foo/%2e%2e/bar").is_err());
    }

    #[test]
    fn rejects_double_encoded_traversal() {
        // The canonical double-encoding attack: %252e decodes to %2e, which
        // decodes to '.'.
        let dir = base();
        let err = safe_path(dir.path(), "foo/%252e%252e/etc/passwd").unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("traversal") || msg.contains("encoded"));
    }

    #[test]
    fn rejects_unicode_dot_variant() {
        let dir = base();
        assert!(safe_path(dir.path(), "a\u{ff0e}\u{ff0e}/b").is_err());
    }

    #[test]
    fn rejects_unicode_slash_variant() {
        let dir = base();
        assert!(safe_path(dir.path(), "a\u{2044}b").is_err());
    }

    #[test]
    fn rejects_backslash_traversal() {
        let dir = base();
        assert!(safe_path(dir.path(), "a\\..\\b").is_err());
    }

    // -- accepted paths --

    #[test]
    fn accepts_simple_relative() {
        let dir = base();
        let resolved = safe_path(dir.path(), "src/main.rs").unwrap();
        assert!(resolved.ends_with("src/main.rs"));
    }

    #[test]
    fn accepts_nonexistent_target() {
        let dir = base();
        assert!(safe_path(dir.path(), "not/yet/created.txt").is_ok());
    }

    #[test]
    fn accepts_single_dots() {
        let dir = base();
        let resolved = safe_path(dir.path(), "./src/./lib.rs").unwrap();
        assert!(resolved.ends_with("src/lib.rs"));
    }

    // -- symlink escapes --

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let dir = base();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let err = safe_path(dir.path(), "link/file.txt").unwrap_err();
        assert!(format!("{err}").contains("symlink"));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_intermediate_symlink_escape() {
        // Even when the final path nominally resolves back inside the base,
        // an escaping intermediate component is rejected.
        let outside = TempDir::new().unwrap();
        let dir = base();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("sub/jump")).unwrap();
        assert!(safe_path(dir.path(), "sub/jump/deep/file").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn accepts_internal_symlink() {
        let dir = base();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        assert!(safe_path(dir.path(), "alias/file.txt").is_ok());
    }

    // -- glob validation --

    #[test]
    fn glob_accepts_safe_patterns() {
        assert!(validate_glob_pattern("src/**/*.rs"));
        assert!(validate_glob_pattern("*.json"));
        assert!(validate_glob_pattern("tests/*_test.py"));
    }

    #[test]
    fn glob_rejects_traversal() {
        assert!(!validate_glob_pattern("../*.rs"));
        assert!(!validate_glob_pattern("**/../secrets"));
    }

    #[test]
    fn glob_rejects_absolute_and_tilde() {
        assert!(!validate_glob_pattern("/etc/*"));
        assert!(!validate_glob_pattern("~/.ssh/*"));
        assert!(!validate_glob_pattern("C:/Windows/*"));
    }
}
