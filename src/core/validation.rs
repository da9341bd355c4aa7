//! Validation for stored package paths
//!
//! Stored paths are relative, `/`-separated and normalized so the same file
//! always maps to one key.

use crate::error::{PackageError, Result};

/// Maximum length of one stored path (PathEntry length is a u16)
pub const MAX_PATH_LEN: usize = u16::MAX as usize;

/// Normalize a caller-supplied path into its stored form
///
/// - Backslashes become `/`
/// - Leading `/` and `./` segments are dropped
/// - Empty and `.` segments are collapsed
/// - `..` segments are rejected
///
/// # Examples
///
/// ```
/// use nvpk_rs::core::validation::normalize_path;
///
/// assert_eq!(normalize_path("/docs//guide/./intro.md").unwrap(), "docs/guide/intro.md");
/// assert_eq!(normalize_path("assets\\ui\\icon.png").unwrap(), "assets/ui/icon.png");
/// assert!(normalize_path("../etc/passwd").is_err());
/// ```
pub fn normalize_path(input: &str) -> Result<String> {
    let replaced = input.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PackageError::InvalidPath {
                    path: input.to_string(),
                    reason: "parent directory segments are not allowed".to_string(),
                })
            }
            other => segments.push(other),
        }
    }
    let normalized = segments.join("/");
    validate_stored_path(&normalized).map_err(|err| match err {
        PackageError::InvalidPath { reason, .. } => PackageError::InvalidPath {
            path: input.to_string(),
            reason,
        },
        other => other,
    })?;
    Ok(normalized)
}

/// Check that `path` is already in normalized stored form
pub fn validate_stored_path(path: &str) -> Result<()> {
    let fail = |reason: &str| {
        Err(PackageError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    if path.is_empty() {
        return fail("path cannot be empty");
    }
    if path.len() > MAX_PATH_LEN {
        return fail("path longer than 65535 bytes");
    }
    if path.contains('\0') {
        return fail("path cannot contain NUL");
    }
    if path.starts_with('/') || path.contains('\\') {
        return fail("path must be relative and '/'-separated");
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return fail("path must be normalized");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_path("a/b/c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_path("/a/b").unwrap(), "a/b");
        assert_eq!(normalize_path("./a//b/").unwrap(), "a/b");
        assert_eq!(normalize_path("a\\b").unwrap(), "a/b");
    }

    #[test]
    fn test_normalize_rejects() {
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("a/../b").is_err());
        assert!(normalize_path("a\0b").is_err());
    }

    #[test]
    fn test_stored_form() {
        assert!(validate_stored_path("docs/readme.txt").is_ok());
        assert!(validate_stored_path("/docs").is_err());
        assert!(validate_stored_path("docs//x").is_err());
        assert!(validate_stored_path("docs/./x").is_err());
        assert!(validate_stored_path(&"a".repeat(MAX_PATH_LEN + 1)).is_err());
    }

    #[test]
    fn test_error_keeps_caller_input() {
        match normalize_path("x/../y") {
            Err(PackageError::InvalidPath { path, .. }) => assert_eq!(path, "x/../y"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
