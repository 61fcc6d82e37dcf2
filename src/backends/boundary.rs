//! Path boundary enforcement.
//!
//! Every path-taking backend operation resolves its operand here before any
//! storage is touched. Resolution is purely lexical (no symlink resolution,
//! no filesystem access) and uses `/` as the separator for both real
//! directories and memory key prefixes.
//!
//! Three cases, in order:
//!
//! 1. An absolute path already inside the boundary is returned normalized.
//! 2. An absolute path outside the boundary is reinterpreted as
//!    boundary-relative by stripping its leading separators, so naming
//!    `/etc/passwd` lands on `<boundary>/etc/passwd`.
//! 3. A relative path is joined onto the boundary, `.`/`..` are folded,
//!    and the result must still be inside the boundary.

use crate::error::{BackendError, Result};

pub const SEPARATOR: char = '/';

/// Lexically normalizes a `/`-separated path.
///
/// Collapses repeated separators, drops `.` segments and folds `..` into
/// the preceding segment. `..` never climbs above the root of an absolute
/// path; leading `..` segments of a relative path are kept. The empty path
/// normalizes to `.`, and trailing separators are removed.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with(SEPARATOR);
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Normalizes `path` as if it were rooted at `/`, yielding a canonical
/// absolute form used for every containment comparison.
pub fn absolutize(path: &str) -> String {
    normalize(&format!("/{path}"))
}

/// Joins two `/`-separated paths without normalizing.
pub fn join(base: &str, tail: &str) -> String {
    if tail.is_empty() {
        return base.to_string();
    }
    if tail.starts_with(SEPARATOR) || base.is_empty() {
        return tail.to_string();
    }
    if base.ends_with(SEPARATOR) {
        format!("{base}{tail}")
    } else {
        format!("{base}/{tail}")
    }
}

/// True when the absolute `candidate` equals `boundary` or lives under it.
/// Both arguments must already be in [`absolutize`]d form.
pub fn is_within(candidate: &str, boundary: &str) -> bool {
    if candidate == boundary {
        return true;
    }
    if boundary == "/" {
        return candidate.starts_with(SEPARATOR);
    }
    candidate
        .strip_prefix(boundary)
        .is_some_and(|rest| rest.starts_with(SEPARATOR))
}

/// Strips `boundary` from an absolute `candidate` inside it, returning the
/// boundary-relative remainder (`""` for the boundary itself).
pub fn relative_to<'a>(candidate: &'a str, boundary: &str) -> Option<&'a str> {
    if candidate == boundary {
        return Some("");
    }
    if boundary == "/" {
        return candidate.strip_prefix(SEPARATOR);
    }
    candidate
        .strip_prefix(boundary)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
}

/// Resolves `path` against `boundary`, rejecting anything that escapes it.
///
/// The returned path keeps the form of `boundary`: an absolute boundary
/// yields an absolute path, a relative one (such as a scope path) yields a
/// path relative to the same parent. Raises [`BackendError::PathEscape`]
/// carrying the original input when normalization leaves the boundary.
pub fn resolve_within(path: &str, boundary: &str) -> Result<String> {
    let boundary_resolved = absolutize(boundary);

    let relative = if path.starts_with(SEPARATOR) {
        let path_resolved = absolutize(path);
        if is_within(&path_resolved, &boundary_resolved) {
            if boundary.starts_with(SEPARATOR) {
                return Ok(path_resolved);
            }
            return Ok(normalize(path_resolved.trim_start_matches(SEPARATOR)));
        }
        path.trim_start_matches(SEPARATOR)
    } else {
        path
    };

    let combined = join(boundary, relative);
    let normalized = normalize(&combined);
    // absolutize() swallows leading `..`, so a relative boundary needs its own check
    let climbs_out = normalized == ".." || normalized.starts_with("../");
    if climbs_out || !is_within(&absolutize(&combined), &boundary_resolved) {
        return Err(BackendError::path_escape(path));
    }

    Ok(normalized)
}

/// Checks that an already-absolute `path` lies inside `boundary` without
/// rewriting it. Used for caller-built paths such as a process working
/// directory, where silently reinterpreting the input would be wrong.
pub fn assert_absolute_within(path: &str, boundary: &str) -> Result<()> {
    if is_within(&absolutize(path), &absolutize(boundary)) {
        Ok(())
    } else {
        Err(BackendError::path_escape(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn escapes(path: &str, boundary: &str) -> bool {
        matches!(
            resolve_within(path, boundary),
            Err(ref e) if e.kind() == ErrorKind::PathEscape
        )
    }

    // ── normalize ───────────────────────────────────────

    #[test]
    fn test_normalize_folds_dots() {
        assert_eq!(normalize("/a/./b/../c"), "/a/c");
        assert_eq!(normalize("a//b/"), "a/b");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("./"), ".");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn test_normalize_parent_at_root_is_dropped() {
        assert_eq!(normalize("/../../etc"), "/etc");
    }

    #[test]
    fn test_normalize_keeps_leading_parent_for_relative() {
        assert_eq!(normalize("../a"), "../a");
        assert_eq!(normalize("a/../../b"), "../b");
    }

    // ── resolve_within ──────────────────────────────────

    #[test]
    fn test_relative_path() {
        assert_eq!(resolve_within("file.txt", "/workspace").unwrap(), "/workspace/file.txt");
        assert_eq!(
            resolve_within("subdir/file.txt", "/workspace").unwrap(),
            "/workspace/subdir/file.txt"
        );
    }

    #[test]
    fn test_boundary_dot_and_empty_resolve_to_boundary() {
        assert_eq!(resolve_within(".", "/workspace").unwrap(), "/workspace");
        assert_eq!(resolve_within("", "/workspace").unwrap(), "/workspace");
        assert_eq!(resolve_within("/workspace", "/workspace").unwrap(), "/workspace");
    }

    #[test]
    fn test_absolute_inside_boundary_unchanged() {
        assert_eq!(resolve_within("/workspace/a/b", "/workspace").unwrap(), "/workspace/a/b");
    }

    #[test]
    fn test_absolute_outside_reinterpreted_as_relative() {
        assert_eq!(
            resolve_within("/etc/passwd", "/workspace").unwrap(),
            "/workspace/etc/passwd"
        );
        assert_eq!(resolve_within("/file.txt", "/workspace").unwrap(), "/workspace/file.txt");
    }

    #[test]
    fn test_sibling_prefix_is_not_inside() {
        // "/workspace-other" shares a string prefix but not a path prefix
        assert_eq!(
            resolve_within("/workspace-other/x", "/workspace").unwrap(),
            "/workspace/workspace-other/x"
        );
    }

    #[test]
    fn test_parent_traversal_escapes() {
        assert!(escapes("../../etc/passwd", "/workspace"));
        assert!(escapes("../etc/passwd", "/workspace"));
        assert!(escapes("../../..", "/workspace"));
    }

    #[test]
    fn test_multi_segment_traversal_caught_after_normalization() {
        assert!(escapes("a/b/../../../../etc", "/workspace"));
        assert!(!escapes("a/b/../../c", "/workspace"));
    }

    #[test]
    fn test_absolute_with_traversal_is_stripped_then_checked() {
        // "/../x" is outside, so it is treated as "../x" relative and rejected
        assert!(escapes("/workspace/../../x", "/workspace"));
    }

    #[test]
    fn test_escape_carries_original_input() {
        let err = resolve_within("a/../../secret", "/workspace").unwrap_err();
        assert_eq!(err.operand(), Some("a/../../secret"));
    }

    #[test]
    fn test_relative_boundary_keeps_relative_form() {
        assert_eq!(resolve_within("file.txt", "users/alice").unwrap(), "users/alice/file.txt");
        assert_eq!(resolve_within(".", "users/alice").unwrap(), "users/alice");
        assert!(escapes("../bob/file.txt", "users/alice"));
        assert_eq!(
            resolve_within("/users/alice/notes", "users/alice").unwrap(),
            "users/alice/notes"
        );
    }

    #[test]
    fn test_dot_boundary_rejects_climbing() {
        assert_eq!(resolve_within("a/b", ".").unwrap(), "a/b");
        assert_eq!(resolve_within("", ".").unwrap(), ".");
        assert!(escapes("../x", "."));
        assert!(escapes("a/../..", "."));
    }

    #[test]
    fn test_root_boundary() {
        assert_eq!(resolve_within("dir/a.txt", "/").unwrap(), "/dir/a.txt");
        assert_eq!(resolve_within("/etc/passwd", "/").unwrap(), "/etc/passwd");
        assert_eq!(resolve_within("..", "/").unwrap(), "/");
    }

    #[test]
    fn test_result_always_within_boundary() {
        let inputs = [
            "", ".", "..", "a", "a/..", "a/../..", "/", "/workspace", "/workspace/",
            "/workspace/../workspace/x", "//etc//passwd", "./a/./b", "a/b/c/../../..",
            "x/../../workspace/y", "/workspacex", "...", "a/.../b",
        ];
        for input in inputs {
            match resolve_within(input, "/workspace") {
                Ok(resolved) => assert!(
                    resolved == "/workspace" || resolved.starts_with("/workspace/"),
                    "{input:?} resolved to {resolved:?}"
                ),
                Err(e) => assert_eq!(e.kind(), ErrorKind::PathEscape),
            }
        }
    }

    // ── assert_absolute_within ──────────────────────────

    #[test]
    fn test_assert_absolute_within() {
        assert!(assert_absolute_within("/workspace/file.txt", "/workspace").is_ok());
        assert!(assert_absolute_within("/workspace", "/workspace").is_ok());
        assert!(assert_absolute_within("/etc/passwd", "/workspace").is_err());
        assert!(assert_absolute_within("/workspace/../etc", "/workspace").is_err());
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("/ws/a/b", "/ws"), Some("a/b"));
        assert_eq!(relative_to("/ws", "/ws"), Some(""));
        assert_eq!(relative_to("/wsx", "/ws"), None);
        assert_eq!(relative_to("/a", "/"), Some("a"));
    }
}
