use crate::error::SdlError;

/// Normalize a wire path to the canonical repo-relative form.
///
/// Backslashes become forward slashes, `./` segments collapse, duplicate
/// slashes collapse. `~` expansion and `..` traversal are rejected rather
/// than resolved, so callers never get to escape the repo root.
pub fn normalize_rel_path(raw: &str) -> Result<String, SdlError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SdlError::config("empty path"));
    }
    if trimmed.starts_with('~') {
        return Err(SdlError::traversal(trimmed));
    }

    let slashed = trimmed.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in slashed.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(SdlError::traversal(trimmed)),
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(SdlError::config("path resolves to repo root"));
    }
    Ok(parts.join("/"))
}

/// Directory component of a normalized rel path ("" for root-level files).
pub fn parent_dir(rel_path: &str) -> String {
    match rel_path.rfind('/') {
        Some(i) => rel_path[..i].to_string(),
        None => String::new(),
    }
}

/// Heuristic used by blast-radius ranking and slice structure scoring.
pub fn is_test_path(rel_path: &str) -> bool {
    let p = rel_path.to_lowercase();
    let file = p.rsplit('/').next().unwrap_or(p.as_str());
    p.contains("/test/")
        || p.contains("/tests/")
        || p.starts_with("test/")
        || p.starts_with("tests/")
        || file.contains(".spec.")
        || file.contains(".test.")
        || file.contains("_test.")
        || file.starts_with("test_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent_and_forward_slash() {
        let p = normalize_rel_path("src\\lib\\./mod.rs").unwrap();
        assert_eq!(p, "src/lib/mod.rs");
        assert_eq!(normalize_rel_path(&p).unwrap(), p);
        assert!(!p.contains('\\'));
    }

    #[test]
    fn traversal_and_home_are_rejected() {
        assert!(normalize_rel_path("../etc/passwd").is_err());
        assert!(normalize_rel_path("src/../../x").is_err());
        assert!(normalize_rel_path("~/secrets").is_err());
    }

    #[test]
    fn collapses_duplicate_slashes() {
        assert_eq!(normalize_rel_path("a//b///c.ts").unwrap(), "a/b/c.ts");
    }

    #[test]
    fn test_paths_detected() {
        assert!(is_test_path("src/tests/foo.rs"));
        assert!(is_test_path("a/b/thing.spec.ts"));
        assert!(!is_test_path("src/contest/entry.rs"));
    }
}
