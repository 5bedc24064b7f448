use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SdlError;

/// Opaque, validated repository identifier. Alphanumerics, `_`, `-`, ≤128.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(String);

impl RepoId {
    pub fn new(raw: &str) -> Result<Self, SdlError> {
        let s = raw.trim();
        if s.is_empty() || s.len() > 128 {
            return Err(SdlError::validation("repoId", "must be 1..=128 chars"));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(SdlError::validation(
                "repoId",
                "only alphanumerics, underscore and dash are allowed",
            ));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structural symbol path, e.g. `src/auth.ts#Login.verify`.
/// Letters, digits and `_ : . / # -`, ≤512.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(String);

impl SymbolId {
    pub fn new(raw: &str) -> Result<Self, SdlError> {
        let s = raw.trim();
        if s.is_empty() || s.len() > 512 {
            return Err(SdlError::validation("symbolId", "must be 1..=512 chars"));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '/' | '#' | '-'))
        {
            return Err(SdlError::validation("symbolId", "contains forbidden characters"));
        }
        Ok(Self(s.to_string()))
    }

    /// Sentinel id for call targets the indexer could not resolve.
    pub fn unresolved(name: &str) -> Self {
        let mut clean = String::with_capacity(name.len());
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | ':' | '.' | '/' | '#' | '-') {
                clean.push(ch);
            } else {
                clean.push('-');
            }
        }
        clean.truncate(512 - "unresolved:".len());
        Self(format!("unresolved:{clean}"))
    }

    pub fn is_unresolved(&self) -> bool {
        self.0.starts_with("unresolved:")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version identifier. On the wire: `<repoId>-v<unix-millis>`; a bare
/// `v<digits>` tail is accepted as shorthand and resolved against the repo.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    pub fn new(raw: &str) -> Result<Self, SdlError> {
        let s = raw.trim();
        if s.is_empty() || s.len() > 192 {
            return Err(SdlError::validation("versionId", "must be 1..=192 chars"));
        }
        let tail = s.rsplit('-').next().unwrap_or(s);
        let digits = tail.strip_prefix('v').unwrap_or(tail);
        if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(SdlError::validation(
                "versionId",
                "expected `<repoId>-v<millis>` or `v<millis>`",
            ));
        }
        Ok(Self(s.to_string()))
    }

    pub fn for_repo(repo: &RepoId, millis: u64) -> Self {
        Self(format!("{}-v{}", repo.as_str(), millis))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_id_rules() {
        assert!(RepoId::new("demo_repo-1").is_ok());
        assert!(RepoId::new("").is_err());
        assert!(RepoId::new("has space").is_err());
        assert!(RepoId::new(&"x".repeat(129)).is_err());
    }

    #[test]
    fn symbol_id_rules() {
        assert!(SymbolId::new("src/a.ts#f").is_ok());
        assert!(SymbolId::new("pkg::mod.Cls.method-2").is_ok());
        assert!(SymbolId::new("bad!char").is_err());
    }

    #[test]
    fn unresolved_sentinel_is_always_valid() {
        let id = SymbolId::unresolved("weird name$with junk");
        assert!(id.is_unresolved());
        assert!(SymbolId::new(id.as_str()).is_ok());
    }

    #[test]
    fn version_id_accepts_wire_format_and_bare_tail() {
        assert!(VersionId::new("demo-v1712345678901").is_ok());
        assert!(VersionId::new("v42").is_ok());
        assert!(VersionId::new("demo-vx").is_err());
        let repo = RepoId::new("demo").unwrap();
        assert_eq!(VersionId::for_repo(&repo, 7).as_str(), "demo-v7");
    }
}
