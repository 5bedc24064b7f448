use serde_json::json;
use thiserror::Error;

/// Core error taxonomy. Every variant maps to a stable wire code; request
/// handlers render them through [`SdlError::to_wire`] and never panic on
/// user data.
#[derive(Debug, Error)]
pub enum SdlError {
    /// User input invalid: bad path, unknown repo, unsupported language.
    /// Surfaced to the caller, never retried.
    #[error("config error: {message}")]
    Config { message: String, code: &'static str },

    /// Storage-engine failure. Contract errors are not retried; transient
    /// I/O is retried with backoff only by background workers.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Single-file parse/extract failure. Recovered locally by the indexer:
    /// logged into the refresh report, file skipped, refresh continues.
    #[error("index error on {file}: {message}")]
    Index { file: String, message: String },

    /// Request payload failed schema validation.
    #[error("invalid field `{field}`: {message}")]
    Validation { field: String, message: String },

    /// Gating decision from the policy evaluator. Carries the self-correction
    /// hints the caller needs to produce an admissible follow-up request.
    #[error("policy denied: {message}")]
    Policy {
        message: String,
        next_best_action: String,
        required_fields: Vec<String>,
    },
}

impl SdlError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into(), code: "config" }
    }

    pub fn repo_not_found(repo: &str) -> Self {
        Self::Config { message: format!("repo `{repo}` is not registered"), code: "repo-not-found" }
    }

    pub fn symbol_not_found(symbol: &str) -> Self {
        Self::Config { message: format!("symbol `{symbol}` not found"), code: "symbol-not-found" }
    }

    pub fn version_not_found(version: &str) -> Self {
        Self::Config { message: format!("version `{version}` not found"), code: "version-not-found" }
    }

    pub fn path_not_found(path: &str) -> Self {
        Self::Config { message: format!("path does not exist: {path}"), code: "path-not-found" }
    }

    pub fn traversal(path: &str) -> Self {
        Self::Config {
            message: format!("path escapes the repository root: {path}"),
            code: "path-traversal",
        }
    }

    pub fn handle_expired(handle: &str) -> Self {
        Self::Config { message: format!("handle `{handle}` has expired"), code: "handle-expired" }
    }

    pub fn file_too_large(path: &str, bytes: u64, cap: u64) -> Self {
        Self::Config {
            message: format!("{path} is {bytes} bytes, over the {cap}-byte extractor cap"),
            code: "file-too-large",
        }
    }

    pub fn index(file: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Index { file: file.into(), message: message.into() }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn policy(
        message: impl Into<String>,
        next_best_action: impl Into<String>,
        required_fields: Vec<String>,
    ) -> Self {
        Self::Policy {
            message: message.into(),
            next_best_action: next_best_action.into(),
            required_fields,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Config { code, .. } => code,
            Self::Storage(_) => "storage",
            Self::Index { .. } => "index",
            Self::Validation { .. } => "validation",
            Self::Policy { .. } => "policy-deny",
        }
    }

    /// The stable structured shape every handler returns on failure.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut err = json!({
            "message": self.to_string(),
            "code": self.code(),
        });
        if let Self::Policy { next_best_action, required_fields, .. } = self {
            err["nextBestAction"] = json!(next_best_action);
            err["requiredFieldsForNext"] = json!(required_fields);
        }
        if let Self::Validation { field, .. } = self {
            err["field"] = json!(field);
        }
        json!({ "error": err })
    }
}

pub type Result<T> = std::result::Result<T, SdlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_carries_code_and_hints() {
        let e = SdlError::policy("raw code gated", "request a skeleton first", vec!["reason".into()]);
        let v = e.to_wire();
        assert_eq!(v["error"]["code"], "policy-deny");
        assert_eq!(v["error"]["nextBestAction"], "request a skeleton first");
        assert_eq!(v["error"]["requiredFieldsForNext"][0], "reason");
    }

    #[test]
    fn validation_names_the_offending_field() {
        let v = SdlError::validation("budget.maxCards", "must be positive").to_wire();
        assert_eq!(v["error"]["field"], "budget.maxCards");
        assert_eq!(v["error"]["code"], "validation");
    }
}
