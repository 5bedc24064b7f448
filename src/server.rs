use anyhow::Result;
use serde_json::{json, Value};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cards::CardResponse;
use crate::delta::GovernorBudget;
use crate::engine::Engine;
use crate::error::SdlError;
use crate::extract::Granularity;
use crate::ids::{RepoId, SymbolId};
use crate::indexer::{RefreshMode, RepoOptions};
use crate::slice::{SliceBudget, SliceRequest};

/// How often (in tool calls) the expired-handle sweep runs.
const SWEEP_EVERY: u64 = 32;

pub struct ServerState {
    engine: Arc<Engine>,
    calls: AtomicU64,
}

impl ServerState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine, calls: AtomicU64::new(0) }
    }

    fn tool_list(&self, id: Value) -> Value {
        let tool = |name: &str, description: &str, props: Value, required: Vec<&str>| {
            json!({
                "name": name,
                "description": description,
                "inputSchema": {
                    "type": "object",
                    "properties": props,
                    "required": required,
                }
            })
        };

        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    tool("repo.register",
                        "Register a repository root for indexing. Paths are forward-slash on the wire; `..` and `~` are rejected.",
                        json!({
                            "repoId": { "type": "string" },
                            "rootPath": { "type": "string" },
                            "ignore": { "type": "array", "items": { "type": "string" } },
                            "languages": { "type": "array", "items": { "type": "string" } },
                            "maxFileBytes": { "type": "integer" }
                        }),
                        vec!["repoId", "rootPath"]),
                    tool("repo.status",
                        "Index health for one repo: latest version, counts, component states.",
                        json!({ "repoId": { "type": "string" } }),
                        vec!["repoId"]),
                    tool("index.refresh",
                        "Re-index the repo (full = rescan and prune, incremental = changed files by content hash) and cut a new version.",
                        json!({
                            "repoId": { "type": "string" },
                            "mode": { "type": "string", "enum": ["full", "incremental"] },
                            "reason": { "type": "string" }
                        }),
                        vec!["repoId", "mode"]),
                    tool("symbol.search",
                        "Name search over indexed symbols; exact matches first, ties broken by kind.",
                        json!({
                            "repoId": { "type": "string" },
                            "query": { "type": "string" },
                            "limit": { "type": "integer" }
                        }),
                        vec!["repoId", "query"]),
                    tool("symbol.getCard",
                        "Structured summary card for one symbol, with fingerprint ETag; pass ifNoneMatch to short-circuit.",
                        json!({
                            "repoId": { "type": "string" },
                            "symbolId": { "type": "string" },
                            "ifNoneMatch": { "type": "string" }
                        }),
                        vec!["repoId", "symbolId"]),
                    tool("slice.build",
                        "Budgeted ranked slice of the symbol graph seeded from the task description, stack trace, and edited files.",
                        json!({
                            "repoId": { "type": "string" },
                            "taskText": { "type": "string" },
                            "stackTrace": { "type": "string" },
                            "failingTestPath": { "type": "string" },
                            "editedFiles": { "type": "array", "items": { "type": "string" } },
                            "entrySymbols": { "type": "array", "items": { "type": "string" } },
                            "budget": { "type": "object", "properties": {
                                "maxCards": { "type": "integer" },
                                "maxEstimatedTokens": { "type": "integer" }
                            } }
                        }),
                        vec!["repoId", "taskText"]),
                    tool("slice.refresh",
                        "Conditional refresh of a slice handle: notModified when the symbol state hash is unchanged, else the delta.",
                        json!({
                            "sliceHandle": { "type": "string" },
                            "knownVersion": { "type": "string" }
                        }),
                        vec!["sliceHandle", "knownVersion"]),
                    tool("slice.spillover.get",
                        "Page through the items dropped by a budget cut.",
                        json!({
                            "spilloverHandle": { "type": "string" },
                            "cursor": { "type": "integer" },
                            "pageSize": { "type": "integer" }
                        }),
                        vec!["spilloverHandle"]),
                    tool("delta.get",
                        "Changed symbols between two versions plus the budget-governed blast radius.",
                        json!({
                            "repoId": { "type": "string" },
                            "fromVersion": { "type": "string" },
                            "toVersion": { "type": "string" },
                            "budget": { "type": "object", "properties": {
                                "maxCards": { "type": "integer" },
                                "maxTokens": { "type": "integer" }
                            } }
                        }),
                        vec!["repoId", "fromVersion", "toVersion"]),
                    tool("code.needWindow",
                        "Policy-gated raw window over one symbol; denials carry nextBestAction.",
                        json!({
                            "repoId": { "type": "string" },
                            "symbolId": { "type": "string" },
                            "reason": { "type": "string" },
                            "expectedLines": { "type": "integer" },
                            "identifiersToFind": { "type": "array", "items": { "type": "string" } },
                            "granularity": { "type": "string", "enum": ["symbol", "block", "fileWindow"] },
                            "maxTokens": { "type": "integer" }
                        }),
                        vec!["repoId", "symbolId", "reason"]),
                    tool("code.getSkeleton",
                        "Shape-preserving skeleton of a symbol or file: signatures and control flow kept, bodies elided.",
                        json!({
                            "repoId": { "type": "string" },
                            "symbolId": { "type": "string" },
                            "file": { "type": "string" },
                            "exportedOnly": { "type": "boolean" },
                            "maxLines": { "type": "integer" },
                            "maxTokens": { "type": "integer" }
                        }),
                        vec!["repoId"]),
                    tool("code.getHotPath",
                        "Lines of a symbol's body mentioning the given identifiers, with context.",
                        json!({
                            "repoId": { "type": "string" },
                            "symbolId": { "type": "string" },
                            "identifiersToFind": { "type": "array", "items": { "type": "string" } },
                            "maxLines": { "type": "integer" },
                            "maxTokens": { "type": "integer" },
                            "contextLines": { "type": "integer" }
                        }),
                        vec!["repoId", "symbolId", "identifiersToFind"]),
                ]
            }
        })
    }

    fn dispatch(&self, name: &str, args: &Value) -> std::result::Result<Value, SdlError> {
        // Housekeeping rides along on the request path.
        if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            let _ = self.engine.sweep_handles();
        }

        match name {
            "repo.register" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let root = req_str(args, "rootPath")?;
                let options = RepoOptions {
                    ignore: str_vec(args, "ignore"),
                    languages: args.get("languages").map(|_| str_vec(args, "languages")),
                    max_file_bytes: args.get("maxFileBytes").and_then(Value::as_u64),
                    edge_weights: None,
                };
                self.engine.register_repo(&repo, root, options)?;
                Ok(json!({ "ok": true, "repoId": repo.as_str() }))
            }
            "repo.status" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                self.engine.repo_status(&repo)
            }
            "index.refresh" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let mode = match req_str(args, "mode")? {
                    "full" => RefreshMode::Full,
                    "incremental" => RefreshMode::Incremental,
                    other => {
                        return Err(SdlError::validation(
                            "mode",
                            format!("expected full|incremental, got `{other}`"),
                        ))
                    }
                };
                let report = self.engine.index_refresh(
                    &repo,
                    mode,
                    args.get("reason").and_then(Value::as_str),
                )?;
                Ok(json!({
                    "versionId": report.version_id,
                    "versionHash": report.version_hash,
                    "changedFiles": report.changed_files,
                    "removedFiles": report.removed_files,
                    "symbolsIndexed": report.symbols_indexed,
                    "failures": report.failures,
                }))
            }
            "symbol.search" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let query = req_str(args, "query")?;
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let hits = self.engine.symbol_search(&repo, query, limit)?;
                let rows: Vec<Value> = hits
                    .iter()
                    .map(|s| {
                        json!({
                            "symbolId": s.row.symbol_id,
                            "name": s.row.name,
                            "file": s.rel_path,
                            "kind": s.row.kind,
                        })
                    })
                    .collect();
                Ok(json!(rows))
            }
            "symbol.getCard" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let symbol = SymbolId::new(req_str(args, "symbolId")?)?;
                let inm = args.get("ifNoneMatch").and_then(Value::as_str);
                match self.engine.symbol_get_card(&repo, &symbol, inm)? {
                    CardResponse::NotModified { etag } => {
                        Ok(json!({ "notModified": true, "etag": etag }))
                    }
                    CardResponse::Card { card, etag, card_hash } => Ok(json!({
                        "card": card,
                        "etag": etag,
                        "cardHash": card_hash,
                    })),
                }
            }
            "slice.build" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let req = SliceRequest {
                    task_text: req_str(args, "taskText")?.to_string(),
                    stack_trace: args.get("stackTrace").and_then(Value::as_str).map(String::from),
                    failing_test_path: args
                        .get("failingTestPath")
                        .and_then(Value::as_str)
                        .map(String::from),
                    edited_files: str_vec(args, "editedFiles"),
                    entry_symbols: str_vec(args, "entrySymbols"),
                };
                let budget = args.get("budget").map(|b| SliceBudget {
                    max_cards: b.get("maxCards").and_then(Value::as_u64).unwrap_or(24) as usize,
                    max_estimated_tokens: b
                        .get("maxEstimatedTokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(12_000) as usize,
                });
                let (slice, lease) = self.engine.slice_build(&repo, &req, budget)?;
                Ok(json!({
                    "sliceHandle": lease.handle.clone(),
                    "lease": lease,
                    "sliceEtag": slice.slice_hash,
                    "slice": &*slice,
                }))
            }
            "slice.refresh" => {
                let handle = req_str(args, "sliceHandle")?;
                let known = req_str(args, "knownVersion")?;
                self.engine.slice_refresh(handle, known)
            }
            "slice.spillover.get" => {
                let handle = req_str(args, "spilloverHandle")?;
                let cursor = args.get("cursor").and_then(Value::as_u64).unwrap_or(0);
                let page = args.get("pageSize").and_then(Value::as_u64).unwrap_or(50) as usize;
                self.engine.spillover_get(handle, cursor, page)
            }
            "delta.get" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let budget = args.get("budget").map(|b| GovernorBudget {
                    max_cards: b.get("maxCards").and_then(Value::as_u64).unwrap_or(40) as usize,
                    max_tokens: b.get("maxTokens").and_then(Value::as_u64).unwrap_or(16_000) as usize,
                });
                let pack = self.engine.delta_get(
                    &repo,
                    req_str(args, "fromVersion")?,
                    req_str(args, "toVersion")?,
                    budget,
                )?;
                Ok(serde_json::to_value(pack).unwrap_or_else(|_| json!(null)))
            }
            "code.needWindow" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let symbol = SymbolId::new(req_str(args, "symbolId")?)?;
                let granularity = args
                    .get("granularity")
                    .and_then(Value::as_str)
                    .and_then(Granularity::parse);
                self.engine.need_window(
                    &repo,
                    &symbol,
                    args.get("reason").and_then(Value::as_str).unwrap_or(""),
                    args.get("expectedLines").and_then(Value::as_u64).unwrap_or(60) as usize,
                    &str_vec(args, "identifiersToFind"),
                    granularity,
                    args.get("maxTokens").and_then(Value::as_u64).map(|v| v as usize),
                )
            }
            "code.getSkeleton" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let symbol = match args.get("symbolId").and_then(Value::as_str) {
                    Some(s) => Some(SymbolId::new(s)?),
                    None => None,
                };
                self.engine.get_skeleton(
                    &repo,
                    symbol.as_ref(),
                    args.get("file").and_then(Value::as_str),
                    args.get("exportedOnly").and_then(Value::as_bool).unwrap_or(false),
                    args.get("maxLines").and_then(Value::as_u64).map(|v| v as usize),
                    args.get("maxTokens").and_then(Value::as_u64).map(|v| v as usize),
                )
            }
            "code.getHotPath" => {
                let repo = RepoId::new(req_str(args, "repoId")?)?;
                let symbol = SymbolId::new(req_str(args, "symbolId")?)?;
                self.engine.get_hot_path(
                    &repo,
                    &symbol,
                    &str_vec(args, "identifiersToFind"),
                    args.get("maxLines").and_then(Value::as_u64).map(|v| v as usize),
                    args.get("maxTokens").and_then(Value::as_u64).map(|v| v as usize),
                    args.get("contextLines").and_then(Value::as_u64).map(|v| v as u32),
                )
            }
            other => Err(SdlError::validation("name", format!("unknown tool `{other}`"))),
        }
    }

    pub fn handle_line(&self, line: &str) -> Option<Value> {
        let msg: Value = serde_json::from_str(line).ok()?;
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

        match method {
            "initialize" => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "serverInfo": { "name": "symledger", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": { "tools": {} }
                }
            })),
            "notifications/initialized" => None,
            "tools/list" => Some(self.tool_list(id)),
            "tools/call" => {
                let name = msg
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                let empty = json!({});
                let args = msg.pointer("/params/arguments").unwrap_or(&empty);
                let payload = match self.dispatch(name, args) {
                    Ok(v) => v,
                    Err(e) => e.to_wire(),
                };
                let text = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".into());
                Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "content": [{ "type": "text", "text": text }] }
                }))
            }
            _ => Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("unknown method `{method}`") }
            })),
        }
    }
}

fn req_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, SdlError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SdlError::validation(key, "required string field"))
}

fn str_vec(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default()
}

/// Line-delimited JSON-RPC over stdio. Shutdown path: stop reading, drain
/// the refresh worker, then let storage close.
pub fn run_stdio_server(engine: Arc<Engine>) -> Result<()> {
    let state = ServerState::new(engine.clone());
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(resp) = state.handle_line(&line) {
            let mut out = stdout.lock();
            serde_json::to_writer(&mut out, &resp)?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
    }

    engine.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Storage;

    fn state_with_repo() -> (tempfile::TempDir, ServerState) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export function f(){ g(); }\nfunction g(){}\n")
            .unwrap();
        let engine = Engine::new(Config::default(), Storage::open_in_memory().unwrap());
        let state = ServerState::new(engine);
        let reg = state
            .dispatch(
                "repo.register",
                &json!({ "repoId": "demo", "rootPath": dir.path().to_string_lossy() }),
            )
            .unwrap();
        assert_eq!(reg["ok"], true);
        (dir, state)
    }

    #[test]
    fn refresh_then_search_orders_exact_first() {
        let (_dir, state) = state_with_repo();
        let refreshed = state
            .dispatch("index.refresh", &json!({ "repoId": "demo", "mode": "full" }))
            .unwrap();
        assert!(refreshed["versionId"].as_str().unwrap().starts_with("demo-v"));
        assert_eq!(refreshed["changedFiles"], 1);

        let hits = state
            .dispatch("symbol.search", &json!({ "repoId": "demo", "query": "f" }))
            .unwrap();
        assert_eq!(hits[0]["name"], "f");
        assert_eq!(hits[0]["symbolId"], "a.ts#f");
    }

    #[test]
    fn errors_come_back_in_the_stable_wire_shape() {
        let (_dir, state) = state_with_repo();
        let err = state
            .dispatch("repo.status", &json!({ "repoId": "ghost" }))
            .unwrap_err()
            .to_wire();
        assert_eq!(err["error"]["code"], "repo-not-found");

        let err = state
            .dispatch("index.refresh", &json!({ "repoId": "demo", "mode": "sideways" }))
            .unwrap_err()
            .to_wire();
        assert_eq!(err["error"]["code"], "validation");
        assert_eq!(err["error"]["field"], "mode");
    }

    #[test]
    fn slice_build_returns_handle_etag_and_budgeted_slice() {
        let (_dir, state) = state_with_repo();
        state.dispatch("index.refresh", &json!({ "repoId": "demo", "mode": "full" })).unwrap();
        let resp = state
            .dispatch(
                "slice.build",
                &json!({
                    "repoId": "demo",
                    "taskText": "call g",
                    "budget": { "maxCards": 1, "maxEstimatedTokens": 10000 }
                }),
            )
            .unwrap();
        assert_eq!(resp["sliceHandle"].as_str().unwrap().len(), 32);
        assert_eq!(resp["slice"]["cards"].as_array().unwrap().len(), 1);
        assert_eq!(resp["slice"]["cards"][0]["symbolId"], "a.ts#g");
        assert_eq!(resp["slice"]["truncation"]["truncated"], true);
        let frontier = resp["slice"]["frontier"].as_array().unwrap();
        assert!(frontier.iter().any(|f| f["symbolId"] == "a.ts#f"));
    }

    #[test]
    fn get_card_etag_law_over_the_wire() {
        let (_dir, state) = state_with_repo();
        state.dispatch("index.refresh", &json!({ "repoId": "demo", "mode": "full" })).unwrap();
        let first = state
            .dispatch("symbol.getCard", &json!({ "repoId": "demo", "symbolId": "a.ts#f" }))
            .unwrap();
        let etag = first["etag"].as_str().unwrap().to_string();
        let second = state
            .dispatch(
                "symbol.getCard",
                &json!({ "repoId": "demo", "symbolId": "a.ts#f", "ifNoneMatch": etag }),
            )
            .unwrap();
        assert_eq!(second["notModified"], true);
    }

    #[test]
    fn hot_path_returns_matched_line_with_neighbours() {
        let (_dir, state) = state_with_repo();
        state.dispatch("index.refresh", &json!({ "repoId": "demo", "mode": "full" })).unwrap();
        let resp = state
            .dispatch(
                "code.getHotPath",
                &json!({
                    "repoId": "demo",
                    "symbolId": "a.ts#f",
                    "identifiersToFind": ["g"],
                    "contextLines": 1
                }),
            )
            .unwrap();
        assert_eq!(resp["matchedIdentifiers"][0], "g");
        assert!(resp["excerpt"].as_str().unwrap().contains("g()"));
    }

    #[test]
    fn initialize_and_tool_list_round_trip() {
        let (_dir, state) = state_with_repo();
        let init = state
            .handle_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .unwrap();
        assert_eq!(init["result"]["serverInfo"]["name"], "symledger");

        let tools = state
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .unwrap();
        let names: Vec<&str> = tools["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"slice.build"));
        assert!(names.contains(&"delta.get"));
        assert_eq!(names.len(), 12);
    }
}
