use serde::Serialize;

use crate::adapters::sha256_hex;
use crate::error::{Result, SdlError};
use crate::graph::CodeGraph;
use crate::storage::Storage;

/// A small structured summary of one symbol: identity, range, kind,
/// signature, dependency neighbourhood, metrics, version.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub symbol_id: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub exported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub calls_out: Vec<String>,
    pub called_by: Vec<String>,
    pub fan_in: u32,
    pub fan_out: u32,
    pub hotness: f64,
    pub version_id: String,
    pub etag: String,
}

#[derive(Debug)]
pub enum CardResponse {
    Card { card: Card, etag: String, card_hash: String },
    NotModified { etag: String },
}

/// Build (or short-circuit) the card for one symbol.
///
/// The ETag is the symbol's fingerprint: `ifNoneMatch` hits exactly when the
/// fingerprint has not changed. Serialized cards land in the deduplicated
/// blob table keyed by their content hash.
pub fn get_card(
    storage: &Storage,
    graph: &CodeGraph,
    symbol_id: &str,
    version_id: &str,
    if_none_match: Option<&str>,
) -> Result<CardResponse> {
    let sym = graph
        .symbols
        .get(symbol_id)
        .ok_or_else(|| SdlError::symbol_not_found(symbol_id))?;

    let etag = sym.row.ast_fingerprint.clone();
    if let Some(known) = if_none_match {
        if known == etag {
            return Ok(CardResponse::NotModified { etag });
        }
    }

    let neighbour_cap = 24;
    let calls_out: Vec<String> = graph
        .out_edges(symbol_id)
        .iter()
        .take(neighbour_cap)
        .map(|e| e.to.clone())
        .collect();
    let called_by: Vec<String> = graph
        .in_edges(symbol_id)
        .iter()
        .take(neighbour_cap)
        .map(|e| e.from.clone())
        .collect();

    let signature = sym
        .row
        .signature_json
        .as_deref()
        .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string));

    let card = Card {
        symbol_id: symbol_id.to_string(),
        name: sym.row.name.clone(),
        kind: sym.row.kind.clone(),
        file: sym.rel_path.clone(),
        language: sym.row.language.clone(),
        start_line: sym.row.start_line,
        end_line: sym.row.end_line,
        exported: sym.row.exported,
        visibility: sym.row.visibility.clone(),
        signature,
        summary: sym.row.summary.clone(),
        calls_out,
        called_by,
        fan_in: graph.fan_in(symbol_id),
        fan_out: graph.fan_out(symbol_id),
        hotness: graph.hotness(symbol_id),
        version_id: version_id.to_string(),
        etag: etag.clone(),
    };

    let serialized = serde_json::to_vec(&card)
        .map_err(|e| SdlError::config(format!("card serialization failed: {e}")))?;
    let card_hash = sha256_hex(&serialized);
    storage.put_blob(&card_hash, "card", &serialized)?;

    Ok(CardResponse::Card { card, etag, card_hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adapter_set;
    use crate::config::Config;
    use crate::ids::RepoId;
    use crate::indexer::{refresh_repo, RefreshMode};

    fn setup() -> (tempfile::TempDir, Storage, String) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export function f(){ g(); }\nfunction g(){}\n")
            .unwrap();
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", &dir.path().to_string_lossy(), "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();
        let report = refresh_repo(
            &storage,
            adapter_set(),
            &Config::default(),
            &repo,
            RefreshMode::Full,
            None,
        )
        .unwrap();
        (dir, storage, report.version_id)
    }

    #[test]
    fn card_carries_neighbourhood_and_etag() {
        let (_dir, storage, version) = setup();
        let graph = CodeGraph::load(&storage, "demo").unwrap();
        let resp = get_card(&storage, &graph, "a.ts#f", &version, None).unwrap();
        let CardResponse::Card { card, etag, card_hash } = resp else {
            panic!("expected a card");
        };
        assert_eq!(card.name, "f");
        assert_eq!(card.calls_out, vec!["a.ts#g"]);
        assert!(card.called_by.is_empty());
        assert!(!etag.is_empty());
        assert_eq!(storage.get_blob(&card_hash).unwrap().map(|b| b.is_empty()), Some(false));
    }

    #[test]
    fn if_none_match_short_circuits_iff_fingerprint_unchanged() {
        let (dir, storage, _version) = setup();
        let graph = CodeGraph::load(&storage, "demo").unwrap();
        let CardResponse::Card { etag, .. } =
            get_card(&storage, &graph, "a.ts#f", "v", None).unwrap()
        else {
            panic!()
        };

        match get_card(&storage, &graph, "a.ts#f", "v", Some(etag.as_str())).unwrap() {
            CardResponse::NotModified { etag: e } => assert_eq!(e, etag),
            _ => panic!("expected notModified"),
        }

        // Modify the body and refresh: the same ifNoneMatch now misses.
        std::fs::write(
            dir.path().join("a.ts"),
            "export function f(){ g(); g(); }\nfunction g(){}\n",
        )
        .unwrap();
        let repo = RepoId::new("demo").unwrap();
        refresh_repo(
            &storage,
            adapter_set(),
            &Config::default(),
            &repo,
            RefreshMode::Incremental,
            None,
        )
        .unwrap();
        let graph2 = CodeGraph::load(&storage, "demo").unwrap();
        match get_card(&storage, &graph2, "a.ts#f", "v", Some(etag.as_str())).unwrap() {
            CardResponse::Card { etag: new_etag, .. } => assert_ne!(new_etag, etag),
            _ => panic!("expected a fresh card"),
        }
    }

    #[test]
    fn unknown_symbol_is_a_config_error() {
        let (_dir, storage, version) = setup();
        let graph = CodeGraph::load(&storage, "demo").unwrap();
        let err = get_card(&storage, &graph, "a.ts#nope", &version, None).unwrap_err();
        assert_eq!(err.code(), "symbol-not-found");
    }
}
