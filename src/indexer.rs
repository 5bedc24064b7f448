use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;

use crate::adapters::{AdapterSet, CallKind, ExtractedCall, ExtractedImport, ExtractedSymbol};
use crate::config::{Config, EdgeWeightConfig};
use crate::error::{Result, SdlError};
use crate::graph::CodeGraph;
use crate::ids::{RepoId, SymbolId};
use crate::ledger::finalize_version;
use crate::paths::{is_test_path, normalize_rel_path, parent_dir};
use crate::scanner::{scan_workspace, ScanOptions};
use crate::storage::{
    EdgeRow, FileIndexMutation, SnapshotRow, Storage, SymbolRow, VersionRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    Full,
    Incremental,
}

/// Per-repo options captured at registration time (`repo.register`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepoOptions {
    pub ignore: Vec<String>,
    pub languages: Option<Vec<String>>,
    pub max_file_bytes: Option<u64>,
    pub edge_weights: Option<EdgeWeightConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub rel_path: String,
    pub message: String,
}

/// Outcome of one refresh. Per-file failures are recorded here; they never
/// abort the run, and the version is created regardless.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub version_id: String,
    pub version_hash: Option<String>,
    pub changed_files: usize,
    pub removed_files: usize,
    pub symbols_indexed: u64,
    pub failures: Vec<FileFailure>,
}

struct ParsedFile {
    rel_path: String,
    content_hash: String,
    byte_size: u64,
    language: String,
    symbols: Vec<ExtractedSymbol>,
    imports: Vec<ExtractedImport>,
    calls: Vec<ExtractedCall>,
}

/// Run one refresh to completion. Writes for a single repo are serialised by
/// the caller (engine holds the per-repo write lock).
pub fn refresh_repo(
    storage: &Storage,
    adapters: &AdapterSet,
    cfg: &Config,
    repo: &RepoId,
    mode: RefreshMode,
    reason: Option<&str>,
) -> Result<RefreshReport> {
    let repo_rec = storage
        .get_repo(repo.as_str())?
        .ok_or_else(|| SdlError::repo_not_found(repo.as_str()))?;
    let options: RepoOptions = serde_json::from_str(&repo_rec.config_json).unwrap_or_default();
    let weights = options.edge_weights.clone().unwrap_or_else(|| cfg.edge_weights.clone());

    let scan_opts = ScanOptions {
        repo_root: std::path::PathBuf::from(&repo_rec.root_path),
        max_file_bytes: options.max_file_bytes.unwrap_or(cfg.token_estimator.max_file_bytes),
        exclude_dir_names: cfg.scan.exclude_dir_names.clone(),
        ignore_globs: options.ignore.clone(),
    };
    let entries = scan_workspace(&scan_opts)
        .map_err(|e| SdlError::config(format!("scan failed: {e}")))?;

    let prior: HashMap<String, String> = storage
        .list_files(repo.as_str())?
        .into_iter()
        .map(|f| (f.rel_path.clone(), f.content_hash))
        .collect();

    let mut failures: Vec<FileFailure> = Vec::new();

    // Eligible = adapter-supported (and allowed by the repo's language filter).
    let mut eligible: Vec<(String, std::path::PathBuf)> = Vec::new();
    for e in &entries {
        let rel = match normalize_rel_path(&e.rel_path.to_string_lossy()) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let Some(adapter) = adapters.adapter_for_path(&rel) else { continue };
        if let Some(langs) = &options.languages {
            if !langs.iter().any(|l| l == adapter.language_id()) {
                continue;
            }
        }
        eligible.push((rel, e.abs_path.clone()));
    }
    let seen: HashSet<String> = eligible.iter().map(|(r, _)| r.clone()).collect();

    // Changed = content hash differs from the stored pre-image. Unchanged
    // files skip parsing entirely, in both modes.
    let mut to_parse: Vec<(String, std::path::PathBuf)> = Vec::new();
    for (rel, abs) in &eligible {
        let raw = match std::fs::read(abs) {
            Ok(b) => b,
            Err(e) => {
                failures.push(FileFailure { rel_path: rel.clone(), message: e.to_string() });
                continue;
            }
        };
        let hash = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&raw));
        if prior.get(rel).map(|h| h == &hash).unwrap_or(false) {
            continue;
        }
        to_parse.push((rel.clone(), abs.clone()));
    }

    // CPU-bound parse fan-out; a failed file yields an error record, never a panic.
    let parsed: Vec<std::result::Result<ParsedFile, FileFailure>> = to_parse
        .par_iter()
        .map(|(rel, abs)| parse_one(adapters, rel, abs))
        .collect();

    let mut changed: Vec<ParsedFile> = Vec::new();
    for p in parsed {
        match p {
            Ok(pf) => changed.push(pf),
            Err(f) => failures.push(f),
        }
    }

    // Pass 1: per changed file, one atomic unit. Prune removed symbols,
    // upsert the post-image, emit locally-resolvable call edges.
    for pf in &changed {
        let pre: HashSet<String> = storage
            .symbols_for_file(repo.as_str(), &pf.rel_path)?
            .into_iter()
            .map(|s| s.row.symbol_id)
            .collect();
        let post: HashSet<String> = pf.symbols.iter().map(|s| s.symbol_id.clone()).collect();
        let removed: Vec<String> = pre.difference(&post).cloned().collect();

        let rows: Vec<SymbolRow> = pf.symbols.iter().map(|s| symbol_row(s, &pf.language)).collect();
        let local_edges = local_call_edges(pf, &weights);

        if let Err(e) = storage.apply_file_index(&FileIndexMutation {
            repo_id: repo.as_str(),
            rel_path: &pf.rel_path,
            content_hash: &pf.content_hash,
            language: &pf.language,
            byte_size: pf.byte_size,
            directory: &parent_dir(&pf.rel_path),
            symbols: &rows,
            removed_symbol_ids: &removed,
            edges: &local_edges,
        }) {
            // Rollback affected only this file; the refresh continues.
            failures.push(FileFailure { rel_path: pf.rel_path.clone(), message: e.to_string() });
        }
    }

    // Prune files the scanner no longer observes (full mode only).
    let mut removed_files = 0usize;
    if mode == RefreshMode::Full {
        for rel in prior.keys() {
            if !seen.contains(rel) {
                storage.delete_file(repo.as_str(), rel)?;
                removed_files += 1;
            }
        }
    }

    // Pass 2: resolve imports and inter-file calls against the now-current
    // symbol table; targets still missing get `unresolved:` sentinel edges.
    let name_index = build_name_index(storage, repo)?;
    for pf in &changed {
        let edges = resolve_file_edges(pf, &name_index, &weights);
        if let Err(e) = storage.replace_file_edges(repo.as_str(), &pf.rel_path, &edges) {
            failures.push(FileFailure { rel_path: pf.rel_path.clone(), message: e.to_string() });
        }
    }

    // Snapshot every live symbol and chain the version.
    let live = storage.load_symbols(repo.as_str())?;
    let symbols_indexed = live.len() as u64;
    let snapshots: Vec<SnapshotRow> = live
        .iter()
        .map(|s| SnapshotRow {
            symbol_id: s.row.symbol_id.clone(),
            ast_fingerprint: s.row.ast_fingerprint.clone(),
            signature_json: s.row.signature_json.clone(),
            summary: s.row.summary.clone(),
            invariants_json: s.row.invariants_json.clone(),
            side_effects_json: s.row.side_effects_json.clone(),
        })
        .collect();

    let reason_full = build_reason(reason, mode, &failures);
    let version: VersionRecord =
        finalize_version(storage, repo, Some(reason_full.as_str()), snapshots)?;

    update_metrics(storage, repo, &changed, mode)?;

    storage.append_audit(
        repo.as_str(),
        "index.refresh",
        &format!("{} changed={} removed={}", version.version_id, changed.len(), removed_files),
    )?;

    Ok(RefreshReport {
        version_id: version.version_id,
        version_hash: version.version_hash,
        changed_files: changed.len(),
        removed_files,
        symbols_indexed,
        failures,
    })
}

fn build_reason(reason: Option<&str>, mode: RefreshMode, failures: &[FileFailure]) -> String {
    let mode_s = match mode {
        RefreshMode::Full => "full",
        RefreshMode::Incremental => "incremental",
    };
    let mut out = match reason {
        Some(r) if !r.trim().is_empty() => format!("{mode_s}: {}", r.trim()),
        _ => mode_s.to_string(),
    };
    if !failures.is_empty() {
        out.push_str(&format!(" ({} file(s) failed)", failures.len()));
    }
    out
}

fn parse_one(
    adapters: &AdapterSet,
    rel: &str,
    abs: &std::path::Path,
) -> std::result::Result<ParsedFile, FileFailure> {
    let fail = |m: String| FileFailure { rel_path: rel.to_string(), message: m };

    let raw = std::fs::read(abs).map_err(|e| fail(e.to_string()))?;
    if raw.contains(&0u8) {
        return Err(fail("binary file".into()));
    }
    let source = String::from_utf8_lossy(&raw).into_owned();
    let content_hash = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&raw));

    let adapter = adapters
        .adapter_for_path(rel)
        .ok_or_else(|| fail("no adapter".into()))?;
    let Some(tree) = adapter.parse(&source, rel) else {
        return Err(fail("parse failed".into()));
    };

    let mut symbols = adapter.extract_symbols(&tree, &source, rel);
    let imports = adapter.extract_imports(&tree, &source, rel);
    let calls = adapter.extract_calls(&tree, &source, rel, &symbols);

    // A file with imports gets a module-scope symbol so import edges have a
    // source endpoint. Its fingerprint covers the import list only.
    if !imports.is_empty() {
        symbols.push(module_symbol(rel, &imports));
    }

    Ok(ParsedFile {
        rel_path: rel.to_string(),
        content_hash,
        byte_size: raw.len() as u64,
        language: adapter.language_id().to_string(),
        symbols,
        imports,
        calls,
    })
}

fn module_symbol(rel_path: &str, imports: &[ExtractedImport]) -> ExtractedSymbol {
    let stem = rel_path
        .rsplit('/')
        .next()
        .unwrap_or(rel_path)
        .split('.')
        .next()
        .unwrap_or(rel_path)
        .to_string();
    let joined: String =
        imports.iter().map(|i| i.specifier.as_str()).collect::<Vec<_>>().join("|");
    ExtractedSymbol {
        symbol_id: format!("{rel_path}#module"),
        name: stem.clone(),
        qualified_name: "module".into(),
        kind: crate::adapters::SymbolKind::Module,
        exported: false,
        visibility: crate::adapters::Visibility::Internal,
        range: Default::default(),
        fingerprint: crate::adapters::sha256_hex(joined.as_bytes()),
        signature: None,
    }
}

fn symbol_row(s: &ExtractedSymbol, language: &str) -> SymbolRow {
    SymbolRow {
        symbol_id: s.symbol_id.clone(),
        kind: s.kind.as_str().to_string(),
        name: s.name.clone(),
        exported: s.exported,
        visibility: Some(s.visibility.as_str().to_string()),
        language: language.to_string(),
        start_line: s.range.start_line,
        start_col: s.range.start_col,
        end_line: s.range.end_line,
        end_col: s.range.end_col,
        ast_fingerprint: s.fingerprint.clone(),
        signature_json: s
            .signature
            .as_ref()
            .map(|sig| serde_json::json!({ "text": sig }).to_string()),
        summary: None,
        invariants_json: None,
        side_effects_json: None,
    }
}

/// Calls whose target is declared in the same file.
fn local_call_edges(pf: &ParsedFile, weights: &EdgeWeightConfig) -> Vec<EdgeRow> {
    let mut edges = Vec::new();
    for call in &pf.calls {
        if call.kind == CallKind::Dynamic {
            continue; // pass 2 records these as unresolved sentinels
        }
        if let Some(target) = resolve_local(&pf.symbols, call) {
            if target != call.caller_id {
                edges.push(EdgeRow {
                    from_symbol_id: call.caller_id.clone(),
                    to_symbol_id: target,
                    edge_type: "call".into(),
                    weight: weights.call,
                    provenance: pf.rel_path.clone(),
                });
            }
        }
    }
    edges
}

fn resolve_local(symbols: &[ExtractedSymbol], call: &ExtractedCall) -> Option<String> {
    let mut candidates: Vec<&ExtractedSymbol> = symbols
        .iter()
        .filter(|s| {
            s.name == call.callee_name
                || (call.kind == CallKind::Constructor
                    && s.qualified_name == format!("{}.constructor", call.callee_name))
        })
        .collect();
    if call.kind == CallKind::Constructor {
        // Prefer the class's constructor member over the class itself.
        candidates.sort_by_key(|s| {
            (s.kind != crate::adapters::SymbolKind::Constructor, s.symbol_id.clone())
        });
    } else {
        candidates.sort_by(|a, b| a.symbol_id.cmp(&b.symbol_id));
    }
    candidates.first().map(|s| s.symbol_id.clone())
}

struct NameIndex {
    by_name: HashMap<String, Vec<(String, bool)>>, // name -> [(symbol_id, exported)]
    by_file_stem: HashMap<String, Vec<String>>,    // file stem -> exported symbol ids
}

fn build_name_index(storage: &Storage, repo: &RepoId) -> Result<NameIndex> {
    let mut by_name: HashMap<String, Vec<(String, bool)>> = HashMap::new();
    let mut by_file_stem: HashMap<String, Vec<String>> = HashMap::new();
    for s in storage.load_symbols(repo.as_str())? {
        by_name
            .entry(s.row.name.clone())
            .or_default()
            .push((s.row.symbol_id.clone(), s.row.exported));
        if s.row.exported {
            let stem = s
                .rel_path
                .rsplit('/')
                .next()
                .unwrap_or(&s.rel_path)
                .split('.')
                .next()
                .unwrap_or("")
                .to_string();
            by_file_stem.entry(stem).or_default().push(s.row.symbol_id.clone());
        }
    }
    for v in by_name.values_mut() {
        v.sort();
    }
    for v in by_file_stem.values_mut() {
        v.sort();
    }
    Ok(NameIndex { by_name, by_file_stem })
}

/// Full edge set for one file: resolved calls, unresolved sentinels, and
/// import/config edges from the module-scope symbol.
fn resolve_file_edges(pf: &ParsedFile, index: &NameIndex, weights: &EdgeWeightConfig) -> Vec<EdgeRow> {
    let mut edges: Vec<EdgeRow> = Vec::new();

    for call in &pf.calls {
        let target = if call.kind == CallKind::Dynamic {
            SymbolId::unresolved(&call.callee_name).as_str().to_string()
        } else {
            resolve_local(&pf.symbols, call)
                .or_else(|| resolve_global(index, call))
                .unwrap_or_else(|| SymbolId::unresolved(&call.callee_name).as_str().to_string())
        };
        if target == call.caller_id {
            continue;
        }
        edges.push(EdgeRow {
            from_symbol_id: call.caller_id.clone(),
            to_symbol_id: target,
            edge_type: "call".into(),
            weight: weights.call,
            provenance: pf.rel_path.clone(),
        });
    }

    let module_id = format!("{}#module", pf.rel_path);
    for import in &pf.imports {
        let is_config = import
            .specifier
            .rsplit('.')
            .next()
            .map(|ext| matches!(ext, "json" | "yaml" | "yml" | "toml" | "env"))
            .unwrap_or(false);
        let (edge_type, weight) =
            if is_config { ("config", weights.config) } else { ("import", weights.import) };

        let mut targets: Vec<String> = Vec::new();
        for name in &import.symbols {
            if let Some(hits) = index.by_name.get(name) {
                // Exported declarations win; ties break on id order.
                if let Some((id, _)) =
                    hits.iter().find(|(id, exported)| *exported && !id.starts_with(&pf.rel_path))
                {
                    targets.push(id.clone());
                    continue;
                }
            }
            targets.push(SymbolId::unresolved(name).as_str().to_string());
        }
        if targets.is_empty() {
            // Bare specifier (`import os`): link to the target module's
            // exported surface when the stem is known, else a sentinel.
            let stem = import
                .specifier
                .trim_start_matches("./")
                .trim_start_matches("../")
                .rsplit(['/', '.'])
                .find(|s| !s.is_empty())
                .unwrap_or("")
                .to_string();
            match index.by_file_stem.get(&stem) {
                Some(ids) if import.is_relative => targets.extend(ids.iter().take(1).cloned()),
                _ => targets.push(SymbolId::unresolved(&import.specifier).as_str().to_string()),
            }
        }
        for t in targets {
            edges.push(EdgeRow {
                from_symbol_id: module_id.clone(),
                to_symbol_id: t,
                edge_type: edge_type.into(),
                weight,
                provenance: pf.rel_path.clone(),
            });
        }
    }

    edges
}

fn resolve_global(index: &NameIndex, call: &ExtractedCall) -> Option<String> {
    let hits = index.by_name.get(&call.callee_name)?;
    hits.iter()
        .find(|(_, exported)| *exported)
        .or_else(|| hits.first())
        .map(|(id, _)| id.clone())
}

/// Global rewrite in full mode; affected-set rewrite when only a file set
/// changed.
fn update_metrics(
    storage: &Storage,
    repo: &RepoId,
    changed: &[ParsedFile],
    mode: RefreshMode,
) -> Result<()> {
    let graph = CodeGraph::load(storage, repo.as_str())?;

    let ids: Vec<String> = match mode {
        RefreshMode::Full => graph.symbols.keys().cloned().collect(),
        RefreshMode::Incremental => {
            let files: HashSet<String> = changed.iter().map(|p| p.rel_path.clone()).collect();
            graph.affected_by_files(&files).into_iter().collect()
        }
    };

    let mut rows = graph.metrics_rows(ids);

    // Fold test-file references into the affected rows.
    let mut test_refs: HashMap<String, Vec<String>> = HashMap::new();
    for e in storage.load_edges(repo.as_str())? {
        if is_test_path(&e.provenance) {
            let refs = test_refs.entry(e.to_symbol_id.clone()).or_default();
            if !refs.contains(&e.provenance) {
                refs.push(e.provenance.clone());
            }
        }
    }
    for row in rows.iter_mut() {
        if let Some(refs) = test_refs.get(&row.symbol_id) {
            row.test_refs_json = serde_json::to_string(refs).ok();
        }
    }

    storage.upsert_metrics(repo.as_str(), &rows)
}

// ---------------------------------------------------------------------------
// Background worker: one serial lane for queued refreshes
// ---------------------------------------------------------------------------

pub struct RefreshJob {
    pub repo: RepoId,
    pub mode: RefreshMode,
    pub reason: Option<String>,
}

/// Bounded-queue worker: event producers (a file watcher, the server) push
/// refresh jobs; one background thread drains them serially, so queued
/// writes to a repo always observe the previous refresh's output. `drain`
/// completes only when queued and in-flight jobs have finished.
pub struct RefreshWorker {
    tx: Option<SyncSender<RefreshJob>>,
    handle: Option<JoinHandle<()>>,
}

impl RefreshWorker {
    pub fn spawn(run: impl Fn(RefreshJob) + Send + 'static) -> Self {
        let (tx, rx): (SyncSender<RefreshJob>, Receiver<RefreshJob>) = sync_channel(64);
        let handle = std::thread::spawn(move || {
            for job in rx {
                run(job);
            }
        });
        Self { tx: Some(tx), handle: Some(handle) }
    }

    /// Non-blocking enqueue; a full queue reports backpressure to the caller.
    pub fn enqueue(&self, job: RefreshJob) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(SdlError::config("worker is shut down"));
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(SdlError::config("refresh queue is full, retry later"))
            }
            Err(TrySendError::Disconnected(_)) => Err(SdlError::config("worker is shut down")),
        }
    }

    /// Close intake and wait for in-flight jobs.
    pub fn drain(&mut self) {
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        self.drain();
    }
}
