use lru::LruCache;
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::adapters::{adapter_set, AdapterSet};
use crate::cards::{get_card, CardResponse};
use crate::config::{Config, ABSOLUTE_MAX_FILE_BYTES};
use crate::delta::{
    build_delta_pack, DeltaPack, DiagnosticsProducer, GovernorBudget,
};
use crate::error::{Result, SdlError};
use crate::extract::{
    self, estimate_tokens, ExtractBudget, Granularity, HotPathMatchers,
};
use crate::graph::CodeGraph;
use crate::ids::{RepoId, SymbolId};
use crate::indexer::{self, RefreshMode, RefreshReport, RefreshWorker, RepoOptions};
use crate::ledger::resolve_version;
use crate::paths::normalize_rel_path;
use crate::slice::{
    build_slice, issue_handle, load_live_handle, request_shape_hash, GraphSlice, Lease,
    SliceBudget, SliceRequest,
};
use crate::storage::{now_unix_ms, Storage, SymbolRecord};

// ---------------------------------------------------------------------------
// Policy signal
// ---------------------------------------------------------------------------

pub struct WindowIntent<'a> {
    pub repo_id: &'a str,
    pub symbol_id: &'a str,
    pub reason: &'a str,
    pub expected_lines: usize,
    pub identifiers: &'a [String],
}

pub enum PolicyDecision {
    Approve { max_lines: usize, max_tokens: usize },
    Deny { message: String, next_best_action: String, required_fields: Vec<String> },
}

/// The gate deciding whether raw code may be served is an external
/// collaborator; the engine only consumes its decision.
pub trait PolicyGate: Send + Sync {
    fn evaluate(&self, intent: &WindowIntent<'_>) -> PolicyDecision;
}

/// Default gate: demands a stated reason and identifier set, then approves
/// with the requested size clamped to sane bounds.
pub struct DefaultPolicy;

impl PolicyGate for DefaultPolicy {
    fn evaluate(&self, intent: &WindowIntent<'_>) -> PolicyDecision {
        if intent.reason.trim().is_empty() {
            return PolicyDecision::Deny {
                message: "raw code windows require a stated reason".into(),
                next_best_action: "re-request with `reason` describing the task, or fetch code.getSkeleton first".into(),
                required_fields: vec!["reason".into()],
            };
        }
        if intent.identifiers.is_empty() && intent.expected_lines > 200 {
            return PolicyDecision::Deny {
                message: "large windows need identifiersToFind so the excerpt can be focused".into(),
                next_best_action: "pass identifiersToFind or use code.getHotPath".into(),
                required_fields: vec!["identifiersToFind".into()],
            };
        }
        let max_lines = intent.expected_lines.clamp(1, 400);
        PolicyDecision::Approve { max_lines, max_tokens: max_lines * 24 }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Process-wide state as an explicit context: handlers receive the engine at
/// startup instead of reaching for globals, so tests can stub every part.
///
/// Teardown order: stop intake → drain worker → close storage → clear caches.
pub struct Engine {
    pub cfg: Config,
    pub storage: Arc<Storage>,
    pub adapters: &'static AdapterSet,
    pub policy: Box<dyn PolicyGate>,
    pub diagnostics: Option<Arc<dyn DiagnosticsProducer>>,
    matchers: HotPathMatchers,
    slice_cache: Mutex<LruCache<String, Arc<GraphSlice>>>,
    graphs: Mutex<HashMap<String, (u64, Arc<CodeGraph>)>>,
    generations: Mutex<HashMap<String, u64>>,
    repo_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    worker: Mutex<Option<RefreshWorker>>,
}

impl Engine {
    pub fn new(cfg: Config, storage: Storage) -> Arc<Self> {
        Self::with_parts(cfg, storage, Box::new(DefaultPolicy), None)
    }

    /// Construction-time injection point: tests stub the policy gate or the
    /// diagnostics producer here.
    pub fn with_parts(
        cfg: Config,
        storage: Storage,
        policy: Box<dyn PolicyGate>,
        diagnostics: Option<Arc<dyn DiagnosticsProducer>>,
    ) -> Arc<Self> {
        let slice_entries = NonZeroUsize::new(cfg.slice.cache_entries.max(1)).unwrap();
        let matcher_cap = cfg.cache.hotpath_matchers;
        let engine = Arc::new(Self {
            storage: Arc::new(storage),
            adapters: adapter_set(),
            policy,
            diagnostics,
            matchers: HotPathMatchers::new(matcher_cap),
            slice_cache: Mutex::new(LruCache::new(slice_entries)),
            graphs: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            repo_locks: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            cfg,
        });

        // Weak: the worker must not keep the engine alive past shutdown.
        let bg = Arc::downgrade(&engine);
        let worker = RefreshWorker::spawn(move |job| {
            let Some(engine) = bg.upgrade() else { return };
            if let Err(e) = engine.index_refresh(&job.repo, job.mode, job.reason.as_deref()) {
                crate::debug_log!("[symledger] background refresh failed: {e}");
            }
        });
        *engine.worker.lock().unwrap() = Some(worker);
        engine
    }

    /// Stop intake, drain in-flight refreshes, drop caches. Storage closes
    /// when the last Arc goes.
    pub fn shutdown(&self) {
        if let Some(mut w) = self.worker.lock().unwrap().take() {
            w.drain();
        }
        self.slice_cache.lock().unwrap().clear();
        self.graphs.lock().unwrap().clear();
    }

    pub fn enqueue_refresh(&self, repo: RepoId, mode: RefreshMode) -> Result<()> {
        let guard = self.worker.lock().unwrap();
        match guard.as_ref() {
            Some(w) => w.enqueue(indexer::RefreshJob { repo, mode, reason: None }),
            None => Err(SdlError::config("engine is shut down")),
        }
    }

    fn repo_lock(&self, repo_id: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .lock()
            .unwrap()
            .entry(repo_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn generation(&self, repo_id: &str) -> u64 {
        *self.generations.lock().unwrap().get(repo_id).unwrap_or(&0)
    }

    fn bump_generation(&self, repo_id: &str) {
        *self.generations.lock().unwrap().entry(repo_id.to_string()).or_insert(0) += 1;
        self.graphs.lock().unwrap().remove(repo_id);
    }

    /// Consistent graph snapshot for the repo's current generation.
    pub fn graph(&self, repo: &RepoId) -> Result<Arc<CodeGraph>> {
        let generation = self.generation(repo.as_str());
        {
            let graphs = self.graphs.lock().unwrap();
            if let Some((g, graph)) = graphs.get(repo.as_str()) {
                if *g == generation {
                    return Ok(graph.clone());
                }
            }
        }
        let graph = Arc::new(CodeGraph::load(&self.storage, repo.as_str())?);
        self.graphs
            .lock()
            .unwrap()
            .insert(repo.as_str().to_string(), (generation, graph.clone()));
        Ok(graph)
    }

    // -- repo.register ---------------------------------------------------

    pub fn register_repo(
        &self,
        repo: &RepoId,
        root_path: &str,
        options: RepoOptions,
    ) -> Result<()> {
        let trimmed = root_path.trim();
        if trimmed.starts_with('~') || trimmed.split(['/', '\\']).any(|seg| seg == "..") {
            return Err(SdlError::traversal(trimmed));
        }
        let root = PathBuf::from(trimmed.replace('\\', "/"));
        let meta = std::fs::metadata(&root).map_err(|_| SdlError::path_not_found(trimmed))?;
        if !meta.is_dir() {
            return Err(SdlError::path_not_found(trimmed));
        }
        let config_json = serde_json::to_string(&options)
            .map_err(|e| SdlError::config(format!("bad repo options: {e}")))?;
        self.storage.register_repo(repo.as_str(), &root.to_string_lossy(), &config_json)
    }

    // -- repo.status -----------------------------------------------------

    pub fn repo_status(&self, repo: &RepoId) -> Result<serde_json::Value> {
        let rec = self
            .storage
            .get_repo(repo.as_str())?
            .ok_or_else(|| SdlError::repo_not_found(repo.as_str()))?;
        let (files, symbols) = self.storage.counts(repo.as_str())?;
        let latest = self.storage.latest_version(repo.as_str())?;

        // Indexed and versioned is healthy; stale failure notes degrade it.
        let mut health: f64 = match &latest {
            Some(_) => 1.0,
            None => 0.3,
        };
        if let Some(v) = &latest {
            if v.reason.as_deref().map(|r| r.contains("failed")).unwrap_or(false) {
                health -= 0.2;
            }
        }
        if files > 0 && symbols == 0 {
            health -= 0.3;
        }

        let worker_state =
            if self.worker.lock().unwrap().is_some() { "running" } else { "stopped" };

        // Aggregates are SQL reads; nothing here touches the graph cache.
        let dirs = self.storage.directory_aggregates(repo.as_str())?;
        let top_fan_in: Vec<serde_json::Value> = self
            .storage
            .top_by_fan_in(repo.as_str(), 5)?
            .into_iter()
            .map(|(id, n)| json!({ "symbolId": id, "fanIn": n }))
            .collect();
        let top_churn: Vec<serde_json::Value> = self
            .storage
            .top_by_churn(repo.as_str(), 5)?
            .into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(id, n)| json!({ "symbolId": id, "churn30d": n }))
            .collect();
        let largest: Vec<serde_json::Value> = self
            .storage
            .largest_files(repo.as_str(), 5)?
            .into_iter()
            .map(|(path, bytes)| json!({ "file": path, "bytes": bytes }))
            .collect();

        Ok(json!({
            "rootPath": rec.root_path,
            "latestVersionId": latest.as_ref().map(|v| v.version_id.clone()),
            "filesIndexed": files,
            "symbolsIndexed": symbols,
            "healthScore": (health.max(0.0) * 100.0).round() / 100.0,
            "components": {
                "storage": "ok",
                "adapters": self.adapters.language_ids(),
                "worker": worker_state,
            },
            "aggregates": {
                "directories": dirs.len(),
                "topFanIn": top_fan_in,
                "topChurn": top_churn,
                "largestFiles": largest,
            }
        }))
    }

    // -- index.refresh ---------------------------------------------------

    pub fn index_refresh(
        &self,
        repo: &RepoId,
        mode: RefreshMode,
        reason: Option<&str>,
    ) -> Result<RefreshReport> {
        // One writer lane per repo: a second concurrent refresh waits here
        // and then observes the first one's output.
        let lock = self.repo_lock(repo.as_str());
        let _guard = lock.lock().unwrap();
        let report =
            indexer::refresh_repo(&self.storage, self.adapters, &self.cfg, repo, mode, reason)?;
        self.bump_generation(repo.as_str());
        Ok(report)
    }

    // -- symbol.search ---------------------------------------------------

    pub fn symbol_search(
        &self,
        repo: &RepoId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SymbolRecord>> {
        let mut hits = self.storage.search_symbols(repo.as_str(), query, limit.max(1) * 4)?;
        let q = query.to_lowercase();
        let tier = |name: &str| -> u8 {
            let n = name.to_lowercase();
            if n == q {
                0
            } else if n.starts_with(&q) {
                1
            } else {
                2
            }
        };
        let kind_rank = |kind: &str| -> u8 {
            match kind {
                "class" => 0,
                "function" => 1,
                "method" => 2,
                "interface" => 3,
                "type" => 4,
                "constructor" => 5,
                "module" => 6,
                _ => 7,
            }
        };
        hits.sort_by(|a, b| {
            tier(&a.row.name)
                .cmp(&tier(&b.row.name))
                .then_with(|| kind_rank(&a.row.kind).cmp(&kind_rank(&b.row.kind)))
                .then_with(|| a.row.symbol_id.cmp(&b.row.symbol_id))
        });
        hits.truncate(limit.max(1));
        Ok(hits)
    }

    // -- symbol.getCard --------------------------------------------------

    pub fn symbol_get_card(
        &self,
        repo: &RepoId,
        symbol_id: &SymbolId,
        if_none_match: Option<&str>,
    ) -> Result<CardResponse> {
        let graph = self.graph(repo)?;
        let version = self
            .storage
            .latest_version(repo.as_str())?
            .map(|v| v.version_id)
            .unwrap_or_default();
        get_card(&self.storage, &graph, symbol_id.as_str(), &version, if_none_match)
    }

    // -- slice.build -----------------------------------------------------

    pub fn slice_build(
        &self,
        repo: &RepoId,
        req: &SliceRequest,
        budget: Option<SliceBudget>,
    ) -> Result<(Arc<GraphSlice>, Lease)> {
        let budget = budget.unwrap_or(SliceBudget {
            max_cards: self.cfg.slice.default_max_cards,
            max_estimated_tokens: self.cfg.slice.default_max_estimated_tokens,
        });
        if budget.max_cards == 0 || budget.max_estimated_tokens == 0 {
            return Err(SdlError::validation("budget", "maxCards and maxEstimatedTokens must be positive"));
        }

        let version = self
            .storage
            .latest_version(repo.as_str())?
            .ok_or_else(|| SdlError::config("repo has no indexed version yet; run index.refresh"))?;

        let generation = self.generation(repo.as_str());
        let key = format!(
            "{}|{}|{}|{}",
            repo.as_str(),
            version.version_id,
            request_shape_hash(req, &budget),
            generation
        );
        if let Some(hit) = self.slice_cache.lock().unwrap().get(&key) {
            let lease = issue_handle(
                &self.storage,
                repo.as_str(),
                &version.version_id,
                &hit.slice_hash,
                self.cfg.slice.lease_ttl_secs,
            )?;
            return Ok((hit.clone(), lease));
        }

        let graph = self.graph(repo)?;
        let slice = Arc::new(build_slice(
            &graph,
            repo.as_str(),
            &version.version_id,
            req,
            budget,
            &self.cfg.slice,
        ));
        self.slice_cache.lock().unwrap().put(key, slice.clone());

        let lease = issue_handle(
            &self.storage,
            repo.as_str(),
            &version.version_id,
            &slice.slice_hash,
            self.cfg.slice.lease_ttl_secs,
        )?;
        self.storage.append_audit(repo.as_str(), "slice.build", &slice.slice_hash)?;
        Ok((slice, lease))
    }

    // -- slice.refresh ---------------------------------------------------

    pub fn slice_refresh(&self, handle: &str, known_version: &str) -> Result<serde_json::Value> {
        let rec = load_live_handle(&self.storage, handle)?;
        let repo = RepoId::new(&rec.repo_id)?;
        let known = resolve_version(&self.storage, &repo, known_version)?;
        let current = self
            .storage
            .latest_version(repo.as_str())?
            .ok_or_else(|| SdlError::repo_not_found(repo.as_str()))?;

        let lease = issue_handle(
            &self.storage,
            repo.as_str(),
            &current.version_id,
            &rec.slice_hash,
            self.cfg.slice.lease_ttl_secs,
        )?;

        // Hash-equal states cannot have produced a different slice.
        if current.version_hash == known.version_hash {
            return Ok(json!({
                "currentVersion": current.version_id,
                "notModified": true,
                "lease": lease,
            }));
        }

        let delta = crate::delta::compute_delta(&self.storage, &known.version_id, &current.version_id)?;
        Ok(json!({
            "currentVersion": current.version_id,
            "notModified": false,
            "delta": delta,
            "lease": lease,
        }))
    }

    // -- slice.spillover.get ----------------------------------------------

    pub fn spillover_get(
        &self,
        handle: &str,
        cursor: u64,
        page_size: usize,
    ) -> Result<serde_json::Value> {
        let rec = load_live_handle(&self.storage, handle)?;
        let spill = rec.spillover_ref.as_deref().unwrap_or(handle);
        let (items, next) = self.storage.get_spillover_page(spill, cursor, page_size.clamp(1, 200))?;
        let symbols: Vec<serde_json::Value> = items
            .iter()
            .filter_map(|j| serde_json::from_str(j).ok())
            .collect();
        Ok(json!({
            "hasMore": next.is_some(),
            "cursor": next,
            "symbols": symbols,
        }))
    }

    // -- delta.get --------------------------------------------------------

    pub fn delta_get(
        &self,
        repo: &RepoId,
        from_version: &str,
        to_version: &str,
        budget: Option<GovernorBudget>,
    ) -> Result<DeltaPack> {
        let from = resolve_version(&self.storage, repo, from_version)?;
        let to = resolve_version(&self.storage, repo, to_version)?;
        let graph = self.graph(repo)?;
        let budget = budget.unwrap_or(GovernorBudget {
            max_cards: self.cfg.blast.default_max_cards,
            max_tokens: self.cfg.blast.default_max_tokens,
        });

        // Diagnostics are best-effort under a deadline; a slow producer
        // degrades to a graph-only pack, recorded in the response.
        let (suspects, timed_out) = match &self.diagnostics {
            None => (None, false),
            Some(producer) => {
                let deadline = std::time::Duration::from_millis(self.cfg.blast.diagnostics_deadline_ms);
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .map_err(|e| SdlError::config(format!("runtime: {e}")))?;
                let producer = producer.clone();
                let (repo_s, from_s, to_s) =
                    (repo.as_str().to_string(), from.version_id.clone(), to.version_id.clone());
                let joined = rt.block_on(async move {
                    let work =
                        tokio::task::spawn_blocking(move || producer.suspects(&repo_s, &from_s, &to_s));
                    tokio::time::timeout(deadline, work).await
                });
                // Don't wait on an overdue producer at shutdown either.
                rt.shutdown_background();
                match joined {
                    Ok(Ok(s)) => (Some(s), false),
                    _ => (None, true),
                }
            }
        };

        let pack = build_delta_pack(
            &self.storage,
            &graph,
            repo.as_str(),
            &from.version_id,
            &to.version_id,
            self.cfg.blast.max_hops,
            budget,
            suspects,
            timed_out,
            self.cfg.slice.lease_ttl_secs,
        )?;
        self.storage.append_audit(
            repo.as_str(),
            "delta.get",
            &format!("{} -> {}", from.version_id, to.version_id),
        )?;
        Ok(pack)
    }

    // -- code.* -----------------------------------------------------------

    fn read_symbol_source(
        &self,
        repo: &RepoId,
        symbol_id: &str,
    ) -> Result<(SymbolRecord, String)> {
        let graph = self.graph(repo)?;
        let sym = graph
            .symbols
            .get(symbol_id)
            .ok_or_else(|| SdlError::symbol_not_found(symbol_id))?
            .clone();
        let source = self.read_repo_file(repo, &sym.rel_path)?;
        Ok((sym, source))
    }

    fn read_repo_file(&self, repo: &RepoId, rel_path: &str) -> Result<String> {
        let rec = self
            .storage
            .get_repo(repo.as_str())?
            .ok_or_else(|| SdlError::repo_not_found(repo.as_str()))?;
        let rel = normalize_rel_path(rel_path)?;
        let abs = Path::new(&rec.root_path).join(&rel);
        let raw = std::fs::read(&abs).map_err(|_| SdlError::path_not_found(&rel))?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn extractor_cap(&self) -> u64 {
        self.cfg.token_estimator.max_file_bytes.min(ABSOLUTE_MAX_FILE_BYTES)
    }

    pub fn need_window(
        &self,
        repo: &RepoId,
        symbol_id: &SymbolId,
        reason: &str,
        expected_lines: usize,
        identifiers: &[String],
        granularity: Option<Granularity>,
        max_tokens: Option<usize>,
    ) -> Result<serde_json::Value> {
        let intent = WindowIntent {
            repo_id: repo.as_str(),
            symbol_id: symbol_id.as_str(),
            reason,
            expected_lines,
            identifiers,
        };
        let (max_lines, approved_tokens) = match self.policy.evaluate(&intent) {
            PolicyDecision::Approve { max_lines, max_tokens } => (max_lines, max_tokens),
            PolicyDecision::Deny { message, next_best_action, required_fields } => {
                return Err(SdlError::policy(message, next_best_action, required_fields));
            }
        };

        let (sym, source) = self.read_symbol_source(repo, symbol_id.as_str())?;
        if !extract::file_within_cap(&sym.rel_path, source.len() as u64, self.extractor_cap()) {
            return Err(SdlError::file_too_large(
                &sym.rel_path,
                source.len() as u64,
                self.extractor_cap(),
            ));
        }

        let budget = ExtractBudget {
            max_lines,
            max_tokens: max_tokens.unwrap_or(approved_tokens),
        };
        let granularity = granularity.unwrap_or(Granularity::Symbol);

        // Identifier-guided requests get the focused hot-path view; plain
        // requests get the raw window.
        let body = if identifiers.is_empty() {
            let ex = extract::window(
                &source,
                sym.row.start_line,
                sym.row.end_line,
                granularity,
                budget,
            );
            json!({
                "kind": "window",
                "text": ex.text,
                "startLine": ex.start_line,
                "endLine": ex.end_line,
                "truncated": ex.truncated,
            })
        } else {
            let hp = extract::hot_path(
                self.adapters,
                &self.matchers,
                &sym.rel_path,
                &source,
                (sym.row.start_line, sym.row.end_line),
                identifiers,
                3,
                budget,
            );
            json!({
                "kind": "hotPath",
                "text": hp.excerpt,
                "matchedIdentifiers": hp.matched_identifiers,
                "matchedLines": hp.matched_lines,
                "truncated": hp.truncated,
            })
        };

        self.storage.append_audit(repo.as_str(), "code.needWindow", symbol_id.as_str())?;
        let estimated =
            estimate_tokens(body.get("text").and_then(|t| t.as_str()).unwrap_or("").len());
        Ok(json!({
            "approved": true,
            "symbolId": symbol_id.as_str(),
            "file": sym.rel_path,
            "window": body,
            "estimatedTokens": estimated,
        }))
    }

    pub fn get_skeleton(
        &self,
        repo: &RepoId,
        symbol_id: Option<&SymbolId>,
        file: Option<&str>,
        exported_only: bool,
        max_lines: Option<usize>,
        max_tokens: Option<usize>,
    ) -> Result<serde_json::Value> {
        let budget = ExtractBudget {
            max_lines: max_lines.unwrap_or(200),
            max_tokens: max_tokens.unwrap_or(2_000),
        };

        let (rel_path, source, range) = match (symbol_id, file) {
            (Some(sid), _) => {
                let (sym, source) = self.read_symbol_source(repo, sid.as_str())?;
                (sym.rel_path.clone(), source, Some((sym.row.start_line, sym.row.end_line)))
            }
            (None, Some(f)) => {
                let rel = normalize_rel_path(f)?;
                let source = self.read_repo_file(repo, &rel)?;
                (rel, source, None)
            }
            (None, None) => {
                return Err(SdlError::validation("symbolId", "either symbolId or file is required"))
            }
        };

        if !extract::file_within_cap(&rel_path, source.len() as u64, self.extractor_cap()) {
            return Ok(json!({ "skeleton": null, "refused": "file-too-large" }));
        }

        let skel =
            extract::render_skeleton(self.adapters, &rel_path, &source, range, exported_only, budget);
        let ir = range.and_then(|r| extract::skeleton_ir(self.adapters, &rel_path, &source, r, budget));

        Ok(match skel {
            Some(s) => json!({
                "skeleton": s.text,
                "file": rel_path,
                "startLine": s.start_line,
                "endLine": s.end_line,
                "truncated": s.truncated,
                "ir": ir.map(|i| json!({ "ops": i.ops, "irHash": i.ir_hash, "truncated": i.truncated })),
            }),
            None => json!({ "skeleton": null, "file": rel_path }),
        })
    }

    pub fn get_hot_path(
        &self,
        repo: &RepoId,
        symbol_id: &SymbolId,
        identifiers: &[String],
        max_lines: Option<usize>,
        max_tokens: Option<usize>,
        context_lines: Option<u32>,
    ) -> Result<serde_json::Value> {
        if identifiers.is_empty() {
            return Err(SdlError::validation("identifiersToFind", "at least one identifier is required"));
        }
        let (sym, source) = self.read_symbol_source(repo, symbol_id.as_str())?;
        if !extract::file_within_cap(&sym.rel_path, source.len() as u64, self.extractor_cap()) {
            return Ok(json!({ "excerpt": null, "refused": "file-too-large" }));
        }
        let hp = extract::hot_path(
            self.adapters,
            &self.matchers,
            &sym.rel_path,
            &source,
            (sym.row.start_line, sym.row.end_line),
            identifiers,
            context_lines.unwrap_or(3),
            ExtractBudget {
                max_lines: max_lines.unwrap_or(120),
                max_tokens: max_tokens.unwrap_or(1_500),
            },
        );
        Ok(json!({
            "symbolId": symbol_id.as_str(),
            "file": sym.rel_path,
            "excerpt": hp.excerpt,
            "matchedIdentifiers": hp.matched_identifiers,
            "matchedLines": hp.matched_lines,
            "truncated": hp.truncated,
        }))
    }

    /// Handle housekeeping entry point for the server's periodic sweep.
    pub fn sweep_handles(&self) -> Result<usize> {
        self.storage.sweep_expired_handles(now_unix_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_demo() -> (tempfile::TempDir, Arc<Engine>, RepoId) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export function f(){ g(); }\nfunction g(){}\n")
            .unwrap();
        let engine = Engine::new(Config::default(), Storage::open_in_memory().unwrap());
        let repo = RepoId::new("demo").unwrap();
        engine
            .register_repo(&repo, &dir.path().to_string_lossy(), RepoOptions::default())
            .unwrap();
        (dir, engine, repo)
    }

    #[test]
    fn register_rejects_traversal_and_missing_paths() {
        let engine = Engine::new(Config::default(), Storage::open_in_memory().unwrap());
        let repo = RepoId::new("demo").unwrap();
        let err = engine.register_repo(&repo, "/tmp/../etc", RepoOptions::default()).unwrap_err();
        assert_eq!(err.code(), "path-traversal");
        let err = engine
            .register_repo(&repo, "/definitely/not/here-49x", RepoOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), "path-not-found");
    }

    #[test]
    fn full_flow_register_refresh_search_card() {
        let (_dir, engine, repo) = engine_with_demo();
        let report = engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        assert!(report.version_id.starts_with("demo-v"));

        let hits = engine.symbol_search(&repo, "f", 10).unwrap();
        assert_eq!(hits[0].row.name, "f");

        let sid = SymbolId::new("a.ts#f").unwrap();
        let CardResponse::Card { card, .. } =
            engine.symbol_get_card(&repo, &sid, None).unwrap()
        else {
            panic!()
        };
        assert_eq!(card.calls_out, vec!["a.ts#g"]);

        let status = engine.repo_status(&repo).unwrap();
        assert_eq!(status["filesIndexed"], 1);
        assert_eq!(status["symbolsIndexed"], 2);
        assert!(status["healthScore"].as_f64().unwrap() > 0.9);
    }

    #[test]
    fn slice_cache_hits_within_generation_and_invalidates_on_refresh() {
        let (dir, engine, repo) = engine_with_demo();
        engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();

        let req = SliceRequest { task_text: "call g".into(), ..Default::default() };
        let (a, _) = engine.slice_build(&repo, &req, None).unwrap();
        let (b, _) = engine.slice_build(&repo, &req, None).unwrap();
        assert!(Arc::ptr_eq(&a, &b), "second identical request must hit the cache");

        std::fs::write(
            dir.path().join("a.ts"),
            "export function f(){ g(); }\nfunction g(){}\nfunction h(){ f(); }\n",
        )
        .unwrap();
        engine.index_refresh(&repo, RefreshMode::Incremental, None).unwrap();
        let (c, _) = engine.slice_build(&repo, &req, None).unwrap();
        assert!(!Arc::ptr_eq(&a, &c), "refresh must invalidate the repo's slice cache");
    }

    #[test]
    fn slice_refresh_reports_not_modified_then_delta() {
        let (dir, engine, repo) = engine_with_demo();
        let r1 = engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        let req = SliceRequest { task_text: "call g".into(), ..Default::default() };
        let (_slice, lease) = engine.slice_build(&repo, &req, None).unwrap();

        let resp = engine.slice_refresh(&lease.handle, &r1.version_id).unwrap();
        assert_eq!(resp["notModified"], true);

        std::fs::write(
            dir.path().join("a.ts"),
            "export function f(){ g(); }\nfunction g(){}\nfunction h(){ f(); }\n",
        )
        .unwrap();
        engine.index_refresh(&repo, RefreshMode::Incremental, None).unwrap();
        let resp = engine.slice_refresh(&lease.handle, &r1.version_id).unwrap();
        assert_eq!(resp["notModified"], false);
        assert_eq!(resp["delta"]["added"][0], "a.ts#h");
    }

    #[test]
    fn need_window_policy_denial_carries_next_best_action() {
        let (_dir, engine, repo) = engine_with_demo();
        engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        let sid = SymbolId::new("a.ts#f").unwrap();
        let err = engine.need_window(&repo, &sid, "", 40, &[], None, None).unwrap_err();
        assert_eq!(err.code(), "policy-deny");
        let wire = err.to_wire();
        assert!(wire["error"]["nextBestAction"].as_str().unwrap().contains("reason"));
    }

    #[test]
    fn need_window_approves_with_reason() {
        let (_dir, engine, repo) = engine_with_demo();
        engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        let sid = SymbolId::new("a.ts#f").unwrap();
        let resp = engine
            .need_window(&repo, &sid, "inspect call into g", 40, &["g".to_string()], None, None)
            .unwrap();
        assert_eq!(resp["approved"], true);
        assert!(resp["window"]["text"].as_str().unwrap().contains("g()"));
    }

    #[test]
    fn delta_get_resolves_bare_version_tails() {
        let (dir, engine, repo) = engine_with_demo();
        let r1 = engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        std::fs::write(
            dir.path().join("a.ts"),
            "export function f(){ g(); }\nfunction g(){}\nfunction h(){ f(); }\n",
        )
        .unwrap();
        let r2 = engine.index_refresh(&repo, RefreshMode::Incremental, None).unwrap();

        let tail = r1.version_id.rsplit('-').next().unwrap().to_string();
        let pack = engine.delta_get(&repo, &tail, &r2.version_id, None).unwrap();
        assert_eq!(pack.changed_symbols.added, vec!["a.ts#h"]);
        assert!(pack.blast_radius.iter().any(|i| i.symbol_id == "a.ts#f" && i.distance == 1));
        assert!(!pack.diagnostics_timed_out);
    }

    #[test]
    fn diagnostics_merge_and_deadline() {
        use crate::delta::DiagnosticSuspect;

        struct Fast;
        impl crate::delta::DiagnosticsProducer for Fast {
            fn suspects(&self, _r: &str, _f: &str, _t: &str) -> Vec<DiagnosticSuspect> {
                vec![DiagnosticSuspect {
                    symbol_id: "a.ts#g".into(),
                    code: "TS2304".into(),
                    message_short: "cannot find name".into(),
                }]
            }
        }
        struct Slow;
        impl crate::delta::DiagnosticsProducer for Slow {
            fn suspects(&self, _r: &str, _f: &str, _t: &str) -> Vec<DiagnosticSuspect> {
                std::thread::sleep(std::time::Duration::from_millis(500));
                Vec::new()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export function f(){ g(); }\nfunction g(){}\n")
            .unwrap();

        let run = |diag: Arc<dyn crate::delta::DiagnosticsProducer>, deadline_ms: u64| {
            let mut cfg = Config::default();
            cfg.blast.diagnostics_deadline_ms = deadline_ms;
            let engine = Engine::with_parts(
                cfg,
                Storage::open_in_memory().unwrap(),
                Box::new(DefaultPolicy),
                Some(diag),
            );
            let repo = RepoId::new("demo").unwrap();
            engine
                .register_repo(&repo, &dir.path().to_string_lossy(), RepoOptions::default())
                .unwrap();
            let r1 = engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
            std::fs::write(
                dir.path().join("a.ts"),
                "export function f(){ g(); }\nfunction g(){}\nfunction h(){ f(); }\n",
            )
            .unwrap();
            let r2 = engine.index_refresh(&repo, RefreshMode::Incremental, None).unwrap();
            let pack = engine.delta_get(&repo, &r1.version_id, &r2.version_id, None).unwrap();
            // Restore the original tree for the next run.
            std::fs::write(
                dir.path().join("a.ts"),
                "export function f(){ g(); }\nfunction g(){}\n",
            )
            .unwrap();
            pack
        };

        let pack = run(Arc::new(Fast), 2_000);
        assert!(!pack.diagnostics_timed_out);
        assert_eq!(pack.blast_radius[0].symbol_id, "a.ts#g");
        assert_eq!(pack.blast_radius[0].rank, 1.0);

        let pack = run(Arc::new(Slow), 50);
        assert!(pack.diagnostics_timed_out);
        assert!(pack.blast_radius.iter().all(|i| i.code.is_none()));
    }

    #[test]
    fn shutdown_drains_worker_and_clears_caches() {
        let (_dir, engine, repo) = engine_with_demo();
        engine.index_refresh(&repo, RefreshMode::Full, None).unwrap();
        let req = SliceRequest { task_text: "g".into(), ..Default::default() };
        engine.slice_build(&repo, &req, None).unwrap();
        engine.shutdown();
        assert!(engine.enqueue_refresh(repo, RefreshMode::Incremental).is_err());
    }
}
