use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashSet};

use crate::adapters::sha256_hex;
use crate::config::SliceConfig;
use crate::error::{Result, SdlError};
use crate::extract::estimate_tokens;
use crate::graph::CodeGraph;
use crate::paths::is_test_path;
use crate::storage::{now_unix_ms, SliceHandleRecord, Storage};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceBudget {
    pub max_cards: usize,
    pub max_estimated_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SliceRequest {
    pub task_text: String,
    pub stack_trace: Option<String>,
    pub failing_test_path: Option<String>,
    pub edited_files: Vec<String>,
    pub entry_symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceCard {
    pub symbol_id: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub signature: Option<String>,
    pub exported: bool,
    pub fan_in: u32,
    pub fan_out: u32,
    pub score: f64,
    pub estimated_tokens: usize,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierEntry {
    pub symbol_id: String,
    pub score: f64,
    pub why: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Truncation {
    pub truncated: bool,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSlice {
    pub repo_id: String,
    pub version_id: String,
    pub budget: SliceBudget,
    pub start_symbols: Vec<String>,
    pub cards: Vec<SliceCard>,
    pub edges: Vec<SliceEdge>,
    pub frontier: Vec<FrontierEntry>,
    pub truncation: Option<Truncation>,
    pub slice_hash: String,
}

/// Opaque 32-hex-digit handle for slices and spillover sets.
pub fn random_handle() -> String {
    let n: u128 = rand::thread_rng().gen();
    format!("{n:032x}")
}

/// Stable hash of the request shape, part of the slice cache key.
pub fn request_shape_hash(req: &SliceRequest, budget: &SliceBudget) -> String {
    let canon = format!(
        "{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}\x1f{}",
        req.task_text.trim(),
        req.stack_trace.as_deref().unwrap_or(""),
        req.failing_test_path.as_deref().unwrap_or(""),
        req.edited_files.join(","),
        req.entry_symbols.join(","),
        budget.max_cards,
        budget.max_estimated_tokens,
    );
    sha256_hex(canon.as_bytes())
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

fn task_tokens(text: &str) -> Vec<String> {
    let mut out: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    out.dedup();
    out
}

/// Token-overlap between task tokens and the symbol name + file path, with
/// weighted match tiers, normalised to [0,1] by token count.
fn query_overlap(tokens: &[String], name: &str, file: &str) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let name_l = name.to_lowercase();
    let file_l = file.to_lowercase();
    let mut sum = 0.0;
    for t in tokens {
        if name_l == *t {
            sum += 1.25;
        } else if name_l.starts_with(t.as_str()) {
            sum += 1.0;
        } else if name_l.contains(t.as_str()) {
            sum += 0.75;
        } else if file_l.contains(t.as_str()) {
            sum += 0.4;
        }
    }
    (sum / (1.25 * tokens.len() as f64)).clamp(0.0, 1.0)
}

struct StackFrame {
    file: String,
    line: u32,
}

fn parse_stack_frames(stack: &str) -> Vec<StackFrame> {
    let re = stack_frame_regex();
    let mut out = Vec::new();
    for cap in re.captures_iter(stack) {
        let file = cap[1].replace('\\', "/");
        if let Ok(line) = cap[2].parse::<u32>() {
            out.push(StackFrame { file, line });
        }
    }
    out
}

fn stack_frame_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"([\w./\\-]+\.\w+):(\d+)").unwrap())
}

/// 1.0 when a frame lands inside the symbol's range, 0.5 for same file.
fn stacktrace_locality(frames: &[StackFrame], file: &str, start_line: u32, end_line: u32) -> f64 {
    let mut best = 0.0f64;
    for f in frames {
        if !f.file.ends_with(file) && !file.ends_with(&f.file) {
            continue;
        }
        // Frames are 1-indexed on the wire; ranges are 0-indexed.
        let line0 = f.line.saturating_sub(1);
        if start_line <= line0 && line0 <= end_line {
            return 1.0;
        }
        best = best.max(0.5);
    }
    best
}

/// Downweights test/dist/script/aggregator files.
fn structural_specificity(file: &str) -> f64 {
    let f = file.to_lowercase();
    let stem = f
        .rsplit('/')
        .next()
        .unwrap_or(&f)
        .split('.')
        .next()
        .unwrap_or("");
    if is_test_path(&f) {
        return 0.55;
    }
    if f.contains("/dist/") || f.contains("scripts/") || f.contains("/generated/") {
        return 0.6;
    }
    if matches!(stem, "index" | "util" | "utils" | "types" | "main" | "mod") {
        return 0.75;
    }
    1.0
}

fn symbol_kind_specificity(kind: &str) -> f64 {
    match kind {
        "class" => 1.0,
        "function" => 0.98,
        "method" => 0.95,
        "interface" => 0.9,
        "type" => 0.88,
        "constructor" => 0.8,
        "module" => 0.7,
        "variable" => 0.55,
        _ => 0.5,
    }
}

fn intrinsic_score(
    graph: &CodeGraph,
    tokens: &[String],
    frames: &[StackFrame],
    symbol_id: &str,
) -> f64 {
    let Some(sym) = graph.symbols.get(symbol_id) else { return 0.0 };
    let q = query_overlap(tokens, &sym.row.name, &sym.rel_path);
    let st = stacktrace_locality(frames, &sym.rel_path, sym.row.start_line, sym.row.end_line);
    let hot = graph.hotness(symbol_id);
    let structure = structural_specificity(&sym.rel_path);
    let kind = symbol_kind_specificity(&sym.row.kind);
    q * 0.4 + st * 0.2 + hot * 0.15 + structure * 0.15 + kind * 0.1
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

struct Candidate {
    score: f64,
    symbol_id: String,
    via: Option<String>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    // Max-heap on score; deterministic tie-break on ascending symbol id.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.symbol_id.cmp(&self.symbol_id))
    }
}

/// Build a budgeted ranked slice rooted in task-derived seeds.
pub fn build_slice(
    graph: &CodeGraph,
    repo_id: &str,
    version_id: &str,
    req: &SliceRequest,
    budget: SliceBudget,
    cfg: &SliceConfig,
) -> GraphSlice {
    let tokens = task_tokens(&req.task_text);
    let frames = req
        .stack_trace
        .as_deref()
        .map(parse_stack_frames)
        .unwrap_or_default();

    // -- Seed selection -------------------------------------------------
    let mut seeds: HashSet<String> = HashSet::new();
    for s in &req.entry_symbols {
        if graph.contains(s) {
            seeds.insert(s.clone());
        }
    }
    for (id, sym) in &graph.symbols {
        if stacktrace_locality(&frames, &sym.rel_path, sym.row.start_line, sym.row.end_line) >= 1.0 {
            seeds.insert(id.clone());
        }
    }
    let mut edited: Vec<&str> = req.edited_files.iter().map(String::as_str).collect();
    if let Some(p) = req.failing_test_path.as_deref() {
        edited.push(p);
    }
    for (id, sym) in &graph.symbols {
        if edited.iter().any(|f| sym.rel_path == f.replace('\\', "/")) {
            seeds.insert(id.clone());
        }
    }
    // Top-k name matches over the task tokens.
    let mut name_hits: Vec<(f64, &String)> = graph
        .symbols
        .iter()
        .map(|(id, sym)| (query_overlap(&tokens, &sym.row.name, &sym.rel_path), id))
        .filter(|(s, _)| *s > 0.0)
        .collect();
    name_hits.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    for (_, id) in name_hits.into_iter().take(cfg.seed_search_limit) {
        seeds.insert(id.clone());
    }

    let mut start_symbols: Vec<String> = seeds.iter().cloned().collect();
    start_symbols.sort();

    // -- Beam walk ------------------------------------------------------
    let mut heap: BinaryHeap<Candidate> = BinaryHeap::new();
    let mut queued: HashSet<String> = HashSet::new();
    for id in &start_symbols {
        heap.push(Candidate {
            score: intrinsic_score(graph, &tokens, &frames, id),
            symbol_id: id.clone(),
            via: None,
        });
        queued.insert(id.clone());
    }

    let mut admitted: Vec<(String, f64)> = Vec::new();
    let mut admitted_set: HashSet<String> = HashSet::new();
    let mut tokens_used = 0usize;
    let mut frontier: Vec<FrontierEntry> = Vec::new();
    let mut dropped = 0usize;

    while let Some(cand) = heap.pop() {
        if admitted_set.contains(&cand.symbol_id) {
            continue;
        }
        let est = card_token_estimate(graph, &cand.symbol_id);
        let fits = admitted.len() < budget.max_cards
            && tokens_used + est <= budget.max_estimated_tokens;

        if !fits {
            dropped += 1;
            if frontier.len() < cfg.frontier_size {
                let why = match &cand.via {
                    Some(parent) => format!("neighbour of {parent}, outside budget"),
                    None => "seed outside budget".to_string(),
                };
                frontier.push(FrontierEntry {
                    symbol_id: cand.symbol_id.clone(),
                    score: cand.score,
                    why,
                });
            }
            continue;
        }

        tokens_used += est;
        admitted.push((cand.symbol_id.clone(), cand.score));
        admitted_set.insert(cand.symbol_id.clone());

        // Expand both directions: callees carry the task context forward,
        // callers show who depends on it.
        for e in graph.out_edges(&cand.symbol_id).iter().chain(graph.in_edges(&cand.symbol_id)) {
            let neighbour = if e.from == cand.symbol_id { &e.to } else { &e.from };
            if !graph.contains(neighbour) || queued.contains(neighbour) {
                continue;
            }
            queued.insert(neighbour.clone());
            let bound = (e.weight.min(1.0)) * cand.score;
            let score = intrinsic_score(graph, &tokens, &frames, neighbour).max(bound);
            heap.push(Candidate {
                score,
                symbol_id: neighbour.clone(),
                via: Some(cand.symbol_id.clone()),
            });
        }
    }

    // Deterministic card order: score desc, id asc.
    admitted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let cards: Vec<SliceCard> = admitted
        .iter()
        .filter_map(|(id, score)| build_card(graph, id, *score))
        .collect();

    let frontier_ids: HashSet<&str> = frontier.iter().map(|f| f.symbol_id.as_str()).collect();
    let mut edges: Vec<SliceEdge> = Vec::new();
    for (id, _) in &admitted {
        for e in graph.out_edges(id) {
            if admitted_set.contains(&e.to) || frontier_ids.contains(e.to.as_str()) {
                edges.push(SliceEdge {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    edge_type: e.edge_type.clone(),
                    weight: e.weight,
                });
            }
        }
    }

    let mut sorted_ids: Vec<&str> = admitted_set.iter().map(String::as_str).collect();
    sorted_ids.sort();
    let slice_hash = sha256_hex(format!("{}\x1f{}", sorted_ids.join("|"), version_id).as_bytes());

    GraphSlice {
        repo_id: repo_id.to_string(),
        version_id: version_id.to_string(),
        budget,
        start_symbols,
        cards,
        edges,
        frontier,
        truncation: if dropped > 0 { Some(Truncation { truncated: true, dropped }) } else { None },
        slice_hash,
    }
}

fn card_token_estimate(graph: &CodeGraph, symbol_id: &str) -> usize {
    let base = graph
        .symbols
        .get(symbol_id)
        .map(|s| {
            s.row.symbol_id.len()
                + s.row.name.len()
                + s.rel_path.len()
                + s.row.signature_json.as_deref().map(str::len).unwrap_or(0)
        })
        .unwrap_or(0);
    estimate_tokens(base + 120)
}

fn build_card(graph: &CodeGraph, symbol_id: &str, score: f64) -> Option<SliceCard> {
    let sym = graph.symbols.get(symbol_id)?;
    let signature = sym
        .row
        .signature_json
        .as_deref()
        .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
        .and_then(|v| v.get("text").and_then(|t| t.as_str()).map(str::to_string));
    Some(SliceCard {
        symbol_id: symbol_id.to_string(),
        name: sym.row.name.clone(),
        kind: sym.row.kind.clone(),
        file: sym.rel_path.clone(),
        start_line: sym.row.start_line,
        end_line: sym.row.end_line,
        signature,
        exported: sym.row.exported,
        fan_in: graph.fan_in(symbol_id),
        fan_out: graph.fan_out(symbol_id),
        score,
        estimated_tokens: card_token_estimate(graph, symbol_id),
        etag: sym.row.ast_fingerprint.clone(),
    })
}

// ---------------------------------------------------------------------------
// Handles & leases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub handle: String,
    pub expires_at: u64,
}

pub fn issue_handle(
    storage: &Storage,
    repo_id: &str,
    version_id: &str,
    slice_hash: &str,
    ttl_secs: u64,
) -> Result<Lease> {
    let now = now_unix_ms();
    let rec = SliceHandleRecord {
        handle: random_handle(),
        repo_id: repo_id.to_string(),
        created_at: now,
        expires_at: now + ttl_secs * 1_000,
        min_version: version_id.to_string(),
        max_version: version_id.to_string(),
        slice_hash: slice_hash.to_string(),
        spillover_ref: None,
    };
    storage.insert_handle(&rec)?;
    Ok(Lease { handle: rec.handle, expires_at: rec.expires_at })
}

/// Validate a handle, sweeping expired rows as a side effect.
pub fn load_live_handle(storage: &Storage, handle: &str) -> Result<SliceHandleRecord> {
    let now = now_unix_ms();
    storage.sweep_expired_handles(now)?;
    let rec = storage
        .get_handle(handle)?
        .ok_or_else(|| SdlError::handle_expired(handle))?;
    if rec.expires_at < now {
        return Err(SdlError::handle_expired(handle));
    }
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adapter_set;
    use crate::config::Config;
    use crate::ids::RepoId;
    use crate::indexer::{refresh_repo, RefreshMode};

    fn demo_graph() -> (Storage, CodeGraph, String) {
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
        let graph = CodeGraph::load(&storage, "demo").unwrap();
        (storage, graph, report.version_id)
    }

    fn req(task: &str) -> SliceRequest {
        SliceRequest { task_text: task.to_string(), ..Default::default() }
    }

    #[test]
    fn tight_budget_slices_one_card_with_frontier() {
        let (_s, graph, version) = demo_graph();
        let budget = SliceBudget { max_cards: 1, max_estimated_tokens: 10_000 };
        let slice = build_slice(&graph, "demo", &version, &req("call g"), budget, &SliceConfig::default());

        assert_eq!(slice.cards.len(), 1);
        assert_eq!(slice.cards[0].symbol_id, "a.ts#g");
        assert!(slice.truncation.as_ref().unwrap().truncated);
        assert!(slice.frontier.iter().any(|f| f.symbol_id == "a.ts#f"));
    }

    #[test]
    fn budget_caps_are_respected() {
        let (_s, graph, version) = demo_graph();
        let budget = SliceBudget { max_cards: 10, max_estimated_tokens: 10_000 };
        let slice = build_slice(&graph, "demo", &version, &req("f g"), budget, &SliceConfig::default());
        assert!(slice.cards.len() <= budget.max_cards);
        let total: usize = slice.cards.iter().map(|c| c.estimated_tokens).sum();
        assert!(total <= budget.max_estimated_tokens);
        // Every card is a live symbol; every edge endpoint is a card or frontier entry.
        let card_ids: HashSet<&str> = slice.cards.iter().map(|c| c.symbol_id.as_str()).collect();
        let frontier_ids: HashSet<&str> =
            slice.frontier.iter().map(|f| f.symbol_id.as_str()).collect();
        for c in &slice.cards {
            assert!(graph.contains(&c.symbol_id));
        }
        for e in &slice.edges {
            assert!(card_ids.contains(e.from.as_str()));
            assert!(card_ids.contains(e.to.as_str()) || frontier_ids.contains(e.to.as_str()));
        }
    }

    #[test]
    fn deterministic_across_builds() {
        let (_s, graph, version) = demo_graph();
        let budget = SliceBudget { max_cards: 5, max_estimated_tokens: 5_000 };
        let a = build_slice(&graph, "demo", &version, &req("call g"), budget, &SliceConfig::default());
        let b = build_slice(&graph, "demo", &version, &req("call g"), budget, &SliceConfig::default());
        assert_eq!(a.slice_hash, b.slice_hash);
        let ids = |s: &GraphSlice| s.cards.iter().map(|c| c.symbol_id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn stack_trace_frames_seed_the_slice() {
        let (_s, graph, version) = demo_graph();
        let budget = SliceBudget { max_cards: 4, max_estimated_tokens: 8_000 };
        let request = SliceRequest {
            task_text: "investigate crash".into(),
            stack_trace: Some("    at f (a.ts:1:10)".into()),
            ..Default::default()
        };
        let slice = build_slice(&graph, "demo", &version, &request, budget, &SliceConfig::default());
        assert!(slice.start_symbols.contains(&"a.ts#f".to_string()));
    }

    #[test]
    fn exact_name_outranks_substring() {
        let toks = vec!["g".to_string()];
        let exact = query_overlap(&toks, "g", "a.ts");
        let substr = query_overlap(&toks, "gadget", "a.ts");
        assert!(exact > substr);
    }

    #[test]
    fn handles_expire() {
        let storage = Storage::open_in_memory().unwrap();
        let lease = issue_handle(&storage, "demo", "demo-v1", "hash", 3_600).unwrap();
        assert!(load_live_handle(&storage, &lease.handle).is_ok());
        assert_eq!(lease.handle.len(), 32);

        let expired = SliceHandleRecord {
            handle: random_handle(),
            repo_id: "demo".into(),
            created_at: 0,
            expires_at: 1,
            min_version: "demo-v1".into(),
            max_version: "demo-v1".into(),
            slice_hash: "h".into(),
            spillover_ref: None,
        };
        storage.insert_handle(&expired).unwrap();
        let err = load_live_handle(&storage, &expired.handle).unwrap_err();
        assert_eq!(err.code(), "handle-expired");
    }

    #[test]
    fn request_shape_hash_distinguishes_budgets() {
        let r = req("task");
        let a = request_shape_hash(&r, &SliceBudget { max_cards: 1, max_estimated_tokens: 100 });
        let b = request_shape_hash(&r, &SliceBudget { max_cards: 2, max_estimated_tokens: 100 });
        assert_ne!(a, b);
    }
}
