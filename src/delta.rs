use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::extract::estimate_tokens;
use crate::graph::CodeGraph;
use crate::paths::is_test_path;
use crate::slice::random_handle;
use crate::storage::{now_unix_ms, SliceHandleRecord, SnapshotRow, Storage};

/// Structured sub-diff for one modified symbol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDiff {
    pub symbol_id: String,
    pub signature_changed: bool,
    pub invariants_changed: bool,
    pub side_effects_changed: bool,
    pub interface_stable: bool,
    pub behavior_stable: bool,
    pub side_effects_stable: bool,
    pub risk_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<SymbolDiff>,
}

impl VersionDelta {
    pub fn changed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.added.clone();
        ids.extend(self.removed.iter().cloned());
        ids.extend(self.modified.iter().map(|m| m.symbol_id.clone()));
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Set-diff of two version snapshots; modifications are fingerprint changes.
pub fn compute_delta(
    storage: &Storage,
    from_version: &str,
    to_version: &str,
) -> Result<VersionDelta> {
    let sx: HashMap<String, SnapshotRow> = storage.snapshots_for_version(from_version)?;
    let sy: HashMap<String, SnapshotRow> = storage.snapshots_for_version(to_version)?;

    let mut added: Vec<String> = sy.keys().filter(|k| !sx.contains_key(*k)).cloned().collect();
    let mut removed: Vec<String> = sx.keys().filter(|k| !sy.contains_key(*k)).cloned().collect();
    added.sort();
    removed.sort();

    let mut modified: Vec<SymbolDiff> = Vec::new();
    for (id, old) in &sx {
        let Some(new) = sy.get(id) else { continue };
        if old.ast_fingerprint == new.ast_fingerprint {
            continue;
        }
        let signature_changed = old.signature_json != new.signature_json;
        let invariants_changed = old.invariants_json != new.invariants_json;
        let side_effects_changed = old.side_effects_json != new.side_effects_json;

        let mut risk: f64 = 0.3; // fingerprint moved: behavior is already suspect
        if signature_changed {
            risk += 0.4;
        }
        if invariants_changed {
            risk += 0.15;
        }
        if side_effects_changed {
            risk += 0.15;
        }
        modified.push(SymbolDiff {
            symbol_id: id.clone(),
            signature_changed,
            invariants_changed,
            side_effects_changed,
            interface_stable: !signature_changed,
            behavior_stable: false,
            side_effects_stable: !side_effects_changed,
            risk_score: risk.clamp(0.0, 1.0),
        });
    }
    modified.sort_by(|a, b| a.symbol_id.cmp(&b.symbol_id));

    Ok(VersionDelta { added, removed, modified })
}

// ---------------------------------------------------------------------------
// Blast radius
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlastSignal {
    Diagnostic,
    DirectDependent,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Must,
    Should,
    Optional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastItem {
    pub symbol_id: String,
    /// 1-based hop count from the nearest changed symbol.
    pub distance: u32,
    pub rank: f64,
    pub signal: BlastSignal,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_short: Option<String>,
}

/// Reverse-dependency walk from the change set.
///
/// Ring 1 takes both in- and out-neighbours of the seeds (a new symbol's
/// callees are inside its impact surface); rings ≥2 follow reverse
/// dependencies only. Missing seeds are warned and skipped.
pub fn compute_blast_radius(
    graph: &CodeGraph,
    changed: &[String],
    max_hops: u32,
) -> (Vec<BlastItem>, Vec<String>) {
    let mut warnings = Vec::new();
    if max_hops == 0 || changed.is_empty() {
        return (Vec::new(), warnings);
    }

    let mut seeds: Vec<&String> = Vec::new();
    for id in changed {
        if graph.contains(id) {
            seeds.push(id);
        } else {
            warnings.push(format!("changed symbol `{id}` is not in the graph (removed?)"));
        }
    }

    let seed_set: HashSet<&str> = seeds.iter().map(|s| s.as_str()).collect();
    let mut visited: HashSet<String> = seeds.iter().map(|s| s.to_string()).collect();
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();

    for seed in &seeds {
        for e in graph.in_edges(seed) {
            enqueue(graph, &mut visited, &mut queue, &e.from, 1);
        }
        for e in graph.out_edges(seed) {
            enqueue(graph, &mut visited, &mut queue, &e.to, 1);
        }
    }

    let mut items: Vec<BlastItem> = Vec::new();
    while let Some((id, d)) = queue.pop_front() {
        if !seed_set.contains(id.as_str()) {
            items.push(make_item(graph, &id, d, max_hops));
        }
        if d < max_hops {
            for e in graph.in_edges(&id) {
                enqueue(graph, &mut visited, &mut queue, &e.from, d + 1);
            }
        }
    }

    items.sort_by(|a, b| {
        b.rank.total_cmp(&a.rank).then_with(|| a.symbol_id.cmp(&b.symbol_id))
    });
    (items, warnings)
}

fn enqueue(
    graph: &CodeGraph,
    visited: &mut HashSet<String>,
    queue: &mut VecDeque<(String, u32)>,
    id: &str,
    d: u32,
) {
    if !graph.contains(id) {
        return; // unresolved sentinels stay out of the radius
    }
    if visited.insert(id.to_string()) {
        queue.push_back((id.to_string(), d));
    }
}

fn make_item(graph: &CodeGraph, id: &str, d: u32, max_hops: u32) -> BlastItem {
    let normalized_distance = 1.0 - (d.saturating_sub(1) as f64 / max_hops as f64);
    let fan_in = graph.fan_in(id);
    let normalized_fan_in = ((fan_in as f64) + 1.0).ln() / 101f64.ln();
    let test_proximity = graph
        .symbols
        .get(id)
        .map(|s| if is_test_path(&s.rel_path) { 1.0 } else { 0.0 })
        .unwrap_or(0.0);
    let rank = (0.6 * normalized_distance + 0.3 * normalized_fan_in + 0.1 * test_proximity)
        .clamp(0.0, 1.0);
    BlastItem {
        symbol_id: id.to_string(),
        distance: d,
        rank,
        signal: if d == 1 { BlastSignal::DirectDependent } else { BlastSignal::Graph },
        priority: match d {
            1 => Priority::Must,
            2 => Priority::Should,
            _ => Priority::Optional,
        },
        code: None,
        message_short: None,
    }
}

// ---------------------------------------------------------------------------
// Diagnostics merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSuspect {
    pub symbol_id: String,
    pub code: String,
    pub message_short: String,
}

/// External diagnostics producer, consulted under a caller-supplied deadline.
pub trait DiagnosticsProducer: Send + Sync {
    fn suspects(&self, repo_id: &str, from_version: &str, to_version: &str)
        -> Vec<DiagnosticSuspect>;
}

/// Diagnostic suspects go to the front with rank 1.0, deduplicating against
/// graph-discovered items (the diagnostic signal wins).
pub fn merge_diagnostics(items: Vec<BlastItem>, suspects: Vec<DiagnosticSuspect>) -> Vec<BlastItem> {
    let mut merged: Vec<BlastItem> = Vec::with_capacity(items.len() + suspects.len());
    let mut seen: HashSet<String> = HashSet::new();
    for s in suspects {
        if !seen.insert(s.symbol_id.clone()) {
            continue;
        }
        merged.push(BlastItem {
            symbol_id: s.symbol_id,
            distance: 0,
            rank: 1.0,
            signal: BlastSignal::Diagnostic,
            priority: Priority::Must,
            code: Some(s.code),
            message_short: Some(s.message_short),
        });
    }
    for item in items {
        if seen.contains(&item.symbol_id) {
            continue;
        }
        merged.push(item);
    }
    merged
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorBudget {
    pub max_cards: usize,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernorCut {
    pub kept: Vec<BlastItem>,
    pub dropped: Vec<BlastItem>,
}

fn item_token_estimate(item: &BlastItem) -> usize {
    let chars = item.symbol_id.len()
        + item.message_short.as_deref().map(str::len).unwrap_or(0)
        + 64;
    estimate_tokens(chars)
}

/// Priority-tiered greedy cut: `must > should > optional`, rank-ordered
/// within a tier; keep while the card and token budgets both hold.
pub fn governor_cut(items: Vec<BlastItem>, budget: GovernorBudget) -> GovernorCut {
    let mut ordered = items;
    ordered.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.rank.total_cmp(&a.rank))
            .then_with(|| a.symbol_id.cmp(&b.symbol_id))
    });

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut tokens_used = 0usize;
    for item in ordered {
        let est = item_token_estimate(&item);
        if kept.len() < budget.max_cards && tokens_used + est <= budget.max_tokens {
            tokens_used += est;
            kept.push(item);
        } else {
            dropped.push(item);
        }
    }
    GovernorCut { kept, dropped }
}

// ---------------------------------------------------------------------------
// Delta pack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPack {
    pub repo_id: String,
    pub from_version: String,
    pub to_version: String,
    pub changed_symbols: VersionDelta,
    pub blast_radius: Vec<BlastItem>,
    pub trimmed: bool,
    pub dropped_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spillover_handle: Option<String>,
    pub warnings: Vec<String>,
    pub diagnostics_timed_out: bool,
}

/// Assemble the full pack: delta, blast radius, diagnostic merge, budget cut,
/// spillover persistence.
#[allow(clippy::too_many_arguments)]
pub fn build_delta_pack(
    storage: &Storage,
    graph: &CodeGraph,
    repo_id: &str,
    from_version: &str,
    to_version: &str,
    max_hops: u32,
    budget: GovernorBudget,
    suspects: Option<Vec<DiagnosticSuspect>>,
    diagnostics_timed_out: bool,
    handle_ttl_secs: u64,
) -> Result<DeltaPack> {
    let changed_symbols = compute_delta(storage, from_version, to_version)?;
    let (radius, warnings) =
        compute_blast_radius(graph, &changed_symbols.changed_ids(), max_hops);
    let merged = match suspects {
        Some(s) => merge_diagnostics(radius, s),
        None => radius,
    };
    let cut = governor_cut(merged, budget);

    let spillover_handle = if cut.dropped.is_empty() {
        None
    } else {
        let handle = random_handle();
        let items_json: Vec<String> = cut
            .dropped
            .iter()
            .filter_map(|i| serde_json::to_string(i).ok())
            .collect();
        storage.insert_spillover(&handle, &items_json)?;
        let now = now_unix_ms();
        storage.insert_handle(&SliceHandleRecord {
            handle: handle.clone(),
            repo_id: repo_id.to_string(),
            created_at: now,
            expires_at: now + handle_ttl_secs * 1_000,
            min_version: from_version.to_string(),
            max_version: to_version.to_string(),
            slice_hash: String::new(),
            spillover_ref: Some(handle.clone()),
        })?;
        Some(handle)
    };

    let dropped_count = cut.dropped.len();
    Ok(DeltaPack {
        repo_id: repo_id.to_string(),
        from_version: from_version.to_string(),
        to_version: to_version.to_string(),
        changed_symbols,
        blast_radius: cut.kept,
        trimmed: dropped_count > 0,
        dropped_count,
        spillover_handle,
        warnings,
        diagnostics_timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adapter_set;
    use crate::config::Config;
    use crate::ids::RepoId;
    use crate::indexer::{refresh_repo, RefreshMode};

    fn snap(id: &str, fp: &str) -> SnapshotRow {
        SnapshotRow {
            symbol_id: id.to_string(),
            ast_fingerprint: fp.to_string(),
            signature_json: None,
            summary: None,
            invariants_json: None,
            side_effects_json: None,
        }
    }

    #[test]
    fn delta_classifies_added_removed_modified() {
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", "/tmp/demo", "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();
        let v1 = crate::ledger::finalize_version(
            &storage,
            &repo,
            None,
            vec![snap("a", "1"), snap("b", "2")],
        )
        .unwrap();
        let v2 = crate::ledger::finalize_version(
            &storage,
            &repo,
            None,
            vec![snap("b", "9"), snap("c", "3")],
        )
        .unwrap();

        let delta = compute_delta(&storage, &v1.version_id, &v2.version_id).unwrap();
        assert_eq!(delta.added, vec!["c"]);
        assert_eq!(delta.removed, vec!["a"]);
        assert_eq!(delta.modified.len(), 1);
        let m = &delta.modified[0];
        assert_eq!(m.symbol_id, "b");
        assert!(!m.behavior_stable);
        assert!(m.risk_score > 0.0 && m.risk_score <= 1.0);
    }

    fn scenario_graph() -> (Storage, CodeGraph, String, String) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "export function f(){ g(); }\nfunction g(){}\n")
            .unwrap();
        let storage = Storage::open_in_memory().unwrap();
        storage.register_repo("demo", &dir.path().to_string_lossy(), "{}").unwrap();
        let repo = RepoId::new("demo").unwrap();
        let cfg = Config::default();
        let r1 = refresh_repo(&storage, adapter_set(), &cfg, &repo, RefreshMode::Full, None).unwrap();

        std::fs::write(
            dir.path().join("a.ts"),
            "export function f(){ g(); }\nfunction g(){}\nfunction h(){ f(); }\n",
        )
        .unwrap();
        let r2 = refresh_repo(&storage, adapter_set(), &cfg, &repo, RefreshMode::Incremental, None)
            .unwrap();
        let graph = CodeGraph::load(&storage, "demo").unwrap();
        (storage, graph, r1.version_id, r2.version_id)
    }

    #[test]
    fn added_caller_pulls_callee_into_blast_radius() {
        let (storage, graph, v1, v2) = scenario_graph();
        let delta = compute_delta(&storage, &v1, &v2).unwrap();
        assert_eq!(delta.added, vec!["a.ts#h"]);
        assert!(delta.modified.is_empty());

        let (items, warnings) = compute_blast_radius(&graph, &delta.changed_ids(), 3);
        assert!(warnings.is_empty());
        let f = items.iter().find(|i| i.symbol_id == "a.ts#f").unwrap();
        assert_eq!(f.distance, 1);
        assert_eq!(f.signal, BlastSignal::DirectDependent);
    }

    #[test]
    fn zero_hops_and_empty_changeset_yield_empty() {
        let (_s, graph, _v1, _v2) = scenario_graph();
        assert!(compute_blast_radius(&graph, &["a.ts#f".to_string()], 0).0.is_empty());
        assert!(compute_blast_radius(&graph, &[], 3).0.is_empty());
    }

    #[test]
    fn missing_seeds_are_warned_not_fatal() {
        let (_s, graph, _v1, _v2) = scenario_graph();
        let (items, warnings) =
            compute_blast_radius(&graph, &["a.ts#gone".to_string(), "a.ts#h".to_string()], 3);
        assert_eq!(warnings.len(), 1);
        assert!(!items.is_empty());
    }

    #[test]
    fn radius_grows_monotonically_with_hops() {
        let (_s, graph, _v1, _v2) = scenario_graph();
        let changed = vec!["a.ts#h".to_string()];
        let small: HashSet<String> = compute_blast_radius(&graph, &changed, 1)
            .0
            .into_iter()
            .map(|i| i.symbol_id)
            .collect();
        let large: HashSet<String> = compute_blast_radius(&graph, &changed, 3)
            .0
            .into_iter()
            .map(|i| i.symbol_id)
            .collect();
        assert!(small.is_subset(&large));
    }

    #[test]
    fn diagnostics_lead_and_deduplicate() {
        let items = vec![BlastItem {
            symbol_id: "a.ts#f".into(),
            distance: 1,
            rank: 0.7,
            signal: BlastSignal::DirectDependent,
            priority: Priority::Must,
            code: None,
            message_short: None,
        }];
        let merged = merge_diagnostics(
            items,
            vec![DiagnosticSuspect {
                symbol_id: "a.ts#f".into(),
                code: "TS2345".into(),
                message_short: "type mismatch".into(),
            }],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].signal, BlastSignal::Diagnostic);
        assert_eq!(merged[0].rank, 1.0);
    }

    #[test]
    fn governor_respects_card_budget_and_spills_over() {
        let (storage, graph, v1, v2) = scenario_graph();
        let pack = build_delta_pack(
            &storage,
            &graph,
            "demo",
            &v1,
            &v2,
            3,
            GovernorBudget { max_cards: 0, max_tokens: 10_000 },
            None,
            false,
            3_600,
        )
        .unwrap();
        assert!(pack.trimmed);
        assert!(pack.blast_radius.is_empty());
        let handle = pack.spillover_handle.unwrap();
        assert_eq!(handle.len(), 32);
        let (page, _) = storage.get_spillover_page(&handle, 0, 10).unwrap();
        assert_eq!(page.len(), pack.dropped_count);
    }

    #[test]
    fn governor_orders_must_before_optional() {
        let mk = |id: &str, p: Priority, rank: f64| BlastItem {
            symbol_id: id.into(),
            distance: 3,
            rank,
            signal: BlastSignal::Graph,
            priority: p,
            code: None,
            message_short: None,
        };
        let cut = governor_cut(
            vec![
                mk("opt-high", Priority::Optional, 0.99),
                mk("must-low", Priority::Must, 0.1),
            ],
            GovernorBudget { max_cards: 1, max_tokens: 10_000 },
        );
        assert_eq!(cut.kept[0].symbol_id, "must-low");
        assert_eq!(cut.dropped[0].symbol_id, "opt-high");
    }
}
