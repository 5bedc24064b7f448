use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::storage::{MetricsRow, Storage, SymbolRecord};

/// A collapsed edge in the in-memory view: parallel edges between the same
/// endpoints of the same type merge with summed weight.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub edge_type: String,
    pub weight: f64,
}

/// In-memory adjacency over one repo, loaded from storage on demand.
///
/// Adjacency lists are sorted by (neighbour id asc, type asc) at build time,
/// so iteration order is reproducible across loads. Each instance is an
/// internally consistent snapshot: it never observes a half-applied refresh.
pub struct CodeGraph {
    pub symbols: HashMap<String, SymbolRecord>,
    adjacency_out: HashMap<String, Vec<GraphEdge>>,
    adjacency_in: HashMap<String, Vec<GraphEdge>>,
    metrics: HashMap<String, MetricsRow>,
}

impl CodeGraph {
    pub fn load(storage: &Storage, repo_id: &str) -> Result<Self> {
        let symbols: HashMap<String, SymbolRecord> = storage
            .load_symbols(repo_id)?
            .into_iter()
            .map(|s| (s.row.symbol_id.clone(), s))
            .collect();

        // Collapse the stored multigraph.
        let mut merged: HashMap<(String, String, String), f64> = HashMap::new();
        for e in storage.load_edges(repo_id)? {
            *merged
                .entry((e.from_symbol_id, e.to_symbol_id, e.edge_type))
                .or_insert(0.0) += e.weight;
        }

        let mut adjacency_out: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        let mut adjacency_in: HashMap<String, Vec<GraphEdge>> = HashMap::new();
        for ((from, to, edge_type), weight) in merged {
            let edge = GraphEdge { from: from.clone(), to: to.clone(), edge_type, weight };
            adjacency_out.entry(from).or_default().push(edge.clone());
            adjacency_in.entry(to).or_default().push(edge);
        }
        for list in adjacency_out.values_mut() {
            list.sort_by(|a, b| a.to.cmp(&b.to).then_with(|| a.edge_type.cmp(&b.edge_type)));
        }
        for list in adjacency_in.values_mut() {
            list.sort_by(|a, b| a.from.cmp(&b.from).then_with(|| a.edge_type.cmp(&b.edge_type)));
        }

        let ids: Vec<String> = symbols.keys().cloned().collect();
        let metrics = storage.get_metrics(repo_id, &ids)?;

        Ok(Self { symbols, adjacency_out, adjacency_in, metrics })
    }

    pub fn contains(&self, symbol_id: &str) -> bool {
        self.symbols.contains_key(symbol_id)
    }

    pub fn out_edges(&self, symbol_id: &str) -> &[GraphEdge] {
        self.adjacency_out.get(symbol_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn in_edges(&self, symbol_id: &str) -> &[GraphEdge] {
        self.adjacency_in.get(symbol_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn fan_in(&self, symbol_id: &str) -> u32 {
        self.in_edges(symbol_id).len() as u32
    }

    pub fn fan_out(&self, symbol_id: &str) -> u32 {
        self.out_edges(symbol_id).len() as u32
    }

    pub fn churn_30d(&self, symbol_id: &str) -> u32 {
        self.metrics.get(symbol_id).map(|m| m.churn_30d).unwrap_or(0)
    }

    /// `0.5·norm_log(fan_in,100) + 0.3·norm_log(fan_out,50) + 0.2·norm_linear(churn,20)`,
    /// clamped to [0,1].
    pub fn hotness(&self, symbol_id: &str) -> f64 {
        let h = 0.5 * norm_log(self.fan_in(symbol_id), 100)
            + 0.3 * norm_log(self.fan_out(symbol_id), 50)
            + 0.2 * norm_linear(self.churn_30d(symbol_id), 20);
        h.clamp(0.0, 1.0)
    }

    /// Incremental-metrics support: symbols living in the changed files plus
    /// their one-hop neighbours. Only these rows get rewritten.
    pub fn affected_by_files(&self, changed_rel_paths: &HashSet<String>) -> HashSet<String> {
        let mut affected: HashSet<String> = HashSet::new();
        for (id, sym) in &self.symbols {
            if changed_rel_paths.contains(&sym.rel_path) {
                affected.insert(id.clone());
            }
        }
        let seeds: Vec<String> = affected.iter().cloned().collect();
        for id in seeds {
            for e in self.out_edges(&id) {
                if self.contains(&e.to) {
                    affected.insert(e.to.clone());
                }
            }
            for e in self.in_edges(&id) {
                if self.contains(&e.from) {
                    affected.insert(e.from.clone());
                }
            }
        }
        affected
    }

    /// Metrics rows for the given symbols, derived from the current adjacency
    /// (churn is preserved from the stored rows; it is supplied externally).
    pub fn metrics_rows(&self, ids: impl IntoIterator<Item = String>) -> Vec<MetricsRow> {
        ids.into_iter()
            .filter(|id| self.contains(id))
            .map(|id| MetricsRow {
                fan_in: self.fan_in(&id),
                fan_out: self.fan_out(&id),
                churn_30d: self.churn_30d(&id),
                test_refs_json: self.metrics.get(&id).and_then(|m| m.test_refs_json.clone()),
                symbol_id: id,
            })
            .collect()
    }
}

fn norm_log(value: u32, cap: u32) -> f64 {
    let v = (value as f64).min(cap as f64);
    (v + 1.0).ln() / (cap as f64 + 1.0).ln()
}

fn norm_linear(value: u32, cap: u32) -> f64 {
    (value as f64 / cap as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EdgeRow, FileIndexMutation, SymbolRow};

    fn sym(id: &str, name: &str) -> SymbolRow {
        SymbolRow {
            symbol_id: id.to_string(),
            kind: "function".into(),
            name: name.into(),
            exported: false,
            visibility: None,
            language: "typescript".into(),
            start_line: 0,
            start_col: 0,
            end_line: 0,
            end_col: 0,
            ast_fingerprint: format!("fp_{name}"),
            signature_json: None,
            summary: None,
            invariants_json: None,
            side_effects_json: None,
        }
    }

    fn edge(from: &str, to: &str) -> EdgeRow {
        EdgeRow {
            from_symbol_id: from.into(),
            to_symbol_id: to.into(),
            edge_type: "call".into(),
            weight: 1.0,
            provenance: "a.ts".into(),
        }
    }

    fn store_with_chain() -> Storage {
        let store = Storage::open_in_memory().unwrap();
        store.register_repo("demo", "/tmp/demo", "{}").unwrap();
        store
            .apply_file_index(&FileIndexMutation {
                repo_id: "demo",
                rel_path: "a.ts",
                content_hash: "h",
                language: "typescript",
                byte_size: 1,
                directory: "",
                symbols: &[sym("a.ts#f", "f"), sym("a.ts#g", "g"), sym("a.ts#h", "h")],
                removed_symbol_ids: &[],
                edges: &[edge("a.ts#f", "a.ts#g"), edge("a.ts#f", "a.ts#g"), edge("a.ts#h", "a.ts#f")],
            })
            .unwrap();
        store
    }

    #[test]
    fn parallel_edges_collapse_with_summed_weight() {
        let store = store_with_chain();
        let graph = CodeGraph::load(&store, "demo").unwrap();
        let out = graph.out_edges("a.ts#f");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].weight, 2.0);
        assert_eq!(graph.fan_in("a.ts#g"), 1);
        assert_eq!(graph.fan_in("a.ts#f"), 1);
    }

    #[test]
    fn adjacency_iteration_is_deterministic() {
        let store = store_with_chain();
        let a = CodeGraph::load(&store, "demo").unwrap();
        let b = CodeGraph::load(&store, "demo").unwrap();
        let order = |g: &CodeGraph| {
            g.out_edges("a.ts#f").iter().map(|e| e.to.clone()).collect::<Vec<_>>()
        };
        assert_eq!(order(&a), order(&b));
    }

    #[test]
    fn hotness_is_clamped_and_monotone_in_fan_in() {
        let store = store_with_chain();
        let graph = CodeGraph::load(&store, "demo").unwrap();
        let hot_g = graph.hotness("a.ts#g");
        let cold_h = graph.hotness("a.ts#h");
        assert!(hot_g > 0.0 && hot_g <= 1.0);
        assert!(cold_h < hot_g + 1.0);
    }

    #[test]
    fn affected_set_includes_one_hop_neighbours() {
        let store = store_with_chain();
        let graph = CodeGraph::load(&store, "demo").unwrap();
        let mut changed = HashSet::new();
        changed.insert("a.ts".to_string());
        let affected = graph.affected_by_files(&changed);
        assert!(affected.contains("a.ts#f"));
        assert!(affected.contains("a.ts#g"));
        assert!(affected.contains("a.ts#h"));
    }
}
