use lru::LruCache;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};
use tree_sitter::Node;

use crate::adapters::support::{node_text, walk_tree};
use crate::adapters::{sha256_hex, AdapterSet};

/// Tokens are estimated as `ceil(chars/4)` unless an adapter supplies a
/// smarter tokeniser (none of the bundled ones do).
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(4)
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractBudget {
    pub max_lines: usize,
    pub max_tokens: usize,
}

impl Default for ExtractBudget {
    fn default() -> Self {
        Self { max_lines: 200, max_tokens: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Excerpt {
    pub text: String,
    pub start_line: u32,
    pub end_line: u32,
    pub truncated: bool,
}

/// All extractors refuse oversized files with a logged null result rather
/// than an error.
pub fn file_within_cap(rel_path: &str, byte_len: u64, cap: u64) -> bool {
    if byte_len > cap {
        crate::debug_log!("[symledger] {rel_path}: {byte_len} bytes over extractor cap {cap}, refused");
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Raw windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Symbol,
    Block,
    FileWindow,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "symbol" => Self::Symbol,
            "block" => Self::Block,
            "fileWindow" => Self::FileWindow,
            _ => return None,
        })
    }
}

/// Raw slice of the file around `[start_line, end_line]` (0-indexed,
/// inclusive). `Block` expands to the nearest enclosing brace balance;
/// `FileWindow` centres the budget on the range.
pub fn window(
    source: &str,
    start_line: u32,
    end_line: u32,
    granularity: Granularity,
    budget: ExtractBudget,
) -> Excerpt {
    let lines: Vec<&str> = source.lines().collect();
    let total = lines.len();
    if total == 0 {
        return Excerpt { text: String::new(), start_line: 0, end_line: 0, truncated: false };
    }

    let (mut lo, mut hi) = match granularity {
        Granularity::Symbol => (start_line as usize, (end_line as usize).min(total - 1)),
        Granularity::Block => expand_to_brace_balance(&lines, start_line as usize, end_line as usize),
        Granularity::FileWindow => {
            let centre = ((start_line + end_line) / 2) as usize;
            let half = budget.max_lines / 2;
            (centre.saturating_sub(half), (centre + half).min(total - 1))
        }
    };
    if hi >= total {
        hi = total - 1;
    }
    if lo > hi {
        lo = hi;
    }

    render_lines(&lines, lo, hi, budget)
}

fn render_lines(lines: &[&str], lo: usize, hi: usize, budget: ExtractBudget) -> Excerpt {
    let mut out = String::new();
    let mut truncated = false;
    let mut last = lo;
    for (count, idx) in (lo..=hi).enumerate() {
        let line = lines[idx];
        let would = out.len() + line.len() + 1;
        if count >= budget.max_lines || estimate_tokens(would) > budget.max_tokens {
            truncated = true;
            break;
        }
        out.push_str(line);
        out.push('\n');
        last = idx;
    }
    Excerpt { text: out, start_line: lo as u32, end_line: last as u32, truncated }
}

/// Walk outward until `{`/`}` counts balance (or the file boundary).
fn expand_to_brace_balance(lines: &[&str], start: usize, end: usize) -> (usize, usize) {
    let balance = |lo: usize, hi: usize| -> i64 {
        let mut n = 0i64;
        for line in lines.iter().take(hi + 1).skip(lo) {
            for ch in line.chars() {
                match ch {
                    '{' => n += 1,
                    '}' => n -= 1,
                    _ => {}
                }
            }
        }
        n
    };
    let mut lo = start.min(lines.len().saturating_sub(1));
    let mut hi = end.min(lines.len().saturating_sub(1));

    // A window with no braces at all first grows upward to reach the
    // enclosing block opener.
    let has_brace = |lo: usize, hi: usize| {
        lines[lo..=hi].iter().any(|l| l.contains('{') || l.contains('}'))
    };
    while !has_brace(lo, hi) && lo > 0 {
        lo -= 1;
    }

    let mut guard = 0;
    while balance(lo, hi) != 0 && guard < 400 {
        guard += 1;
        if balance(lo, hi) > 0 && hi + 1 < lines.len() {
            hi += 1;
        } else if lo > 0 {
            lo -= 1;
        } else if hi + 1 < lines.len() {
            hi += 1;
        } else {
            break;
        }
    }
    (lo, hi)
}

// ---------------------------------------------------------------------------
// Skeleton
// ---------------------------------------------------------------------------

const ELISION: &str = "/* … */";

/// Statement kinds whose scaffolding stays legible in a skeleton.
const CONTROL_KINDS: &[&str] = &[
    // TS / JS
    "if_statement",
    "else_clause",
    "for_statement",
    "for_in_statement",
    "while_statement",
    "do_statement",
    "switch_statement",
    "switch_case",
    "try_statement",
    "catch_clause",
    "finally_clause",
    "return_statement",
    "throw_statement",
    // Rust
    "if_expression",
    "match_expression",
    "match_arm",
    "for_expression",
    "while_expression",
    "loop_expression",
    "return_expression",
    // Python
    "elif_clause",
    "except_clause",
    "raise_statement",
];

const DECL_KINDS: &[&str] = &[
    "function_declaration",
    "generator_function_declaration",
    "class_declaration",
    "abstract_class_declaration",
    "method_definition",
    "interface_declaration",
    "type_alias_declaration",
    "enum_declaration",
    "lexical_declaration",
    "variable_declaration",
    "import_statement",
    "export_statement",
    "function_item",
    "struct_item",
    "enum_item",
    "trait_item",
    "impl_item",
    "type_item",
    "const_item",
    "static_item",
    "mod_item",
    "use_declaration",
    "function_definition",
    "class_definition",
    "decorated_definition",
    "import_from_statement",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Skeleton {
    pub text: String,
    pub start_line: u32,
    pub end_line: u32,
    pub truncated: bool,
}

/// Shape-preserving view: declarations/imports/signatures plus control-flow
/// scaffolding kept, everything else elided down to sentinel lines.
///
/// Falls back to the regex skeleton for unsupported languages, `None` when
/// even that finds no structure worth keeping.
pub fn render_skeleton(
    adapters: &AdapterSet,
    rel_path: &str,
    source: &str,
    range: Option<(u32, u32)>,
    exported_only: bool,
    budget: ExtractBudget,
) -> Option<Skeleton> {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return None;
    }

    let Some(adapter) = adapters.adapter_for_path(rel_path) else {
        let text = render_universal_skeleton(source);
        return Some(Skeleton {
            start_line: 0,
            end_line: lines.len().saturating_sub(1) as u32,
            truncated: text.ends_with("...\n"),
            text,
        });
    };
    let tree = adapter.parse(source, rel_path)?;
    let src = source.as_bytes();

    // Mark the lines worth keeping.
    let mut keep: BTreeSet<usize> = BTreeSet::new();
    let mut visit = |node: Node| {
        let kind = node.kind();
        let row = node.start_position().row;
        // `const`/`let` statements inside bodies parse as declarations too;
        // only the module-scope ones belong to the skeleton surface.
        if matches!(kind, "lexical_declaration" | "variable_declaration")
            && !node
                .parent()
                .map(|p| matches!(p.kind(), "program" | "export_statement" | "source_file" | "module"))
                .unwrap_or(true)
        {
            return;
        }
        if DECL_KINDS.contains(&kind) {
            if exported_only && !decl_is_exported(node, src) {
                return;
            }
            // Declaration header: everything before the body.
            let body_row = node
                .child_by_field_name("body")
                .map(|b| b.start_position().row)
                .unwrap_or(row);
            for r in row..=body_row.max(row) {
                keep.insert(r);
            }
            keep.insert(node.end_position().row);
        } else if CONTROL_KINDS.contains(&kind) {
            keep.insert(row);
        }
    };
    walk_tree(tree.root_node(), &mut visit);

    let (lo, hi) = match range {
        Some((s, e)) => (s as usize, (e as usize).min(lines.len() - 1)),
        None => (0, lines.len() - 1),
    };
    keep.retain(|r| *r >= lo && *r <= hi);
    if keep.is_empty() {
        return None;
    }

    let mut out = String::new();
    let mut truncated = false;
    let mut emitted = 0usize;
    let mut prev: Option<usize> = None;
    for &row in &keep {
        if emitted >= budget.max_lines || estimate_tokens(out.len() + 80) > budget.max_tokens {
            truncated = true;
            break;
        }
        if let Some(p) = prev {
            if row > p + 1 {
                let indent = leading_ws(lines[row]);
                out.push_str(&format!("{indent}{ELISION}\n"));
            }
        }
        out.push_str(lines[row].trim_end());
        out.push('\n');
        emitted += 1;
        prev = Some(row);
    }

    Some(Skeleton { text: out, start_line: lo as u32, end_line: hi as u32, truncated })
}

fn decl_is_exported(node: Node, src: &[u8]) -> bool {
    if node.kind() == "export_statement" {
        return true;
    }
    if node.parent().map(|p| p.kind() == "export_statement").unwrap_or(false) {
        return true;
    }
    // Rust pub, Python non-underscore.
    if let Some(first) = node.child(0) {
        if first.kind() == "visibility_modifier" {
            return true;
        }
    }
    if let Some(name) = node.child_by_field_name("name") {
        let n = node_text(src, name);
        if !n.is_empty() && !n.starts_with('_') && node.kind().ends_with("_definition") {
            return true;
        }
    }
    false
}

fn leading_ws(line: &str) -> &str {
    let end = line.len() - line.trim_start().len();
    &line[..end]
}

// ---------------------------------------------------------------------------
// Skeleton IR
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IrOp {
    pub op: &'static str,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkeletonIr {
    pub ops: Vec<IrOp>,
    pub ir_hash: String,
    pub truncated: bool,
}

/// Structured op stream over a symbol's subtree. The SHA-256 of the
/// serialised stream is a stable IR hash: line numbers are emitted relative
/// to the symbol start, so moving the symbol does not move the hash.
pub fn skeleton_ir(
    adapters: &AdapterSet,
    rel_path: &str,
    source: &str,
    range: (u32, u32),
    budget: ExtractBudget,
) -> Option<SkeletonIr> {
    let adapter = adapters.adapter_for_path(rel_path)?;
    let tree = adapter.parse(source, rel_path)?;
    let src = source.as_bytes();
    let (lo, hi) = range;

    let mut ops: Vec<IrOp> = Vec::new();
    let mut visit = |node: Node| {
        let row = node.start_position().row as u32;
        if row < lo || row > hi {
            return;
        }
        let rel_line = row - lo;
        match node.kind() {
            "call_expression" | "call" | "new_expression" | "macro_invocation" => {
                let callee = node
                    .child_by_field_name("function")
                    .or_else(|| node.child_by_field_name("constructor"))
                    .map(|n| last_identifier_text(src, n))
                    .unwrap_or_default();
                ops.push(IrOp { op: "call", line: rel_line, detail: Some(callee) });
            }
            "if_statement" | "if_expression" | "match_expression" | "switch_statement" => {
                ops.push(IrOp { op: "if", line: rel_line, detail: None });
            }
            "try_statement" => ops.push(IrOp { op: "try", line: rel_line, detail: None }),
            "return_statement" | "return_expression" => {
                ops.push(IrOp { op: "return", line: rel_line, detail: None })
            }
            "throw_statement" | "raise_statement" => {
                ops.push(IrOp { op: "throw", line: rel_line, detail: None })
            }
            "assignment_expression" | "augmented_assignment_expression" | "assignment"
            | "augmented_assignment" => {
                ops.push(IrOp { op: "sideEffect", line: rel_line, detail: None })
            }
            _ => {}
        }
    };
    walk_tree(tree.root_node(), &mut visit);

    let mut truncated = false;
    if ops.len() > budget.max_lines {
        let cut_line = ops[budget.max_lines].line;
        ops.truncate(budget.max_lines);
        ops.push(IrOp { op: "elision", line: cut_line, detail: None });
        truncated = true;
    }

    let serialized = serde_json::to_string(&ops).unwrap_or_default();
    Some(SkeletonIr { ir_hash: sha256_hex(serialized.as_bytes()), ops, truncated })
}

fn last_identifier_text(src: &[u8], node: Node) -> String {
    let mut last = String::new();
    let mut visit = |n: Node| {
        if matches!(
            n.kind(),
            "identifier" | "field_identifier" | "property_identifier" | "type_identifier"
        ) && last.is_empty()
        {
            last = node_text(src, n).to_string();
        }
    };
    // First identifier in callee position reads as the call target for
    // plain calls; member chains fall back to the chain head, which is
    // still a stable anchor for hashing.
    walk_tree(node, &mut visit);
    last
}

// ---------------------------------------------------------------------------
// Hot-path
// ---------------------------------------------------------------------------

/// Per-call compiled matcher, memoized under a bounded cache keyed by the
/// sorted identifier set. No shared mutable match state between calls.
pub struct HotPathMatchers {
    cache: Mutex<LruCache<String, Arc<Regex>>>,
}

impl HotPathMatchers {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    fn matcher(&self, identifiers: &[String]) -> Option<Arc<Regex>> {
        let mut sorted: Vec<&str> = identifiers.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let key = sorted.join("\x1f");
        let mut cache = self.cache.lock().unwrap();
        if let Some(re) = cache.get(&key) {
            return Some(re.clone());
        }
        let escaped: Vec<String> = sorted.iter().map(|s| regex::escape(s)).collect();
        let re = Regex::new(&format!(r"\b({})\b", escaped.join("|"))).ok()?;
        let re = Arc::new(re);
        cache.put(key, re.clone());
        Some(re)
    }
}

pub fn hotpath_matchers() -> &'static HotPathMatchers {
    static M: OnceLock<HotPathMatchers> = OnceLock::new();
    M.get_or_init(|| HotPathMatchers::new(32))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HotPath {
    pub excerpt: String,
    pub matched_identifiers: Vec<String>,
    /// 1-indexed line numbers of the matched lines.
    pub matched_lines: Vec<u32>,
    pub truncated: bool,
}

/// Lines of the symbol's body mentioning any identifier in the set: exact
/// name on identifier nodes, any component of member chains, the constructor
/// in `throw new X`. Emitted with ± `context_lines` of context.
pub fn hot_path(
    adapters: &AdapterSet,
    matchers: &HotPathMatchers,
    rel_path: &str,
    source: &str,
    range: (u32, u32),
    identifiers: &[String],
    context_lines: u32,
    budget: ExtractBudget,
) -> HotPath {
    let (lo, hi) = range;
    let lines: Vec<&str> = source.lines().collect();
    let ident_set: BTreeSet<&str> = identifiers.iter().map(String::as_str).collect();

    let mut matched_rows: BTreeSet<u32> = BTreeSet::new();
    let mut matched_ids: BTreeSet<String> = BTreeSet::new();

    let parsed = adapters
        .adapter_for_path(rel_path)
        .and_then(|a| a.parse(source, rel_path));

    if let Some(tree) = parsed {
        let src = source.as_bytes();
        let mut visit = |node: Node| {
            let kind = node.kind();
            if kind.contains("comment") || kind.contains("string") {
                return;
            }
            if !matches!(
                kind,
                "identifier"
                    | "type_identifier"
                    | "field_identifier"
                    | "property_identifier"
                    | "shorthand_property_identifier"
            ) {
                return;
            }
            let row = node.start_position().row as u32;
            if row < lo || row > hi {
                return;
            }
            let text = node_text(src, node);
            if ident_set.contains(text) {
                matched_rows.insert(row);
                matched_ids.insert(text.to_string());
            }
        };
        walk_tree(tree.root_node(), &mut visit);
    } else if let Some(re) = matchers.matcher(identifiers) {
        // Regex fallback for unsupported languages.
        for (idx, line) in lines.iter().enumerate() {
            let row = idx as u32;
            if row < lo || row > hi {
                continue;
            }
            for cap in re.captures_iter(line) {
                matched_rows.insert(row);
                matched_ids.insert(cap[1].to_string());
            }
        }
    }

    // Merge ± context windows. Matches stay inside the symbol range, but
    // context may spill past it (a one-line body still gets neighbours).
    let mut emit: BTreeSet<u32> = BTreeSet::new();
    for &row in &matched_rows {
        let from = row.saturating_sub(context_lines);
        let to = (row + context_lines).min(lines.len().saturating_sub(1) as u32);
        for r in from..=to {
            emit.insert(r);
        }
    }

    let mut excerpt = String::new();
    let mut truncated = false;
    let mut emitted = 0usize;
    let mut prev: Option<u32> = None;
    for &row in &emit {
        if emitted >= budget.max_lines || estimate_tokens(excerpt.len() + 80) > budget.max_tokens {
            truncated = true;
            break;
        }
        if let Some(p) = prev {
            if row > p + 1 {
                excerpt.push_str(ELISION);
                excerpt.push('\n');
            }
        }
        excerpt.push_str(lines[row as usize].trim_end());
        excerpt.push('\n');
        emitted += 1;
        prev = Some(row);
    }

    HotPath {
        excerpt,
        matched_identifiers: matched_ids.into_iter().collect(),
        matched_lines: matched_rows.into_iter().map(|r| r + 1).collect(),
        truncated,
    }
}

// ---------------------------------------------------------------------------
// Regex-based universal skeleton (unsupported languages)
// ---------------------------------------------------------------------------

fn contains_todo_fixme(s: &str) -> bool {
    let up = s.to_ascii_uppercase();
    up.contains("TODO") || up.contains("FIXME")
}

fn def_regexes() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        vec![
            // Ruby/Swift/Kotlin-ish: class Foo, def bar, func baz, struct X, enum Y, interface Z
            Regex::new(r"^\s*(function|class|def|func|struct|interface|enum)\s+([a-zA-Z0-9_]+)").unwrap(),
            // Kotlin: public/private/protected static fn/var/val name
            Regex::new(r"^\s*(?:public|private|protected)?\s*(?:static\s*)?(?:fn|var|val)\s+([a-zA-Z0-9_]+)").unwrap(),
            // Swift with modifiers: public/private/protected static func name
            Regex::new(r"^\s*(?:public|private|protected)?\s*(?:static\s*)?func\s+([a-zA-Z0-9_]+)").unwrap(),
        ]
    })
}

fn is_definition_line(line: &str) -> bool {
    // Cheap prefilter to avoid regex cost on most lines.
    let t = line.trim_start();
    if t.is_empty() {
        return false;
    }

    if contains_todo_fixme(t) {
        return true;
    }

    if !(t.starts_with("function")
        || t.starts_with("class")
        || t.starts_with("def")
        || t.starts_with("func")
        || t.starts_with("struct")
        || t.starts_with("interface")
        || t.starts_with("enum")
        || t.starts_with("public")
        || t.starts_with("private")
        || t.starts_with("protected")
        || t.starts_with("static")
        || t.starts_with("fn")
        || t.starts_with("var")
        || t.starts_with("val"))
    {
        return false;
    }

    def_regexes().iter().any(|re| re.is_match(line))
}

/// Regex-based skeleton extraction for unsupported languages.
///
/// Output is line-based: definition-ish lines are kept, gaps are collapsed to
/// a single `...` line.
pub fn render_universal_skeleton(source_text: &str) -> String {
    let max_kept_lines: usize = 600;

    let mut out = String::new();
    let mut last_kept_line: Option<usize> = None;
    let mut kept: usize = 0;

    for (idx, line) in source_text.lines().enumerate() {
        if kept >= max_kept_lines {
            out.push_str("...\n");
            break;
        }

        if !is_definition_line(line) {
            continue;
        }

        if let Some(prev) = last_kept_line {
            if idx > prev + 1 {
                out.push_str("...\n");
            }
        }

        out.push_str(line.trim());
        out.push('\n');
        last_kept_line = Some(idx);
        kept += 1;
    }

    if out.trim().is_empty() {
        // If no structure was found, return a small head snippet (still better than full file).
        let head: String = source_text
            .lines()
            .take(50)
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join("\n");
        return format!("/* TRUNCATED */\n{}\n", head);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::adapter_set;

    const TS: &str = "import { x } from \"./x\";\n\
export function handle(req: Req) {\n\
  const a = prepare(req);\n\
  if (!a.ok) {\n\
    throw new ValidationError(a.message);\n\
  }\n\
  const b = transform(a);\n\
  const c = persist(b);\n\
  return c;\n\
}\n";

    #[test]
    fn window_symbol_and_budget() {
        let ex = window(TS, 1, 9, Granularity::Symbol, ExtractBudget::default());
        assert!(ex.text.contains("export function handle"));
        assert!(!ex.truncated);

        let tight = window(TS, 1, 9, Granularity::Symbol, ExtractBudget { max_lines: 2, max_tokens: 100 });
        assert!(tight.truncated);
        assert_eq!(tight.text.lines().count(), 2);
    }

    #[test]
    fn block_window_balances_braces() {
        // Start inside the if-block; expansion must reach balanced braces.
        let ex = window(TS, 4, 4, Granularity::Block, ExtractBudget::default());
        assert!(ex.text.contains('{'));
        let opens = ex.text.matches('{').count();
        let closes = ex.text.matches('}').count();
        assert_eq!(opens, closes);
    }

    #[test]
    fn skeleton_keeps_scaffolding_elides_plumbing() {
        let skel = render_skeleton(adapter_set(), "a.ts", TS, None, false, ExtractBudget::default())
            .unwrap();
        assert!(skel.text.contains("export function handle"));
        assert!(skel.text.contains("if (!a.ok)"));
        assert!(skel.text.contains("throw new ValidationError"));
        assert!(skel.text.contains("return c;"));
        assert!(skel.text.contains(ELISION));
        assert!(!skel.text.contains("const b = transform"));
    }

    #[test]
    fn skeleton_falls_back_to_universal() {
        let kt = "class Greeter {\n    fun greet(name: String) {\n        println(name)\n    }\n}\n";
        let skel =
            render_skeleton(adapter_set(), "main.kt", kt, None, false, ExtractBudget::default())
                .unwrap();
        assert!(skel.text.contains("class Greeter"));
    }

    #[test]
    fn ir_hash_is_stable_under_relocation() {
        let moved = format!("// header\n// padding\n{TS}");
        let a = skeleton_ir(adapter_set(), "a.ts", TS, (1, 9), ExtractBudget::default()).unwrap();
        let b = skeleton_ir(adapter_set(), "a.ts", &moved, (3, 11), ExtractBudget::default()).unwrap();
        assert_eq!(a.ir_hash, b.ir_hash);
        assert!(a.ops.iter().any(|o| o.op == "call"));
        assert!(a.ops.iter().any(|o| o.op == "if"));
        assert!(a.ops.iter().any(|o| o.op == "throw"));
        assert!(a.ops.iter().any(|o| o.op == "return"));
    }

    #[test]
    fn hot_path_finds_identifier_with_context() {
        const SRC: &str = "export function f() {\n  const x = 1;\n  g();\n  const y = 2;\n  return y;\n}\nfunction g(){}\n";
        let hp = hot_path(
            adapter_set(),
            hotpath_matchers(),
            "a.ts",
            SRC,
            (0, 5),
            &["g".to_string()],
            1,
            ExtractBudget::default(),
        );
        assert_eq!(hp.matched_identifiers, vec!["g"]);
        assert_eq!(hp.matched_lines, vec![3]);
        assert!(hp.excerpt.contains("g();"));
        assert!(hp.excerpt.contains("const x = 1;"));
        assert!(hp.excerpt.contains("const y = 2;"));
        assert!(!hp.excerpt.contains("return y"));
    }

    #[test]
    fn hot_path_matches_member_chain_components() {
        const SRC: &str =
            "export function f(db: Db) {\n  db.users.insert(row);\n}\n";
        let hp = hot_path(
            adapter_set(),
            hotpath_matchers(),
            "a.ts",
            SRC,
            (0, 2),
            &["insert".to_string()],
            0,
            ExtractBudget::default(),
        );
        assert_eq!(hp.matched_identifiers, vec!["insert"]);
        assert!(hp.excerpt.contains("db.users.insert"));
    }

    #[test]
    fn oversized_files_are_refused_not_errored() {
        assert!(!file_within_cap("big.ts", 2_000_000, 1_000_000));
        assert!(file_within_cap("ok.ts", 10, 1_000_000));
    }

    #[test]
    fn token_estimate_is_ceil_chars_over_4() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }
}
