use tree_sitter::{Language, Node, Tree};

use super::support::{
    enclosing_symbol, first_line_signature, node_text, range_of, structural_fingerprint, walk_tree,
};
use super::{
    finalize_symbol_ids, CallKind, ExtractedCall, ExtractedImport, ExtractedSymbol, LanguageAdapter,
    SymbolKind, Visibility,
};

pub struct RustAdapter;

impl LanguageAdapter for RustAdapter {
    fn language_id(&self) -> &'static str {
        "rust"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_rust::language()
    }

    fn extract_symbols(&self, tree: &Tree, source: &str, rel_path: &str) -> Vec<ExtractedSymbol> {
        let src = source.as_bytes();
        let mut out: Vec<ExtractedSymbol> = Vec::new();
        collect_items(tree.root_node(), src, None, &mut out);
        finalize_symbol_ids(rel_path, &mut out);
        out
    }

    fn extract_imports(&self, tree: &Tree, source: &str, _rel_path: &str) -> Vec<ExtractedImport> {
        let src = source.as_bytes();
        let mut out = Vec::new();
        let mut visit = |node: Node| {
            if node.kind() != "use_declaration" {
                return;
            }
            let Some(arg) = node.child_by_field_name("argument") else { return };
            let specifier = node_text(src, arg).to_string();
            let head = specifier
                .split("::")
                .next()
                .unwrap_or("")
                .trim_start_matches("r#");
            let is_relative = matches!(head, "crate" | "self" | "super");
            let is_external = !is_relative && !matches!(head, "std" | "core" | "alloc");
            let symbols = trailing_use_names(&specifier);
            out.push(ExtractedImport {
                specifier,
                is_relative,
                is_external,
                symbols,
                line: node.start_position().row as u32,
            });
        };
        walk_tree(tree.root_node(), &mut visit);
        out
    }

    fn extract_calls(
        &self,
        tree: &Tree,
        source: &str,
        _rel_path: &str,
        symbols: &[ExtractedSymbol],
    ) -> Vec<ExtractedCall> {
        let src = source.as_bytes();
        let mut out = Vec::new();
        let mut visit = |node: Node| {
            // Macro invocations stay opaque; expansion is not our job.
            if node.kind() != "call_expression" {
                return;
            }
            let row = node.start_position().row as u32;
            let col = node.start_position().column as u32;
            let Some(caller) = enclosing_symbol(symbols, row, col) else { return };
            let Some(callee) = node.child_by_field_name("function") else { return };

            let call = match callee.kind() {
                "identifier" => ExtractedCall {
                    caller_id: caller.symbol_id.clone(),
                    callee_name: node_text(src, callee).to_string(),
                    receiver: None,
                    kind: CallKind::Function,
                    is_resolved: true,
                    line: row,
                },
                "field_expression" => {
                    let Some(field) = callee.child_by_field_name("field") else { return };
                    ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name: node_text(src, field).to_string(),
                        receiver: callee
                            .child_by_field_name("value")
                            .map(|v| node_text(src, v).to_string()),
                        kind: CallKind::Method,
                        is_resolved: true,
                        line: row,
                    }
                }
                "scoped_identifier" => {
                    let text = node_text(src, callee);
                    let mut parts = text.rsplit("::");
                    let name = parts.next().unwrap_or("").to_string();
                    let qualifier = text
                        .rsplit_once("::")
                        .map(|(q, _)| q.to_string())
                        .filter(|q| !q.is_empty());
                    // `Type::new` is the Rust spelling of a constructor call.
                    let kind = if name == "new" { CallKind::Constructor } else { CallKind::Function };
                    let callee_name = if name == "new" {
                        qualifier.clone().unwrap_or(name)
                    } else {
                        name
                    };
                    ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name,
                        receiver: qualifier,
                        kind,
                        is_resolved: true,
                        line: row,
                    }
                }
                "generic_function" => {
                    let inner = callee.child_by_field_name("function");
                    let name = inner.map(|n| node_text(src, n).to_string()).unwrap_or_default();
                    if name.is_empty() {
                        return;
                    }
                    ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name: name.rsplit("::").next().unwrap_or("").to_string(),
                        receiver: None,
                        kind: CallKind::Function,
                        is_resolved: true,
                        line: row,
                    }
                }
                _ => ExtractedCall {
                    caller_id: caller.symbol_id.clone(),
                    callee_name: "<dynamic>".into(),
                    receiver: None,
                    kind: CallKind::Dynamic,
                    is_resolved: false,
                    line: row,
                },
            };
            out.push(call);
        };
        walk_tree(tree.root_node(), &mut visit);
        out
    }
}

fn collect_items(node: Node, src: &[u8], qualifier: Option<&str>, out: &mut Vec<ExtractedSymbol>) {
    for i in 0..node.child_count() {
        let Some(item) = node.child(i.try_into().unwrap()) else { continue };
        match item.kind() {
            "function_item" => {
                let kind = if qualifier.is_some() { SymbolKind::Method } else { SymbolKind::Function };
                push_named(item, src, kind, qualifier, out);
            }
            "struct_item" => push_named(item, src, SymbolKind::Class, None, out),
            "enum_item" => push_named(item, src, SymbolKind::Type, None, out),
            "trait_item" => {
                push_named(item, src, SymbolKind::Interface, None, out);
            }
            "type_item" => push_named(item, src, SymbolKind::Type, None, out),
            "const_item" | "static_item" => push_named(item, src, SymbolKind::Variable, None, out),
            "mod_item" => {
                push_named(item, src, SymbolKind::Module, None, out);
                if let Some(body) = item.child_by_field_name("body") {
                    collect_items(body, src, qualifier, out);
                }
            }
            "impl_item" => {
                let type_name = impl_type_name(item, src);
                if let Some(body) = item.child_by_field_name("body") {
                    collect_items(body, src, type_name.as_deref(), out);
                }
            }
            _ => {}
        }
    }
}

fn push_named(
    item: Node,
    src: &[u8],
    kind: SymbolKind,
    qualifier: Option<&str>,
    out: &mut Vec<ExtractedSymbol>,
) {
    let Some(name_node) = item.child_by_field_name("name") else { return };
    let name = node_text(src, name_node).to_string();
    if name.is_empty() {
        return;
    }
    let is_pub = item
        .child(0)
        .map(|c| c.kind() == "visibility_modifier")
        .unwrap_or(false);
    let qualified_name = match qualifier {
        Some(q) => format!("{q}.{name}"),
        None => name.clone(),
    };
    // `Type::new` associated functions are the conventional constructors.
    let kind = if kind == SymbolKind::Method && name == "new" { SymbolKind::Constructor } else { kind };
    let salt = format!("{} {}", kind.as_str(), qualified_name);
    out.push(ExtractedSymbol {
        symbol_id: String::new(),
        fingerprint: structural_fingerprint(&salt, item, src),
        signature: Some(first_line_signature(node_text(src, item))),
        range: range_of(item),
        name,
        qualified_name,
        kind,
        exported: is_pub,
        visibility: if is_pub { Visibility::Public } else { Visibility::Private },
    });
}

fn impl_type_name(item: Node, src: &[u8]) -> Option<String> {
    let ty = item.child_by_field_name("type")?;
    let text = match ty.kind() {
        "type_identifier" => node_text(src, ty).to_string(),
        "generic_type" => ty
            .child_by_field_name("type")
            .map(|t| node_text(src, t).to_string())
            .unwrap_or_default(),
        _ => node_text(src, ty).to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Names introduced by a `use` argument: trailing segment, or every entry of
/// a `{...}` list.
fn trailing_use_names(specifier: &str) -> Vec<String> {
    if let Some(open) = specifier.find('{') {
        let inner = specifier[open + 1..].trim_end_matches('}');
        return inner
            .split(',')
            .map(|s| {
                s.trim()
                    .rsplit("::")
                    .next()
                    .unwrap_or("")
                    .split(" as ")
                    .last()
                    .unwrap_or("")
                    .trim()
                    .to_string()
            })
            .filter(|s| !s.is_empty() && s != "*")
            .collect();
    }
    specifier
        .rsplit("::")
        .next()
        .map(|s| s.split(" as ").last().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty() && s != "*")
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(src: &str) -> (Vec<ExtractedSymbol>, Vec<ExtractedCall>) {
        let a = RustAdapter;
        let tree = a.parse(src, "m.rs").unwrap();
        let syms = a.extract_symbols(&tree, src, "m.rs");
        let calls = a.extract_calls(&tree, src, "m.rs", &syms);
        (syms, calls)
    }

    #[test]
    fn impl_methods_carry_type_qualifier() {
        let src = "pub struct Store;\nimpl Store {\n    pub fn new() -> Self { Store }\n    fn get(&self, k: &str) -> u32 { self.hash(k) }\n    fn hash(&self, k: &str) -> u32 { k.len() as u32 }\n}\n";
        let (syms, calls) = extract(src);
        let get = syms.iter().find(|s| s.name == "get").unwrap();
        assert_eq!(get.qualified_name, "Store.get");
        assert_eq!(get.kind, SymbolKind::Method);
        let ctor = syms.iter().find(|s| s.name == "new").unwrap();
        assert_eq!(ctor.kind, SymbolKind::Constructor);

        let hash_call = calls.iter().find(|c| c.callee_name == "hash").unwrap();
        assert_eq!(hash_call.kind, CallKind::Method);
        assert_eq!(hash_call.caller_id, get.symbol_id);
    }

    #[test]
    fn scoped_new_is_a_constructor_call() {
        let src = "fn build() -> Store { Store::new() }\npub struct Store;\n";
        let (_, calls) = extract(src);
        let c = &calls[0];
        assert_eq!(c.kind, CallKind::Constructor);
        assert_eq!(c.callee_name, "Store");
    }

    #[test]
    fn use_classification() {
        let a = RustAdapter;
        let src = "use crate::graph::CodeGraph;\nuse serde::{Serialize, Deserialize};\nuse std::path::Path;\n";
        let tree = a.parse(src, "m.rs").unwrap();
        let imports = a.extract_imports(&tree, src, "m.rs");
        assert!(imports[0].is_relative);
        assert!(imports[1].is_external);
        assert_eq!(imports[1].symbols, vec!["Serialize", "Deserialize"]);
        assert!(!imports[2].is_external && !imports[2].is_relative);
    }

    #[test]
    fn visibility_split() {
        let (syms, _) = extract("pub fn api() {}\nfn helper() {}\n");
        assert_eq!(syms[0].visibility, Visibility::Public);
        assert!(syms[0].exported);
        assert_eq!(syms[1].visibility, Visibility::Private);
    }
}
