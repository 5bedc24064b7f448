use tree_sitter::{Language, Node, Tree};

use super::support::{
    enclosing_symbol, first_line_signature, node_text, range_of, structural_fingerprint, walk_tree,
};
use super::{
    finalize_symbol_ids, CallKind, ExtractedCall, ExtractedImport, ExtractedSymbol, LanguageAdapter,
    SymbolKind, Visibility,
};

pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language_id(&self) -> &'static str {
        "python"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_python::language()
    }

    fn extract_symbols(&self, tree: &Tree, source: &str, rel_path: &str) -> Vec<ExtractedSymbol> {
        let src = source.as_bytes();
        let mut out: Vec<ExtractedSymbol> = Vec::new();
        collect_block(tree.root_node(), src, None, &mut out);
        finalize_symbol_ids(rel_path, &mut out);
        out
    }

    fn extract_imports(&self, tree: &Tree, source: &str, _rel_path: &str) -> Vec<ExtractedImport> {
        let src = source.as_bytes();
        let mut out = Vec::new();
        let mut visit = |node: Node| match node.kind() {
            "import_statement" => {
                for i in 0..node.child_count() {
                    let Some(c) = node.child(i.try_into().unwrap()) else { continue };
                    if c.kind() == "dotted_name" || c.kind() == "aliased_import" {
                        let name = match c.kind() {
                            "aliased_import" => c
                                .child_by_field_name("name")
                                .map(|n| node_text(src, n).to_string())
                                .unwrap_or_default(),
                            _ => node_text(src, c).to_string(),
                        };
                        if name.is_empty() {
                            continue;
                        }
                        out.push(ExtractedImport {
                            is_relative: false,
                            is_external: true,
                            specifier: name,
                            symbols: vec![],
                            line: node.start_position().row as u32,
                        });
                    }
                }
            }
            "import_from_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|m| node_text(src, m).to_string())
                    .unwrap_or_default();
                let is_relative = module.starts_with('.');
                let mut symbols = Vec::new();
                for i in 0..node.child_count() {
                    let Some(c) = node.child(i.try_into().unwrap()) else { continue };
                    if c.kind() == "dotted_name" && Some(c) != node.child_by_field_name("module_name")
                    {
                        symbols.push(node_text(src, c).to_string());
                    }
                }
                out.push(ExtractedImport {
                    is_external: !is_relative,
                    is_relative,
                    specifier: module,
                    symbols,
                    line: node.start_position().row as u32,
                });
            }
            _ => {}
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
            if node.kind() != "call" {
                return;
            }
            let row = node.start_position().row as u32;
            let col = node.start_position().column as u32;
            let Some(caller) = enclosing_symbol(symbols, row, col) else { return };
            let Some(callee) = node.child_by_field_name("function") else { return };

            let call = match callee.kind() {
                "identifier" => {
                    let name = node_text(src, callee).to_string();
                    // Calling a capitalized name is instantiation by convention.
                    let kind = if name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
                    {
                        CallKind::Constructor
                    } else {
                        CallKind::Function
                    };
                    ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name: name,
                        receiver: None,
                        kind,
                        is_resolved: true,
                        line: row,
                    }
                }
                "attribute" => {
                    let Some(attr) = callee.child_by_field_name("attribute") else { return };
                    ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name: node_text(src, attr).to_string(),
                        receiver: callee
                            .child_by_field_name("object")
                            .map(|o| node_text(src, o).to_string()),
                        kind: CallKind::Method,
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

fn collect_block(node: Node, src: &[u8], qualifier: Option<&str>, out: &mut Vec<ExtractedSymbol>) {
    for i in 0..node.child_count() {
        let Some(stmt) = node.child(i.try_into().unwrap()) else { continue };
        match stmt.kind() {
            "decorated_definition" => {
                if let Some(def) = stmt.child_by_field_name("definition") {
                    collect_one(def, src, qualifier, out);
                }
            }
            "function_definition" | "class_definition" => collect_one(stmt, src, qualifier, out),
            _ => {}
        }
    }
}

fn collect_one(def: Node, src: &[u8], qualifier: Option<&str>, out: &mut Vec<ExtractedSymbol>) {
    let Some(name_node) = def.child_by_field_name("name") else { return };
    let name = node_text(src, name_node).to_string();
    if name.is_empty() {
        return;
    }

    let (kind, descend) = match def.kind() {
        "class_definition" => (SymbolKind::Class, true),
        _ if qualifier.is_some() => {
            let k = if name == "__init__" { SymbolKind::Constructor } else { SymbolKind::Method };
            (k, false)
        }
        _ => (SymbolKind::Function, false),
    };

    let private = name.starts_with('_') && !name.starts_with("__");
    let dunder = name.starts_with("__");
    let visibility = if private || dunder { Visibility::Private } else { Visibility::Public };

    let qualified_name = match qualifier {
        Some(q) => format!("{q}.{name}"),
        None => name.clone(),
    };
    let salt = format!("{} {}", kind.as_str(), qualified_name);
    out.push(ExtractedSymbol {
        symbol_id: String::new(),
        fingerprint: structural_fingerprint(&salt, def, src),
        signature: Some(first_line_signature(node_text(src, def))),
        range: range_of(def),
        exported: qualifier.is_none() && !private && !dunder,
        name: name.clone(),
        qualified_name,
        kind,
        visibility,
    });

    if descend {
        if let Some(body) = def.child_by_field_name("body") {
            collect_block(body, src, Some(name.as_str()), out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(src: &str) -> (Vec<ExtractedSymbol>, Vec<ExtractedCall>) {
        let a = PythonAdapter;
        let tree = a.parse(src, "m.py").unwrap();
        let syms = a.extract_symbols(&tree, src, "m.py");
        let calls = a.extract_calls(&tree, src, "m.py", &syms);
        (syms, calls)
    }

    #[test]
    fn classes_methods_and_privacy() {
        let src = "class Ledger:\n    def __init__(self):\n        pass\n    def commit(self):\n        self._flush()\n    def _flush(self):\n        pass\n\ndef helper():\n    return Ledger()\n";
        let (syms, calls) = extract(src);
        let commit = syms.iter().find(|s| s.name == "commit").unwrap();
        assert_eq!(commit.qualified_name, "Ledger.commit");
        assert_eq!(commit.kind, SymbolKind::Method);
        let init = syms.iter().find(|s| s.name == "__init__").unwrap();
        assert_eq!(init.kind, SymbolKind::Constructor);
        let flush = syms.iter().find(|s| s.name == "_flush").unwrap();
        assert_eq!(flush.visibility, Visibility::Private);
        assert!(!flush.exported);

        let method_call = calls.iter().find(|c| c.callee_name == "_flush").unwrap();
        assert_eq!(method_call.kind, CallKind::Method);
        let ctor = calls.iter().find(|c| c.callee_name == "Ledger").unwrap();
        assert_eq!(ctor.kind, CallKind::Constructor);
    }

    #[test]
    fn from_import_relative() {
        let a = PythonAdapter;
        let src = "from .util import clean\nimport os\n";
        let tree = a.parse(src, "m.py").unwrap();
        let imports = a.extract_imports(&tree, src, "m.py");
        let rel = imports.iter().find(|i| i.is_relative).unwrap();
        assert_eq!(rel.specifier, ".util");
        assert_eq!(rel.symbols, vec!["clean"]);
        assert!(imports.iter().any(|i| i.specifier == "os" && i.is_external));
    }
}
