use tree_sitter::{Language, Node, Tree};

use super::support::{
    enclosing_symbol, first_line_signature, node_text, range_of, structural_fingerprint,
    strip_string_quotes, walk_tree,
};
use super::{
    finalize_symbol_ids, CallKind, ExtractedCall, ExtractedImport, ExtractedSymbol, LanguageAdapter,
    SymbolKind, Visibility,
};

/// TypeScript / JavaScript adapter. JS shares the TS grammar for our
/// purposes; `.tsx`/`.jsx` use the TSX variant.
pub struct TypeScriptAdapter;

impl LanguageAdapter for TypeScriptAdapter {
    fn language_id(&self) -> &'static str {
        "typescript"
    }

    fn file_extensions(&self) -> &'static [&'static str] {
        &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"]
    }

    fn grammar(&self) -> Language {
        tree_sitter_typescript::language_typescript()
    }

    fn parse(&self, source: &str, path: &str) -> Option<Tree> {
        let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
        let language = if ext == "tsx" || ext == "jsx" {
            tree_sitter_typescript::language_tsx()
        } else {
            tree_sitter_typescript::language_typescript()
        };
        super::support::parse_with(&language, source)
    }

    fn extract_symbols(&self, tree: &Tree, source: &str, rel_path: &str) -> Vec<ExtractedSymbol> {
        let src = source.as_bytes();
        let mut out: Vec<ExtractedSymbol> = Vec::new();

        for i in 0..tree.root_node().child_count() {
            let Some(node) = tree.root_node().child(i.try_into().unwrap()) else { continue };
            collect_declaration(node, src, false, &mut out);
        }

        finalize_symbol_ids(rel_path, &mut out);
        out
    }

    fn extract_imports(&self, tree: &Tree, source: &str, _rel_path: &str) -> Vec<ExtractedImport> {
        let src = source.as_bytes();
        let mut out = Vec::new();

        let mut visit = |node: Node| {
            if node.kind() != "import_statement" {
                return;
            }
            let Some(source_node) = node.child_by_field_name("source") else { return };
            let specifier = strip_string_quotes(node_text(src, source_node));
            let is_relative = specifier.starts_with("./") || specifier.starts_with("../");

            let mut symbols = Vec::new();
            let mut grab = |n: Node| {
                if n.kind() == "import_specifier" {
                    if let Some(name) = n.child_by_field_name("name") {
                        symbols.push(node_text(src, name).to_string());
                    }
                } else if n.kind() == "namespace_import" || n.kind() == "identifier" {
                    // `import * as ns` / default import binding
                    let text = node_text(src, n);
                    let bare = text.trim_start_matches("* as ").trim();
                    if !bare.is_empty() && n.parent().map(|p| p.kind()) == Some("import_clause") {
                        symbols.push(bare.to_string());
                    }
                }
            };
            walk_tree(node, &mut grab);

            out.push(ExtractedImport {
                is_external: !is_relative,
                is_relative,
                specifier,
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
            let kind = node.kind();
            if kind != "call_expression" && kind != "new_expression" {
                return;
            }
            let row = node.start_position().row as u32;
            let col = node.start_position().column as u32;
            let Some(caller) = enclosing_symbol(symbols, row, col) else { return };

            let call = if kind == "new_expression" {
                let Some(ctor) = node.child_by_field_name("constructor") else { return };
                let name = trailing_identifier(src, ctor);
                if name.is_empty() {
                    return;
                }
                ExtractedCall {
                    caller_id: caller.symbol_id.clone(),
                    callee_name: name,
                    receiver: None,
                    kind: CallKind::Constructor,
                    is_resolved: true,
                    line: row,
                }
            } else {
                let Some(callee) = node.child_by_field_name("function") else { return };
                match callee.kind() {
                    "identifier" => ExtractedCall {
                        caller_id: caller.symbol_id.clone(),
                        callee_name: node_text(src, callee).to_string(),
                        receiver: None,
                        kind: CallKind::Function,
                        is_resolved: true,
                        line: row,
                    },
                    "member_expression" => {
                        let prop = callee
                            .child_by_field_name("property")
                            .map(|p| node_text(src, p).to_string())
                            .unwrap_or_default();
                        if prop.is_empty() {
                            return;
                        }
                        let obj = callee
                            .child_by_field_name("object")
                            .map(|o| node_text(src, o).to_string());
                        // Computed members (`obj[key]()`) surface as subscript
                        // objects; the property path above only matches dot access.
                        ExtractedCall {
                            caller_id: caller.symbol_id.clone(),
                            callee_name: prop,
                            receiver: obj,
                            kind: CallKind::Method,
                            is_resolved: true,
                            line: row,
                        }
                    }
                    _ => {
                        // subscript_expression, parenthesized callee, tagged
                        // template: dynamic dispatch, never resolvable.
                        let name = trailing_identifier(src, callee);
                        ExtractedCall {
                            caller_id: caller.symbol_id.clone(),
                            callee_name: if name.is_empty() { "<dynamic>".into() } else { name },
                            receiver: None,
                            kind: CallKind::Dynamic,
                            is_resolved: false,
                            line: row,
                        }
                    }
                }
            };
            out.push(call);
        };
        walk_tree(tree.root_node(), &mut visit);
        out
    }
}

/// Collect one top-level declaration (descending through export wrappers and
/// into class bodies).
fn collect_declaration(node: Node, src: &[u8], exported: bool, out: &mut Vec<ExtractedSymbol>) {
    match node.kind() {
        "export_statement" => {
            if let Some(decl) = node.child_by_field_name("declaration") {
                collect_declaration(decl, src, true, out);
            }
        }
        "function_declaration" | "generator_function_declaration" => {
            if let Some(sym) = named_symbol(node, src, SymbolKind::Function, exported, None) {
                out.push(sym);
            }
        }
        "class_declaration" | "abstract_class_declaration" => {
            let class_name = node
                .child_by_field_name("name")
                .map(|n| node_text(src, n).to_string())
                .unwrap_or_default();
            if let Some(sym) = named_symbol(node, src, SymbolKind::Class, exported, None) {
                out.push(sym);
            }
            if class_name.is_empty() {
                return;
            }
            if let Some(body) = node.child_by_field_name("body") {
                for i in 0..body.child_count() {
                    let Some(member) = body.child(i.try_into().unwrap()) else { continue };
                    if member.kind() != "method_definition" {
                        continue;
                    }
                    let Some(name_node) = member.child_by_field_name("name") else { continue };
                    let name = node_text(src, name_node).to_string();
                    let kind = if name == "constructor" {
                        SymbolKind::Constructor
                    } else {
                        SymbolKind::Method
                    };
                    let vis = member_visibility(member, src);
                    if let Some(sym) =
                        symbol_from(member, src, name, kind, exported, Some(class_name.as_str()), vis)
                    {
                        out.push(sym);
                    }
                }
            }
        }
        "interface_declaration" => {
            if let Some(sym) = named_symbol(node, src, SymbolKind::Interface, exported, None) {
                out.push(sym);
            }
        }
        "type_alias_declaration" => {
            if let Some(sym) = named_symbol(node, src, SymbolKind::Type, exported, None) {
                out.push(sym);
            }
        }
        "enum_declaration" => {
            if let Some(sym) = named_symbol(node, src, SymbolKind::Type, exported, None) {
                out.push(sym);
            }
        }
        "lexical_declaration" | "variable_declaration" => {
            for i in 0..node.child_count() {
                let Some(declarator) = node.child(i.try_into().unwrap()) else { continue };
                if declarator.kind() != "variable_declarator" {
                    continue;
                }
                let Some(name_node) = declarator.child_by_field_name("name") else { continue };
                if name_node.kind() != "identifier" {
                    continue;
                }
                let name = node_text(src, name_node).to_string();
                let value_kind = declarator.child_by_field_name("value").map(|v| v.kind());
                let kind = match value_kind {
                    Some("arrow_function") | Some("function_expression") | Some("function") => {
                        SymbolKind::Function
                    }
                    _ => SymbolKind::Variable,
                };
                let vis = if exported { Visibility::Exported } else { Visibility::Internal };
                if let Some(sym) = symbol_from(declarator, src, name, kind, exported, None, vis) {
                    out.push(sym);
                }
            }
        }
        _ => {}
    }
}

fn named_symbol(
    node: Node,
    src: &[u8],
    kind: SymbolKind,
    exported: bool,
    qualifier: Option<&str>,
) -> Option<ExtractedSymbol> {
    let name_node = node.child_by_field_name("name")?;
    let name = node_text(src, name_node).to_string();
    let vis = if exported { Visibility::Exported } else { Visibility::Internal };
    symbol_from(node, src, name, kind, exported, qualifier, vis)
}

fn symbol_from(
    node: Node,
    src: &[u8],
    name: String,
    kind: SymbolKind,
    exported: bool,
    qualifier: Option<&str>,
    visibility: Visibility,
) -> Option<ExtractedSymbol> {
    if name.is_empty() {
        return None;
    }
    let qualified_name = match qualifier {
        Some(q) => format!("{q}.{name}"),
        None => name.clone(),
    };
    let salt = format!("{} {}", kind.as_str(), qualified_name);
    Some(ExtractedSymbol {
        symbol_id: String::new(),
        fingerprint: structural_fingerprint(&salt, node, src),
        signature: Some(first_line_signature(node_text(src, node))),
        range: range_of(node),
        name,
        qualified_name,
        kind,
        exported,
        visibility,
    })
}

fn member_visibility(member: Node, src: &[u8]) -> Visibility {
    for i in 0..member.child_count() {
        if let Some(c) = member.child(i.try_into().unwrap()) {
            if c.kind() == "accessibility_modifier" {
                return match node_text(src, c) {
                    "private" => Visibility::Private,
                    "protected" => Visibility::Protected,
                    _ => Visibility::Public,
                };
            }
        }
    }
    Visibility::Public
}

/// Trailing identifier of an arbitrary callee expression (`a.b.C` → `C`).
fn trailing_identifier(src: &[u8], node: Node) -> String {
    match node.kind() {
        "identifier" | "type_identifier" | "property_identifier" => {
            node_text(src, node).to_string()
        }
        "member_expression" => node
            .child_by_field_name("property")
            .map(|p| node_text(src, p).to_string())
            .unwrap_or_default(),
        _ => {
            let text = node_text(src, node);
            text.rsplit(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .next()
                .unwrap_or("")
                .to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(src: &str) -> (Vec<ExtractedSymbol>, Vec<ExtractedCall>) {
        let a = TypeScriptAdapter;
        let tree = a.parse(src, "a.ts").unwrap();
        let syms = a.extract_symbols(&tree, src, "a.ts");
        let calls = a.extract_calls(&tree, src, "a.ts", &syms);
        (syms, calls)
    }

    #[test]
    fn functions_and_local_call() {
        let (syms, calls) = extract("export function f(){ g(); }\nfunction g(){}\n");
        let names: Vec<&str> = syms.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["f", "g"]);
        assert!(syms[0].exported);
        assert!(!syms[1].exported);
        assert_eq!(syms[0].symbol_id, "a.ts#f");

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee_name, "g");
        assert_eq!(calls[0].caller_id, "a.ts#f");
        assert_eq!(calls[0].kind, CallKind::Function);
    }

    #[test]
    fn one_line_file_attributes_call_by_column() {
        // Two declarations share line 0; attribution must use columns.
        let (syms, calls) = extract("export function f(){ g(); } function g(){}");
        assert_eq!(syms.len(), 2);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].caller_id, "a.ts#f");
        assert_eq!(calls[0].callee_name, "g");
    }

    #[test]
    fn class_methods_are_qualified() {
        let src = "export class Login {\n  constructor(){ }\n  verify(x: string){ this.log(x); }\n  private log(m: string){ }\n}\n";
        let (syms, calls) = extract(src);
        let verify = syms.iter().find(|s| s.name == "verify").unwrap();
        assert_eq!(verify.qualified_name, "Login.verify");
        assert_eq!(verify.kind, SymbolKind::Method);
        let ctor = syms.iter().find(|s| s.kind == SymbolKind::Constructor).unwrap();
        assert_eq!(ctor.qualified_name, "Login.constructor");
        let log = syms.iter().find(|s| s.name == "log").unwrap();
        assert_eq!(log.visibility, Visibility::Private);

        let this_call = calls.iter().find(|c| c.callee_name == "log").unwrap();
        assert_eq!(this_call.kind, CallKind::Method);
        assert_eq!(this_call.receiver.as_deref(), Some("this"));
        assert_eq!(this_call.caller_id, verify.symbol_id);
    }

    #[test]
    fn constructor_and_dynamic_calls() {
        let src = "function build(reg: any, k: string){ const s = new Server(); reg[k](); return s; }\nclass Server {}\n";
        let (_, calls) = extract(src);
        let ctor = calls.iter().find(|c| c.kind == CallKind::Constructor).unwrap();
        assert_eq!(ctor.callee_name, "Server");
        let dynamic = calls.iter().find(|c| c.kind == CallKind::Dynamic).unwrap();
        assert!(!dynamic.is_resolved);
    }

    #[test]
    fn import_classification() {
        let a = TypeScriptAdapter;
        let src = "import { join } from \"path\";\nimport { helper } from \"./util\";\n";
        let tree = a.parse(src, "a.ts").unwrap();
        let imports = a.extract_imports(&tree, src, "a.ts");
        assert_eq!(imports.len(), 2);
        assert!(imports[0].is_external && !imports[0].is_relative);
        assert!(imports[1].is_relative && !imports[1].is_external);
        assert_eq!(imports[1].specifier, "./util");
        assert_eq!(imports[1].symbols, vec!["helper"]);
    }

    #[test]
    fn arrow_function_consts_are_functions() {
        let (syms, _) = extract("export const handler = (req: any) => req;\nconst LIMIT = 3;\n");
        assert_eq!(syms[0].kind, SymbolKind::Function);
        assert_eq!(syms[1].kind, SymbolKind::Variable);
    }

    #[test]
    fn fingerprint_survives_relocation_in_file() {
        let (a_syms, _) = extract("function g(){ return 1; }\n");
        let (b_syms, _) = extract("// moved down\n\nfunction pad(){}\nfunction g(){ return 1; }\n");
        let fa = &a_syms.iter().find(|s| s.name == "g").unwrap().fingerprint;
        let fb = &b_syms.iter().find(|s| s.name == "g").unwrap().fingerprint;
        assert_eq!(fa, fb);
    }
}
