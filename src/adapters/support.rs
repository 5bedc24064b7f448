use sha2::{Digest, Sha256};
use tree_sitter::{Language, Node, Parser, Tree};

use super::{ExtractedSymbol, SymRange};

/// Return true when a source text looks minified or machine-generated.
///
/// Heuristic: inspect the first 5 non-empty lines. If *any* single line exceeds
/// 2 000 chars the file is almost certainly minified JS/CSS/JSON — running
/// Tree-sitter on it wastes CPU and may hang a low-RAM machine.
pub fn is_minified_or_generated(source_text: &str) -> bool {
    const MAX_SAFE_LINE_CHARS: usize = 2_000;
    source_text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(5)
        .any(|l| l.len() > MAX_SAFE_LINE_CHARS)
}

/// Parse with the given grammar, returning `None` on any failure so the
/// indexer can skip the file without aborting the run.
pub fn parse_with(language: &Language, source_text: &str) -> Option<Tree> {
    if is_minified_or_generated(source_text) {
        return None;
    }
    let mut parser = Parser::new();
    if parser.set_language(language).is_err() {
        return None;
    }
    parser.parse(source_text, None)
}

pub fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    let start = node.start_byte();
    let end = node.end_byte();
    std::str::from_utf8(&source[start..end]).unwrap_or("")
}

/// Normalized 0-indexed line/col range for a node.
pub fn range_of(node: Node) -> SymRange {
    let s = node.start_position();
    let e = node.end_position();
    SymRange {
        start_line: s.row as u32,
        start_col: s.column as u32,
        end_line: e.row as u32,
        end_col: e.column as u32,
    }
}

/// Structural fingerprint of a declaration subtree.
///
/// Hashes the pre-order node kinds plus the text of leaf tokens, skipping
/// comment subtrees. Whitespace and byte/line positions never enter the
/// digest, so moving a symbol within its file (or pasting the same code into
/// another file) reproduces the fingerprint, while any token or shape change
/// breaks it. `salt` carries kind/qualifier context (e.g. `method Cls.f`).
pub fn structural_fingerprint(salt: &str, node: Node, source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update([0u8]);
    hash_subtree(&mut hasher, node, source);
    hex_digest(hasher)
}

fn hash_subtree(hasher: &mut Sha256, node: Node, source: &[u8]) {
    let kind = node.kind();
    if kind.contains("comment") {
        return;
    }
    hasher.update(kind.as_bytes());
    hasher.update([1u8]);
    if node.child_count() == 0 {
        hasher.update(node_text(source, node).as_bytes());
        hasher.update([2u8]);
        return;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i.try_into().unwrap()) {
            hash_subtree(hasher, child, source);
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for b in out {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Collapse a declaration's text to a one-line signature: everything up to
/// the body brace, whitespace squeezed, capped for display.
pub fn first_line_signature(def_text: &str) -> String {
    let mut s = def_text;
    if let Some(i) = s.find('{') {
        s = &s[..i];
    }
    if let Some(i) = s.find(':') {
        // Python: cut at the suite colon when no brace was found first.
        if !def_text.contains('{') {
            s = &s[..i];
        }
    }
    if let Some(i) = s.find('\n') {
        s = &s[..i];
    }

    let mut out = String::with_capacity(s.len().min(200));
    let mut prev_ws = false;
    for ch in s.chars() {
        let is_ws = ch.is_whitespace();
        if is_ws {
            if !prev_ws {
                out.push(' ');
            }
        } else {
            out.push(ch);
        }
        prev_ws = is_ws;
        if out.len() >= 240 {
            break;
        }
    }

    out.trim().trim_end_matches('{').trim().to_string()
}

/// Pre-order walk over every node (named and anonymous).
pub fn walk_tree<'a>(node: Node<'a>, visit: &mut impl FnMut(Node<'a>)) {
    visit(node);
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i.try_into().unwrap()) {
            walk_tree(child, visit);
        }
    }
}

/// The tightest symbol whose range contains `(row, col)`, preferring the
/// innermost (latest-starting) candidate so methods win over their class.
/// Column-aware so several one-line declarations on the same line resolve
/// correctly.
pub fn enclosing_symbol<'a>(
    symbols: &'a [ExtractedSymbol],
    row: u32,
    col: u32,
) -> Option<&'a ExtractedSymbol> {
    let contains = |s: &ExtractedSymbol| -> bool {
        let after_start =
            s.range.start_line < row || (s.range.start_line == row && s.range.start_col <= col);
        let before_end = row < s.range.end_line || (row == s.range.end_line && col <= s.range.end_col);
        after_start && before_end
    };
    symbols
        .iter()
        .filter(|s| contains(s))
        .max_by_key(|s| (s.range.start_line, s.range.start_col))
}

pub fn strip_string_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        let first = bytes[0];
        let last = bytes[t.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') || (first == b'`' && last == b'`')
        {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_rust(src: &str) -> Tree {
        parse_with(&tree_sitter_rust::language(), src).unwrap()
    }

    #[test]
    fn fingerprint_ignores_position_and_whitespace() {
        let a = parse_rust("fn f(x: u32) -> u32 { x + 1 }");
        let b = parse_rust("\n\n\nfn f(x: u32)   ->\n    u32 { x + 1 }");
        let fa = structural_fingerprint("function f", a.root_node(), b"fn f(x: u32) -> u32 { x + 1 }");
        let src_b = "\n\n\nfn f(x: u32)   ->\n    u32 { x + 1 }";
        let fb = structural_fingerprint("function f", b.root_node(), src_b.as_bytes());
        assert_eq!(fa, fb);
    }

    #[test]
    fn fingerprint_changes_with_body_tokens() {
        let src_a = "fn f(x: u32) -> u32 { x + 1 }";
        let src_b = "fn f(x: u32) -> u32 { x + 2 }";
        let a = parse_rust(src_a);
        let b = parse_rust(src_b);
        let fa = structural_fingerprint("function f", a.root_node(), src_a.as_bytes());
        let fb = structural_fingerprint("function f", b.root_node(), src_b.as_bytes());
        assert_ne!(fa, fb);
    }

    #[test]
    fn signature_is_single_line() {
        assert_eq!(
            first_line_signature("pub fn process(a: A,\n    b: B) -> C {\n    body\n}"),
            "pub fn process(a: A, b: B) -> C"
        );
    }

    #[test]
    fn minified_detection() {
        assert!(!is_minified_or_generated("fn main() {}\n"));
        let long = "x".repeat(3_000);
        assert!(is_minified_or_generated(&long));
    }
}
