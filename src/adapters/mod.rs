use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tree_sitter::{Language, Tree};

pub mod python;
pub mod rust;
pub mod support;
pub mod typescript;

pub use support::{is_minified_or_generated, sha256_hex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Interface,
    Type,
    Module,
    Method,
    Constructor,
    Variable,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Module => "module",
            Self::Method => "method",
            Self::Constructor => "constructor",
            Self::Variable => "variable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "function" => Self::Function,
            "class" => Self::Class,
            "interface" => Self::Interface,
            "type" => Self::Type,
            "module" => Self::Module,
            "method" => Self::Method,
            "constructor" => Self::Constructor,
            "variable" => Self::Variable,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Protected,
    Private,
    Exported,
    Internal,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::Private => "private",
            Self::Exported => "exported",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "public" => Self::Public,
            "protected" => Self::Protected,
            "private" => Self::Private,
            "exported" => Self::Exported,
            "internal" => Self::Internal,
            _ => return None,
        })
    }
}

/// 0-indexed line/column range of a declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymRange {
    pub start_line: u32,
    pub start_col: u32,
    pub end_line: u32,
    pub end_col: u32,
}

impl SymRange {
    pub fn contains_line(&self, line: u32) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

/// Canonical symbol record produced by every adapter, independent of grammar
/// details. `symbol_id` is the structural path `<rel_path>#<qualified_name>`,
/// stable across reindexes; overloads get a short signature-hash suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedSymbol {
    pub symbol_id: String,
    pub name: String,
    /// Method names carry their class qualifier (`Cls.method`).
    pub qualified_name: String,
    pub kind: SymbolKind,
    pub exported: bool,
    pub visibility: Visibility,
    pub range: SymRange,
    pub fingerprint: String,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedImport {
    pub specifier: String,
    pub is_relative: bool,
    pub is_external: bool,
    /// Named symbols pulled in by this import, when the syntax names them.
    pub symbols: Vec<String>,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    /// Free-standing call to a resolvable free function or namespace-qualified static.
    Function,
    /// Call on a receiver expression (incl. member-expression chains).
    Method,
    /// `new Foo(…)` style (Rust: `Foo::new(…)`, Python: `Foo(…)`).
    Constructor,
    /// Callee is a variable, computed member, or tagged template. Never resolved.
    Dynamic,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Constructor => "constructor",
            Self::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedCall {
    /// `symbol_id` of the enclosing declaration the call was made from.
    pub caller_id: String,
    /// Trailing identifier of the callee expression.
    pub callee_name: String,
    /// Receiver/qualifier text for method and namespaced calls.
    pub receiver: Option<String>,
    pub kind: CallKind,
    pub is_resolved: bool,
    pub line: u32,
}

/// Per-language capability object. Concrete adapters compose the shared
/// helpers in [`support`] for range normalisation and fingerprinting rather
/// than inheriting from each other.
pub trait LanguageAdapter: Send + Sync {
    fn language_id(&self) -> &'static str;
    /// Primary file extensions handled by this adapter (lowercase, without dot).
    fn file_extensions(&self) -> &'static [&'static str];
    fn grammar(&self) -> Language;

    /// Parse failures yield `None`; the indexer skips the file without
    /// aborting the run.
    fn parse(&self, source: &str, _path: &str) -> Option<Tree> {
        support::parse_with(&self.grammar(), source)
    }

    fn extract_symbols(&self, tree: &Tree, source: &str, rel_path: &str) -> Vec<ExtractedSymbol>;

    fn extract_imports(&self, tree: &Tree, source: &str, rel_path: &str) -> Vec<ExtractedImport>;

    fn extract_calls(
        &self,
        tree: &Tree,
        source: &str,
        rel_path: &str,
        symbols: &[ExtractedSymbol],
    ) -> Vec<ExtractedCall>;
}

/// Assign final structural ids: `<rel_path>#<qualified_name>`, with a short
/// fingerprint suffix to disambiguate overloaded names within one file.
pub fn finalize_symbol_ids(rel_path: &str, symbols: &mut [ExtractedSymbol]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for sym in symbols.iter() {
        *seen.entry(sym.qualified_name.clone()).or_insert(0) += 1;
    }
    for sym in symbols.iter_mut() {
        let base = format!("{}#{}", rel_path, sym.qualified_name);
        if seen.get(&sym.qualified_name).copied().unwrap_or(0) > 1 {
            let tag = &sym.fingerprint[..8.min(sym.fingerprint.len())];
            sym.symbol_id = format!("{base}-{tag}");
        } else {
            sym.symbol_id = base;
        }
    }
}

pub struct AdapterSet {
    adapters: Vec<Box<dyn LanguageAdapter>>,
    by_ext: HashMap<String, usize>,
}

impl AdapterSet {
    pub fn adapter_for_path(&self, rel_path: &str) -> Option<&dyn LanguageAdapter> {
        let ext = rel_path.rsplit('.').next().unwrap_or("").to_lowercase();
        self.by_ext.get(&ext).map(|&idx| self.adapters[idx].as_ref())
    }

    pub fn adapter_for_language(&self, language_id: &str) -> Option<&dyn LanguageAdapter> {
        self.adapters
            .iter()
            .find(|a| a.language_id() == language_id)
            .map(|a| a.as_ref())
    }

    pub fn language_ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.language_id()).collect()
    }
}

impl Default for AdapterSet {
    fn default() -> Self {
        let adapters: Vec<Box<dyn LanguageAdapter>> = vec![
            Box::new(rust::RustAdapter),
            Box::new(typescript::TypeScriptAdapter),
            Box::new(python::PythonAdapter),
        ];

        let mut set = Self { adapters, by_ext: HashMap::new() };
        for (idx, a) in set.adapters.iter().enumerate() {
            for ext in a.file_extensions() {
                set.by_ext.insert(ext.to_string(), idx);
            }
        }
        set
    }
}

pub fn adapter_set() -> &'static AdapterSet {
    static SET: OnceLock<AdapterSet> = OnceLock::new();
    SET.get_or_init(AdapterSet::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_routing() {
        let set = adapter_set();
        assert_eq!(set.adapter_for_path("src/a.ts").unwrap().language_id(), "typescript");
        assert_eq!(set.adapter_for_path("lib.rs").unwrap().language_id(), "rust");
        assert_eq!(set.adapter_for_path("tool.py").unwrap().language_id(), "python");
        assert!(set.adapter_for_path("README.md").is_none());
    }

    #[test]
    fn overloads_get_distinct_ids() {
        let mk = |fp: &str| ExtractedSymbol {
            symbol_id: String::new(),
            name: "f".into(),
            qualified_name: "f".into(),
            kind: SymbolKind::Function,
            exported: false,
            visibility: Visibility::Private,
            range: SymRange::default(),
            fingerprint: fp.to_string(),
            signature: None,
        };
        let mut syms = vec![mk("aaaaaaaaaaaaaaaa"), mk("bbbbbbbbbbbbbbbb")];
        finalize_symbol_ids("m.ts", &mut syms);
        assert_ne!(syms[0].symbol_id, syms[1].symbol_id);
        assert!(syms[0].symbol_id.starts_with("m.ts#f-"));
    }
}
