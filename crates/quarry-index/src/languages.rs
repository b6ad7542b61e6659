//! Language detection and tree-sitter entity boundaries.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

/// Source language with an optional tree-sitter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
}

impl Lang {
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
        }
    }

    /// Get the tree-sitter grammar. Returns `None` if the
    /// corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-rust")]
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            #[cfg(feature = "lang-go")]
            Self::Go => Some(tree_sitter_go::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Node kinds whose start is a natural chunk boundary.
    #[must_use]
    pub fn entity_node_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &[
                "function_item",
                "struct_item",
                "enum_item",
                "trait_item",
                "impl_item",
                "type_item",
                "const_item",
                "static_item",
                "macro_definition",
                "mod_item",
            ],
            Self::Python => &[
                "function_definition",
                "class_definition",
                "decorated_definition",
            ],
            Self::JavaScript | Self::TypeScript => &[
                "function_declaration",
                "class_declaration",
                "method_definition",
                "export_statement",
                "lexical_declaration",
            ],
            Self::Go => &[
                "function_declaration",
                "method_declaration",
                "type_declaration",
                "const_declaration",
            ],
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?;
    match ext {
        "rs" => Some(Lang::Rust),
        "py" | "pyi" => Some(Lang::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => Some(Lang::TypeScript),
        "go" => Some(Lang::Go),
        _ => None,
    }
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "mts", "cts", "go", "java", "kt",
    "kts", "scala", "c", "h", "cc", "cpp", "hpp", "cs", "rb", "php", "swift", "sh",
];

/// Programming-language source file, as opposed to docs or config.
#[must_use]
pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

/// Byte offsets where an entity (function, type, impl block) starts, in ascending order.
///
/// Descends into entities so that members of a large `impl` or class are also candidates.
/// Returns an empty list when no grammar is compiled in or parsing fails.
#[must_use]
pub fn entity_boundaries(source: &str, lang: Lang) -> Vec<usize> {
    let Some(grammar) = lang.grammar() else {
        return Vec::new();
    };
    let mut parser = Parser::new();
    if parser.set_language(&grammar).is_err() {
        return Vec::new();
    }
    let Some(tree) = parser.parse(source, None) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    collect_boundaries(source, &tree.root_node(), lang, 0, &mut out);
    out.sort_unstable();
    out.dedup();
    out
}

const MAX_BOUNDARY_DEPTH: usize = 4;

fn collect_boundaries(source: &str, node: &Node, lang: Lang, depth: usize, out: &mut Vec<usize>) {
    if depth > MAX_BOUNDARY_DEPTH {
        return;
    }
    let kinds = lang.entity_node_kinds();
    let child_count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(child) = node.named_child(i) else {
            continue;
        };
        if kinds.contains(&child.kind()) {
            out.push(line_start(source, child.start_byte()));
        }
        if child.named_child_count() > 0 {
            collect_boundaries(source, &child, lang, depth + 1, out);
        }
    }
}

/// Move `offset` back to the start of its line when only indentation precedes it.
fn line_start(source: &str, offset: usize) -> usize {
    let head = &source[..offset];
    match head.rfind('\n') {
        Some(nl) if head[nl + 1..].chars().all(char::is_whitespace) => nl + 1,
        None if head.chars().all(char::is_whitespace) => 0,
        _ => offset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_language_variants() {
        assert_eq!(detect_language(Path::new("src/main.rs")), Some(Lang::Rust));
        assert_eq!(detect_language(Path::new("a/b.pyi")), Some(Lang::Python));
        assert_eq!(detect_language(Path::new("x.tsx")), Some(Lang::TypeScript));
        assert_eq!(detect_language(Path::new("x.mjs")), Some(Lang::JavaScript));
        assert_eq!(detect_language(Path::new("README.md")), None);
        assert_eq!(detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn source_file_detection() {
        assert!(is_source_file(Path::new("src/App.java")));
        assert!(is_source_file(Path::new("lib.rs")));
        assert!(!is_source_file(Path::new("docs/guide.md")));
        assert!(!is_source_file(Path::new("Cargo.toml")));
    }

    #[test]
    fn line_start_skips_indentation() {
        let src = "mod a {\n    fn b() {}\n}";
        let fn_offset = src.find("fn").unwrap();
        assert_eq!(line_start(src, fn_offset), src.find("    fn").unwrap());
        assert_eq!(line_start(src, 0), 0);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_boundaries_include_functions_and_impl_members() {
        let src = "fn one() {}\n\nstruct S;\n\nimpl S {\n    fn two(&self) {}\n}\n";
        let b = entity_boundaries(src, Lang::Rust);
        assert!(b.contains(&0));
        assert!(b.contains(&src.find("struct").unwrap()));
        assert!(b.contains(&src.find("impl").unwrap()));
        assert!(b.contains(&src.find("    fn two").unwrap()));
        assert!(b.windows(2).all(|w| w[0] < w[1]));
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_boundaries() {
        let src = "import os\n\ndef f():\n    pass\n\nclass C:\n    def m(self):\n        pass\n";
        let b = entity_boundaries(src, Lang::Python);
        assert!(b.contains(&src.find("def f").unwrap()));
        assert!(b.contains(&src.find("class C").unwrap()));
    }
}
