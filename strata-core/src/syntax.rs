//! Language detection and tree-sitter helpers shared by chunking and
//! snippet extraction.

use std::path::Path;

/// Detect file type from extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Markdown,
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Other,
}

impl FileType {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("md" | "markdown") => Self::Markdown,
            Some("rs") => Self::Rust,
            Some("py") => Self::Python,
            Some("js" | "jsx" | "mjs" | "cjs") => Self::JavaScript,
            Some("ts" | "tsx" | "mts" | "cts") => Self::TypeScript,
            Some("go") => Self::Go,
            _ => Self::Other,
        }
    }

    pub fn is_markdown(self) -> bool {
        matches!(self, Self::Markdown)
    }

    pub fn has_tree_sitter_grammar(self) -> bool {
        matches!(
            self,
            Self::Rust | Self::Python | Self::JavaScript | Self::TypeScript | Self::Go
        )
    }
}

/// Parse source with the grammar for `path`. `None` when the file type has
/// no grammar or the parser gives up.
pub fn parse_tree(path: &Path, source: &str) -> Option<tree_sitter::Tree> {
    let language: tree_sitter::Language = match FileType::from_path(path) {
        FileType::Rust => tree_sitter_rust::LANGUAGE.into(),
        FileType::Python => tree_sitter_python::LANGUAGE.into(),
        FileType::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        FileType::TypeScript => {
            // Use TSX for .tsx files, regular TS for others
            if path.extension().is_some_and(|e| e == "tsx") {
                tree_sitter_typescript::LANGUAGE_TSX.into()
            } else {
                tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()
            }
        }
        FileType::Go => tree_sitter_go::LANGUAGE.into(),
        FileType::Markdown | FileType::Other => return None,
    };

    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&language).ok()?;
    parser.parse(source, None)
}

/// Named declaration kinds worth keeping whole in a chunk or listing as a
/// snippet.
pub fn is_declaration(file_type: FileType, kind: &str) -> bool {
    match file_type {
        FileType::Rust => matches!(
            kind,
            "function_item"
                | "impl_item"
                | "struct_item"
                | "enum_item"
                | "trait_item"
                | "mod_item"
                | "type_item"
                | "macro_definition"
        ),
        FileType::Python => matches!(kind, "function_definition" | "class_definition"),
        FileType::JavaScript | FileType::TypeScript => matches!(
            kind,
            "function_declaration"
                | "class_declaration"
                | "method_definition"
                | "interface_declaration"
                | "type_alias_declaration"
                | "enum_declaration"
        ),
        FileType::Go => matches!(
            kind,
            "function_declaration" | "method_declaration" | "type_spec"
        ),
        FileType::Markdown | FileType::Other => false,
    }
}

/// Node kinds whose body holds further declarations (impl blocks, classes).
pub fn body_of<'a>(node: &tree_sitter::Node<'a>) -> Option<tree_sitter::Node<'a>> {
    node.child_by_field_name("body")
        .or_else(|| find_child_by_kind(node, "declaration_list"))
        .or_else(|| find_child_by_kind(node, "class_body"))
        .or_else(|| find_child_by_kind(node, "block"))
}

pub fn find_child_by_kind<'a>(
    node: &tree_sitter::Node<'a>,
    kind: &str,
) -> Option<tree_sitter::Node<'a>> {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).find(|child| child.kind() == kind);
    found
}

pub fn node_text<'s>(node: &tree_sitter::Node, source: &'s str) -> &'s str {
    &source[node.start_byte()..node.end_byte().min(source.len())]
}

/// Name of a declaration node, following each grammar's field layout.
pub fn declaration_name(node: &tree_sitter::Node, source: &str) -> Option<String> {
    if node.kind() == "impl_item" {
        // impl<T> Trait for Foo<T> names the implementing type
        return node.child_by_field_name("type").map(|t| {
            if t.kind() == "generic_type" {
                t.child_by_field_name("type")
                    .map(|inner| node_text(&inner, source).to_string())
                    .unwrap_or_else(|| node_text(&t, source).to_string())
            } else {
                node_text(&t, source).to_string()
            }
        });
    }
    node.child_by_field_name("name")
        .or_else(|| find_child_by_kind(node, "identifier"))
        .or_else(|| find_child_by_kind(node, "type_identifier"))
        .map(|n| node_text(&n, source).to_string())
}

/// Byte offset of the first character of the line containing `offset`.
pub fn line_start(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())]
        .rfind('\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}
