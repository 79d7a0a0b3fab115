//! Chunking policy shared by the chunk and vector indexes.

use crate::config::IndexingConfig;
use crate::syntax::{self, FileType};
use pulldown_cmark::{Event, Parser, Tag};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// A chunk before it is bound to a cache key. Lines are 1-indexed, inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    pub max_chunk_tokens: usize,
    pub max_file_bytes: usize,
    non_structural: HashSet<String>,
}

impl ChunkPolicy {
    pub fn from_config(config: &IndexingConfig) -> Self {
        Self {
            max_chunk_tokens: config.max_chunk_tokens,
            max_file_bytes: config.max_file_bytes,
            non_structural: config
                .non_structural_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Same policy with a different token budget (an embedder's own limit).
    pub fn with_max_tokens(mut self, max_chunk_tokens: usize) -> Self {
        self.max_chunk_tokens = max_chunk_tokens;
        self
    }

    /// Files that are empty, too large, or have no extension are not chunked.
    pub fn should_chunk(&self, path: &str, content: &str) -> bool {
        if content.is_empty() || content.len() > self.max_file_bytes {
            return false;
        }
        Path::new(path).extension().is_some()
    }

    fn is_non_structural(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.non_structural.contains(&e.to_ascii_lowercase()))
    }

    /// Split a document, dropping any chunk over the token budget.
    pub fn chunk_document(&self, path: &str, content: &str) -> Vec<RawChunk> {
        if !self.should_chunk(path, content) {
            return Vec::new();
        }

        let file_path = Path::new(path);
        let file_type = FileType::from_path(file_path);
        let chunks = if self.is_non_structural(file_path) {
            basic_chunks(content, 1, self.max_chunk_tokens)
        } else if file_type.is_markdown() {
            markdown_chunks(content, self.max_chunk_tokens)
        } else if file_type.has_tree_sitter_grammar() {
            match code_chunks(file_path, content, file_type, self.max_chunk_tokens) {
                Some(chunks) if !chunks.is_empty() => chunks,
                _ => basic_chunks(content, 1, self.max_chunk_tokens),
            }
        } else {
            basic_chunks(content, 1, self.max_chunk_tokens)
        };

        chunks
            .into_iter()
            .filter(|chunk| {
                let tokens = estimate_tokens(&chunk.content);
                if tokens > self.max_chunk_tokens {
                    debug!(path, tokens, start = chunk.start_line, "dropping oversized chunk");
                    false
                } else {
                    !chunk.content.trim().is_empty()
                }
            })
            .collect()
    }
}

/// Pack whole lines up to the token budget. Lines that alone exceed the
/// budget are skipped.
fn basic_chunks(content: &str, first_line: usize, max_tokens: usize) -> Vec<RawChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;
    let mut start_line = first_line;
    let mut last_line = first_line;

    for (offset, line) in content.lines().enumerate() {
        let line_no = first_line + offset;
        let line_tokens = estimate_tokens(line);
        if line_tokens > max_tokens {
            continue;
        }
        if !current.is_empty() && current_tokens + line_tokens + 1 > max_tokens {
            chunks.push(RawChunk {
                content: std::mem::take(&mut current),
                start_line,
                end_line: last_line,
            });
            current_tokens = 0;
        }
        if current.is_empty() {
            start_line = line_no;
        }
        current.push_str(line);
        current.push('\n');
        current_tokens += line_tokens + 1;
        last_line = line_no;
    }

    if !current.is_empty() {
        chunks.push(RawChunk {
            content: current,
            start_line,
            end_line: last_line,
        });
    }
    chunks
}

/// One section per heading; sections over budget fall back to line packing.
fn markdown_chunks(content: &str, max_tokens: usize) -> Vec<RawChunk> {
    let mut section_starts = vec![0usize];
    for (event, range) in Parser::new(content).into_offset_iter() {
        if let Event::Start(Tag::Heading { .. }) = event {
            if range.start > 0 {
                section_starts.push(syntax::line_start(content, range.start));
            }
        }
    }
    section_starts.dedup();

    let mut chunks = Vec::new();
    for (i, &start) in section_starts.iter().enumerate() {
        let end = section_starts.get(i + 1).copied().unwrap_or(content.len());
        let text = &content[start..end];
        if text.trim().is_empty() {
            continue;
        }
        let first_line = line_of(content, start);
        if estimate_tokens(text) <= max_tokens {
            chunks.push(RawChunk {
                content: text.to_string(),
                start_line: first_line,
                end_line: first_line + text.trim_end_matches('\n').lines().count().max(1) - 1,
            });
        } else {
            chunks.extend(basic_chunks(text, first_line, max_tokens));
        }
    }
    chunks
}

/// Declaration-bounded chunks from the syntax tree. `None` when the file
/// does not parse.
fn code_chunks(
    path: &Path,
    content: &str,
    file_type: FileType,
    max_tokens: usize,
) -> Option<Vec<RawChunk>> {
    let tree = syntax::parse_tree(path, content)?;
    let root = tree.root_node();
    if root.has_error() && root.named_child_count() == 0 {
        return None;
    }
    let mut chunks = Vec::new();
    pack_nodes(&root, content, file_type, max_tokens, &mut chunks);
    Some(chunks)
}

/// Greedily group sibling nodes into chunks; a sibling too large on its own
/// is split through its body, or by lines when it has none.
fn pack_nodes(
    parent: &tree_sitter::Node,
    source: &str,
    file_type: FileType,
    max_tokens: usize,
    out: &mut Vec<RawChunk>,
) {
    let mut group: Option<(usize, usize, usize)> = None; // (start byte, end byte, tokens)

    let mut cursor = parent.walk();
    let children: Vec<tree_sitter::Node> = parent.named_children(&mut cursor).collect();
    for child in children {
        let start = syntax::line_start(source, child.start_byte());
        let end = child.end_byte().min(source.len());
        let tokens = estimate_tokens(&source[start..end]);

        if tokens > max_tokens {
            if let Some(g) = group.take() {
                out.push(span_chunk(source, g.0, g.1));
            }
            match syntax::body_of(&child) {
                Some(body) if syntax::is_declaration(file_type, child.kind()) => {
                    pack_nodes(&body, source, file_type, max_tokens, out)
                }
                _ => out.extend(basic_chunks(
                    &source[start..end],
                    line_of(source, start),
                    max_tokens,
                )),
            }
            continue;
        }

        group = match group {
            Some((g_start, _, g_tokens)) if g_tokens + tokens <= max_tokens => {
                Some((g_start, end, g_tokens + tokens))
            }
            Some(g) => {
                out.push(span_chunk(source, g.0, g.1));
                Some((start, end, tokens))
            }
            None => Some((start, end, tokens)),
        };
    }

    if let Some(g) = group {
        out.push(span_chunk(source, g.0, g.1));
    }
}

fn span_chunk(source: &str, start: usize, end: usize) -> RawChunk {
    let text = &source[start..end];
    let start_line = line_of(source, start);
    let end_line = start_line + text.matches('\n').count();
    RawChunk {
        content: text.to_string(),
        start_line,
        end_line,
    }
}

/// 1-indexed line containing byte `offset`.
fn line_of(source: &str, offset: usize) -> usize {
    source[..offset.min(source.len())].matches('\n').count() + 1
}

static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

/// Estimate token count using tiktoken-rs
pub fn estimate_tokens(text: &str) -> usize {
    // cl100k_base is loaded once; fall back to 4 chars per token without it
    match BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}
