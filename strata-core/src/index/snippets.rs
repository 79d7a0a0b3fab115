//! Named declarations (functions, types, classes) for outline listings and
//! context lookups.

use super::CodebaseIndex;
use crate::store::Store;
use crate::syntax::{self, FileType};
use crate::tag::{BranchAndDir, IndexTag, PathAndCacheKey};
use crate::workspace::Workspace;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SNIPPETS_ARTIFACT_ID: &str = "codeSnippets";

/// A declaration pulled out of a file. Lines are 1-indexed, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub title: String,
    pub content: String,
    pub signature: String,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnippetSummary {
    pub id: i64,
    pub title: String,
    pub path: String,
}

/// A snippet rendered for a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextItem {
    pub name: String,
    pub description: String,
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSignatures {
    pub path: String,
    pub signatures: Vec<String>,
}

pub struct SnippetIndex {
    store: Arc<Store>,
    workspace: Arc<dyn Workspace>,
}

/// Kinds whose whole text is the signature.
fn is_type_shape(kind: &str) -> bool {
    matches!(
        kind,
        "struct_item"
            | "enum_item"
            | "type_item"
            | "interface_declaration"
            | "type_alias_declaration"
            | "enum_declaration"
            | "type_spec"
    )
}

/// Declarations of `source`. `Err` when the grammar exists but the file
/// cannot be parsed; files without a grammar yield nothing.
pub fn extract_snippets(path: &str, source: &str) -> Result<Vec<Snippet>, String> {
    let file_path = Path::new(path);
    let file_type = FileType::from_path(file_path);
    if !file_type.has_tree_sitter_grammar() {
        return Ok(Vec::new());
    }
    let tree = syntax::parse_tree(file_path, source).ok_or_else(|| "parser gave up".to_string())?;
    let root = tree.root_node();
    if root.has_error() && root.named_child_count() == 0 {
        return Err("syntax tree is all errors".to_string());
    }

    let mut snippets = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if syntax::is_declaration(file_type, node.kind()) {
            if let Some(title) = syntax::declaration_name(&node, source) {
                let content = syntax::node_text(&node, source).to_string();
                let signature = match syntax::body_of(&node) {
                    Some(body) if !is_type_shape(node.kind()) => source
                        [node.start_byte()..body.start_byte()]
                        .trim_end()
                        .to_string(),
                    _ => content.clone(),
                };
                snippets.push(Snippet {
                    title,
                    content,
                    signature,
                    start_line: node.start_position().row + 1,
                    end_line: node.end_position().row + 1,
                });
            }
        }
        let mut cursor = node.walk();
        let children: Vec<tree_sitter::Node> = node.named_children(&mut cursor).collect();
        // reversed so the stack pops in source order
        stack.extend(children.into_iter().rev());
    }
    Ok(snippets)
}

impl SnippetIndex {
    pub fn new(store: Arc<Store>, workspace: Arc<dyn Workspace>) -> crate::Result<Self> {
        store.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS code_snippets (
                id INTEGER PRIMARY KEY,
                path TEXT NOT NULL,
                cache_key TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                signature TEXT NOT NULL,
                start_line INTEGER NOT NULL,
                end_line INTEGER NOT NULL,
                UNIQUE (cache_key, start_line, end_line, title)
            );

            CREATE TABLE IF NOT EXISTS code_snippets_tags (
                id INTEGER PRIMARY KEY,
                cache_key TEXT NOT NULL,
                tag TEXT NOT NULL,
                path TEXT NOT NULL,
                UNIQUE (cache_key, tag, path)
            );
            CREATE INDEX IF NOT EXISTS idx_code_snippets_tags_tag ON code_snippets_tags(tag);
            ",
        )?;
        Ok(Self { store, workspace })
    }

    fn tag_string(tag: &BranchAndDir) -> String {
        tag.with_artifact(SNIPPETS_ARTIFACT_ID).tag_string()
    }

    pub fn snippets_for_tag(&self, tag: &BranchAndDir) -> crate::Result<Vec<SnippetSummary>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.title, t.path FROM code_snippets s
             JOIN code_snippets_tags t ON s.cache_key = t.cache_key
             WHERE t.tag = ?1
             ORDER BY t.path, s.start_line",
        )?;
        let rows = stmt
            .query_map(params![Self::tag_string(tag)], |row| {
                Ok(SnippetSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    path: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The snippet rendered at the path `tag` links its content to. `None`
    /// when the id is unknown or its content is not in `tag`.
    pub fn snippet_by_id(
        &self,
        tag: &BranchAndDir,
        id: i64,
    ) -> crate::Result<Option<ContextItem>> {
        let conn = self.store.conn()?;
        let row: Option<(String, String, String)> = conn
            .prepare_cached(
                "SELECT s.title, s.content, t.path FROM code_snippets s
                 JOIN code_snippets_tags t ON s.cache_key = t.cache_key
                 WHERE s.id = ?1 AND t.tag = ?2
                 ORDER BY t.path
                 LIMIT 1",
            )?
            .query_row(params![id, Self::tag_string(tag)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        Ok(row.map(|(title, content, path)| {
            let segments: Vec<&str> = path.split(['/', '\\']).filter(|s| !s.is_empty()).collect();
            let description = segments[segments.len().saturating_sub(2)..].join("/");
            ContextItem {
                name: title,
                description,
                content: format!("```{path}\n{content}\n```"),
                path,
            }
        }))
    }

    /// Signatures grouped by file, paged over the tag's paths in order.
    pub fn paths_and_signatures(
        &self,
        tag: &BranchAndDir,
        offset: usize,
        batch_size: usize,
    ) -> crate::Result<Vec<FileSignatures>> {
        let conn = self.store.conn()?;
        let tag_string = Self::tag_string(tag);
        let paths: Vec<(String, String)> = conn
            .prepare_cached(
                "SELECT path, cache_key FROM code_snippets_tags WHERE tag = ?1
                 ORDER BY path LIMIT ?2 OFFSET ?3",
            )?
            .query_map(
                params![tag_string, batch_size as i64, offset as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare_cached(
            "SELECT signature FROM code_snippets WHERE cache_key = ?1 ORDER BY start_line",
        )?;
        let mut out = Vec::with_capacity(paths.len());
        for (path, cache_key) in paths {
            let signatures = stmt
                .query_map(params![cache_key], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            out.push(FileSignatures { path, signatures });
        }
        Ok(out)
    }
}

fn has_snippets(conn: &Connection, cache_key: &str) -> crate::Result<bool> {
    let found: Option<i64> = conn
        .prepare_cached("SELECT 1 FROM code_snippets WHERE cache_key = ?1 LIMIT 1")?
        .query_row(params![cache_key], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn link(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO code_snippets_tags (cache_key, tag, path) VALUES (?1, ?2, ?3)",
    )?
    .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

fn unlink(conn: &Connection, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
    conn.prepare_cached(
        "DELETE FROM code_snippets_tags WHERE cache_key = ?1 AND tag = ?2 AND path = ?3",
    )?
    .execute(params![item.cache_key, tag.tag_string(), item.path])?;
    Ok(())
}

impl CodebaseIndex for SnippetIndex {
    fn artifact_id(&self) -> String {
        SNIPPETS_ARTIFACT_ID.to_string()
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()> {
        for item in items {
            let exists = has_snippets(&*self.store.conn()?, &item.cache_key)?;
            let snippets = if exists {
                Vec::new()
            } else {
                match self.workspace.read_file(&item.path) {
                    Ok(bytes) => {
                        match extract_snippets(&item.path, &String::from_utf8_lossy(&bytes)) {
                            Ok(snippets) => snippets,
                            Err(reason) => {
                                warn!(path = %item.path, %reason, "snippet extraction failed");
                                Vec::new()
                            }
                        }
                    }
                    Err(e) => {
                        warn!(path = %item.path, error = %e, "could not read file for snippets");
                        Vec::new()
                    }
                }
            };

            let mut conn = self.store.conn()?;
            let tx = conn.transaction()?;
            {
                let mut insert = tx.prepare_cached(
                    "INSERT OR IGNORE INTO code_snippets
                     (path, cache_key, title, content, signature, start_line, end_line)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for s in &snippets {
                    insert.execute(params![
                        item.path,
                        item.cache_key,
                        s.title,
                        s.content,
                        s.signature,
                        s.start_line as i64,
                        s.end_line as i64,
                    ])?;
                }
            }
            link(&tx, tag, item)?;
            tx.commit()?;
            debug!(path = %item.path, snippets = snippets.len(), "snippets indexed");
        }
        Ok(())
    }

    fn add_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        link(&*self.store.conn()?, tag, item)
    }

    fn remove_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        unlink(&*self.store.conn()?, tag, item)
    }

    fn delete(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        unlink(&tx, tag, item)?;
        tx.execute(
            "DELETE FROM code_snippets WHERE cache_key = ?1",
            params![item.cache_key],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> crate::Result<()> {
        self.store
            .conn()?
            .execute_batch("DELETE FROM code_snippets; DELETE FROM code_snippets_tags;")?;
        Ok(())
    }
}
