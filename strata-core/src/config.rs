//! Configuration for strata

use crate::StrataError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration as TOML
pub const DEFAULT_CONFIG: &str = r#"# Strata Configuration

[indexing]
# Files handed to each index per batch during refresh
files_per_batch = 200
# Upper bound on files read concurrently while hashing
max_concurrent_reads = 16
# Files larger than this (bytes) are not chunked
max_file_bytes = 1000000
# Chunks above this token count are dropped
max_chunk_tokens = 512
# Formats that skip syntax-aware chunking
non_structural_extensions = ["css", "scss", "sass", "less", "html", "htm", "xml", "svg", "json", "yaml", "yml", "toml", "txt", "csv"]

[lexical]
# FTS5 tokenizer (trigram supports substring matches in identifiers)
tokenizer = "trigram"
# bm25 weight of the path column relative to content
path_weight = 10.0
# Matches scoring above this are dropped (bm25 is negative, lower is better)
bm25_threshold = -2.5

[vector]
# Vector store backend: "sqlite" or "memory"
backend = "sqlite"
# Rows fetched per partition before applying a path filter
path_filter_overfetch = 300
# Files whose chunks are embedded in one provider call
files_per_embed_batch = 20

[completion]
capacity = 1000
# How often dirty entries are written back (e.g., "30s", "5m")
flush_interval = "30s"

[ignore]
# Additional patterns to ignore (beyond .gitignore)
patterns = [
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "*.min.js",
    "*.lock",
]
"#;

/// Strata configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_files_per_batch")]
    pub files_per_batch: usize,
    #[serde(default = "default_max_concurrent_reads")]
    pub max_concurrent_reads: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
    #[serde(default = "default_non_structural_extensions")]
    pub non_structural_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    #[serde(default = "default_path_weight")]
    pub path_weight: f64,
    #[serde(default = "default_bm25_threshold")]
    pub bm25_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_path_filter_overfetch")]
    pub path_filter_overfetch: usize,
    #[serde(default = "default_files_per_embed_batch")]
    pub files_per_embed_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreConfig {
    #[serde(default = "default_ignore_patterns")]
    pub patterns: Vec<String>,
}

// Default value functions
fn default_files_per_batch() -> usize {
    200
}
fn default_max_concurrent_reads() -> usize {
    16
}
fn default_max_file_bytes() -> usize {
    1_000_000
}
fn default_max_chunk_tokens() -> usize {
    512
}
fn default_non_structural_extensions() -> Vec<String> {
    [
        "css", "scss", "sass", "less", "html", "htm", "xml", "svg", "json", "yaml", "yml", "toml",
        "txt", "csv",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_tokenizer() -> String {
    "trigram".to_string()
}
fn default_path_weight() -> f64 {
    10.0
}
fn default_bm25_threshold() -> f64 {
    -2.5
}
fn default_backend() -> String {
    "sqlite".to_string()
}
fn default_path_filter_overfetch() -> usize {
    300
}
fn default_files_per_embed_batch() -> usize {
    20
}
fn default_capacity() -> usize {
    1000
}
fn default_flush_interval() -> String {
    "30s".to_string()
}
fn default_ignore_patterns() -> Vec<String> {
    vec![
        ".git".to_string(),
        "node_modules".to_string(),
        "target".to_string(),
        "__pycache__".to_string(),
    ]
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            files_per_batch: default_files_per_batch(),
            max_concurrent_reads: default_max_concurrent_reads(),
            max_file_bytes: default_max_file_bytes(),
            max_chunk_tokens: default_max_chunk_tokens(),
            non_structural_extensions: default_non_structural_extensions(),
        }
    }
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            tokenizer: default_tokenizer(),
            path_weight: default_path_weight(),
            bm25_threshold: default_bm25_threshold(),
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path_filter_overfetch: default_path_filter_overfetch(),
            files_per_embed_batch: default_files_per_embed_batch(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_interval: default_flush_interval(),
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            patterns: default_ignore_patterns(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| StrataError::ConfigParse(e.to_string()))
    }
}

impl CompletionConfig {
    /// Flush interval as Duration, 30s when unparseable
    pub fn flush_interval_duration(&self) -> Duration {
        parse_duration(&self.flush_interval).unwrap_or(Duration::from_secs(30))
    }
}

/// Parse duration string (e.g., "30s", "5m", "1h")
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        "d" => Some(Duration::from_secs(num * 86400)),
        _ => None,
    }
}
