//! Strata Core - Content-addressed, tag-partitioned codebase indexing
//!
//! Files are keyed by the hash of their contents and every derived artifact
//! (chunks, full-text rows, embeddings, snippets) is computed once per key and
//! shared by every directory/branch tag that contains it. A refresh diffs the
//! workspace against the tag catalog and only does the work that changed.

pub mod chunker;
pub mod completion_cache;
pub mod config;
pub mod embed;
pub mod error;
pub mod hash;
pub mod index;
pub mod orchestrator;
pub mod store;
pub mod syntax;
pub mod tag;
pub mod vector_store;
pub mod workspace;

pub use chunker::ChunkPolicy;
pub use completion_cache::CompletionCache;
pub use config::Config;
pub use embed::{EmbedError, Embedder};
pub use error::StrataError;
pub use hash::{content_key, HashMemo};
pub use index::{
    Chunk, ChunkIndex, CodebaseIndex, Index, IndexKind, IndexResultType, LexicalIndex,
    RefreshIndexResults, SnippetIndex, VectorIndex,
};
pub use orchestrator::{
    CancellationToken, CodebaseIndexer, IndexingStatus, PauseToken, ProgressUpdate,
};
pub use store::Store;
pub use tag::{BranchAndDir, IndexTag, PathAndCacheKey};
pub use vector_store::{open_vector_store, VectorStore, VectorStoreStatus};
pub use workspace::{LastModifiedMap, LocalWorkspace, Workspace};

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
