//! Partitioned nearest-neighbour storage behind a backend-neutral trait.

mod memory;
mod sqlite;

pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use crate::config::VectorConfig;
use crate::error::StrataError;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A stored embedding. `path` is the referencing path in this partition.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub uuid: String,
    pub path: String,
    pub cache_key: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub uuid: String,
    pub path: String,
    pub cache_key: String,
    pub distance: f32,
}

pub trait VectorStore: Send + Sync {
    fn backend(&self) -> &'static str;

    fn has_partition(&self, name: &str) -> crate::Result<bool>;

    /// Create `name` holding `rows`. Creating an existing partition appends.
    fn create_partition(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()>;

    fn insert(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()>;

    /// Delete rows for `cache_key`, only those at `path` when given.
    /// Returns the number of rows removed.
    fn delete(&self, name: &str, cache_key: &str, path: Option<&str>) -> crate::Result<usize>;

    /// `limit` nearest rows by L2 distance, closest first.
    fn search(&self, name: &str, query: &[f32], limit: usize) -> crate::Result<Vec<VectorHit>>;

    fn partitions(&self) -> crate::Result<Vec<String>>;

    /// Drop every partition.
    fn clear(&self) -> crate::Result<()>;
}

/// Outcome of opening the configured backend.
pub enum VectorStoreStatus {
    Ready(Arc<dyn VectorStore>),
    Unsupported { backend: String, reason: String },
    Failed(StrataError),
}

impl VectorStoreStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

pub fn open_vector_store(config: &VectorConfig, dir: &Path) -> VectorStoreStatus {
    match config.backend.as_str() {
        "sqlite" => match SqliteVectorStore::open(dir) {
            Ok(store) => {
                info!(dir = %dir.display(), "opened sqlite vector store");
                VectorStoreStatus::Ready(Arc::new(store))
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "vector store failed to open");
                VectorStoreStatus::Failed(e)
            }
        },
        "memory" => VectorStoreStatus::Ready(Arc::new(MemoryVectorStore::new())),
        other => {
            warn!(backend = other, "vector store backend not available");
            VectorStoreStatus::Unsupported {
                backend: other.to_string(),
                reason: "backend is not built into this library".to_string(),
            }
        }
    }
}

pub(crate) fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Keep the `limit` closest hits, closest first.
pub(crate) fn nearest(mut hits: Vec<VectorHit>, limit: usize) -> Vec<VectorHit> {
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    hits.truncate(limit);
    hits
}
