use super::{l2_distance, nearest, VectorHit, VectorRow, VectorStore};
use crate::error::StrataError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-local backend; nothing survives the process.
#[derive(Default)]
pub struct MemoryVectorStore {
    partitions: RwLock<HashMap<String, Vec<VectorRow>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StrataError {
    StrataError::VectorStore("memory vector store lock poisoned".to_string())
}

impl VectorStore for MemoryVectorStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn has_partition(&self, name: &str) -> crate::Result<bool> {
        Ok(self.partitions.read().map_err(poisoned)?.contains_key(name))
    }

    fn create_partition(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()> {
        self.partitions
            .write()
            .map_err(poisoned)?
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    fn insert(&self, name: &str, rows: &[VectorRow]) -> crate::Result<()> {
        let mut partitions = self.partitions.write().map_err(poisoned)?;
        let partition = partitions
            .get_mut(name)
            .ok_or_else(|| StrataError::VectorStore(format!("no partition {name}")))?;
        partition.extend_from_slice(rows);
        Ok(())
    }

    fn delete(&self, name: &str, cache_key: &str, path: Option<&str>) -> crate::Result<usize> {
        let mut partitions = self.partitions.write().map_err(poisoned)?;
        let Some(partition) = partitions.get_mut(name) else {
            return Ok(0);
        };
        let before = partition.len();
        partition.retain(|row| {
            !(row.cache_key == cache_key && path.map_or(true, |p| row.path == p))
        });
        Ok(before - partition.len())
    }

    fn search(&self, name: &str, query: &[f32], limit: usize) -> crate::Result<Vec<VectorHit>> {
        let partitions = self.partitions.read().map_err(poisoned)?;
        let Some(partition) = partitions.get(name) else {
            return Ok(Vec::new());
        };
        let hits = partition
            .iter()
            .map(|row| VectorHit {
                uuid: row.uuid.clone(),
                path: row.path.clone(),
                cache_key: row.cache_key.clone(),
                distance: l2_distance(query, &row.vector),
            })
            .collect();
        Ok(nearest(hits, limit))
    }

    fn partitions(&self) -> crate::Result<Vec<String>> {
        let mut names: Vec<String> = self
            .partitions
            .read()
            .map_err(poisoned)?
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    fn clear(&self) -> crate::Result<()> {
        self.partitions.write().map_err(poisoned)?.clear();
        Ok(())
    }
}
