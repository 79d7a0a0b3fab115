//! Index partitions and the identifiers that flow through a refresh.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Longest partition name handed to a vector store backend. Backends that
/// map partitions to files append a short extension, so stay well under the
/// common 255-byte file name limit.
pub const MAX_PARTITION_NAME: usize = 240;

/// One indexing partition: a directory on a branch for one artifact kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexTag {
    pub directory: String,
    pub branch: String,
    pub artifact_id: String,
}

impl IndexTag {
    pub fn new(
        directory: impl Into<String>,
        branch: impl Into<String>,
        artifact_id: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            branch: branch.into(),
            artifact_id: artifact_id.into(),
        }
    }

    /// `directory::branch::artifact_id`, the value stored in join tables.
    pub fn tag_string(&self) -> String {
        format!("{}::{}::{}", self.directory, self.branch, self.artifact_id)
    }

    pub fn branch_and_dir(&self) -> BranchAndDir {
        BranchAndDir {
            directory: self.directory.clone(),
            branch: self.branch.clone(),
        }
    }
}

impl fmt::Display for IndexTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag_string())
    }
}

/// Retrieval-side selector; each index supplies its own artifact id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchAndDir {
    pub directory: String,
    pub branch: String,
}

impl BranchAndDir {
    pub fn new(directory: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            branch: branch.into(),
        }
    }

    pub fn with_artifact(&self, artifact_id: &str) -> IndexTag {
        IndexTag::new(&self.directory, &self.branch, artifact_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathAndCacheKey {
    pub path: String,
    pub cache_key: String,
}

impl PathAndCacheKey {
    pub fn new(path: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cache_key: cache_key.into(),
        }
    }
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect()
}

/// Deterministic vector-store partition name for a tag.
///
/// Every name starts with the first eight hex digits of the tag string's
/// digest, so tags that sanitize to the same text stay apart. Long
/// directories collapse to the tail of their last segment; branch and
/// artifact id are always kept.
pub fn partition_name(tag: &IndexTag) -> String {
    let digest = hex::encode(Sha256::digest(tag.tag_string().as_bytes()));
    let prefix = &digest[..8];
    let suffix = format!("__{}__{}", sanitize(&tag.branch), sanitize(&tag.artifact_id));
    let full = format!("{prefix}_{}{suffix}", sanitize(&tag.directory));
    if full.len() <= MAX_PARTITION_NAME {
        return full;
    }

    let last_segment = tag
        .directory
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .map(sanitize)
        .unwrap_or_default();

    // prefix + '_' + segment + suffix
    let room = MAX_PARTITION_NAME.saturating_sub(prefix.len() + 1 + suffix.len());
    let segment = if last_segment.len() > room {
        // sanitized text is ASCII, so byte slicing is safe
        &last_segment[last_segment.len() - room..]
    } else {
        last_segment.as_str()
    };

    let name = format!("{prefix}_{segment}{suffix}");
    if name.len() <= MAX_PARTITION_NAME {
        name
    } else {
        // Branch and artifact id alone overflow the ceiling.
        digest
    }
}
