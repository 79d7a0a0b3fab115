//! The indexer contract and the indexes built on it.

pub mod catalog;
pub mod chunks;
pub mod diff;
pub mod global_cache;
pub mod lexical;
pub mod snippets;
pub mod vector;

use crate::tag::{IndexTag, PathAndCacheKey};
use serde::Serialize;
use std::sync::Arc;

pub use catalog::TagCommitter;
pub use chunks::ChunkIndex;
pub use diff::{diff, diff_paths, ContentHasher, DiffOutcome};
pub use global_cache::GlobalCacheIndex;
pub use lexical::LexicalIndex;
pub use snippets::SnippetIndex;
pub use vector::VectorIndex;

/// The closed set of index kinds, in the order a refresh runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum IndexKind {
    Chunk,
    Lexical,
    Vector,
    Snippets,
}

impl IndexKind {
    /// Chunks come first: the lexical index reads chunk rows.
    pub const ORDER: [IndexKind; 4] = [Self::Chunk, Self::Lexical, Self::Vector, Self::Snippets];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Lexical => "lexical",
            Self::Vector => "vector",
            Self::Snippets => "snippets",
        }
    }

    /// Label shown in progress messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Chunk => "Chunking",
            Self::Lexical => "Full text search",
            Self::Vector => "Embedding",
            Self::Snippets => "Code snippets",
        }
    }

    fn position(self) -> usize {
        Self::ORDER.iter().position(|k| *k == self).unwrap_or(Self::ORDER.len())
    }
}

/// How an index maps its work onto a 0..1 progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressModel {
    /// Every item counts the same.
    PerItem,
    /// compute, addTag and the two removal buckets each take a third.
    ThreePhase,
}

/// What happened to an item; drives catalog and membership writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexResultType {
    Compute,
    AddTag,
    RemoveTag,
    Delete,
    /// Content unchanged; only the catalog timestamp moves.
    UpdateLastUpdated,
    /// Removal with no membership rows; repaired in the catalog only.
    Inconsistent,
}

/// Classification of one tag's files for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshIndexResults {
    pub compute: Vec<PathAndCacheKey>,
    pub add_tag: Vec<PathAndCacheKey>,
    pub remove_tag: Vec<PathAndCacheKey>,
    pub del: Vec<PathAndCacheKey>,
}

impl RefreshIndexResults {
    pub fn total_ops(&self) -> usize {
        self.compute.len() + self.add_tag.len() + self.remove_tag.len() + self.del.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_ops() == 0
    }

    /// Split into batches taking up to `size` items from every bucket.
    pub fn batches(&self, size: usize) -> Vec<RefreshIndexResults> {
        let size = size.max(1);
        let longest = [
            self.compute.len(),
            self.add_tag.len(),
            self.remove_tag.len(),
            self.del.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);

        let slice = |items: &[PathAndCacheKey], start: usize| -> Vec<PathAndCacheKey> {
            items.iter().skip(start).take(size).cloned().collect()
        };

        (0..longest)
            .step_by(size)
            .map(|start| RefreshIndexResults {
                compute: slice(&self.compute, start),
                add_tag: slice(&self.add_tag, start),
                remove_tag: slice(&self.remove_tag, start),
                del: slice(&self.del, start),
            })
            .collect()
    }
}

/// A chunk as returned by retrieval. Lines are 1-indexed, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub filepath: String,
    pub cache_key: String,
    pub index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

/// One step of an index update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexProgress {
    pub fraction: f64,
    pub message: String,
}

/// Commit callback handed to every update.
pub trait MarkComplete: Send + Sync {
    fn mark_complete(&self, items: &[PathAndCacheKey], result: IndexResultType)
        -> crate::Result<()>;
}

/// A persistent artifact builder driven by refresh diffs.
///
/// Implementations write their own rows for an item and return; the update
/// driver commits the item afterwards, so a failed write never advances the
/// catalog.
pub trait CodebaseIndex: Send + Sync {
    fn artifact_id(&self) -> String;

    fn progress_model(&self) -> ProgressModel {
        ProgressModel::PerItem
    }

    /// Items handed to one `compute` call.
    fn compute_batch_size(&self) -> usize {
        1
    }

    /// Called once before the first item of an update.
    fn begin(&self, _tag: &IndexTag) -> crate::Result<()> {
        Ok(())
    }

    fn compute(&self, tag: &IndexTag, items: &[PathAndCacheKey]) -> crate::Result<()>;
    fn add_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()>;
    fn remove_tag(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()>;
    fn delete(&self, tag: &IndexTag, item: &PathAndCacheKey) -> crate::Result<()>;

    /// Remove every artifact this index owns.
    fn clear(&self) -> crate::Result<()>;

    fn update(
        &self,
        tag: IndexTag,
        results: RefreshIndexResults,
        commit: Arc<dyn MarkComplete>,
    ) -> IndexUpdate<'_>
    where
        Self: Sized,
    {
        IndexUpdate::new(self, tag, results, commit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Begin,
    Compute,
    AddTag,
    RemoveTag,
    Delete,
    Done,
}

/// Lazy walk over one diff, bucket by bucket in the order
/// compute, addTag, removeTag, del. Each `next()` does one unit of work.
pub struct IndexUpdate<'a> {
    index: &'a dyn CodebaseIndex,
    tag: IndexTag,
    results: RefreshIndexResults,
    commit: Arc<dyn MarkComplete>,
    phase: Phase,
    pos: usize,
    done_ops: usize,
}

impl<'a> IndexUpdate<'a> {
    pub fn new(
        index: &'a dyn CodebaseIndex,
        tag: IndexTag,
        results: RefreshIndexResults,
        commit: Arc<dyn MarkComplete>,
    ) -> Self {
        Self {
            index,
            tag,
            results,
            commit,
            phase: Phase::Begin,
            pos: 0,
            done_ops: 0,
        }
    }

    fn bucket(&self, phase: Phase) -> &[PathAndCacheKey] {
        match phase {
            Phase::Compute => &self.results.compute,
            Phase::AddTag => &self.results.add_tag,
            Phase::RemoveTag => &self.results.remove_tag,
            Phase::Delete => &self.results.del,
            Phase::Begin | Phase::Done => &[],
        }
    }

    fn fraction(&self) -> f64 {
        match self.index.progress_model() {
            ProgressModel::PerItem => {
                let total = self.results.total_ops();
                if total == 0 {
                    1.0
                } else {
                    self.done_ops as f64 / total as f64
                }
            }
            ProgressModel::ThreePhase => {
                let share = |done: usize, len: usize| {
                    if len == 0 {
                        1.0
                    } else {
                        done as f64 / len as f64
                    }
                };
                let removals = self.results.remove_tag.len() + self.results.del.len();
                let (base, within) = match self.phase {
                    Phase::Begin => (0.0, 0.0),
                    Phase::Compute => (0.0, share(self.pos, self.results.compute.len())),
                    Phase::AddTag => (1.0, share(self.pos, self.results.add_tag.len())),
                    Phase::RemoveTag => (2.0, share(self.pos, removals)),
                    Phase::Delete => (
                        2.0,
                        share(self.results.remove_tag.len() + self.pos, removals),
                    ),
                    Phase::Done => (3.0, 0.0),
                };
                (base + within) / 3.0
            }
        }
    }

    fn step(&mut self) -> crate::Result<Option<IndexProgress>> {
        loop {
            let phase = self.phase;
            let next_phase = match phase {
                Phase::Begin => {
                    self.index.begin(&self.tag)?;
                    Phase::Compute
                }
                Phase::Done => return Ok(None),
                _ if self.pos >= self.bucket(phase).len() => match phase {
                    Phase::Compute => Phase::AddTag,
                    Phase::AddTag => Phase::RemoveTag,
                    Phase::RemoveTag => Phase::Delete,
                    _ => Phase::Done,
                },
                _ => break,
            };
            self.phase = next_phase;
            self.pos = 0;
        }

        let phase = self.phase;
        let take = if phase == Phase::Compute {
            self.index.compute_batch_size().max(1)
        } else {
            1
        };
        let end = self.pos.saturating_add(take).min(self.bucket(phase).len());
        let items: Vec<PathAndCacheKey> = self.bucket(phase)[self.pos..end].to_vec();

        let (result, verb) = match phase {
            Phase::Compute => {
                self.index.compute(&self.tag, &items)?;
                (IndexResultType::Compute, "Indexing")
            }
            Phase::AddTag => {
                self.index.add_tag(&self.tag, &items[0])?;
                (IndexResultType::AddTag, "Adding tag for")
            }
            Phase::RemoveTag => {
                self.index.remove_tag(&self.tag, &items[0])?;
                (IndexResultType::RemoveTag, "Removing tag for")
            }
            _ => {
                self.index.delete(&self.tag, &items[0])?;
                (IndexResultType::Delete, "Removing")
            }
        };
        self.commit.mark_complete(&items, result)?;

        self.pos = end;
        self.done_ops += items.len();
        let message = match items.as_slice() {
            [only] => format!("{verb} {}", only.path),
            [first, ..] => format!("{verb} {} and {} more", first.path, items.len() - 1),
            [] => verb.to_string(),
        };
        Ok(Some(IndexProgress {
            fraction: self.fraction(),
            message,
        }))
    }
}

impl Iterator for IndexUpdate<'_> {
    type Item = crate::Result<IndexProgress>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(progress)) => Some(Ok(progress)),
            Ok(None) => None,
            Err(e) => {
                self.phase = Phase::Done;
                Some(Err(e))
            }
        }
    }
}

/// One of the concrete indexes. The orchestrator runs them in
/// [`IndexKind::ORDER`] regardless of construction order.
pub enum Index {
    Chunk(ChunkIndex),
    Lexical(LexicalIndex),
    Vector(VectorIndex),
    Snippets(SnippetIndex),
}

impl Index {
    pub fn kind(&self) -> IndexKind {
        match self {
            Self::Chunk(_) => IndexKind::Chunk,
            Self::Lexical(_) => IndexKind::Lexical,
            Self::Vector(_) => IndexKind::Vector,
            Self::Snippets(_) => IndexKind::Snippets,
        }
    }

    pub fn as_codebase_index(&self) -> &dyn CodebaseIndex {
        match self {
            Self::Chunk(index) => index,
            Self::Lexical(index) => index,
            Self::Vector(index) => index,
            Self::Snippets(index) => index,
        }
    }

    pub fn artifact_id(&self) -> String {
        self.as_codebase_index().artifact_id()
    }

    pub fn update(
        &self,
        tag: IndexTag,
        results: RefreshIndexResults,
        commit: Arc<dyn MarkComplete>,
    ) -> IndexUpdate<'_> {
        IndexUpdate::new(self.as_codebase_index(), tag, results, commit)
    }

    pub(crate) fn order(&self) -> usize {
        self.kind().position()
    }
}
