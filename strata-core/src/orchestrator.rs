//! Drives a refresh over workspace roots and every registered index, as a
//! pull-based progress stream.

use crate::config::IndexingConfig;
use crate::error::StrataError;
use crate::hash::HashMemo;
use crate::index::{
    diff_paths, ContentHasher, DiffOutcome, Index, IndexProgress, IndexResultType, IndexUpdate,
    MarkComplete, RefreshIndexResults,
};
use crate::store::Store;
use crate::tag::IndexTag;
use crate::workspace::{LastModifiedMap, Workspace};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Shared pause switch. While set, a refresh stream blocks at its next step.
#[derive(Debug, Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_paused(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingStatus {
    Loading,
    Indexing,
    Paused,
    Cancelled,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub desc: String,
    pub status: IndexingStatus,
    pub warnings: Vec<String>,
    pub should_clear_indexes: bool,
}

/// Owns the indexes and runs refreshes over them.
pub struct CodebaseIndexer {
    store: Arc<Store>,
    workspace: Arc<dyn Workspace>,
    indexes: Vec<Index>,
    hasher: ContentHasher,
    config: IndexingConfig,
    pause: PauseToken,
}

impl CodebaseIndexer {
    pub fn new(
        store: Arc<Store>,
        workspace: Arc<dyn Workspace>,
        mut indexes: Vec<Index>,
        config: IndexingConfig,
    ) -> crate::Result<Self> {
        indexes.sort_by_key(|index| index.order());
        for pair in indexes.windows(2) {
            if pair[0].kind() == pair[1].kind() {
                return Err(StrataError::DuplicateIndex(pair[0].kind().as_str()));
            }
        }
        let hasher = ContentHasher::new(workspace.clone(), config.max_concurrent_reads)?;
        Ok(Self {
            store,
            workspace,
            indexes,
            hasher,
            config,
            pause: PauseToken::new(),
        })
    }

    pub fn pause_token(&self) -> PauseToken {
        self.pause.clone()
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// Refresh every index for every root.
    pub fn refresh(&self, roots: &[PathBuf], cancel: CancellationToken) -> RefreshStream<'_> {
        RefreshStream::new(self, roots.to_vec(), None, cancel)
    }

    /// Refresh only `files`; roots that contain none of them are skipped.
    /// A listed file missing from disk is removed from the index.
    pub fn refresh_files(
        &self,
        roots: &[PathBuf],
        files: &[String],
        cancel: CancellationToken,
    ) -> RefreshStream<'_> {
        let only: HashSet<String> = files.iter().cloned().collect();
        let roots = roots
            .iter()
            .filter(|root| {
                let prefix = root.to_string_lossy();
                only.iter().any(|f| f.starts_with(prefix.as_ref()))
            })
            .cloned()
            .collect();
        RefreshStream::new(self, roots, Some(only), cancel)
    }

    /// Drop every artifact, catalog row and membership row.
    pub fn clear_indexes(&self) -> crate::Result<()> {
        for index in &self.indexes {
            index.as_codebase_index().clear()?;
        }
        self.store.clear_core_tables()?;
        info!("cleared all indexes");
        Ok(())
    }
}

/// Per-root facts shared by the indexes of that root.
struct RootPass {
    index: usize,
    directory: String,
    branch: String,
    files: LastModifiedMap,
}

struct IndexPass<'a> {
    position: usize,
    tag: IndexTag,
    batches: VecDeque<RefreshIndexResults>,
    batch_count: usize,
    batch_no: usize,
    current: Option<IndexUpdate<'a>>,
    outcome_tail: Option<DiffOutcome>,
}

enum State<'a> {
    Start,
    NextRoot(usize),
    NextIndex(RootPass, usize),
    Running(RootPass, IndexPass<'a>),
    Finished,
}

enum Step {
    Yield(ProgressUpdate),
    Continue,
}

/// Lazy refresh. Each `next()` performs at most one unit of indexing work.
pub struct RefreshStream<'a> {
    indexer: &'a CodebaseIndexer,
    roots: Vec<PathBuf>,
    only: Option<HashSet<String>>,
    cancel: CancellationToken,
    memo: HashMemo,
    state: State<'a>,
    warnings: Vec<String>,
    should_clear_indexes: bool,
    failed_roots: usize,
    pause_reported: bool,
    progress: f64,
}

impl<'a> RefreshStream<'a> {
    fn new(
        indexer: &'a CodebaseIndexer,
        roots: Vec<PathBuf>,
        only: Option<HashSet<String>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            indexer,
            roots,
            only,
            cancel,
            memo: HashMemo::new(),
            state: State::Start,
            warnings: Vec::new(),
            should_clear_indexes: false,
            failed_roots: 0,
            pause_reported: false,
            progress: 0.0,
        }
    }

    fn update(&self, status: IndexingStatus, desc: impl Into<String>) -> ProgressUpdate {
        ProgressUpdate {
            progress: self.progress,
            desc: desc.into(),
            status,
            warnings: self.warnings.clone(),
            should_clear_indexes: self.should_clear_indexes,
        }
    }

    fn overall(&self, root: usize, position: usize, inner: f64) -> f64 {
        let roots = self.roots.len().max(1) as f64;
        let indexes = self.indexer.indexes.len().max(1) as f64;
        ((root as f64 + (position as f64 + inner.clamp(0.0, 1.0)) / indexes) / roots).min(1.0)
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Record a failed diff or a pass-fatal batch. Fatal errors abandon the
    /// rest of the root; others skip to the next index.
    fn fail(&mut self, root: RootPass, position: usize, tag: &IndexTag, e: StrataError) -> Step {
        if e.should_clear_indexes() {
            self.should_clear_indexes = true;
        }
        if e.is_fatal_for_pass() {
            error!(tag = %tag, error = %e, "indexing failed for root");
            self.failed_roots += 1;
            self.warnings.push(format!("Indexing failed for {}: {e}", root.directory));
            self.progress = self.overall(root.index + 1, 0, 0.0);
            self.state = State::NextRoot(root.index + 1);
            return Step::Yield(self.update(IndexingStatus::Failed, e.to_string()));
        }
        self.warn(format!("{tag}: {e}"));
        self.state = State::NextIndex(root, position + 1);
        Step::Continue
    }

    fn commit_tail(&mut self, outcome: &DiffOutcome) {
        let committer = &outcome.committer;
        let results = committer
            .mark_complete(&outcome.stale, IndexResultType::UpdateLastUpdated)
            .and_then(|_| {
                committer.mark_complete(&outcome.inconsistent, IndexResultType::Inconsistent)
            });
        if let Err(e) = results {
            if e.should_clear_indexes() {
                self.should_clear_indexes = true;
            }
            let tag = committer.tag();
            self.warn(format!("{tag}: could not refresh catalog timestamps: {e}"));
        }
        for item in &outcome.inconsistent {
            self.warnings.push(format!(
                "{}: {} had no membership rows; catalog entry dropped",
                committer.tag(),
                item.path
            ));
        }
    }

    fn step(&mut self) -> Step {
        let indexer = self.indexer;
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Start => {
                self.state = State::NextRoot(0);
                Step::Yield(self.update(IndexingStatus::Loading, "Loading files"))
            }

            State::NextRoot(i) => {
                let Some(root) = self.roots.get(i).cloned() else {
                    self.progress = 1.0;
                    let all_failed = !self.roots.is_empty() && self.failed_roots == self.roots.len();
                    let (status, desc) = if all_failed {
                        (IndexingStatus::Failed, "Indexing failed")
                    } else {
                        (IndexingStatus::Done, "Indexing complete")
                    };
                    info!(
                        roots = self.roots.len(),
                        warnings = self.warnings.len(),
                        "refresh finished"
                    );
                    return Step::Yield(self.update(status, desc));
                };

                let mut files = match indexer.workspace.list_files(&root) {
                    Ok(files) => files,
                    Err(e) => {
                        self.warn(format!("Could not list files in {}: {e}", root.display()));
                        self.failed_roots += 1;
                        self.progress = self.overall(i + 1, 0, 0.0);
                        self.state = State::NextRoot(i + 1);
                        return Step::Continue;
                    }
                };
                if let Some(only) = &self.only {
                    files.retain(|path, _| only.contains(path));
                }
                let branch = indexer.workspace.current_branch(&root);
                info!(root = %root.display(), %branch, files = files.len(), "refreshing root");
                self.memo = HashMemo::new();
                let pass = RootPass {
                    index: i,
                    directory: root.to_string_lossy().to_string(),
                    branch,
                    files,
                };
                self.state = State::NextIndex(pass, 0);
                Step::Continue
            }

            State::NextIndex(root, position) => {
                let Some(index) = indexer.indexes.get(position) else {
                    self.state = State::NextRoot(root.index + 1);
                    return Step::Continue;
                };
                let tag = IndexTag::new(&root.directory, &root.branch, index.artifact_id());
                let outcome = match diff_paths(
                    &indexer.store,
                    &tag,
                    &root.files,
                    &indexer.hasher,
                    &self.memo,
                    self.only.as_ref(),
                ) {
                    Ok(outcome) => outcome,
                    Err(e) => return self.fail(root, position, &tag, e),
                };

                if outcome.results.is_empty() {
                    self.commit_tail(&outcome);
                    self.progress = self.overall(root.index, position + 1, 0.0);
                    self.state = State::NextIndex(root, position + 1);
                    return Step::Continue;
                }

                let batches: VecDeque<RefreshIndexResults> = outcome
                    .results
                    .batches(indexer.config.files_per_batch)
                    .into();
                let desc = format!(
                    "{}: {} files to update",
                    index.kind().display_name(),
                    outcome.results.total_ops()
                );
                debug!(tag = %tag, batches = batches.len(), "index pass");
                self.progress = self.overall(root.index, position, 0.0);
                self.state = State::Running(
                    root,
                    IndexPass {
                        position,
                        tag,
                        batch_count: batches.len(),
                        batches,
                        batch_no: 0,
                        current: None,
                        outcome_tail: Some(outcome),
                    },
                );
                Step::Yield(self.update(IndexingStatus::Indexing, desc))
            }

            State::Running(root, mut pass) => {
                if pass.current.is_none() {
                    match pass.batches.pop_front() {
                        Some(batch) => {
                            let index = &indexer.indexes[pass.position];
                            let committer: Arc<dyn MarkComplete> = match &pass.outcome_tail {
                                Some(outcome) => outcome.committer.clone(),
                                None => {
                                    self.state = State::NextIndex(root, pass.position + 1);
                                    return Step::Continue;
                                }
                            };
                            pass.current = Some(index.update(pass.tag.clone(), batch, committer));
                        }
                        None => {
                            if let Some(outcome) = pass.outcome_tail.take() {
                                self.commit_tail(&outcome);
                            }
                            self.progress = self.overall(root.index, pass.position + 1, 0.0);
                            self.state = State::NextIndex(root, pass.position + 1);
                            return Step::Continue;
                        }
                    }
                }

                let next = pass.current.as_mut().and_then(|update| update.next());
                match next {
                    Some(Ok(IndexProgress { fraction, message })) => {
                        let inner =
                            (pass.batch_no as f64 + fraction) / pass.batch_count.max(1) as f64;
                        self.progress = self.overall(root.index, pass.position, inner);
                        let name = indexer.indexes[pass.position].kind().display_name();
                        let desc = format!("{name}: {message}");
                        self.state = State::Running(root, pass);
                        Step::Yield(self.update(IndexingStatus::Indexing, desc))
                    }
                    Some(Err(e)) if e.is_fatal_for_pass() => {
                        let tag = pass.tag.clone();
                        self.fail(root, pass.position, &tag, e)
                    }
                    Some(Err(e)) => {
                        // The failed batch stays uncommitted and is retried by the next refresh.
                        if e.should_clear_indexes() {
                            self.should_clear_indexes = true;
                        }
                        self.warn(format!(
                            "{}: batch {} of {}: {e}",
                            pass.tag,
                            pass.batch_no + 1,
                            pass.batch_count
                        ));
                        pass.current = None;
                        pass.batch_no += 1;
                        self.state = State::Running(root, pass);
                        Step::Continue
                    }
                    None => {
                        pass.current = None;
                        pass.batch_no += 1;
                        self.state = State::Running(root, pass);
                        Step::Continue
                    }
                }
            }

            State::Finished => Step::Continue,
        }
    }
}

impl Iterator for RefreshStream<'_> {
    type Item = ProgressUpdate;

    fn next(&mut self) -> Option<ProgressUpdate> {
        if matches!(self.state, State::Finished) {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.state = State::Finished;
            info!("refresh cancelled");
            return Some(self.update(IndexingStatus::Cancelled, "Indexing cancelled"));
        }
        if self.indexer.pause.is_paused() {
            if !self.pause_reported {
                self.pause_reported = true;
                return Some(self.update(IndexingStatus::Paused, "Indexing paused"));
            }
            while self.indexer.pause.is_paused() && !self.cancel.is_cancelled() {
                thread::sleep(PAUSE_POLL);
            }
            if self.cancel.is_cancelled() {
                self.state = State::Finished;
                return Some(self.update(IndexingStatus::Cancelled, "Indexing cancelled"));
            }
        }
        self.pause_reported = false;

        loop {
            match self.step() {
                Step::Yield(update) => return Some(update),
                Step::Continue if matches!(self.state, State::Finished) => return None,
                Step::Continue => {}
            }
        }
    }
}
