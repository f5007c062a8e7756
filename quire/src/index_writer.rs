use std::collections::BTreeSet;
use std::collections::HashSet;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Codec, IndexMetaWriter};
use crate::comparator::Comparator;
use crate::consolidation::{ConsolidatingSegments, ConsolidationPolicy};
use crate::directory::{self, Directory, DirectoryLock, WRITE_LOCK_NAME};
use crate::doc::Field;
use crate::doc_mask::DocumentMask;
use crate::error::Error;
use crate::filter::{matching_docs, Filter};
use crate::flush_context::{FlushContext, ModificationQuery, PendingSegment, FLUSH_CONTEXTS};
use crate::index_reader::IndexReader;
use crate::merge_writer::{MergeWriter, MergedSegment, Progress};
use crate::meta::{IndexFeatures, IndexMeta, IndexSegment};
use crate::readers_cache::ReadersCache;
use crate::segment_pool::{SegmentPool, SegmentRef, SlotState};
use crate::segment_reader::SegmentReader;
use crate::segment_writer::{Begin, SegmentWriter, UpdateContext};
use crate::{DocId, DOC_ID_MIN};

/// How long a transaction waits for a segment slot before it looks at the flush contexts again.
const POOL_WAIT: Duration = Duration::from_millis(100);

/// Produces the user payload stored with an index state, given the highest tick committed.
pub type PayloadProvider = dyn Fn(u64) -> Option<Vec<u8>> + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from an empty index. An existing one is replaced by the first commit.
    Create,
    /// Fail with `IndexNotFound` unless an index was committed before.
    Append,
    CreateOrAppend,
}

/// Bounds on the segments being built. 0 lifts a limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentLimits {
    /// Segments built at the same time.
    pub segment_count_max: usize,
    /// Documents buffered by a segment before it is sealed.
    pub segment_docs_max: usize,
    /// Bytes buffered by a segment before it is sealed.
    pub segment_memory_max: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsolidationStatus {
    /// Merged, or nothing worth merging. Visible with the next commit.
    Ok,
    /// A candidate is being merged elsewhere or went away, or the merge itself failed.
    Fail,
    /// A commit was in progress. The policy runs with the next commit.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsolidationResult {
    /// Number of segments merged.
    pub size: usize,
    pub status: ConsolidationStatus,
}

impl ConsolidationResult {
    fn new(size: usize, status: ConsolidationStatus) -> ConsolidationResult {
        ConsolidationResult { size, status }
    }
}

pub struct IndexWriterBuilder {
    segment_pool_size: usize,
    limits: SegmentLimits,
    lock_repository: bool,
    comparator: Option<Arc<dyn Comparator>>,
    payload_provider: Option<Arc<PayloadProvider>>,
}

impl Default for IndexWriterBuilder {
    fn default() -> IndexWriterBuilder {
        IndexWriterBuilder::new()
    }
}

impl IndexWriterBuilder {
    pub fn new() -> IndexWriterBuilder {
        IndexWriterBuilder {
            segment_pool_size: 128,
            limits: SegmentLimits::default(),
            lock_repository: true,
            comparator: None,
            payload_provider: None,
        }
    }

    pub fn segment_pool_size(mut self, val: usize) -> IndexWriterBuilder {
        self.segment_pool_size = val;
        self
    }

    pub fn segment_count_max(mut self, val: usize) -> IndexWriterBuilder {
        self.limits.segment_count_max = val;
        self
    }

    pub fn segment_docs_max(mut self, val: usize) -> IndexWriterBuilder {
        self.limits.segment_docs_max = val;
        self
    }

    pub fn segment_memory_max(mut self, val: usize) -> IndexWriterBuilder {
        self.limits.segment_memory_max = val;
        self
    }

    pub fn segment_limits(mut self, val: SegmentLimits) -> IndexWriterBuilder {
        self.limits = val;
        self
    }

    pub fn lock_repository(mut self, val: bool) -> IndexWriterBuilder {
        self.lock_repository = val;
        self
    }

    pub fn comparator<C: Comparator + 'static>(mut self, val: C) -> IndexWriterBuilder {
        self.comparator = Some(Arc::new(val));
        self
    }

    pub fn meta_payload_provider<F>(mut self, val: F) -> IndexWriterBuilder
    where
        F: Fn(u64) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.payload_provider = Some(Arc::new(val));
        self
    }

    pub fn open(
        self,
        dir: Arc<dyn Directory>,
        codec: Arc<dyn Codec>,
        mode: OpenMode,
    ) -> Result<IndexWriter, Error> {
        let write_lock = if self.lock_repository {
            let mut lock = dir.make_lock(WRITE_LOCK_NAME)?;
            if !lock.try_lock()? {
                return Err(Error::LockObtainFailed(WRITE_LOCK_NAME.to_string()));
            }
            debug!("acquired {}", WRITE_LOCK_NAME);
            Some(lock)
        } else {
            None
        };

        let meta_reader = codec.index_meta_reader();
        let last = meta_reader.last_segments_file(dir.as_ref())?;
        let mut obsolete = HashSet::new();
        let mut referenced = HashSet::new();
        let (committed, state_file, force) = match (mode, last) {
            (OpenMode::Append, None) => return Err(Error::IndexNotFound),
            (OpenMode::Create, Some(filename)) => {
                let existing = meta_reader.read(dir.as_ref(), &filename)?;
                obsolete = existing.files();
                obsolete.insert(filename);
                let meta = IndexMeta {
                    generation: existing.generation,
                    segment_counter: existing.segment_counter,
                    segments: Vec::new(),
                    payload: None,
                };
                (meta, None, true)
            }
            (_, Some(filename)) => {
                let meta = meta_reader.read(dir.as_ref(), &filename)?;
                referenced.insert(filename.clone());
                (meta, Some(filename), false)
            }
            (_, None) => (IndexMeta::default(), None, true),
        };
        referenced.extend(committed.files());
        referenced.extend(obsolete.iter().cloned());
        let removed = directory::remove_unreferenced(dir.as_ref(), &referenced)?;
        info!(
            generation = committed.generation,
            segments = committed.segments.len(),
            removed,
            "opened index writer"
        );

        let pool = SegmentPool::new(
            self.segment_pool_size,
            self.limits.segment_count_max,
            self.comparator.clone(),
        );
        Ok(IndexWriter {
            readers: ReadersCache::new(dir.clone(), codec.clone()),
            commit: Mutex::new(CommitState {
                meta_writer: codec.index_meta_writer(),
                pending: None,
                force,
                state_file,
                obsolete,
            }),
            segment_counter: AtomicU64::new(committed.segment_counter),
            committed: RwLock::new(Arc::new(committed)),
            contexts: (0..FLUSH_CONTEXTS).map(FlushContext::new).collect(),
            active: AtomicUsize::new(0),
            pool,
            docs_max: AtomicUsize::new(self.limits.segment_docs_max),
            memory_max: AtomicUsize::new(self.limits.segment_memory_max),
            consolidating: Mutex::new(ConsolidatingSegments::new()),
            comparator: self.comparator,
            payload_provider: self.payload_provider,
            write_lock: Mutex::new(write_lock),
            dir,
            codec,
        })
    }
}

/// A prepared index state waiting to be published.
struct PendingCommit {
    /// The flush context drained into the state, `None` for a clear.
    ctx: Option<usize>,
    meta: Arc<IndexMeta>,
}

struct CommitState {
    meta_writer: Box<dyn IndexMetaWriter>,
    pending: Option<PendingCommit>,
    /// Write the next index state even if nothing changed.
    force: bool,
    /// The published index state file.
    state_file: Option<String>,
    /// Files of a replaced index, removed by the next commit.
    obsolete: HashSet<String>,
}

/// Concurrent, transactional writer of a segmented index.
///
/// Documents go in through `documents()` transactions on any number of threads. They become
/// visible with the next `commit()`, which seals every buffered segment, applies the removals
/// recorded since the last commit and publishes a new index state in two phases.
pub struct IndexWriter {
    dir: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    comparator: Option<Arc<dyn Comparator>>,
    payload_provider: Option<Arc<PayloadProvider>>,
    contexts: Vec<FlushContext>,
    active: AtomicUsize,
    pool: SegmentPool,
    docs_max: AtomicUsize,
    memory_max: AtomicUsize,
    segment_counter: AtomicU64,
    committed: RwLock<Arc<IndexMeta>>,
    commit: Mutex<CommitState>,
    consolidating: Mutex<ConsolidatingSegments>,
    readers: ReadersCache,
    write_lock: Mutex<Option<Box<dyn DirectoryLock>>>,
}

impl IndexWriter {
    pub fn builder() -> IndexWriterBuilder {
        IndexWriterBuilder::new()
    }

    /// Starts a document transaction.
    pub fn documents(&self) -> Documents {
        Documents {
            writer: self,
            active: None,
            tick: 0,
        }
    }

    pub fn committed_state(&self) -> Arc<IndexMeta> {
        self.committed.read().clone()
    }

    /// Generation of the last published index state.
    pub fn generation(&self) -> u64 {
        self.committed.read().generation
    }

    /// Documents buffered in segments that are not committed yet.
    pub fn buffered_docs(&self) -> u64 {
        self.pool.buffered_docs()
    }

    /// A reader over the last published index state.
    pub fn reader(&self) -> Result<IndexReader, Error> {
        IndexReader::from_meta(
            self.dir.as_ref(),
            self.codec.as_ref(),
            (*self.committed_state()).clone(),
        )
    }

    pub fn segment_limits(&self) -> SegmentLimits {
        SegmentLimits {
            segment_count_max: self.pool.count_max(),
            segment_docs_max: self.docs_max.load(Ordering::SeqCst),
            segment_memory_max: self.memory_max.load(Ordering::SeqCst),
        }
    }

    pub fn set_segment_limits(&self, limits: SegmentLimits) {
        self.docs_max.store(limits.segment_docs_max, Ordering::SeqCst);
        self.memory_max.store(limits.segment_memory_max, Ordering::SeqCst);
        self.pool.set_count_max(limits.segment_count_max);
    }

    /// Runs the first commit phase: everything buffered is sealed and written into a new index
    /// state which is synced but not published. Returns whether a state was prepared.
    pub fn begin(&self) -> Result<bool, Error> {
        let mut commit = self.commit.lock();
        self.start(&mut commit)
    }

    /// Prepares, unless `begin` already did, and publishes a new index state. Returns whether
    /// one was published.
    pub fn commit(&self) -> Result<bool, Error> {
        let mut commit = self.commit.lock();
        let started = self.start(&mut commit)?;
        let finished = self.finish(&mut commit)?;
        Ok(started || finished)
    }

    /// Discards the state prepared by `begin`, with the documents and removals it held.
    pub fn rollback(&self) -> bool {
        let mut commit = self.commit.lock();
        match commit.pending.take() {
            Some(pending) => {
                commit.meta_writer.rollback(self.dir.as_ref());
                self.discard(pending);
                info!("rolled back prepared index state");
                true
            }
            None => false,
        }
    }

    /// Replaces the index by an empty one and drops everything buffered so far.
    pub fn clear(&self) -> Result<(), Error> {
        let mut commit = self.commit.lock();
        if let Some(pending) = commit.pending.take() {
            commit.meta_writer.rollback(self.dir.as_ref());
            self.discard(pending);
        }

        let index = self.swap_context();
        let segments = self.retire(index);
        for segment in &segments {
            let mut state = segment.slot().state.lock();
            state.writer.reset();
            for flushed in state.flushed.drain(..) {
                self.remove_files(flushed.segment.files());
            }
            segment.slot().buffered_docs.store(0, Ordering::SeqCst);
        }
        drop(segments);
        let queued = mem::replace(
            &mut self.contexts[index].state.lock().pending_segments,
            Vec::new(),
        );
        for pending in &queued {
            self.remove_files(pending.segment.files());
        }
        self.reset_context(index);

        let mut meta = IndexMeta {
            generation: self.generation(),
            segment_counter: self.segment_counter.load(Ordering::SeqCst),
            segments: Vec::new(),
            payload: None,
        };
        let pending_file = commit.meta_writer.prepare(self.dir.as_ref(), &mut meta)?;
        if let Err(e) = self.dir.sync(&pending_file) {
            commit.meta_writer.rollback(self.dir.as_ref());
            return Err(e);
        }
        commit.pending = Some(PendingCommit {
            ctx: None,
            meta: Arc::new(meta),
        });
        self.finish(&mut commit)?;
        self.readers.clear();
        Ok(())
    }

    /// Merges the segments `policy` selects into one. The merge runs without blocking commits
    /// or document transactions and shows with the next commit.
    pub fn consolidate<P>(
        &self,
        policy: P,
        progress: &mut Progress,
    ) -> Result<ConsolidationResult, Error>
    where
        P: ConsolidationPolicy + 'static,
    {
        let (snapshot, candidates, readers) = {
            let commit = self.commit.lock();
            if commit.pending.is_some() {
                self.defer(Box::new(policy));
                return Ok(ConsolidationResult::new(0, ConsolidationStatus::Pending));
            }
            let snapshot = self.committed_state();
            let mut consolidating = self.consolidating.lock();
            let selected = policy.select(&snapshot, &consolidating, &self.readers)?;
            if selected.iter().any(|name| consolidating.contains(name)) {
                debug!("selected segments are already being consolidated");
                return Ok(ConsolidationResult::new(0, ConsolidationStatus::Fail));
            }
            let candidates: Vec<IndexSegment> =
                consolidation_candidates(&snapshot, &consolidating, &selected)
                    .into_iter()
                    .cloned()
                    .collect();
            if candidates.is_empty() {
                return Ok(ConsolidationResult::new(0, ConsolidationStatus::Ok));
            }
            let readers = candidates
                .iter()
                .map(|c| self.readers.emplace(&c.meta))
                .collect::<Result<Vec<_>, Error>>()?;
            consolidating.extend(candidates.iter().map(|c| c.meta.name.clone()));
            (snapshot, candidates, readers)
        };
        let mut claim = Claim {
            writer: self,
            names: candidates.iter().map(|c| c.meta.name.clone()).collect(),
            armed: true,
        };

        let name = self.next_segment_name();
        let merged = match self.merge(&name, &readers, progress) {
            Some(merged) => merged?,
            None => return Ok(ConsolidationResult::new(0, ConsolidationStatus::Fail)),
        };

        let commit = self.commit.lock();
        if commit.pending.is_some() {
            self.remove_files(merged.segment.files());
            self.defer(Box::new(policy));
            return Ok(ConsolidationResult::new(0, ConsolidationStatus::Pending));
        }
        let current = self.committed_state();
        let segment = if merged.meta().docs_count == 0 {
            self.remove_files(merged.segment.files());
            None
        } else if Arc::ptr_eq(&current, &snapshot) {
            Some(merged.segment.clone())
        } else {
            match self.carry_deletions(&current, &candidates, &readers, &merged) {
                Ok(Some(segment)) => segment,
                Ok(None) => {
                    self.remove_files(merged.segment.files());
                    debug!(segment = %name, "consolidation candidates went away");
                    return Ok(ConsolidationResult::new(0, ConsolidationStatus::Fail));
                }
                Err(e) => {
                    self.remove_files(merged.segment.files());
                    return Err(e);
                }
            }
        };

        let ctx = &self.contexts[self.active.load(Ordering::SeqCst)];
        {
            let mut state = ctx.state.lock();
            state.segment_mask.extend(claim.names.iter().cloned());
            if let Some(segment) = segment {
                state.pending_segments.push(PendingSegment {
                    segment,
                    generation: 0,
                });
            }
        }
        claim.armed = false;
        drop(commit);
        info!(
            segment = %name,
            candidates = candidates.len(),
            docs = merged.meta().docs_count,
            "consolidated segments"
        );
        Ok(ConsolidationResult::new(
            candidates.len(),
            ConsolidationStatus::Ok,
        ))
    }

    /// Adds the live documents of `reader` as one new segment, visible with the next commit.
    /// Returns `false` if the merge was cancelled or the fields of the imported segments
    /// conflict.
    pub fn import(&self, reader: &IndexReader, progress: &mut Progress) -> Result<bool, Error> {
        if reader.segments().is_empty() {
            return Ok(true);
        }
        let name = self.next_segment_name();
        let merged = match self.merge(&name, reader.segments(), progress) {
            Some(merged) => merged?,
            None => return Ok(false),
        };
        if merged.meta().docs_count == 0 {
            self.remove_files(merged.segment.files());
            return Ok(true);
        }
        let docs = merged.meta().docs_count;
        loop {
            let index = self.active.load(Ordering::SeqCst);
            let ctx = &self.contexts[index];
            let _guard = ctx.flush_lock.read();
            if self.active.load(Ordering::SeqCst) != index {
                continue;
            }
            ctx.state.lock().pending_segments.push(PendingSegment {
                segment: merged.segment,
                generation: ctx.generation(),
            });
            break;
        }
        info!(segment = %name, docs, "imported segments");
        Ok(true)
    }

    /// Merges `readers` into the segment `name`. Returns `None` if the merge was cancelled or
    /// the inputs have conflicting fields.
    fn merge(
        &self,
        name: &str,
        readers: &[Arc<SegmentReader>],
        progress: &mut Progress,
    ) -> Option<Result<MergedSegment, Error>> {
        let mut merge = MergeWriter::new(
            self.dir.as_ref(),
            self.codec.as_ref(),
            self.comparator.as_deref(),
        );
        for reader in readers {
            merge.add(reader.clone());
        }
        match merge.flush(name, progress) {
            Ok(merged) => Some(Ok(merged)),
            Err(e) => match e {
                Error::MergeAborted | Error::FieldFeaturesMismatch { .. } => {
                    info!(segment = %name, error = %e, "merge failed");
                    None
                }
                e => Some(Err(e)),
            },
        }
    }

    /// Masks, in the merged segment, documents removed from the candidates after they were
    /// merged. Returns `None` if a candidate is no longer committed, `Some(None)` if nothing of
    /// the merged segment survives.
    fn carry_deletions(
        &self,
        current: &IndexMeta,
        candidates: &[IndexSegment],
        readers: &[Arc<SegmentReader>],
        merged: &MergedSegment,
    ) -> Result<Option<Option<IndexSegment>>, Error> {
        let mut mask = DocumentMask::new();
        for (input, (candidate, merged_reader)) in candidates.iter().zip(readers).enumerate() {
            let segment = match current.segment(&candidate.meta.name) {
                Some(segment) => segment,
                None => return Ok(None),
            };
            if segment.meta.version == candidate.meta.version {
                continue;
            }
            let latest = self.readers.emplace(&segment.meta)?;
            for doc in latest.mask().iter() {
                if merged_reader.mask().contains(doc) {
                    continue;
                }
                if let Some(new) = merged.doc_map(input, doc) {
                    mask.insert(new);
                }
            }
        }
        if mask.is_empty() {
            return Ok(Some(Some(merged.segment.clone())));
        }
        trace!(
            segment = %merged.meta().name,
            removed = mask.len(),
            "carrying deletions over to merged segment"
        );
        let mut ignored = Vec::new();
        self.write_mask(&merged.segment, &mask, false, &mut ignored)
            .map(Some)
    }

    fn defer(&self, policy: Box<dyn ConsolidationPolicy>) {
        let ctx = &self.contexts[self.active.load(Ordering::SeqCst)];
        ctx.state.lock().policies.push(policy);
        debug!("consolidation deferred to the next commit");
    }

    fn next_segment_name(&self) -> String {
        format!("_{}", self.segment_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn start(&self, commit: &mut CommitState) -> Result<bool, Error> {
        if commit.pending.is_some() {
            return Ok(false);
        }
        let index = self.swap_context();
        let mut reset = ContextReset {
            writer: self,
            index,
            armed: true,
        };
        let (mut meta, mut to_sync) = match self.flush_all(index, commit.force)? {
            Some(flushed) => flushed,
            None => {
                debug!("nothing to commit");
                return Ok(false);
            }
        };
        let pending_file = match commit.meta_writer.prepare(self.dir.as_ref(), &mut meta) {
            Ok(pending_file) => pending_file,
            Err(e) => {
                self.remove_uncommitted(&meta);
                return Err(e);
            }
        };
        to_sync.push(pending_file);
        for file in &to_sync {
            if let Err(e) = self.dir.sync(file) {
                warn!(file = %file, error = %e, "sync failed, rolling back");
                commit.meta_writer.rollback(self.dir.as_ref());
                self.remove_uncommitted(&meta);
                return Err(e);
            }
        }
        reset.armed = false;
        info!(
            generation = meta.generation,
            segments = meta.segments.len(),
            docs = meta.docs_count(),
            live = meta.live_docs_count(),
            "prepared index state"
        );
        commit.pending = Some(PendingCommit {
            ctx: Some(index),
            meta: Arc::new(meta),
        });
        Ok(true)
    }

    fn finish(&self, commit: &mut CommitState) -> Result<bool, Error> {
        let pending = match commit.pending.take() {
            Some(pending) => pending,
            None => return Ok(false),
        };
        let published = match commit.meta_writer.commit(self.dir.as_ref()) {
            Ok(published) => published,
            Err(e) => {
                warn!(error = %e, "publishing index state failed, rolling back");
                commit.meta_writer.rollback(self.dir.as_ref());
                self.discard(pending);
                return Err(e);
            }
        };
        let previous = mem::replace(&mut *self.committed.write(), pending.meta.clone());
        commit.force = false;
        if let Some(index) = pending.ctx {
            self.reset_context(index);
        }

        let current = pending.meta.files();
        let mut unreferenced = mem::replace(&mut commit.obsolete, HashSet::new());
        unreferenced.extend(previous.files());
        if let Some(file) = commit.state_file.replace(published) {
            unreferenced.insert(file);
        }
        self.remove_files(unreferenced.iter().filter(|f| !current.contains(*f)));
        let current_keys = pending.meta.keys();
        let superseded: HashSet<_> = previous
            .keys()
            .into_iter()
            .filter(|key| !current_keys.contains(key))
            .collect();
        self.readers.purge(&superseded);
        info!(
            generation = pending.meta.generation,
            segments = pending.meta.segments.len(),
            "committed index state"
        );
        Ok(true)
    }

    /// Drops a prepared state that will not be published.
    fn discard(&self, pending: PendingCommit) {
        self.remove_uncommitted(&pending.meta);
        if let Some(index) = pending.ctx {
            self.reset_context(index);
        }
    }

    /// Makes the other flush context the active one, returning the retired context.
    fn swap_context(&self) -> usize {
        let index = self.active.load(Ordering::SeqCst);
        let _guard = self.contexts[index].flush_lock.write();
        self.active.store((index + 1) % FLUSH_CONTEXTS, Ordering::SeqCst);
        index
    }

    /// Claims the segments of a retired context and waits for the writes still running on
    /// them.
    fn retire(&self, index: usize) -> Vec<SegmentRef> {
        let ctx = &self.contexts[index];
        let segments = {
            let mut state = ctx.state.lock();
            for segment in &state.pending {
                segment.slot().dirty.store(true, Ordering::SeqCst);
            }
            state.free.clear();
            mem::replace(&mut state.pending, Vec::new())
        };
        ctx.wait_drained();
        segments
    }

    fn reset_context(&self, index: usize) {
        let released = self.contexts[index].reset();
        if !released.is_empty() {
            let mut consolidating = self.consolidating.lock();
            for name in &released {
                consolidating.remove(name);
            }
        }
    }

    /// Seals everything buffered in the retired context `index` and applies its removals.
    /// Returns the new index state with the files to sync, or `None` if nothing changed.
    fn flush_all(
        &self,
        index: usize,
        force: bool,
    ) -> Result<Option<(IndexMeta, Vec<String>)>, Error> {
        let ctx = &self.contexts[index];
        let slots = self.retire(index);
        let mut flushed = Vec::new();
        for segment in &slots {
            let mut state = segment.slot().state.lock();
            let sealed = state.writer.flush(self.dir.as_ref(), self.codec.as_ref());
            flushed.extend(state.flushed.drain(..));
            segment.slot().buffered_docs.store(0, Ordering::SeqCst);
            if let Some(sealed) = sealed? {
                flushed.push(sealed);
            }
        }
        drop(slots);

        let (mut queries, queued, segment_mask, policies) = {
            let mut state = ctx.state.lock();
            (
                mem::replace(&mut state.queries, Vec::new()),
                mem::replace(&mut state.pending_segments, Vec::new()),
                state.segment_mask.clone(),
                mem::replace(&mut state.policies, Vec::new()),
            )
        };
        let committed = self.committed_state();
        let mut modified = force;
        let mut to_sync = Vec::new();
        let mut segments = Vec::with_capacity(committed.segments.len() + flushed.len());

        for segment in &committed.segments {
            if segment_mask.contains(&segment.meta.name) {
                modified = true;
                continue;
            }
            if !queries.iter().any(|q| q.valid) {
                segments.push(segment.clone());
                continue;
            }
            let reader = self.readers.emplace(&segment.meta)?;
            let mut mask = reader.mask().clone();
            if !apply_queries(&reader, &mut queries, 0, &mut mask)? {
                segments.push(segment.clone());
                continue;
            }
            modified = true;
            match self.write_mask(segment, &mask, true, &mut to_sync)? {
                Some(updated) => segments.push(updated),
                None => debug!(segment = %segment.meta.name, "dropping fully removed segment"),
            }
        }

        for pending in queued {
            modified = true;
            let applies = queries
                .iter()
                .any(|q| q.valid && q.generation >= pending.generation);
            let segment = if applies {
                let reader = self.readers.emplace(&pending.segment.meta)?;
                let mut mask = reader.mask().clone();
                if apply_queries(&reader, &mut queries, pending.generation, &mut mask)? {
                    self.write_mask(&pending.segment, &mask, false, &mut to_sync)?
                } else {
                    Some(pending.segment)
                }
            } else {
                Some(pending.segment)
            };
            if let Some(segment) = segment {
                to_sync.extend(segment.files().cloned());
                segments.push(segment);
            }
        }

        let mut sealed = Vec::with_capacity(flushed.len());
        for segment in flushed {
            let reader = self.readers.emplace(&segment.segment.meta)?;
            let mut mask = reader.mask().clone();
            let mut changed = mask.union(&segment.docs_mask) > 0;
            for q in 0..queries.len() {
                if !queries[q].valid {
                    continue;
                }
                for doc in matching_docs(&*queries[q].filter, &reader)? {
                    let context = match segment.update_context(doc) {
                        Some(context) => context,
                        None => continue,
                    };
                    if queries[q].generation < context.generation {
                        continue;
                    }
                    // replacements of an update that matched nothing do not count as matches
                    if queries[q].is_update {
                        if let Some(update) = context.update_id {
                            if !queries.get(update).map_or(false, |u| u.seen) {
                                continue;
                            }
                        }
                    }
                    if mask.insert(doc) {
                        queries[q].seen = true;
                        changed = true;
                    }
                }
            }
            sealed.push((segment, mask, changed));
        }

        let mut tick = 0;
        for (segment, mut mask, mut changed) in sealed {
            for (i, context) in segment.doc_contexts.iter().enumerate() {
                if let Some(update) = context.update_id {
                    let applied = queries.get(update).map_or(false, |q| q.seen && q.valid);
                    if !applied && mask.insert(i as DocId + DOC_ID_MIN) {
                        changed = true;
                    }
                }
            }
            tick = tick.max(segment.tick);
            let kept = if changed {
                self.write_mask(&segment.segment, &mask, false, &mut to_sync)?
            } else {
                Some(segment.segment)
            };
            match kept {
                Some(kept) => {
                    modified = true;
                    to_sync.extend(kept.files().cloned());
                    segments.push(kept);
                }
                None => trace!("dropping fully removed flushed segment"),
            }
        }

        if !policies.is_empty() {
            modified |=
                self.consolidate_deferred(&committed, &policies, &mut segments, &mut to_sync)?;
        }

        if !modified {
            return Ok(None);
        }
        to_sync.sort();
        to_sync.dedup();
        let payload = match self.payload_provider {
            Some(ref provider) => provider(tick),
            None => committed.payload.clone(),
        };
        let meta = IndexMeta {
            generation: committed.generation,
            segment_counter: self.segment_counter.load(Ordering::SeqCst),
            segments,
            payload,
        };
        Ok(Some((meta, to_sync)))
    }

    /// Runs the policies deferred to a drain over the segments it produced and merges their
    /// selection in place. Returns whether the segments changed.
    fn consolidate_deferred(
        &self,
        committed: &IndexMeta,
        policies: &[Box<dyn ConsolidationPolicy>],
        segments: &mut Vec<IndexSegment>,
        to_sync: &mut Vec<String>,
    ) -> Result<bool, Error> {
        let candidate = IndexMeta {
            generation: committed.generation,
            segment_counter: self.segment_counter.load(Ordering::SeqCst),
            segments: segments.clone(),
            payload: None,
        };
        let consolidating = self.consolidating.lock().clone();
        let mut selected = BTreeSet::new();
        for policy in policies {
            selected.extend(policy.select(&candidate, &consolidating, &self.readers)?);
        }
        let selected: BTreeSet<String> = selected
            .into_iter()
            .filter(|name| !consolidating.contains(name))
            .collect();
        let candidates = consolidation_candidates(&candidate, &consolidating, &selected);
        if candidates.is_empty() {
            return Ok(false);
        }
        let readers = candidates
            .iter()
            .map(|c| self.readers.emplace(&c.meta))
            .collect::<Result<Vec<_>, Error>>()?;
        let name = self.next_segment_name();
        let merged = match self.merge(&name, &readers, &mut || true) {
            Some(merged) => merged?,
            None => return Ok(false),
        };

        let names: HashSet<&str> = candidates.iter().map(|c| c.meta.name.as_str()).collect();
        let committed_files = committed.files();
        let uncommitted: HashSet<&String> = candidates
            .iter()
            .flat_map(|c| c.files())
            .filter(|f| !committed_files.contains(*f))
            .collect();
        self.remove_files(uncommitted.iter().cloned());
        to_sync.retain(|f| !uncommitted.contains(f));
        segments.retain(|s| !names.contains(s.meta.name.as_str()));
        if merged.meta().docs_count > 0 {
            to_sync.extend(merged.segment.files().cloned());
            segments.push(merged.segment);
        } else {
            self.remove_files(merged.segment.files());
        }
        info!(segment = %name, candidates = names.len(), "consolidated segments on commit");
        Ok(true)
    }

    /// Writes a new version of `segment` carrying `mask` and queues its new files for sync.
    /// Returns `None` if the mask covers every document. Files of an uncommitted `segment` the
    /// new version does not use are removed.
    fn write_mask(
        &self,
        segment: &IndexSegment,
        mask: &DocumentMask,
        committed: bool,
        to_sync: &mut Vec<String>,
    ) -> Result<Option<IndexSegment>, Error> {
        let docs = segment.meta.docs_count;
        if u64::from(mask.len()) >= docs {
            if !committed {
                self.remove_files(segment.files());
            }
            return Ok(None);
        }
        let mut meta = segment.meta.clone();
        meta.version += 1;
        meta.live_docs_count = docs - u64::from(mask.len());
        meta.files.retain(|f| !codec::is_document_mask(f));
        let mask_file = self
            .codec
            .document_mask_writer()
            .write(self.dir.as_ref(), &meta, mask)?;
        meta.files.insert(mask_file.clone());
        let mut size = 0;
        for file in &meta.files {
            size += self.dir.length(file)?;
        }
        meta.size = size;
        let filename = self
            .codec
            .segment_meta_writer()
            .write(self.dir.as_ref(), &meta)?;
        trace!(
            segment = %meta.name,
            version = meta.version,
            live = meta.live_docs_count,
            "wrote segment mask"
        );
        to_sync.push(mask_file);
        to_sync.push(filename.clone());
        let updated = IndexSegment { filename, meta };
        if !committed {
            let used: HashSet<&String> = updated.files().collect();
            self.remove_files(segment.files().filter(|f| !used.contains(f)));
        }
        Ok(Some(updated))
    }

    /// Removes the files of `meta` the committed state does not reference.
    fn remove_uncommitted(&self, meta: &IndexMeta) {
        let committed = self.committed_state().files();
        self.remove_files(meta.files().iter().filter(|f| !committed.contains(*f)));
    }

    fn remove_files<'f, I>(&self, files: I)
    where
        I: IntoIterator<Item = &'f String>,
    {
        for file in files {
            match self.dir.remove(file) {
                Ok(()) => trace!(file = %file, "removed file"),
                Err(e) => debug!(file = %file, error = %e, "could not remove file"),
            }
        }
    }

    fn exceeds_limits(&self, writer: &SegmentWriter) -> bool {
        let docs_max = self.docs_max.load(Ordering::SeqCst);
        let memory_max = self.memory_max.load(Ordering::SeqCst);
        (docs_max > 0 && writer.docs_cached() >= docs_max)
            || (memory_max > 0 && writer.memory_active() >= memory_max)
    }

    /// Seals the slot's writer into its flushed list and starts a fresh segment. On failure
    /// the writer keeps its documents.
    fn roll_over(&self, state: &mut SlotState) -> Result<(), Error> {
        let sealed = state.writer.flush(self.dir.as_ref(), self.codec.as_ref())?;
        state.writer.reset_to(self.next_segment_name());
        if let Some(sealed) = sealed {
            debug!(
                segment = %sealed.name(),
                docs = sealed.segment.meta.docs_count,
                "rolled over segment"
            );
            state.flushed.push(sealed);
        }
        Ok(())
    }

    /// Rolls over a writer past its limits. The documents are committed at this point, so a
    /// failed rollover leaves them buffered for the drain.
    fn check_limits(&self, state: &mut SlotState) {
        if self.exceeds_limits(&state.writer) {
            if let Err(e) = self.roll_over(state) {
                warn!(segment = %state.writer.name(), error = %e, "could not roll over segment");
            }
        }
    }

    fn begin_doc(&self, state: &mut SlotState, context: UpdateContext) -> Result<DocId, Error> {
        if let Begin::Started(doc) = state.writer.begin(context, 0) {
            return Ok(doc);
        }
        self.roll_over(state)?;
        match state.writer.begin(context, 0) {
            Begin::Started(doc) => Ok(doc),
            Begin::SegmentFull => Err(Error::illegal_state(
                "a fresh segment does not take any document",
            )),
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        self.rollback();
        if let Some(mut lock) = self.write_lock.lock().take() {
            if let Err(e) = lock.unlock() {
                warn!(error = %e, "could not release {}", WRITE_LOCK_NAME);
            }
        }
    }
}

/// Picks the segments of `meta` to merge for `selected`, in index order. A lone candidate
/// is only merged if it has deletions, together with the last segment not selected.
fn consolidation_candidates<'m>(
    meta: &'m IndexMeta,
    consolidating: &ConsolidatingSegments,
    selected: &BTreeSet<String>,
) -> Vec<&'m IndexSegment> {
    let mut positions: Vec<usize> = meta
        .segments
        .iter()
        .enumerate()
        .filter(|(_, s)| selected.contains(&s.meta.name))
        .map(|(i, _)| i)
        .collect();
    if positions.len() == 1 {
        if !meta.segments[positions[0]].meta.has_deletions() {
            return Vec::new();
        }
        let other = meta.segments.iter().rposition(|s| {
            !selected.contains(&s.meta.name) && !consolidating.contains(&s.meta.name)
        });
        if let Some(other) = other {
            positions.push(other);
            positions.sort();
        }
    }
    positions.into_iter().map(|i| &meta.segments[i]).collect()
}

/// Masks the documents of `reader` matched by the valid queries recorded at or after
/// `generation`, in the order they were recorded. A query that masks a document has seen it.
/// Returns whether the mask changed.
fn apply_queries(
    reader: &SegmentReader,
    queries: &mut [ModificationQuery],
    generation: u64,
    mask: &mut DocumentMask,
) -> Result<bool, Error> {
    let mut changed = false;
    for query in queries
        .iter_mut()
        .filter(|q| q.valid && q.generation >= generation)
    {
        for doc in matching_docs(&*query.filter, reader)? {
            if u64::from(doc) > reader.docs_count() {
                continue;
            }
            if mask.insert(doc) {
                query.seen = true;
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Resets a retired flush context unless disarmed.
struct ContextReset<'w> {
    writer: &'w IndexWriter,
    index: usize,
    armed: bool,
}

impl<'w> Drop for ContextReset<'w> {
    fn drop(&mut self) {
        if self.armed {
            self.writer.reset_context(self.index);
        }
    }
}

/// Segments claimed for a consolidation. Released on drop unless disarmed.
struct Claim<'w> {
    writer: &'w IndexWriter,
    names: Vec<String>,
    armed: bool,
}

impl<'w> Drop for Claim<'w> {
    fn drop(&mut self) {
        if self.armed {
            let mut consolidating = self.writer.consolidating.lock();
            for name in &self.names {
                consolidating.remove(name);
            }
        }
    }
}

/// Ends a write on a flush context when dropped.
struct Busy<'c>(&'c FlushContext);

impl<'c> Drop for Busy<'c> {
    fn drop(&mut self) {
        self.0.end_write();
    }
}

/// The segment a transaction writes to, and its entry in the flush context it is registered
/// with.
struct ActiveSegment {
    segment: SegmentRef,
    ctx: usize,
    epoch: u64,
    offset: usize,
}

enum Filled {
    More,
    Last,
    Invalid,
}

/// Replacement documents inserted for one update. Unless disarmed, dropping masks all of them
/// and invalidates the update.
struct Replacement<'s, 'c> {
    state: &'s mut SlotState,
    ctx: &'c FlushContext,
    query: usize,
    docs: Vec<(String, DocId)>,
    armed: bool,
}

impl<'s, 'c> Drop for Replacement<'s, 'c> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for (segment, doc) in self.docs.drain(..) {
            if self.state.writer.name() == segment {
                self.state.writer.remove(doc);
            } else if let Some(flushed) = self
                .state
                .flushed
                .iter_mut()
                .find(|f| f.name() == segment)
            {
                flushed.mask_written(doc);
            }
        }
        if let Some(query) = self.ctx.state.lock().queries.get_mut(self.query) {
            query.valid = false;
        }
    }
}

/// A batch of document operations from one thread. Operations take effect with the next
/// commit of the writer.
pub struct Documents<'a> {
    writer: &'a IndexWriter,
    active: Option<ActiveSegment>,
    tick: u64,
}

impl<'a> Documents<'a> {
    /// Tick recorded with the documents inserted from now on.
    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    /// Inserts the document `fill` builds. If `fill` fails or returns `false` the document is
    /// rolled back and the batch stays usable.
    pub fn insert<F>(&mut self, fill: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut Document) -> Result<bool, Error>,
    {
        let tick = self.tick;
        self.write(move |writer, ctx, state| {
            let context = UpdateContext {
                generation: ctx.generation(),
                update_id: None,
            };
            let doc = writer.begin_doc(state, context)?;
            let filled = fill(&mut Document {
                writer: &mut state.writer,
                doc,
            });
            match filled {
                Ok(true) => state.writer.commit_with_tick(tick),
                Ok(false) => {
                    state.writer.rollback();
                    return Ok(false);
                }
                Err(e) => {
                    state.writer.rollback();
                    return Err(e);
                }
            }
            writer.check_limits(state);
            Ok(true)
        })
    }

    /// Removes every document matched by `filter` that was inserted before this call.
    pub fn remove<F: Filter + 'static>(&mut self, filter: F) {
        self.remove_shared(Arc::new(filter))
    }

    pub fn remove_shared(&mut self, filter: Arc<dyn Filter>) {
        let writer = self.writer;
        loop {
            let index = writer.active.load(Ordering::SeqCst);
            let ctx = &writer.contexts[index];
            let _guard = ctx.flush_lock.read();
            if writer.active.load(Ordering::SeqCst) != index {
                continue;
            }
            let mut state = ctx.state.lock();
            let generation = ctx.next_generation();
            state.add_query(ModificationQuery {
                filter,
                generation,
                is_update: false,
                seen: false,
                valid: true,
            });
            trace!(generation, "recorded removal");
            return;
        }
    }

    /// Replaces the documents matched by `filter` with the one `fill` builds. If nothing
    /// matches, the replacement is dropped at commit. If `fill` fails or returns `false`
    /// nothing is replaced.
    pub fn replace<F, R>(&mut self, filter: F, fill: R) -> Result<bool, Error>
    where
        F: Filter + 'static,
        R: FnOnce(&mut Document) -> Result<bool, Error>,
    {
        let mut fill = Some(fill);
        self.update(Arc::new(filter), move |doc| match fill.take() {
            Some(fill) => fill(doc).map(|valid| if valid { Filled::Last } else { Filled::Invalid }),
            None => Ok(Filled::Last),
        })
    }

    /// Replaces the documents matched by `filter` with several, built by calling `fill` until
    /// it returns `false`. If any call fails, none of the replacements are kept and nothing
    /// is replaced.
    pub fn replace_many<F, R>(&mut self, filter: F, mut fill: R) -> Result<bool, Error>
    where
        F: Filter + 'static,
        R: FnMut(&mut Document) -> Result<bool, Error>,
    {
        self.update(Arc::new(filter), move |doc| {
            fill(doc).map(|more| if more { Filled::More } else { Filled::Last })
        })
    }

    fn update<F>(&mut self, filter: Arc<dyn Filter>, mut fill: F) -> Result<bool, Error>
    where
        F: FnMut(&mut Document) -> Result<Filled, Error>,
    {
        let tick = self.tick;
        self.write(move |writer, ctx, state| {
            let (query, generation) = {
                let mut flush_state = ctx.state.lock();
                let generation = ctx.next_generation() + 1;
                let query = flush_state.add_query(ModificationQuery {
                    filter,
                    generation: generation - 1,
                    is_update: true,
                    seen: false,
                    valid: true,
                });
                (query, generation)
            };
            let context = UpdateContext {
                generation,
                update_id: Some(query),
            };
            let mut replaced = Replacement {
                state,
                ctx,
                query,
                docs: Vec::new(),
                armed: true,
            };
            loop {
                let doc = writer.begin_doc(replaced.state, context)?;
                let segment = replaced.state.writer.name().to_string();
                let filled = fill(&mut Document {
                    writer: &mut replaced.state.writer,
                    doc,
                });
                match filled {
                    Ok(Filled::Invalid) => {
                        replaced.state.writer.rollback();
                        return Ok(false);
                    }
                    Err(e) => {
                        replaced.state.writer.rollback();
                        return Err(e);
                    }
                    Ok(step) => {
                        replaced.state.writer.commit_with_tick(tick);
                        replaced.docs.push((segment, doc));
                        writer.check_limits(replaced.state);
                        if let Filled::Last = step {
                            break;
                        }
                    }
                }
            }
            replaced.armed = false;
            trace!(generation, docs = replaced.docs.len(), "recorded update");
            Ok(true)
        })
    }

    /// Runs `op` on this batch's segment with a write marked on its flush context.
    fn write<R, F>(&mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a IndexWriter, &'a FlushContext, &mut SlotState) -> Result<R, Error>,
    {
        let (index, segment) = self.acquire();
        let writer = self.writer;
        let busy = Busy(&writer.contexts[index]);
        let result = {
            let slot = segment.slot();
            let mut state = slot.state.lock();
            let result = op(writer, busy.0, &mut *state);
            let buffered = state.writer.docs_cached()
                + state
                    .flushed
                    .iter()
                    .map(|f| f.segment.meta.docs_count as usize)
                    .sum::<usize>();
            slot.buffered_docs.store(buffered as u64, Ordering::SeqCst);
            result
        };
        drop(busy);
        drop(segment);
        result
    }

    /// Finds the segment to write to in the active flush context, registering a new one if
    /// needed, and marks a write as started on that context.
    fn acquire(&mut self) -> (usize, SegmentRef) {
        let writer = self.writer;
        loop {
            let index = writer.active.load(Ordering::SeqCst);
            let ctx = &writer.contexts[index];
            let guard = ctx.flush_lock.read();
            if writer.active.load(Ordering::SeqCst) != index {
                continue;
            }

            if let Some(ref active) = self.active {
                let slot = active.segment.slot();
                if active.ctx == index
                    && slot.owner.load(Ordering::SeqCst) == index
                    && !slot.dirty.load(Ordering::SeqCst)
                {
                    ctx.begin_write();
                    return (index, active.segment.clone());
                }
                drop(guard);
                self.release();
                continue;
            }

            let mut state = ctx.state.lock();
            if let Some(offset) = state.free.pop() {
                let segment = state.pending[offset].clone();
                let epoch = state.epoch;
                drop(state);
                ctx.begin_write();
                self.active = Some(ActiveSegment {
                    segment: segment.clone(),
                    ctx: index,
                    epoch,
                    offset,
                });
                return (index, segment);
            }
            drop(state);

            let segment = match writer.pool.try_acquire() {
                Some(segment) => segment,
                None => {
                    drop(guard);
                    trace!("waiting for a segment slot");
                    writer.pool.wait_released(POOL_WAIT);
                    continue;
                }
            };
            {
                let mut slot_state = segment.slot().state.lock();
                if !slot_state.writer.initialized() {
                    slot_state.writer.reset_to(writer.next_segment_name());
                }
            }
            segment.slot().owner.store(index, Ordering::SeqCst);
            let (offset, epoch) = {
                let mut state = ctx.state.lock();
                (state.register(segment.clone()), state.epoch)
            };
            ctx.begin_write();
            self.active = Some(ActiveSegment {
                segment: segment.clone(),
                ctx: index,
                epoch,
                offset,
            });
            return (index, segment);
        }
    }

    /// Gives the segment back to its flush context for other batches to use.
    fn release(&mut self) {
        if let Some(active) = self.active.take() {
            {
                let mut state = self.writer.contexts[active.ctx].state.lock();
                if state.epoch == active.epoch
                    && !active.segment.slot().dirty.load(Ordering::SeqCst)
                {
                    state.free.push(active.offset);
                }
            }
            drop(active);
        }
    }
}

impl<'a> Drop for Documents<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

/// The document being built inside a `Documents` operation.
pub struct Document<'d> {
    writer: &'d mut SegmentWriter,
    doc: DocId,
}

impl<'d> Document<'d> {
    /// Id of the document in the segment being built.
    pub fn doc_id(&self) -> DocId {
        self.doc
    }

    /// Indexes the tokens of `field` with its features.
    pub fn index(&mut self, field: &Field) -> Result<(), Error> {
        self.writer.index(&field.name, field.features, field.tokens())
    }

    pub fn index_tokens<I, T>(
        &mut self,
        field: &str,
        features: IndexFeatures,
        tokens: I,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.writer.index(field, features, tokens)
    }

    /// Stores the raw value of `field` in a column of the same name.
    pub fn store(&mut self, field: &Field) -> Result<(), Error> {
        self.writer.store(&field.name, field.value_bytes())
    }

    pub fn store_bytes(&mut self, column: &str, value: &[u8]) -> Result<(), Error> {
        self.writer.store(column, value)
    }

    /// Sets the value the configured comparator orders the document by.
    pub fn sorted(&mut self, value: &[u8]) -> Result<(), Error> {
        self.writer.sorted(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DefaultCodec;
    use crate::consolidation::ConsolidateAll;
    use crate::directory::MemoryDirectory;
    use crate::filter::TermFilter;
    use std::panic;

    fn writer(dir: &MemoryDirectory) -> IndexWriter {
        IndexWriterBuilder::new()
            .open(
                Arc::new(dir.clone()),
                Arc::new(DefaultCodec),
                OpenMode::CreateOrAppend,
            )
            .unwrap()
    }

    fn add(docs: &mut Documents, id: &str) -> bool {
        docs.insert(|doc| {
            doc.index(&Field::string("id", id))?;
            doc.index(&Field::text("body", "common words"))?;
            Ok(true)
        })
        .unwrap()
    }

    fn live_ids(writer: &IndexWriter) -> Vec<String> {
        let reader = writer.reader().unwrap();
        let mut ids = Vec::new();
        for segment in reader.segments() {
            let field = match segment.field("id") {
                Some(field) => field,
                None => continue,
            };
            for term in field.terms() {
                let (term, postings) = term.unwrap();
                for posting in postings {
                    if segment.is_live(posting.doc) {
                        ids.push(String::from_utf8(term.clone()).unwrap());
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    #[test]
    fn consolidated_segments_leave_readers_cache() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        add(&mut writer.documents(), "a");
        writer.commit().unwrap();
        add(&mut writer.documents(), "b");
        writer.commit().unwrap();
        assert_eq!(2, writer.readers.len());

        let result = writer.consolidate(ConsolidateAll, &mut || true).unwrap();
        assert_eq!(ConsolidationResult::new(2, ConsolidationStatus::Ok), result);
        assert_eq!(2, writer.readers.len());
        writer.commit().unwrap();
        assert_eq!(1, writer.committed_state().segments.len());
        assert_eq!(0, writer.readers.len());
        assert_eq!(vec!["a", "b"], live_ids(&writer));
    }

    #[test]
    fn removal_only_affects_earlier_documents() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            add(&mut docs, "a");
            docs.remove(TermFilter::new("body", "common"));
            add(&mut docs, "b");
        }
        assert!(writer.commit().unwrap());
        assert_eq!(vec!["b"], live_ids(&writer));
        assert_eq!(2, writer.committed_state().docs_count());
    }

    #[test]
    fn replacement_survives_its_own_filter() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            add(&mut docs, "a");
            let replaced = docs
                .replace(TermFilter::new("id", "a"), |doc| {
                    doc.index(&Field::string("id", "a"))?;
                    doc.index(&Field::string("rev", "2"))?;
                    Ok(true)
                })
                .unwrap();
            assert!(replaced);
        }
        writer.commit().unwrap();
        assert_eq!(vec!["a"], live_ids(&writer));
        let reader = writer.reader().unwrap();
        assert_eq!(1, reader.live_docs_count());
        assert!(reader.segments()[0].field("rev").is_some());
    }

    #[test]
    fn unseen_update_drops_replacement() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            add(&mut docs, "a");
            docs.replace(TermFilter::new("id", "missing"), |doc| {
                doc.index(&Field::string("id", "b"))?;
                Ok(true)
            })
            .unwrap();
        }
        writer.commit().unwrap();
        assert_eq!(vec!["a"], live_ids(&writer));
    }

    #[test]
    fn failed_replace_many_keeps_targets() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            add(&mut docs, "a");
        }
        writer.commit().unwrap();
        {
            let mut docs = writer.documents();
            let mut calls = 0;
            let result = docs.replace_many(TermFilter::new("id", "a"), |doc| {
                calls += 1;
                doc.index(&Field::string("id", &format!("new{}", calls)))?;
                if calls == 3 {
                    return Err(Error::illegal_state("broken document"));
                }
                Ok(true)
            });
            assert!(result.is_err());
            add(&mut docs, "c");
        }
        writer.commit().unwrap();
        assert_eq!(vec!["a", "c"], live_ids(&writer));
    }

    #[test]
    fn panicking_replace_many_keeps_targets() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            add(&mut docs, "a");
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                let mut first = true;
                let _ = docs.replace_many(TermFilter::new("id", "a"), |doc| {
                    doc.index(&Field::string("id", "b"))?;
                    if !first {
                        panic!("fill failed");
                    }
                    first = false;
                    Ok(true)
                });
            }));
            assert!(result.is_err());
        }
        writer.commit().unwrap();
        assert_eq!(vec!["a"], live_ids(&writer));
    }

    #[test]
    fn invalid_document_is_rolled_back() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        {
            let mut docs = writer.documents();
            assert!(!docs
                .insert(|doc| {
                    doc.index(&Field::string("id", "x"))?;
                    Ok(false)
                })
                .unwrap());
            let failed = docs.insert(|doc| {
                doc.index(&Field::string("id", "y"))?;
                doc.index(&Field::string("id", "y").with_features(IndexFeatures::ALL))?;
                Ok(true)
            });
            assert!(failed.is_err());
            add(&mut docs, "z");
        }
        writer.commit().unwrap();
        assert_eq!(vec!["z"], live_ids(&writer));
    }

    #[test]
    fn begin_then_rollback_keeps_committed_state() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        add(&mut writer.documents(), "a");
        writer.commit().unwrap();
        let before = writer.committed_state();

        add(&mut writer.documents(), "b");
        assert!(writer.begin().unwrap());
        assert!(!writer.begin().unwrap());
        assert!(writer.rollback());
        assert!(!writer.rollback());
        assert_eq!(before, writer.committed_state());
        assert!(!writer.commit().unwrap());
        assert_eq!(vec!["a"], live_ids(&writer));
    }

    #[test]
    fn nothing_to_commit() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        assert!(writer.commit().unwrap());
        assert_eq!(1, writer.generation());
        assert!(!writer.commit().unwrap());
        writer.documents().remove(TermFilter::new("id", "missing"));
        assert!(!writer.commit().unwrap());
        assert_eq!(1, writer.generation());
    }

    #[test]
    fn consolidation_is_deferred_while_commit_is_pending() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for id in &["a", "b"] {
            add(&mut writer.documents(), id);
            writer.commit().unwrap();
        }
        assert_eq!(2, writer.committed_state().segments.len());
        add(&mut writer.documents(), "c");
        writer.begin().unwrap();
        let result = writer.consolidate(ConsolidateAll, &mut || true).unwrap();
        assert_eq!(ConsolidationStatus::Pending, result.status);
        writer.commit().unwrap();
        assert_eq!(3, writer.committed_state().segments.len());

        writer.commit().unwrap();
        let state = writer.committed_state();
        assert_eq!(1, state.segments.len());
        assert_eq!(3, state.live_docs_count());
        assert_eq!(vec!["a", "b", "c"], live_ids(&writer));
    }

    #[test]
    fn payload_provider_sees_highest_tick() {
        let dir = MemoryDirectory::new();
        let writer = IndexWriterBuilder::new()
            .meta_payload_provider(|tick| Some(tick.to_string().into_bytes()))
            .open(
                Arc::new(dir.clone()),
                Arc::new(DefaultCodec),
                OpenMode::Create,
            )
            .unwrap();
        {
            let mut docs = writer.documents();
            docs.set_tick(7);
            add(&mut docs, "a");
            docs.set_tick(3);
            add(&mut docs, "b");
        }
        writer.commit().unwrap();
        assert_eq!(Some(b"7".to_vec()), writer.committed_state().payload);
    }

    #[test]
    fn lone_candidate_pairs_with_last_unselected() {
        let dir = MemoryDirectory::new();
        let writer = writer(&dir);
        for id in &["a", "b", "c"] {
            let mut docs = writer.documents();
            add(&mut docs, id);
            add(&mut docs, &format!("{}2", id));
            drop(docs);
            writer.commit().unwrap();
        }
        writer.documents().remove(TermFilter::new("id", "a"));
        writer.commit().unwrap();
        let state = writer.committed_state();
        let first = state.segments[0].meta.name.clone();
        let last = state.segments[2].meta.name.clone();
        let only_first = move |meta: &IndexMeta,
                               _: &ConsolidatingSegments,
                               _: &ReadersCache|
              -> Result<BTreeSet<String>, Error> {
            Ok(meta
                .segments
                .iter()
                .filter(|s| s.meta.name == first)
                .map(|s| s.meta.name.clone())
                .collect())
        };
        let result = writer.consolidate(only_first, &mut || true).unwrap();
        assert_eq!(ConsolidationResult::new(2, ConsolidationStatus::Ok), result);
        writer.commit().unwrap();
        let names = writer.committed_state().segment_names().join(",");
        assert!(!names.contains(&last));
        assert_eq!(2, writer.committed_state().segments.len());
        assert_eq!(vec!["a2", "b", "b2", "c", "c2"], live_ids(&writer));
    }
}
