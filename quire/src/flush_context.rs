use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::consolidation::ConsolidationPolicy;
use crate::filter::Filter;
use crate::meta::IndexSegment;
use crate::segment_pool::SegmentRef;

/// Number of flush contexts the writer rotates through.
pub(crate) const FLUSH_CONTEXTS: usize = 2;

/// A delete or update recorded while a flush context was active.
pub(crate) struct ModificationQuery {
    pub filter: Arc<dyn Filter>,
    pub generation: u64,
    pub is_update: bool,
    /// The filter matched at least one live document.
    pub seen: bool,
    /// Cleared if the replacement document of an update could not be inserted.
    pub valid: bool,
}

/// A segment produced by an import or a consolidation, waiting for the next drain.
pub(crate) struct PendingSegment {
    pub segment: IndexSegment,
    /// Only modifications from this generation on apply to the segment.
    pub generation: u64,
}

pub(crate) struct FlushState {
    /// Bumped on every reset, so transactions can tell whether a pending entry is still theirs.
    pub epoch: u64,
    pub pending: Vec<SegmentRef>,
    /// Entries of `pending` not held by any transaction.
    pub free: Vec<usize>,
    pub queries: Vec<ModificationQuery>,
    /// Committed segments replaced by a queued consolidation.
    pub segment_mask: HashSet<String>,
    pub pending_segments: Vec<PendingSegment>,
    pub policies: Vec<Box<dyn ConsolidationPolicy>>,
}

impl FlushState {
    fn new() -> FlushState {
        FlushState {
            epoch: 0,
            pending: Vec::new(),
            free: Vec::new(),
            queries: Vec::new(),
            segment_mask: HashSet::new(),
            pending_segments: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Registers a slot with this context, returning its entry in the pending list.
    pub fn register(&mut self, segment: SegmentRef) -> usize {
        self.pending.push(segment);
        self.pending.len() - 1
    }

    pub fn add_query(&mut self, query: ModificationQuery) -> usize {
        self.queries.push(query);
        self.queries.len() - 1
    }
}

pub(crate) struct FlushContext {
    pub index: usize,
    /// Read-locked to validate a segment and start a write, write-locked to retire the context.
    pub flush_lock: RwLock<()>,
    active_count: AtomicUsize,
    drain_mutex: Mutex<()>,
    drained: Condvar,
    generation: AtomicU64,
    pub state: Mutex<FlushState>,
}

impl FlushContext {
    pub fn new(index: usize) -> FlushContext {
        FlushContext {
            index,
            flush_lock: RwLock::new(()),
            active_count: AtomicUsize::new(0),
            drain_mutex: Mutex::new(()),
            drained: Condvar::new(),
            generation: AtomicU64::new(0),
            state: Mutex::new(FlushState::new()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the generation before the increment.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Marks a write as in progress. Callers hold a read guard of `flush_lock`.
    pub fn begin_write(&self) {
        self.active_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_write(&self) {
        if self.active_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.drain_mutex.lock();
            self.drained.notify_all();
        }
    }

    pub fn active_writes(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Blocks until every write started against this context has ended.
    pub fn wait_drained(&self) {
        let mut guard = self.drain_mutex.lock();
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if self
                .drained
                .wait_for(&mut guard, Duration::from_secs(1))
                .timed_out()
            {
                debug!(
                    context = self.index,
                    active = self.active_count.load(Ordering::SeqCst),
                    "still waiting for writes to finish"
                );
            }
        }
    }

    /// Clears everything recorded in the context. Returns the consolidation candidates it
    /// held, which are no longer being consolidated.
    pub fn reset(&self) -> Vec<String> {
        let pending;
        let released;
        {
            let mut state = self.state.lock();
            released = state.segment_mask.drain().collect();
            let epoch = state.epoch + 1;
            pending = std::mem::replace(&mut *state, FlushState::new()).pending;
            state.epoch = epoch;
        }
        self.generation.store(0, Ordering::SeqCst);
        // slot references are released outside the state lock
        drop(pending);
        released
    }
}
