use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::comparator::Comparator;
use crate::segment_writer::{FlushedSegment, SegmentWriter};

/// Owner value of a slot not registered with any flush context.
pub(crate) const NO_OWNER: usize = ::std::usize::MAX;

pub(crate) struct SlotState {
    pub writer: SegmentWriter,
    /// Segments this slot already sealed on rollover, waiting for the next drain.
    pub flushed: Vec<FlushedSegment>,
}

pub(crate) struct SegmentSlot {
    refs: AtomicUsize,
    /// Set once a draining flush context claimed the slot. No document may start afterwards.
    pub dirty: AtomicBool,
    pub owner: AtomicUsize,
    pub buffered_docs: AtomicU64,
    pub state: Mutex<SlotState>,
}

struct PoolState {
    slots: Vec<Arc<SegmentSlot>>,
    free: Vec<usize>,
    in_use: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    released: Condvar,
    pool_size: usize,
    count_max: AtomicUsize,
    comparator: Option<Arc<dyn Comparator>>,
}

impl PoolInner {
    fn new_writer(&self) -> SegmentWriter {
        SegmentWriter::new(String::new()).with_comparator(self.comparator.clone())
    }

    fn release(&self, index: usize, slot: &SegmentSlot) {
        let keep_warm = self.state.lock().free.len() < self.pool_size;
        {
            let mut state = slot.state.lock();
            if keep_warm {
                state.writer.reset();
            } else {
                state.writer = self.new_writer();
            }
            state.flushed.clear();
        }
        slot.dirty.store(false, Ordering::SeqCst);
        slot.owner.store(NO_OWNER, Ordering::SeqCst);
        slot.buffered_docs.store(0, Ordering::SeqCst);

        let mut state = self.state.lock();
        state.free.push(index);
        state.in_use -= 1;
        trace!(slot = index, in_use = state.in_use, "segment slot released");
        self.released.notify_all();
    }
}

/// Bounded, reusable set of segment writers.
#[derive(Clone)]
pub(crate) struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl SegmentPool {
    pub fn new(
        pool_size: usize,
        count_max: usize,
        comparator: Option<Arc<dyn Comparator>>,
    ) -> SegmentPool {
        SegmentPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: Vec::new(),
                    free: Vec::new(),
                    in_use: 0,
                }),
                released: Condvar::new(),
                pool_size,
                count_max: AtomicUsize::new(count_max),
                comparator,
            }),
        }
    }

    /// 0 lifts the limit.
    pub fn set_count_max(&self, count_max: usize) {
        self.inner.count_max.store(count_max, Ordering::SeqCst);
        self.inner.released.notify_all();
    }

    pub fn count_max(&self) -> usize {
        self.inner.count_max.load(Ordering::SeqCst)
    }

    fn at_limit(&self, state: &PoolState) -> bool {
        let max = self.inner.count_max.load(Ordering::SeqCst);
        max > 0 && state.in_use >= max
    }

    /// Hands out an unused slot, or `None` if the maximum number of slots is in use.
    pub fn try_acquire(&self) -> Option<SegmentRef> {
        let mut state = self.inner.state.lock();
        if self.at_limit(&state) {
            return None;
        }
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                let index = state.slots.len();
                state.slots.push(Arc::new(SegmentSlot {
                    refs: AtomicUsize::new(0),
                    dirty: AtomicBool::new(false),
                    owner: AtomicUsize::new(NO_OWNER),
                    buffered_docs: AtomicU64::new(0),
                    state: Mutex::new(SlotState {
                        writer: self.inner.new_writer(),
                        flushed: Vec::new(),
                    }),
                }));
                index
            }
        };
        state.in_use += 1;
        let slot = state.slots[index].clone();
        slot.refs.store(1, Ordering::SeqCst);
        Some(SegmentRef {
            pool: self.inner.clone(),
            slot,
            index,
        })
    }

    /// Blocks until a slot is released or `timeout` passes. Returns immediately if a slot is
    /// available.
    pub fn wait_released(&self, timeout: Duration) {
        let mut state = self.inner.state.lock();
        if self.at_limit(&state) {
            self.inner.released.wait_for(&mut state, timeout);
        }
    }

    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Documents buffered over all slots in use.
    pub fn buffered_docs(&self) -> u64 {
        self.inner
            .state
            .lock()
            .slots
            .iter()
            .map(|s| s.buffered_docs.load(Ordering::SeqCst))
            .sum()
    }
}

/// Counted reference to a pool slot. The slot returns to the pool when the last reference is
/// dropped.
pub(crate) struct SegmentRef {
    pool: Arc<PoolInner>,
    slot: Arc<SegmentSlot>,
    index: usize,
}

impl SegmentRef {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot(&self) -> &SegmentSlot {
        &self.slot
    }
}

impl Clone for SegmentRef {
    fn clone(&self) -> SegmentRef {
        self.slot.refs.fetch_add(1, Ordering::SeqCst);
        SegmentRef {
            pool: self.pool.clone(),
            slot: self.slot.clone(),
            index: self.index,
        }
    }
}

impl Drop for SegmentRef {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.release(self.index, &self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment_writer::UpdateContext;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn slots_are_reused_after_last_reference() {
        let pool = SegmentPool::new(4, 0, None);
        let first = pool.try_acquire().unwrap();
        let index = first.index();
        first.slot().state.lock().writer.reset_to("_1");
        first.slot().state.lock().writer.begin(UpdateContext::default(), 0);
        let second = first.clone();
        drop(first);
        assert_eq!(1, pool.in_use());
        drop(second);
        assert_eq!(0, pool.in_use());

        let again = pool.try_acquire().unwrap();
        assert_eq!(index, again.index());
        let state = again.slot().state.lock();
        assert!(!state.writer.initialized());
        assert_eq!(0, state.writer.docs_cached());
    }

    #[test]
    fn respects_count_max() {
        let pool = SegmentPool::new(4, 1, None);
        let held = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());

        let start = Instant::now();
        pool.wait_released(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                while pool.try_acquire().is_none() {
                    pool.wait_released(Duration::from_secs(5));
                }
            })
        };
        drop(held);
        waiter.join().unwrap();
        pool.set_count_max(0);
        let _a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert_eq!(2, pool.in_use());
    }
}
