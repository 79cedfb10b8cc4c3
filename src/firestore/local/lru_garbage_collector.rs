use std::collections::{BTreeSet, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::constants::{
    INVALID_SEQUENCE_NUMBER, LRU_INITIAL_GC_DELAY, LRU_REGULAR_GC_DELAY,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

/// Cache size value that turns collection off.
pub const LRU_COLLECTION_DISABLED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;


/// Thresholds for least-recently-used collection of cached targets and documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size in bytes above which collection runs, or
    /// [`LRU_COLLECTION_DISABLED`].
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: LRU_COLLECTION_DISABLED,
            ..Self::default()
        }
    }

    /// Collects once the cache grows past `bytes`. Values below one megabyte
    /// are rejected unless they disable collection.
    pub fn with_cache_size_bytes(bytes: i64) -> FirestoreResult<Self> {
        if bytes != LRU_COLLECTION_DISABLED && bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be set to at least {MINIMUM_CACHE_SIZE_BYTES} bytes"
            )));
        }
        Ok(Self {
            cache_size_collection_threshold: bytes,
            ..Self::default()
        })
    }

    pub fn with_percentile(mut self, percentile: u32) -> Self {
        self.percentile_to_collect = percentile.min(100);
        self
    }

    pub fn with_maximum_sequence_numbers(mut self, maximum: usize) -> Self {
        self.maximum_sequence_numbers_to_collect = maximum;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != LRU_COLLECTION_DISABLED
    }
}

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Keeps the `capacity` smallest sequence numbers seen.
#[derive(Debug)]
pub struct RollingSequenceNumberBuffer {
    capacity: usize,
    heap: BinaryHeap<i64>,
}

impl RollingSequenceNumberBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    pub fn add(&mut self, sequence_number: i64) {
        if self.capacity == 0 {
            return;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(sequence_number);
        } else if self.heap.peek().is_some_and(|&highest| sequence_number < highest) {
            self.heap.pop();
            self.heap.push(sequence_number);
        }
    }

    /// Largest of the retained sequence numbers.
    pub fn max_value(&self) -> i64 {
        self.heap.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }
}

/// Access to the cache contents a collection pass inspects and prunes.
pub trait LruDelegate {
    /// Estimated size of the document cache in bytes.
    fn cache_size(&self) -> usize;

    /// Number of targets plus orphaned documents.
    fn sequence_number_count(&self) -> usize;

    fn for_each_target_sequence_number(&self, f: &mut dyn FnMut(i64));

    fn for_each_orphaned_document_sequence_number(&self, f: &mut dyn FnMut(i64));

    /// Removes inactive targets last used at or before `upper_bound`.
    fn remove_targets(&mut self, upper_bound: i64, active_target_ids: &BTreeSet<i32>) -> usize;

    /// Removes unreferenced documents last used at or before `upper_bound`.
    fn remove_orphaned_documents(&mut self, upper_bound: i64) -> usize;
}

#[derive(Debug, Clone, Default)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Sequence number count matching `percentile` of everything collectable.
    pub fn calculate_target_count(&self, delegate: &dyn LruDelegate, percentile: u32) -> usize {
        delegate.sequence_number_count() * percentile as usize / 100
    }

    /// The `count`-th smallest sequence number across targets and orphaned documents.
    pub fn nth_sequence_number(&self, delegate: &dyn LruDelegate, count: usize) -> i64 {
        if count == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        let mut buffer = RollingSequenceNumberBuffer::new(count);
        delegate.for_each_target_sequence_number(&mut |n| buffer.add(n));
        delegate.for_each_orphaned_document_sequence_number(&mut |n| buffer.add(n));
        buffer.max_value()
    }

    /// Runs a pass when the cache exceeds the configured threshold.
    pub fn collect(&self, delegate: &mut dyn LruDelegate, active_target_ids: &BTreeSet<i32>) -> LruResults {
        if !self.params.is_enabled() {
            log::debug!("garbage collection skipped; disabled");
            return LruResults::skipped();
        }
        let cache_size = delegate.cache_size();
        if (cache_size as i64) < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return LruResults::skipped();
        }
        self.run_garbage_collection(delegate, active_target_ids)
    }

    fn run_garbage_collection(&self, delegate: &mut dyn LruDelegate, active_target_ids: &BTreeSet<i32>) -> LruResults {
        let mut count = self.calculate_target_count(&*delegate, self.params.percentile_to_collect);
        if count > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping garbage collection to {} sequence numbers (requested {count})",
                self.params.maximum_sequence_numbers_to_collect
            );
            count = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(&*delegate, count);
        let targets_removed = delegate.remove_targets(upper_bound, active_target_ids);
        let documents_removed = delegate.remove_orphaned_documents(upper_bound);
        log::debug!(
            "LRU garbage collection: collected {count} sequence numbers up to {upper_bound}, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        }
    }
}

pub type GarbageCollectionTask = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<LruResults>> + Send + Sync>;

/// Runs collection on the async queue one minute after start, then every five
/// minutes.
#[derive(Clone)]
pub struct LruScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    queue: AsyncQueue,
    task: GarbageCollectionTask,
    enabled: bool,
    stopped: AtomicBool,
    pending: StdMutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(params: &LruParams, queue: AsyncQueue, task: GarbageCollectionTask) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue,
                task,
                enabled: params.is_enabled(),
                stopped: AtomicBool::new(true),
                pending: StdMutex::new(None),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.enabled {
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        Self::schedule(&self.inner, LRU_INITIAL_GC_DELAY);
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(operation) = self.inner.lock_pending().take() {
            operation.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock_pending().is_some()
    }

    fn schedule(inner: &Arc<SchedulerInner>, delay: Duration) {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        let operation = inner
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                inner.lock_pending().take();
                match (inner.task)().await {
                    Ok(results) => log::debug!("scheduled garbage collection finished: {results:?}"),
                    Err(err) => log::warn!("ignoring failure during garbage collection: {err}"),
                }
                Self::schedule(&inner, LRU_REGULAR_GC_DELAY);
                Ok(())
            });
        let mut pending = inner.lock_pending();
        if let Some(previous) = pending.replace(operation) {
            previous.cancel();
        }
    }
}

impl SchedulerInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<DelayedOperation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeDelegate {
        size: usize,
        targets: BTreeMap<i32, i64>,
        orphans: BTreeMap<String, i64>,
        pinned: BTreeSet<String>,
    }

    impl LruDelegate for FakeDelegate {
        fn cache_size(&self) -> usize {
            self.size
        }

        fn sequence_number_count(&self) -> usize {
            self.targets.len() + self.orphans.len()
        }

        fn for_each_target_sequence_number(&self, f: &mut dyn FnMut(i64)) {
            self.targets.values().for_each(|&n| f(n));
        }

        fn for_each_orphaned_document_sequence_number(&self, f: &mut dyn FnMut(i64)) {
            self.orphans.values().for_each(|&n| f(n));
        }

        fn remove_targets(&mut self, upper_bound: i64, active_target_ids: &BTreeSet<i32>) -> usize {
            let before = self.targets.len();
            self.targets
                .retain(|id, n| *n > upper_bound || active_target_ids.contains(id));
            before - self.targets.len()
        }

        fn remove_orphaned_documents(&mut self, upper_bound: i64) -> usize {
            let before = self.orphans.len();
            let pinned = self.pinned.clone();
            self.orphans.retain(|key, n| *n > upper_bound || pinned.contains(key));
            before - self.orphans.len()
        }
    }

    #[test]
    fn buffer_keeps_smallest_values() {
        let mut buffer = RollingSequenceNumberBuffer::new(3);
        for n in [9, 4, 7, 1, 8, 2] {
            buffer.add(n);
        }
        assert_eq!(buffer.max_value(), 4);
        assert_eq!(RollingSequenceNumberBuffer::new(0).max_value(), INVALID_SEQUENCE_NUMBER);
    }

    #[test]
    fn rejects_tiny_cache_sizes() {
        assert!(LruParams::with_cache_size_bytes(1024).is_err());
        assert!(!LruParams::with_cache_size_bytes(LRU_COLLECTION_DISABLED).unwrap().is_enabled());
    }

    #[test]
    fn skips_below_threshold() {
        let collector = LruGarbageCollector::new(LruParams::default());
        let mut delegate = FakeDelegate {
            size: 10,
            ..FakeDelegate::default()
        };
        assert!(!collector.collect(&mut delegate, &BTreeSet::new()).did_run);
    }

    #[test]
    fn collects_oldest_percentile_except_active_and_pinned() {
        let params = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        };
        let collector = LruGarbageCollector::new(params);
        let mut delegate = FakeDelegate::default();
        for (id, n) in [(2, 1), (4, 2), (6, 10)] {
            delegate.targets.insert(id, n);
        }
        for (key, n) in [("a", 3), ("b", 4), ("c", 11)] {
            delegate.orphans.insert(key.to_string(), n);
        }
        delegate.pinned.insert("b".to_string());

        let active: BTreeSet<i32> = [4].into_iter().collect();
        let results = collector.collect(&mut delegate, &active);
        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 3);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);
        assert!(delegate.targets.contains_key(&4));
        assert!(delegate.orphans.contains_key("b"));
        assert!(!delegate.orphans.contains_key("a"));
    }

    #[test]
    fn caps_sequence_numbers() {
        let params = LruParams {
            cache_size_collection_threshold: 0,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1,
        };
        let collector = LruGarbageCollector::new(params);
        let mut delegate = FakeDelegate::default();
        delegate.targets.insert(2, 1);
        delegate.targets.insert(4, 2);
        let results = collector.collect(&mut delegate, &BTreeSet::new());
        assert_eq!(results.sequence_numbers_collected, 1);
        assert_eq!(results.targets_removed, 1);
    }
}
