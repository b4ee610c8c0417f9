// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Multi-bucket fair-share queue.
//!
//! Work is keyed by tag; each tag owns a bucket with a FIFO of actions and an accumulated excess execution time.
//! Workers always dequeue from the bucket with the least excess time, tracked by a min-heap with back-references from
//! the bucket arena. Buckets whose FIFO runs dry are evicted from the heap lazily, during dequeue, and their excess is
//! forgotten; a bucket re-entering the heap starts at the current heap minimum so that neither newcomers nor returning
//! tenants can starve established ones or be starved by them.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    action::{
        Action,
        Callback,
        Invoker,
        QueueStats,
    },
    event_count::EventCount,
    fiber::FiberScope,
    scheduler_thread::{
        ActionSource,
        BeginExecute,
    },
};
use ::slab::Slab;
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        Weak,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Key identifying a fair-share tenant.
pub type FairShareTag = String;

/// Per-tag invoker handle. Cloneable and cheap; dropping the last handle retires the bucket once its queued work is
/// gone.
pub struct Bucket {
    self_ref: Weak<Bucket>,
    key: usize,
    tag: FairShareTag,
    parent: Weak<FairShareQueue>,
}

/// Bucket state inside the queue's arena.
struct BucketEntry {
    tag: FairShareTag,
    fifo: VecDeque<Action>,
    /// Position of this bucket's entry in the heap, if scheduled.
    heap_index: Option<usize>,
    /// Set when the last external [Bucket] handle is dropped.
    handle_dropped: bool,
    /// Wait time of the most recently started action.
    last_wait_time: Duration,
}

/// Heap node: buckets ordered by accumulated excess execution time, least first.
struct HeapEntry {
    excess_time: Duration,
    key: usize,
}

/// Per-worker execution claim. The claim pins the bucket's arena slot until accounting closes.
struct Execution {
    key: Option<usize>,
    /// Excess time has been charged to the bucket up to this instant.
    accounted_at: Instant,
}

struct QueueState {
    buckets: Slab<BucketEntry>,
    heap: Vec<HeapEntry>,
    tag_to_bucket: HashMap<FairShareTag, (usize, Weak<Bucket>)>,
    executions: Vec<Execution>,
}

/// The shared action source of a fair-share thread pool: a bucket arena, an excess-time min-heap, and one execution
/// claim per worker.
pub struct FairShareQueue {
    state: Mutex<QueueState>,
    event_count: Arc<EventCount>,
    running: AtomicBool,
    len: AtomicUsize,
    stats: Mutex<QueueStats>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Buckets
impl Bucket {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait time of this bucket's most recently started action.
    pub fn average_wait_time(&self) -> Duration {
        match self.parent.upgrade() {
            Some(parent) => {
                let state: MutexGuard<QueueState> = parent.state.lock().expect("fair share state lock poisoned");
                match state.buckets.get(self.key) {
                    Some(entry) => entry.last_wait_time,
                    None => Duration::ZERO,
                }
            },
            None => Duration::ZERO,
        }
    }
}

impl QueueState {
    /// Charges elapsed time to every bucket currently claimed by a worker and resets their accounting marks.
    fn account_currently_executing(&mut self) {
        let now: Instant = Instant::now();
        for i in 0..self.executions.len() {
            let key: usize = match self.executions[i].key {
                Some(key) => key,
                None => continue,
            };
            let duration: Duration = now.duration_since(self.executions[i].accounted_at);
            self.executions[i].accounted_at = now;
            self.charge_excess(key, duration);
        }
    }

    /// Adds `duration` to the bucket's excess time and restores heap order. Buckets already evicted from the heap
    /// forget the charge.
    fn charge_excess(&mut self, key: usize, duration: Duration) {
        if let Some(index) = self.buckets[key].heap_index {
            self.heap[index].excess_time += duration;
            self.sift_down(index);
        }
    }

    /// Schedules the bucket if it is not in the heap yet. Admission is at the current heap minimum, never below it.
    fn insert_into_heap(&mut self, key: usize) {
        if self.buckets[key].heap_index.is_some() {
            return;
        }
        let initial_excess: Duration = match self.heap.first() {
            Some(front) => front.excess_time,
            None => Duration::ZERO,
        };
        let index: usize = self.heap.len();
        self.heap.push(HeapEntry {
            excess_time: initial_excess,
            key,
        });
        self.buckets[key].heap_index = Some(index);
        self.sift_up(index);
    }

    /// Pops the heap front, fixing the back-reference of whatever entry takes its place.
    fn extract_heap_front(&mut self) -> usize {
        let front: HeapEntry = self.heap.swap_remove(0);
        self.buckets[front.key].heap_index = None;
        if !self.heap.is_empty() {
            let moved: usize = self.heap[0].key;
            self.buckets[moved].heap_index = Some(0);
            self.sift_down(0);
        }
        front.key
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent: usize = (index - 1) / 2;
            if self.heap[index].excess_time >= self.heap[parent].excess_time {
                break;
            }
            self.swap_heap_entries(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left: usize = 2 * index + 1;
            let right: usize = 2 * index + 2;
            let mut least: usize = index;
            if left < self.heap.len() && self.heap[left].excess_time < self.heap[least].excess_time {
                least = left;
            }
            if right < self.heap.len() && self.heap[right].excess_time < self.heap[least].excess_time {
                least = right;
            }
            if least == index {
                break;
            }
            self.swap_heap_entries(index, least);
            index = least;
        }
    }

    fn swap_heap_entries(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let key_a: usize = self.heap[a].key;
        let key_b: usize = self.heap[b].key;
        self.buckets[key_a].heap_index = Some(a);
        self.buckets[key_b].heap_index = Some(b);
    }

    /// Frees the bucket's arena slot once nothing references it: no handle, no queued work, no heap entry, no claim.
    fn try_free_bucket(&mut self, key: usize) {
        let entry: &BucketEntry = match self.buckets.get(key) {
            Some(entry) => entry,
            None => return,
        };
        if !entry.handle_dropped || !entry.fifo.is_empty() || entry.heap_index.is_some() {
            return;
        }
        if self.executions.iter().any(|execution| execution.key == Some(key)) {
            return;
        }
        trace!("try_free_bucket(): bucket retired (tag={})", entry.tag);
        self.buckets.remove(key);
    }
}

/// Associate Functions for FairShareQueues
impl FairShareQueue {
    /// Creates a queue drained by `worker_count` scheduler threads blocking on `event_count`.
    pub fn new(event_count: Arc<EventCount>, worker_count: usize) -> Arc<Self> {
        assert!(worker_count > 0, "a fair share queue needs at least one worker");
        let executions: Vec<Execution> = (0..worker_count)
            .map(|_| Execution {
                key: None,
                accounted_at: Instant::now(),
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(QueueState {
                buckets: Slab::new(),
                heap: Vec::new(),
                tag_to_bucket: HashMap::new(),
                executions,
            }),
            event_count,
            running: AtomicBool::new(true),
            len: AtomicUsize::new(0),
            stats: Mutex::new(QueueStats::default()),
        })
    }

    /// Returns the invoker for `tag`, creating its bucket on first use. Handles are shared: while one is alive, the
    /// same tag maps to the same bucket.
    pub fn get_invoker(self: &Arc<Self>, tag: &str) -> Arc<Bucket> {
        let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");

        if let Some((_, weak)) = state.tag_to_bucket.get(tag) {
            if let Some(bucket) = weak.upgrade() {
                return bucket;
            }
        }

        let key: usize = state.buckets.insert(BucketEntry {
            tag: tag.to_string(),
            fifo: VecDeque::new(),
            heap_index: None,
            handle_dropped: false,
            last_wait_time: Duration::ZERO,
        });
        let parent: Weak<FairShareQueue> = Arc::downgrade(self);
        let bucket: Arc<Bucket> = Arc::new_cyclic(|self_ref: &Weak<Bucket>| Bucket {
            self_ref: self_ref.clone(),
            key,
            tag: tag.to_string(),
            parent,
        });
        state
            .tag_to_bucket
            .insert(tag.to_string(), (key, Arc::downgrade(&bucket)));
        trace!("get_invoker(): bucket created (tag={})", tag);
        bucket
    }

    /// Number of actions enqueued but not yet fully accounted, across all buckets.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> QueueStats {
        *self.stats.lock().expect("fair share stats lock poisoned")
    }

    /// Stops intake and discards all pending actions.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.drain();
    }

    /// Discards every queued action. In-flight actions are unaffected.
    pub fn drain(&self) {
        // Dropping an action can drop the last bucket handle, which re-enters this queue; actions must outlive the
        // lock.
        let mut discarded: Vec<Action> = Vec::new();
        {
            let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");
            for i in 0..state.heap.len() {
                let key: usize = state.heap[i].key;
                let drained: VecDeque<Action> = std::mem::take(&mut state.buckets[key].fifo);
                self.len.fetch_sub(drained.len(), Ordering::Relaxed);
                discarded.extend(drained);
            }
        }
        if !discarded.is_empty() {
            debug!("drain(): discarded {} pending actions", discarded.len());
        }
    }

    fn invoke_into_bucket(&self, key: usize, callback: Callback) {
        if !self.running.load(Ordering::Relaxed) {
            trace!("invoke_into_bucket(): queue shut down, incoming action ignored");
            return;
        }

        {
            let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");
            state.insert_into_heap(key);
            state.buckets[key].fifo.push_back(Action::new(callback));
        }
        self.len.fetch_add(1, Ordering::Relaxed);

        self.event_count.notify_one();
    }

    fn remove_bucket(&self, key: usize, tag: &str) {
        let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");
        if let Some(entry) = state.buckets.get_mut(key) {
            entry.handle_dropped = true;
        }
        if let Some((mapped_key, weak)) = state.tag_to_bucket.get(tag) {
            if *mapped_key == key && weak.upgrade().is_none() {
                state.tag_to_bucket.remove(tag);
            }
        }
        state.try_free_bucket(key);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Invoker for Bucket {
    fn invoke(&self, callback: Callback) {
        let parent: Arc<FairShareQueue> = match self.parent.upgrade() {
            Some(parent) => parent,
            None => return,
        };
        let invoker: Arc<Bucket> = match self.self_ref.upgrade() {
            Some(this) => this,
            None => return,
        };
        let callback: Callback = Box::new(move |mut scope: FiberScope| {
            scope.set_invoker(invoker);
            callback(scope)
        });
        parent.invoke_into_bucket(self.key, callback);
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_bucket(self.key, &self.tag);
        }
    }
}

impl ActionSource for FairShareQueue {
    fn begin_execute(&self, action: &mut Action, index: usize) -> BeginExecute {
        debug_assert!(action.finished, "previous action was never closed");

        let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");
        debug_assert!(
            state.executions[index].key.is_none(),
            "worker already holds an execution claim"
        );

        state.account_currently_executing();

        // Evict dry buckets at the front until a starving bucket with work surfaces.
        let (key, mut next): (usize, Action) = loop {
            let key: usize = match state.heap.first() {
                Some(front) => front.key,
                None => return BeginExecute::QueueEmpty,
            };
            match state.buckets[key].fifo.pop_front() {
                Some(next) => break (key, next),
                None => {
                    let evicted: usize = state.extract_heap_front();
                    state.try_free_bucket(evicted);
                },
            }
        };

        let now: Instant = Instant::now();
        state.executions[index] = Execution {
            key: Some(key),
            accounted_at: now,
        };

        next.started_at = Some(now);
        if let Some(enqueued_at) = next.enqueued_at {
            state.buckets[key].last_wait_time = now.duration_since(enqueued_at);
        }

        let callback: Callback = next.take_callback().expect("enqueued action carries a callback");
        *action = next;
        BeginExecute::Dequeued(callback)
    }

    fn end_execute(&self, action: &mut Action, index: usize) {
        let mut state: MutexGuard<QueueState> = self.state.lock().expect("fair share state lock poisoned");

        let key: usize = match state.executions[index].key {
            Some(key) => key,
            None => return,
        };
        if action.finished {
            return;
        }

        let now: Instant = Instant::now();
        action.finished_at = Some(now);
        action.finished = true;
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .lock()
            .expect("fair share stats lock poisoned")
            .account(action);

        let duration: Duration = now.duration_since(state.executions[index].accounted_at);
        state.charge_excess(key, duration);
        state.executions[index].key = None;
        state.try_free_bucket(key);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
