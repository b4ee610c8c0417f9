// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    event_count::EventCount,
    fair_share_queue::{
        Bucket,
        FairShareQueue,
    },
    scheduler_thread::SchedulerThread,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A pool of scheduler threads draining one shared [FairShareQueue]. Callers obtain per-tag invokers and submit work
/// through them; the pool divides execution time fairly across tags, not across callers or actions.
pub struct FairShareThreadPool {
    name_prefix: String,
    queue: Arc<FairShareQueue>,
    threads: Mutex<Vec<Arc<SchedulerThread>>>,
    shutdown_flag: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for FairShareThreadPools
impl FairShareThreadPool {
    /// Creates and starts a pool of `thread_count` workers named `{name_prefix}:{index}`.
    pub fn new(thread_count: usize, name_prefix: &str) -> Self {
        assert!(thread_count > 0, "a fair share thread pool needs at least one thread");

        let event_count: Arc<EventCount> = Arc::new(EventCount::new());
        let queue: Arc<FairShareQueue> = FairShareQueue::new(event_count.clone(), thread_count);

        let threads: Vec<Arc<SchedulerThread>> = (0..thread_count)
            .map(|index: usize| {
                Arc::new(SchedulerThread::new(
                    &format!("{}:{}", name_prefix, index),
                    queue.clone(),
                    event_count.clone(),
                    index,
                ))
            })
            .collect();
        for thread in &threads {
            thread.start();
        }

        debug!("new(): fair share pool started (name={}, threads={})", name_prefix, thread_count);

        Self {
            name_prefix: name_prefix.to_string(),
            queue,
            threads: Mutex::new(threads),
            shutdown_flag: AtomicBool::new(false),
        }
    }

    /// Returns the invoker for `tag`, creating its bucket on first use.
    pub fn get_invoker(&self, tag: &str) -> Arc<Bucket> {
        self.queue.get_invoker(tag)
    }

    pub fn queue(&self) -> &Arc<FairShareQueue> {
        &self.queue
    }

    /// Stops intake, discards pending actions, and hands thread joins plus the final drain to a finalizer thread.
    /// Only the first call acts; later calls and [Drop] are no-ops.
    pub fn shutdown(&self) {
        if self
            .shutdown_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        debug!("shutdown(): stopping fair share pool (name={})", self.name_prefix);

        self.queue.shutdown();

        let threads: Vec<Arc<SchedulerThread>> = {
            let mut threads: MutexGuard<Vec<Arc<SchedulerThread>>> =
                self.threads.lock().expect("pool threads lock poisoned");
            std::mem::take(&mut *threads)
        };

        // Joins happen off the caller's thread: a worker of this very pool may be the one shutting it down.
        let queue: Arc<FairShareQueue> = self.queue.clone();
        let _ = thread::Builder::new()
            .name(format!("{}:finalizer", self.name_prefix))
            .spawn(move || {
                for thread in &threads {
                    thread.shutdown();
                }
                queue.drain();
            })
            .expect("failed to spawn pool finalizer thread");
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for FairShareThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
