// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

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
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
    TryRecvError,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The simplest invoker: one unbounded FIFO of actions shared by one logical consumer. Producers never block;
/// submissions after shutdown are silently dropped.
pub struct InvokerQueue {
    /// Back-reference for stamping the current invoker on dispatched callbacks.
    self_ref: Weak<InvokerQueue>,
    sender: Sender<Action>,
    receiver: Receiver<Action>,
    running: AtomicBool,
    len: AtomicUsize,
    event_count: Arc<EventCount>,
    stats: Mutex<QueueStats>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for InvokerQueues
impl InvokerQueue {
    /// Creates a queue whose consumers block on `event_count` when it runs dry.
    pub fn new(event_count: Arc<EventCount>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref: &Weak<InvokerQueue>| {
            let (sender, receiver): (Sender<Action>, Receiver<Action>) = unbounded();
            Self {
                self_ref: self_ref.clone(),
                sender,
                receiver,
                running: AtomicBool::new(true),
                len: AtomicUsize::new(0),
                event_count,
                stats: Mutex::new(QueueStats::default()),
            }
        })
    }

    /// Number of actions enqueued but not yet fully accounted.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops accepting new actions. Actions already queued remain eligible for execution.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Snapshot of the aggregate statistics.
    pub fn stats(&self) -> QueueStats {
        *self.stats.lock().expect("queue stats lock poisoned")
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Invoker for InvokerQueue {
    fn invoke(&self, callback: Callback) {
        if !self.running.load(Ordering::Relaxed) {
            trace!("invoke(): queue shut down, incoming action ignored");
            return;
        }

        let invoker: Arc<dyn Invoker> = match self.self_ref.upgrade() {
            Some(this) => this,
            None => return,
        };
        let callback: Callback = Box::new(move |mut scope: FiberScope| {
            scope.set_invoker(invoker);
            callback(scope)
        });

        self.len.fetch_add(1, Ordering::Relaxed);
        trace!("invoke(): callback enqueued");

        // The receiver lives as long as the queue, so this send cannot fail.
        let _ = self.sender.send(Action::new(callback));

        self.event_count.notify_one();
    }
}

impl ActionSource for InvokerQueue {
    fn begin_execute(&self, action: &mut Action, _index: usize) -> BeginExecute {
        debug_assert!(action.finished, "previous action was never closed");

        let mut next: Action = match self.receiver.try_recv() {
            Ok(next) => next,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return BeginExecute::QueueEmpty,
        };

        next.started_at = Some(Instant::now());
        let callback: Callback = next.take_callback().expect("enqueued action carries a callback");
        *action = next;
        BeginExecute::Dequeued(callback)
    }

    fn end_execute(&self, action: &mut Action, _index: usize) {
        if action.finished {
            return;
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        action.finished_at = Some(Instant::now());
        action.finished = true;
        self.stats.lock().expect("queue stats lock poisoned").account(action);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
