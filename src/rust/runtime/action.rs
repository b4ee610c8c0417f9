// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    fiber::FiberScope,
};
use ::std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The future produced by a callback. It must only suspend through the [FiberScope] suspension primitives; the
/// cancellation signal ([Fail::canceled]) is the sole failure a callback is allowed to return.
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), Fail>> + Send + 'static>>;

/// A deferred unit of work. The factory receives the scope of the fiber that ends up executing it, which carries the
/// suspension primitives and the current invoker.
pub type Callback = Box<dyn FnOnce(FiberScope) -> CallbackFuture + Send + 'static>;

/// A queued callback plus its bookkeeping timestamps. Also used as the per-worker execution slot: a default Action
/// with `finished == true` means "nothing pending".
pub struct Action {
    /// When the callback was accepted by an invoker.
    pub enqueued_at: Option<Instant>,
    /// When a worker dequeued the callback.
    pub started_at: Option<Instant>,
    /// When accounting for the callback was closed.
    pub finished_at: Option<Instant>,
    /// Whether accounting for this action has been closed. Starts out true and flips to false on enqueue.
    pub finished: bool,
    /// The deferred work. Taken out of the action the moment execution begins so that captured resources do not
    /// outlive cancellation handling.
    pub callback: Option<Callback>,
}

/// Aggregate wait/exec/total time statistics for a queue.
#[derive(Clone, Copy, Default, Debug)]
pub struct QueueStats {
    /// Number of actions whose accounting has been closed.
    pub dequeued: u64,
    /// Cumulative time actions spent queued before starting.
    pub wait_time: Duration,
    /// Cumulative time actions spent executing.
    pub exec_time: Duration,
    /// Cumulative time from enqueue to finish.
    pub total_time: Duration,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Actions
impl Action {
    /// Creates a freshly enqueued action around `callback`.
    pub fn new(callback: Callback) -> Self {
        Self {
            enqueued_at: Some(Instant::now()),
            started_at: None,
            finished_at: None,
            finished: false,
            callback: Some(callback),
        }
    }

    /// Takes the callback out of this action for execution.
    pub fn take_callback(&mut self) -> Option<Callback> {
        self.callback.take()
    }
}

/// Associate Functions for QueueStats
impl QueueStats {
    /// Folds a finished action into the aggregates.
    pub fn account(&mut self, action: &Action) {
        self.dequeued += 1;
        if let (Some(enqueued_at), Some(started_at)) = (action.enqueued_at, action.started_at) {
            self.wait_time += started_at.duration_since(enqueued_at);
        }
        if let (Some(started_at), Some(finished_at)) = (action.started_at, action.finished_at) {
            self.exec_time += finished_at.duration_since(started_at);
        }
        if let (Some(enqueued_at), Some(finished_at)) = (action.enqueued_at, action.finished_at) {
            self.total_time += finished_at.duration_since(enqueued_at);
        }
    }
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// The single capability every component of the runtime depends on: accept a callback for later execution. `invoke`
/// never blocks the caller and never executes the callback synchronously; callbacks submitted to the same invoker run
/// in submission order. Submitting to a shut-down invoker is a silent no-op.
pub trait Invoker: Send + Sync + 'static {
    /// Accepts `callback` for asynchronous execution.
    fn invoke(&self, callback: Callback);
}

/// Convenience extensions over [Invoker].
pub trait InvokerExt: Invoker {
    /// Submits a plain closure that never suspends.
    fn invoke_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.invoke(Box::new(move |_: FiberScope| -> CallbackFuture {
            Box::pin(async move {
                f();
                Ok(())
            })
        }));
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// An empty slot with nothing pending.
impl Default for Action {
    fn default() -> Self {
        Self {
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            finished: true,
            callback: None,
        }
    }
}

impl<I: Invoker + ?Sized> InvokerExt for I {}
