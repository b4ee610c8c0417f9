// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fibers: suspendable units of execution driven by scheduler threads.
//!
//! A fiber owns a boxed coroutine plus a small shared cell (state, cancellation flag, suspension-request slot). The
//! coroutine may only return `Pending` from the suspension futures issued by its [FiberScope]; each of those records
//! what the fiber wants (yield, yield-to, sleep on an invoker) in the request slot for the driving thread to act on.
//! Ownership of a fiber moves with it: when a fiber goes to sleep its `Fiber` value is moved into the continuation
//! handed to the target invoker, and the thread that put it to sleep can never touch it again.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    action::Invoker,
    fail::Fail,
    promise::PromiseFuture,
};
use ::std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
    },
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The fiber state machine. Transitions are performed exclusively by the driving scheduler thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or cooperatively yielded; ready to be resumed.
    Suspended = 0,
    /// Currently being polled by some OS thread.
    Running = 1,
    /// Suspended pending an external event; ownership has been handed to a continuation.
    Sleeping = 2,
    /// The coroutine ran to completion.
    Terminated = 3,
    /// The coroutine was torn down by cancellation.
    Canceled = 4,
}

/// What a suspended fiber asked its driver to do.
pub(crate) enum SuspendRequest {
    /// Requeue me at the back of the run queue.
    Yield,
    /// Run this fiber now; requeue me at the front.
    YieldTo(Fiber),
    /// Hand my continuation to `invoker`, immediately or once `future` settles.
    Sleep {
        future: Option<PromiseFuture>,
        invoker: Arc<dyn Invoker>,
    },
}

/// State shared between a fiber, its scope, and its cancelers.
pub(crate) struct FiberShared {
    state: AtomicU8,
    canceled: AtomicBool,
    request: Mutex<Option<SuspendRequest>>,
}

/// How a fiber's coroutine finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberExit {
    Terminated,
    Canceled,
}

/// An owned, non-aliasable fiber handle. Whichever component holds the `Fiber` value owns the right to drive it.
pub struct Fiber {
    shared: Arc<FiberShared>,
    coroutine: Pin<Box<dyn Future<Output = FiberExit> + Send>>,
}

/// The explicit context handed to every callback: suspension primitives, the cancellation view, and the invoker the
/// callback arrived through.
#[derive(Clone)]
pub struct FiberScope {
    shared: Arc<FiberShared>,
    invoker: Option<Arc<dyn Invoker>>,
}

/// A cloneable handle for canceling a fiber and observing its state from any thread.
#[derive(Clone)]
pub struct FiberCanceler {
    shared: Arc<FiberShared>,
}

/// Future returned by every suspension primitive. First poll records the request and suspends; the poll after
/// resumption reports success or cancellation. The cancellation flag is checked on both sides of the suspension.
pub struct SuspendFuture {
    shared: Arc<FiberShared>,
    request: Option<SuspendRequest>,
    suspended: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FiberState {
    fn from_u8(value: u8) -> FiberState {
        match value {
            0 => FiberState::Suspended,
            1 => FiberState::Running,
            2 => FiberState::Sleeping,
            3 => FiberState::Terminated,
            4 => FiberState::Canceled,
            _ => unreachable!("invalid fiber state: {}", value),
        }
    }
}

impl FiberShared {
    fn new() -> Arc<FiberShared> {
        Arc::new(FiberShared {
            state: AtomicU8::new(FiberState::Suspended as u8),
            canceled: AtomicBool::new(false),
            request: Mutex::new(None),
        })
    }
}

/// Associate Functions for Fibers
impl Fiber {
    /// Creates a fiber in the `Suspended` state. The factory receives the fiber's own scope so that the body can
    /// issue suspension requests against the right cell.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: FnOnce(FiberScope) -> Fut,
        Fut: Future<Output = FiberExit> + Send + 'static,
    {
        let shared: Arc<FiberShared> = FiberShared::new();
        let scope: FiberScope = FiberScope {
            shared: shared.clone(),
            invoker: None,
        };
        let coroutine: Pin<Box<dyn Future<Output = FiberExit> + Send>> = Box::pin(factory(scope));
        Self { shared, coroutine }
    }

    /// Returns a cancellation/observation handle.
    pub fn canceler(&self) -> FiberCanceler {
        FiberCanceler {
            shared: self.shared.clone(),
        }
    }

    /// Current state of this fiber.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.shared.state.store(state as u8, Ordering::Release);
    }

    /// Polls the coroutine one step.
    pub(crate) fn poll(&mut self, ctx: &mut Context) -> Poll<FiberExit> {
        self.coroutine.as_mut().poll(ctx)
    }

    /// Takes the suspension request recorded by the last `Pending`.
    pub(crate) fn take_request(&self) -> Option<SuspendRequest> {
        self.shared.request.lock().expect("fiber request lock poisoned").take()
    }

    /// Identity of the fiber's shared cell, used to recognize the idle fiber across suspensions.
    pub(crate) fn cell(&self) -> &Arc<FiberShared> {
        &self.shared
    }
}

/// Associate Functions for FiberScopes
impl FiberScope {
    /// The invoker whose action this fiber is currently executing, if any.
    pub fn invoker(&self) -> Option<Arc<dyn Invoker>> {
        self.invoker.clone()
    }

    /// Stamps the current invoker. Called by queue wrappers when dispatching a callback.
    pub fn set_invoker(&mut self, invoker: Arc<dyn Invoker>) {
        self.invoker = Some(invoker);
    }

    /// Returns a cancellation/observation handle onto the running fiber.
    pub fn canceler(&self) -> FiberCanceler {
        FiberCanceler {
            shared: self.shared.clone(),
        }
    }

    /// Checks the cancellation flag without suspending.
    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Cooperatively yields; the fiber is requeued to run again on the same thread.
    pub fn yield_now(&self) -> SuspendFuture {
        self.suspend(SuspendRequest::Yield)
    }

    /// Runs `fiber` now on this thread, resuming the caller afterwards.
    pub fn yield_to(&self, fiber: Fiber) -> SuspendFuture {
        self.suspend(SuspendRequest::YieldTo(fiber))
    }

    /// Moves this fiber's continuation to `invoker`; it resumes on whichever thread drains that invoker.
    pub fn switch_to(&self, invoker: Arc<dyn Invoker>) -> SuspendFuture {
        self.suspend(SuspendRequest::Sleep { future: None, invoker })
    }

    /// Sleeps until `future` settles, then resumes via `invoker`, possibly on a different OS thread.
    pub fn wait_for(&self, future: PromiseFuture, invoker: Arc<dyn Invoker>) -> SuspendFuture {
        self.suspend(SuspendRequest::Sleep {
            future: Some(future),
            invoker,
        })
    }

    fn suspend(&self, request: SuspendRequest) -> SuspendFuture {
        SuspendFuture {
            shared: self.shared.clone(),
            request: Some(request),
            suspended: false,
        }
    }
}

/// Associate Functions for FiberCancelers
impl FiberCanceler {
    /// Flags the fiber for cancellation. Observed at its next suspension-point check; idempotent, and a no-op for
    /// fibers that already terminated.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Current state of the fiber.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.shared.state.load(Ordering::Acquire))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for SuspendFuture {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if !self_.suspended {
            // Check before suspending.
            if self_.shared.canceled.load(Ordering::Acquire) {
                return Poll::Ready(Err(Fail::canceled()));
            }
            let request: SuspendRequest = self_
                .request
                .take()
                .expect("suspension future polled after completion");
            *self_.shared.request.lock().expect("fiber request lock poisoned") = Some(request);
            self_.suspended = true;
            return Poll::Pending;
        }
        // Check after resumption.
        if self_.shared.canceled.load(Ordering::Acquire) {
            return Poll::Ready(Err(Fail::canceled()));
        }
        Poll::Ready(Ok(()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
