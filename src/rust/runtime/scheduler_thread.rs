// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Scheduler threads: one OS thread driving fibers over an abstract action source.
//!
//! The thread's main loop pops ready fibers off a run queue and polls them. When the run queue is empty it spawns an
//! "idle fiber" whose body drains the action source in a loop; when that fiber goes to sleep or dies the thread bumps
//! its epoch and spawns a fresh one. The epoch lets a fiber that migrated to another thread notice that it has been
//! replaced and abandon the drain loop instead of double-driving the source.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    action::{
        Action,
        Callback,
        CallbackFuture,
        Invoker,
    },
    event_count::{
        EventCount,
        WaitCookie,
    },
    fail::Fail,
    fiber::{
        Fiber,
        FiberExit,
        FiberScope,
        FiberState,
        SuspendRequest,
    },
    invoker_queue::InvokerQueue,
    promise::{
        Promise,
        PromiseFuture,
    },
};
use ::futures::task::noop_waker_ref;
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
    },
    task::{
        Context,
        Poll,
    },
    thread,
    thread::{
        JoinHandle,
        ThreadId,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Bit 0 of the epoch: the thread accepts work while set.
const EPOCH_RUNNING_BIT: u64 = 0x1;
/// Added to the epoch every time an idle fiber is retired.
const EPOCH_GENERATION_STEP: u64 = 0x2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of asking an action source for work.
pub enum BeginExecute {
    /// An action was dequeued into the caller's slot; poll this callback to run it.
    Dequeued(Callback),
    /// Nothing pending.
    QueueEmpty,
}

/// Thread state shared between the public handle, the OS thread's loop, and the idle fibers it spawns.
struct ThreadShared {
    name: String,
    /// Worker index within a shared source (0 for single-queue threads).
    index: usize,
    /// Low bit: running. Remaining bits: idle-fiber generation. The epoch is a liveness and abandonment check, no
    /// data is read through it; retirement bumps and abandonment reads use acquire/release since those are the points
    /// where fiber ownership changes hands.
    epoch: AtomicU64,
    event_count: Arc<EventCount>,
    source: Arc<dyn ActionSource>,
    /// One-shot observers fired after the next context switch.
    context_switch_callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Owns one OS thread that executes actions from an [ActionSource] inside fibers.
pub struct SchedulerThread {
    shared: Arc<ThreadShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Per-OS-thread scheduling state. Lives entirely inside the spawned thread; fibers and the run queue are never
/// reachable from outside it.
struct SchedulerLoop {
    shared: Arc<ThreadShared>,
    run_queue: VecDeque<Fiber>,
    /// Cell identity of the live idle fiber, if any.
    idle: Option<Arc<crate::runtime::fiber::FiberShared>>,
    /// Execution slot shared with the idle fibers so both sides can close accounting.
    action_slot: Arc<Mutex<Action>>,
}

/// The simplest concrete scheduler: one thread bound to one [InvokerQueue].
pub struct SingleQueueSchedulerThread {
    queue: Arc<InvokerQueue>,
    thread: SchedulerThread,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Supplies actions to scheduler threads. The two hooks bracket one step of the fiber drain loop; `end_execute` must
/// be idempotent per action and safe to call when nothing was dequeued.
pub trait ActionSource: Send + Sync + 'static {
    /// Pops the next action into `action`, recording its start time.
    fn begin_execute(&self, action: &mut Action, index: usize) -> BeginExecute;

    /// Closes accounting for the action in `action`, if not already closed.
    fn end_execute(&self, action: &mut Action, index: usize);
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ThreadShared {
    fn is_running(&self) -> bool {
        (self.epoch.load(Ordering::Relaxed) & EPOCH_RUNNING_BIT) == EPOCH_RUNNING_BIT
    }
}

/// Associate Functions for SchedulerThreads
impl SchedulerThread {
    /// Creates a scheduler thread bound to `source` as worker `index`. The OS thread is not spawned until
    /// [SchedulerThread::start].
    pub fn new(name: &str, source: Arc<dyn ActionSource>, event_count: Arc<EventCount>, index: usize) -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                name: name.to_string(),
                index,
                epoch: AtomicU64::new(0),
                event_count,
                source,
                context_switch_callbacks: Mutex::new(Vec::new()),
                thread_id: Mutex::new(None),
            }),
            join: Mutex::new(None),
        }
    }

    /// Spawns the OS thread and blocks until its loop is live. Starting twice is a no-op.
    pub fn start(&self) {
        if self.shared.epoch.fetch_or(EPOCH_RUNNING_BIT, Ordering::Relaxed) & EPOCH_RUNNING_BIT != 0 {
            return;
        }

        debug!("start(): starting thread (name={})", self.shared.name);

        let (started, started_future): (Promise, PromiseFuture) = Promise::new();
        let shared: Arc<ThreadShared> = self.shared.clone();
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || SchedulerLoop::new(shared).run(started))
            .expect("failed to spawn scheduler thread");
        *self.join.lock().expect("scheduler join lock poisoned") = Some(handle);

        started_future.wait();
    }

    /// Stops the loop, wakes all blocked waiters, and joins the OS thread unless called from it.
    pub fn shutdown(&self) {
        if !self.shared.is_running() {
            return;
        }

        debug!("shutdown(): stopping thread (name={})", self.shared.name);

        self.shared.epoch.fetch_and(!EPOCH_RUNNING_BIT, Ordering::Relaxed);
        self.shared.event_count.notify_all();

        let handle: Option<JoinHandle<()>> = self.join.lock().expect("scheduler join lock poisoned").take();
        if let Some(handle) = handle {
            let self_shutdown: bool = {
                let thread_id: MutexGuard<Option<ThreadId>> =
                    self.shared.thread_id.lock().expect("scheduler thread id lock poisoned");
                *thread_id == Some(thread::current().id())
            };
            // Joining from the thread itself would deadlock.
            if !self_shutdown {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Registers a one-shot observer fired after the next fiber context switch on this thread.
    pub fn subscribe_context_switched<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .context_switch_callbacks
            .lock()
            .expect("context switch lock poisoned")
            .push(Box::new(callback));
    }
}

/// Associate Functions for SchedulerLoops
impl SchedulerLoop {
    fn new(shared: Arc<ThreadShared>) -> Self {
        Self {
            shared,
            run_queue: VecDeque::new(),
            idle: None,
            action_slot: Arc::new(Mutex::new(Action::default())),
        }
    }

    fn run(mut self, started: Promise) {
        *self
            .shared
            .thread_id
            .lock()
            .expect("scheduler thread id lock poisoned") = Some(thread::current().id());
        debug!("run(): thread started (name={})", self.shared.name);
        started.set();

        while self.shared.is_running() {
            self.step();
        }

        debug!("run(): thread stopped (name={})", self.shared.name);
    }

    /// One iteration of the thread's main loop: resume the front fiber, act on how it came back, fire observers,
    /// close accounting.
    fn step(&mut self) {
        if self.run_queue.is_empty() {
            debug_assert!(self.idle.is_none());
            let fiber: Fiber = self.spawn_idle_fiber();
            self.idle = Some(fiber.cell().clone());
            self.run_queue.push_back(fiber);
        }

        let mut fiber: Fiber = self.run_queue.pop_front().expect("run queue cannot be empty here");
        assert_eq!(
            fiber.state(),
            FiberState::Suspended,
            "resuming a fiber that is not suspended"
        );
        fiber.set_state(FiberState::Running);

        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        // Follow yield-to chains without returning to the outer loop.
        loop {
            match fiber.poll(&mut ctx) {
                Poll::Ready(exit) => {
                    fiber.set_state(match exit {
                        FiberExit::Terminated => FiberState::Terminated,
                        FiberExit::Canceled => FiberState::Canceled,
                    });
                    self.retire_if_idle(&fiber);
                    // We do not own this fiber any more.
                    break;
                },
                Poll::Pending => match fiber.take_request() {
                    Some(SuspendRequest::Yield) => {
                        fiber.set_state(FiberState::Suspended);
                        self.run_queue.push_back(fiber);
                        break;
                    },
                    Some(SuspendRequest::YieldTo(target)) => {
                        // Suspended covers cooperative handoffs; Sleeping covers a rescheduled continuation waking
                        // the fiber it carried, possibly on a different thread than the one that parked it.
                        let target_state: FiberState = target.state();
                        assert!(
                            target_state == FiberState::Suspended || target_state == FiberState::Sleeping,
                            "yielding to a fiber that is not resumable: {:?}",
                            target_state
                        );
                        fiber.set_state(FiberState::Suspended);
                        self.run_queue.push_front(fiber);
                        target.set_state(FiberState::Running);
                        fiber = target;
                    },
                    Some(SuspendRequest::Sleep { future, invoker }) => {
                        fiber.set_state(FiberState::Sleeping);
                        // The idle fiber might be rescheduled elsewhere; a replacement is spawned next step.
                        self.retire_if_idle(&fiber);
                        reschedule(fiber, future, invoker);
                        break;
                    },
                    None => panic!("fiber suspended outside a suspension point"),
                },
            }
        }

        self.on_context_switch();

        // Safe to call even if no action was dequeued in this step.
        let mut action: MutexGuard<Action> = self.action_slot.lock().expect("action slot lock poisoned");
        self.shared.source.end_execute(&mut action, self.shared.index);
    }

    /// If `fiber` is the live idle fiber, advance the epoch and forget the slot.
    fn retire_if_idle(&mut self, fiber: &Fiber) {
        if let Some(idle) = &self.idle {
            if Arc::ptr_eq(idle, fiber.cell()) {
                self.shared.epoch.fetch_add(EPOCH_GENERATION_STEP, Ordering::AcqRel);
                self.idle = None;
            }
        }
    }

    fn spawn_idle_fiber(&self) -> Fiber {
        let shared: Arc<ThreadShared> = self.shared.clone();
        let action_slot: Arc<Mutex<Action>> = self.action_slot.clone();
        let spawned_epoch: u64 = self.shared.epoch.load(Ordering::Acquire);
        trace!(
            "spawn_idle_fiber(): name={} epoch={}",
            self.shared.name,
            spawned_epoch
        );
        Fiber::new(move |scope: FiberScope| fiber_main(scope, shared, action_slot, spawned_epoch))
    }

    fn on_context_switch(&self) {
        let callbacks: Vec<Box<dyn FnOnce() + Send>> = std::mem::take(
            &mut *self
                .shared
                .context_switch_callbacks
                .lock()
                .expect("context switch lock poisoned"),
        );
        for callback in callbacks {
            callback();
        }
    }
}

/// Associate Functions for SingleQueueSchedulerThreads
impl SingleQueueSchedulerThread {
    /// Creates a stopped scheduler thread over a fresh invoker queue.
    pub fn new(name: &str) -> Self {
        let event_count: Arc<EventCount> = Arc::new(EventCount::new());
        let queue: Arc<InvokerQueue> = InvokerQueue::new(event_count.clone());
        let thread: SchedulerThread = SchedulerThread::new(name, queue.clone(), event_count, 0);
        Self { queue, thread }
    }

    pub fn start(&self) {
        self.thread.start();
    }

    /// The invoker callers submit work through.
    pub fn get_invoker(&self) -> Arc<dyn Invoker> {
        self.queue.clone()
    }

    pub fn queue(&self) -> &Arc<InvokerQueue> {
        &self.queue
    }

    pub fn thread(&self) -> &SchedulerThread {
        &self.thread
    }

    /// Stops intake and joins the worker. Queued-but-unrun actions are dropped with the queue.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        self.thread.shutdown();
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Body of an idle fiber: drain the source until the thread stops, the queue runs dry for good, or this fiber is
/// abandoned because its continuation moved to another thread.
async fn fiber_main(
    scope: FiberScope,
    shared: Arc<ThreadShared>,
    action_slot: Arc<Mutex<Action>>,
    spawned_epoch: u64,
) -> FiberExit {
    trace!("fiber_main(): fiber started (name={})", shared.name);

    loop {
        let cookie: WaitCookie = shared.event_count.prepare_wait();

        if !shared.is_running() {
            return FiberExit::Terminated;
        }

        let begin: BeginExecute = {
            let mut action: MutexGuard<Action> = action_slot.lock().expect("action slot lock poisoned");
            shared.source.begin_execute(&mut action, shared.index)
        };

        match begin {
            BeginExecute::Dequeued(callback) => {
                let result: Result<(), Fail> = callback(scope.clone()).await;

                // If the callback saw wait_for/switch_to, ownership of this fiber has been transferred and the
                // spawning thread has already replaced it; abandon the drain loop.
                let current_epoch: u64 = shared.epoch.load(Ordering::Acquire);
                let abandoned: bool = spawned_epoch != current_epoch;

                match result {
                    Ok(()) => {
                        if abandoned {
                            return FiberExit::Terminated;
                        }
                        let mut action: MutexGuard<Action> =
                            action_slot.lock().expect("action slot lock poisoned");
                        shared.source.end_execute(&mut action, shared.index);
                    },
                    Err(e) if e.is_canceled() => {
                        // Still a successful step; the canceling party owns any further teardown.
                        if !abandoned {
                            let mut action: MutexGuard<Action> =
                                action_slot.lock().expect("action slot lock poisoned");
                            shared.source.end_execute(&mut action, shared.index);
                        }
                        return FiberExit::Canceled;
                    },
                    Err(e) => {
                        // Fail fast: the thread's scheduling state cannot be recovered mid-callback.
                        error!(
                            "fiber_main(): unhandled error in scheduler thread (name={}): {:?}",
                            shared.name, e
                        );
                        panic!("unhandled error in scheduler thread: {:?}", e);
                    },
                }
            },
            BeginExecute::QueueEmpty => {
                {
                    let mut action: MutexGuard<Action> = action_slot.lock().expect("action slot lock poisoned");
                    shared.source.end_execute(&mut action, shared.index);
                }
                shared.event_count.wait(cookie);
            },
        }
    }
}

/// Hands a sleeping fiber's continuation to `invoker`, immediately or once `future` settles. The continuation
/// yields-to the moved fiber from whichever fiber is draining the target invoker; dropping it unwinds the fiber.
fn reschedule(fiber: Fiber, future: Option<PromiseFuture>, invoker: Arc<dyn Invoker>) {
    let callback: Callback = Box::new(move |scope: FiberScope| -> CallbackFuture {
        Box::pin(async move { scope.yield_to(fiber).await })
    });
    match future {
        Some(future) => future.subscribe(move || invoker.invoke(callback)),
        None => invoker.invoke(callback),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for SingleQueueSchedulerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
