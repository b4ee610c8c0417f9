// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fairsched::{
    Callback,
    CallbackFuture,
    FairShareThreadPool,
    FiberCanceler,
    FiberScope,
    FiberState,
    InvokerExt,
    Promise,
    SingleQueueSchedulerThread,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        mpsc,
        Arc,
        Mutex,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on how long any condition in these tests may take to become true.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Polls `condition` until it holds or [TEST_TIMEOUT] expires.
fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline: Instant = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Wraps an async callback body into the boxed form invokers accept.
fn callback<F, Fut>(f: F) -> Callback
where
    F: FnOnce(FiberScope) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), fairsched::Fail>> + Send + 'static,
{
    Box::new(move |scope: FiberScope| -> CallbackFuture { Box::pin(f(scope)) })
}

//======================================================================================================================
// test_single_queue_yield_ordering()
//======================================================================================================================

/// A callback that yields resumes on the same worker before the next queued action is dequeued.
#[test]
fn test_single_queue_yield_ordering() -> Result<()> {
    fairsched::logging::initialize();

    let scheduler: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("yield-order");
    scheduler.start();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (done, done_future) = Promise::new();

    {
        let order: Arc<Mutex<Vec<&'static str>>> = order.clone();
        scheduler.get_invoker().invoke(callback(move |scope: FiberScope| async move {
            order.lock().unwrap().push("first-pre");
            scope.yield_now().await?;
            order.lock().unwrap().push("first-post");
            Ok(())
        }));
    }
    {
        let order: Arc<Mutex<Vec<&'static str>>> = order.clone();
        scheduler.get_invoker().invoke_fn(move || {
            order.lock().unwrap().push("second");
            done.set();
        });
    }

    done_future.wait();
    anyhow::ensure!(*order.lock().unwrap() == vec!["first-pre", "first-post", "second"]);
    // Accounting for the last action closes shortly after its callback body runs.
    anyhow::ensure!(wait_until(|| scheduler.queue().stats().dequeued == 2));
    scheduler.shutdown();
    Ok(())
}

//======================================================================================================================
// test_fair_share_light_tag_not_starved()
//======================================================================================================================

/// On a single worker, a tag submitting short actions overtakes a tag that has burned execution time: the heavy tag's
/// last action finishes after every light one.
#[test]
fn test_fair_share_light_tag_not_starved() -> Result<()> {
    fairsched::logging::initialize();

    let pool: FairShareThreadPool = FairShareThreadPool::new(1, "starvation-test");
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (done, done_future) = Promise::new();
    let done: Arc<Mutex<Option<Promise>>> = Arc::new(Mutex::new(Some(done)));
    let remaining: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(6));

    // Wedge the worker so all six actions are queued before any is scheduled.
    let (gate, gate_future) = Promise::new();
    pool.get_invoker("gate").invoke_fn(move || gate_future.wait());

    let track = |label: &'static str, work: Duration| {
        let order: Arc<Mutex<Vec<&'static str>>> = order.clone();
        let remaining: Arc<AtomicUsize> = remaining.clone();
        let done: Arc<Mutex<Option<Promise>>> = done.clone();
        move || {
            order.lock().unwrap().push(label);
            std::thread::sleep(work);
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some(done) = done.lock().unwrap().take() {
                    done.set();
                }
            }
        }
    };

    let heavy = pool.get_invoker("heavy");
    let light = pool.get_invoker("light");
    for label in ["h1", "h2", "h3"] {
        heavy.invoke_fn(track(label, Duration::from_millis(15)));
    }
    for label in ["l1", "l2", "l3"] {
        light.invoke_fn(track(label, Duration::from_millis(1)));
    }

    gate.set();
    done_future.wait();

    let order: Vec<&'static str> = order.lock().unwrap().clone();
    anyhow::ensure!(order.len() == 6);
    // The heavy tag accumulates excess fast, so its final action cannot precede any light one.
    anyhow::ensure!(order[5] == "h3", "light tag was starved: {:?}", order);
    let light_positions: Vec<usize> = ["l1", "l2", "l3"]
        .iter()
        .map(|l| order.iter().position(|x| x == l).unwrap())
        .collect();
    anyhow::ensure!(light_positions.windows(2).all(|w| w[0] < w[1]), "light tag ran out of order");

    pool.shutdown();
    Ok(())
}

//======================================================================================================================
// test_pool_shutdown_discards_pending()
//======================================================================================================================

/// Shutting the pool down discards queued actions, and submissions after shutdown never run.
#[test]
fn test_pool_shutdown_discards_pending() -> Result<()> {
    fairsched::logging::initialize();

    let pool: FairShareThreadPool = FairShareThreadPool::new(2, "shutdown-test");
    let invoker = pool.get_invoker("victim");
    let executed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    // Wedge both workers.
    let (gate, gate_future) = Promise::new();
    for i in 0..2 {
        let gate_future = gate_future.clone();
        pool.get_invoker(&format!("gate-{}", i)).invoke_fn(move || gate_future.wait());
    }

    for _ in 0..5 {
        let executed: Arc<AtomicUsize> = executed.clone();
        invoker.invoke_fn(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        });
    }
    anyhow::ensure!(pool.queue().len() >= 5);

    pool.shutdown();
    gate.set();

    anyhow::ensure!(wait_until(|| pool.queue().len() == 0));
    anyhow::ensure!(!pool.queue().is_running());

    let executed_late: Arc<AtomicUsize> = executed.clone();
    invoker.invoke_fn(move || {
        executed_late.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(50));
    anyhow::ensure!(executed.load(Ordering::SeqCst) == 0);
    Ok(())
}

//======================================================================================================================
// test_wait_for_migrates_between_threads()
//======================================================================================================================

/// A callback that sleeps on a promise and names another queue as its resumption invoker wakes up on that queue's
/// worker, and the thread it left behind keeps serving new work.
#[test]
fn test_wait_for_migrates_between_threads() -> Result<()> {
    fairsched::logging::initialize();

    let alpha: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("alpha");
    let beta: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("beta");
    alpha.start();
    beta.start();

    let (signal, signal_future) = Promise::new();
    let (done, done_future) = Promise::new();
    let names: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let names: Arc<Mutex<Vec<Option<String>>>> = names.clone();
        let beta_invoker = beta.get_invoker();
        alpha.get_invoker().invoke(callback(move |scope: FiberScope| async move {
            names.lock().unwrap().push(std::thread::current().name().map(String::from));
            scope.wait_for(signal_future, beta_invoker).await?;
            names.lock().unwrap().push(std::thread::current().name().map(String::from));
            done.set();
            Ok(())
        }));
    }

    // The fiber parks until the promise settles.
    std::thread::sleep(Duration::from_millis(10));
    anyhow::ensure!(!done_future.is_set());
    signal.set();
    anyhow::ensure!(
        wait_until(|| done_future.is_set()),
        "fiber never resumed on the target queue"
    );

    let names: Vec<Option<String>> = names.lock().unwrap().clone();
    anyhow::ensure!(names[0].as_deref() == Some("alpha"));
    anyhow::ensure!(names[1].as_deref() == Some("beta"));

    // The thread the fiber abandoned replaced it and still serves work.
    let (after, after_future) = Promise::new();
    alpha.get_invoker().invoke_fn(move || after.set());
    after_future.wait();

    alpha.shutdown();
    beta.shutdown();
    Ok(())
}

//======================================================================================================================
// test_switch_to_moves_execution()
//======================================================================================================================

/// An unconditional switch hands the rest of the callback to the target queue's worker.
#[test]
fn test_switch_to_moves_execution() -> Result<()> {
    fairsched::logging::initialize();

    let alpha: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("switch-alpha");
    let beta: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("switch-beta");
    alpha.start();
    beta.start();

    let (done, done_future) = Promise::new();
    let names: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let names: Arc<Mutex<Vec<Option<String>>>> = names.clone();
        let beta_invoker = beta.get_invoker();
        alpha.get_invoker().invoke(callback(move |scope: FiberScope| async move {
            names.lock().unwrap().push(std::thread::current().name().map(String::from));
            scope.switch_to(beta_invoker).await?;
            names.lock().unwrap().push(std::thread::current().name().map(String::from));
            done.set();
            Ok(())
        }));
    }

    anyhow::ensure!(
        wait_until(|| done_future.is_set()),
        "fiber never resumed on the target queue"
    );
    let names: Vec<Option<String>> = names.lock().unwrap().clone();
    anyhow::ensure!(names[0].as_deref() == Some("switch-alpha"));
    anyhow::ensure!(names[1].as_deref() == Some("switch-beta"));

    alpha.shutdown();
    beta.shutdown();
    Ok(())
}

//======================================================================================================================
// test_cancellation_unwinds_yielding_fiber()
//======================================================================================================================

/// Canceling a fiber stuck in a yield loop tears it down at the next suspension point, and the worker keeps serving
/// other actions afterwards.
#[test]
fn test_cancellation_unwinds_yielding_fiber() -> Result<()> {
    fairsched::logging::initialize();

    let scheduler: SingleQueueSchedulerThread = SingleQueueSchedulerThread::new("cancel-test");
    scheduler.start();

    let (canceler_tx, canceler_rx) = mpsc::channel::<FiberCanceler>();
    scheduler.get_invoker().invoke(callback(move |scope: FiberScope| async move {
        canceler_tx.send(scope.canceler()).expect("main thread waits on this send");
        loop {
            scope.yield_now().await?;
        }
    }));

    let canceler: FiberCanceler = canceler_rx.recv()?;
    canceler.cancel();
    anyhow::ensure!(wait_until(|| canceler.state() == FiberState::Canceled));

    // The worker survived the teardown.
    let (after, after_future) = Promise::new();
    scheduler.get_invoker().invoke_fn(move || after.set());
    after_future.wait();

    scheduler.shutdown();
    Ok(())
}

//======================================================================================================================
// test_pool_random_workload_completes()
//======================================================================================================================

/// A randomized burst of work across tags and workers all runs exactly once. Completion order is not asserted:
/// several workers may legitimately execute actions of the same tag concurrently.
#[test]
fn test_pool_random_workload_completes() -> Result<()> {
    fairsched::logging::initialize();

    const TAGS: usize = 5;
    const TASKS: usize = 100;

    let pool: FairShareThreadPool = FairShareThreadPool::new(3, "stress-test");
    let mut rng: SmallRng = SmallRng::seed_from_u64(0x5eed);
    let remaining: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(TASKS));
    let (done, done_future) = Promise::new();
    let done: Arc<Mutex<Option<Promise>>> = Arc::new(Mutex::new(Some(done)));
    let per_tag: Vec<Arc<Mutex<Vec<usize>>>> = (0..TAGS).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();
    let mut sequence: Vec<usize> = vec![0; TAGS];

    for _ in 0..TASKS {
        let tag: usize = rng.gen_range(0..TAGS);
        let seq: usize = sequence[tag];
        sequence[tag] += 1;
        let work: u64 = rng.gen_range(0..3);
        let runs: Arc<Mutex<Vec<usize>>> = per_tag[tag].clone();
        let remaining: Arc<AtomicUsize> = remaining.clone();
        let done: Arc<Mutex<Option<Promise>>> = done.clone();
        pool.get_invoker(&format!("tag-{}", tag)).invoke_fn(move || {
            if work > 0 {
                std::thread::sleep(Duration::from_millis(work));
            }
            runs.lock().unwrap().push(seq);
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some(done) = done.lock().unwrap().take() {
                    done.set();
                }
            }
        });
    }

    done_future.wait();
    for (tag, runs) in per_tag.iter().enumerate() {
        let mut runs: Vec<usize> = runs.lock().unwrap().clone();
        runs.sort_unstable();
        anyhow::ensure!(
            runs == (0..sequence[tag]).collect::<Vec<usize>>(),
            "tag {} lost or duplicated work: {:?}",
            tag,
            runs
        );
    }

    pool.shutdown();
    Ok(())
}
