// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    Arc,
    Condvar,
    Mutex,
    MutexGuard,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct PromiseState {
    set: bool,
    /// Continuations to run when the promise is set. Run at most once, on the setting thread.
    subscribers: Vec<Box<dyn FnOnce() + Send>>,
}

struct Shared {
    state: Mutex<PromiseState>,
    condvar: Condvar,
}

/// The setting side of a set-once unit future. Dropping the promise without setting it leaves subscribers unfired.
pub struct Promise(Arc<Shared>);

/// The consuming side: fibers suspend on it via `wait_for`, threads outside the runtime block on it via
/// [PromiseFuture::wait], and the scheduler chains continuations with [PromiseFuture::subscribe].
#[derive(Clone)]
pub struct PromiseFuture(Arc<Shared>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Promises
impl Promise {
    /// Creates a linked promise/future pair.
    pub fn new() -> (Promise, PromiseFuture) {
        let shared: Arc<Shared> = Arc::new(Shared {
            state: Mutex::new(PromiseState {
                set: false,
                subscribers: Vec::new(),
            }),
            condvar: Condvar::new(),
        });
        (Promise(shared.clone()), PromiseFuture(shared))
    }

    /// Settles the future. Subscribed continuations run synchronously on the calling thread, after the lock is
    /// released.
    pub fn set(self) {
        let subscribers: Vec<Box<dyn FnOnce() + Send>> = {
            let mut state: MutexGuard<PromiseState> = self.0.state.lock().expect("promise lock poisoned");
            state.set = true;
            std::mem::take(&mut state.subscribers)
        };
        self.0.condvar.notify_all();
        for subscriber in subscribers {
            subscriber();
        }
    }
}

/// Associate Functions for PromiseFutures
impl PromiseFuture {
    /// Checks whether the promise has been settled.
    pub fn is_set(&self) -> bool {
        self.0.state.lock().expect("promise lock poisoned").set
    }

    /// Registers a continuation to run when the promise settles. If it already has, `f` runs synchronously on the
    /// calling thread.
    pub fn subscribe<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state: MutexGuard<PromiseState> = self.0.state.lock().expect("promise lock poisoned");
            if !state.set {
                state.subscribers.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Blocks the calling OS thread until the promise settles. Never call this from inside a fiber; fibers use
    /// `wait_for` instead.
    pub fn wait(&self) {
        let mut state: MutexGuard<PromiseState> = self.0.state.lock().expect("promise lock poisoned");
        while !state.set {
            state = self.0.condvar.wait(state).expect("promise lock poisoned");
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Promise;
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    /// A continuation subscribed before set fires exactly once, on set.
    #[test]
    fn promise_subscribe_before_set() -> Result<()> {
        let (promise, future) = Promise::new();
        let fired: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        future.subscribe({
            let fired: Arc<AtomicUsize> = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        anyhow::ensure!(fired.load(Ordering::SeqCst) == 0);
        promise.set();
        anyhow::ensure!(fired.load(Ordering::SeqCst) == 1);
        anyhow::ensure!(future.is_set());
        Ok(())
    }

    /// A continuation subscribed after set runs synchronously.
    #[test]
    fn promise_subscribe_after_set() -> Result<()> {
        let (promise, future) = Promise::new();
        promise.set();
        let fired: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        future.subscribe({
            let fired: Arc<AtomicUsize> = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        anyhow::ensure!(fired.load(Ordering::SeqCst) == 1);
        Ok(())
    }

    /// A blocking wait returns once the promise settles on another thread.
    #[test]
    fn promise_blocking_wait() -> Result<()> {
        let (promise, future) = Promise::new();
        let setter: std::thread::JoinHandle<()> = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            promise.set();
        });
        future.wait();
        anyhow::ensure!(future.is_set());
        if setter.join().is_err() {
            anyhow::bail!("setter thread panicked");
        }
        Ok(())
    }
}
