// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    Condvar,
    Mutex,
    MutexGuard,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Cross-thread wait/notify primitive. Consumers snapshot the generation with [EventCount::prepare_wait], re-check
/// their queue, and only then block; a producer notification between the snapshot and the block makes the wait return
/// immediately, so wakeups are never lost.
pub struct EventCount {
    /// Bumped once per notification.
    generation: Mutex<u64>,
    condvar: Condvar,
}

/// Generation snapshot taken before blocking.
#[derive(Clone, Copy, Debug)]
pub struct WaitCookie(u64);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for EventCount
impl EventCount {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Snapshots the current generation. Must be called before checking the guarded condition.
    pub fn prepare_wait(&self) -> WaitCookie {
        WaitCookie(*self.generation.lock().expect("event count lock poisoned"))
    }

    /// Blocks until some producer has notified after `cookie` was taken.
    pub fn wait(&self, cookie: WaitCookie) {
        let mut generation: MutexGuard<u64> = self.generation.lock().expect("event count lock poisoned");
        while *generation == cookie.0 {
            generation = self
                .condvar
                .wait(generation)
                .expect("event count lock poisoned");
        }
    }

    /// Wakes one blocked consumer.
    pub fn notify_one(&self) {
        *self.generation.lock().expect("event count lock poisoned") += 1;
        self.condvar.notify_one();
    }

    /// Wakes every blocked consumer.
    pub fn notify_all(&self) {
        *self.generation.lock().expect("event count lock poisoned") += 1;
        self.condvar.notify_all();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for EventCount {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
