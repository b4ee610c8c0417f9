// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod logging;
pub mod runtime;

pub use self::runtime::{
    Action,
    ActionSource,
    BeginExecute,
    Bucket,
    Callback,
    CallbackFuture,
    EventCount,
    Fail,
    FairShareQueue,
    FairShareTag,
    FairShareThreadPool,
    Fiber,
    FiberCanceler,
    FiberExit,
    FiberScope,
    FiberState,
    Invoker,
    InvokerExt,
    InvokerQueue,
    Promise,
    PromiseFuture,
    QueueStats,
    SchedulerThread,
    SingleQueueSchedulerThread,
};
