// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod action;
pub mod event_count;
pub mod fail;
pub mod fair_share_queue;
pub mod fair_share_thread_pool;
pub mod fiber;
pub mod invoker_queue;
pub mod promise;
pub mod scheduler_thread;

pub use self::{
    action::{
        Action,
        Callback,
        CallbackFuture,
        Invoker,
        InvokerExt,
        QueueStats,
    },
    event_count::{
        EventCount,
        WaitCookie,
    },
    fail::Fail,
    fair_share_queue::{
        Bucket,
        FairShareQueue,
        FairShareTag,
    },
    fair_share_thread_pool::FairShareThreadPool,
    fiber::{
        Fiber,
        FiberCanceler,
        FiberExit,
        FiberScope,
        FiberState,
    },
    invoker_queue::InvokerQueue,
    promise::{
        Promise,
        PromiseFuture,
    },
    scheduler_thread::{
        ActionSource,
        BeginExecute,
        SchedulerThread,
        SingleQueueSchedulerThread,
    },
};
