// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Strand
//!
//! Facade over the two halves of the framework:
//! - the actor runtime: mailboxes, actors, the work-stealing executor, the
//!   scheduler and supervision;
//! - the async runtime: futures, promises, the cooperative executor,
//!   channels and the worker pool.
//!
//! The two halves share no state. Each keeps its own error type, exported
//! here as [`ActorError`] and [`RuntimeError`].
//!

pub use actor::{
    Actor, ActorContext, ActorHandle, ActorMessageProcessor, ActorMetrics, ActorRef,
    ActorScheduler, ActorState, BackoffStrategy, BoundedMailbox, DEFAULT_CAPACITY,
    DEFAULT_PRIORITY, DelayedTaskTimer, Envelope, Error as ActorError, ExecutorConfig,
    ExecutorMetrics, ExecutorState, ExponentialBackoffStrategy, FailureListener,
    FixedIntervalStrategy, LinearIntervalStrategy, LoopMetrics, LoopState, Mailbox,
    MailboxType, MessageLoop, MessageLoopConfig, MessageProcessor, NoIntervalStrategy,
    OneForAllStrategy, OneForOneStrategy, PriorityActorScheduler, PriorityDistribution,
    PriorityFn, PriorityMailbox, RestForOneStrategy, RestartPolicy, RestartStats,
    RetryStrategy, ScheduledTask, Scheduler, SchedulerConfig, SchedulerMetrics,
    SchedulerState, SchedulingPolicy, SpawnOptions, SupervisionStrategy, SupervisorActor,
    SupervisorDirective, SupervisorMessage, Task as ExecutorTask, TaskPriority,
    ThreadPoolExecutor, UnboundedMailbox, WorkStealingQueue, WorkerStats, create_mailbox,
    create_scheduler, spawn,
};

pub use runtime::{
    BoxFuture, Channel, DEFAULT_MAX_IDLE_ITERATIONS, Error as RuntimeError, Executor,
    FutureExt, Promise, PromiseFuture, Receiver, Runtime, Sender, Task as AsyncTask,
    TaskHandle, TaskId, TaskState, Waker, Worker, WorkerFuture, WorkerHandle, WorkerPool,
    block_on, future, promise_from_callback,
};
