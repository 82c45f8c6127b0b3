// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Strand Actor Runtime
//!
//! Thread-based actor runtime: actors with private state and mailboxes, a
//! work-stealing thread pool to run them, a scheduler that keeps track of
//! live actors, and supervisors that restart failing actors with backoff.
//!
//! ## Overview
//!
//! An actor is a value implementing [`Actor`]. It is only ever touched by
//! one thread at a time, through its [`Actor::receive`] method, so its state
//! needs no locking. Other code talks to it through an [`ActorRef`], which
//! queues messages in the actor's [`Mailbox`].
//!
//! Messages are pulled out of the mailbox by a [`MessageLoop`]. A loop can
//! own a dedicated thread, or be driven in short cycles by the
//! [`ActorScheduler`] on a shared [`ThreadPoolExecutor`]. The second mode is
//! the default: an idle actor costs no thread, and `max_throughput` bounds
//! how long one busy actor can keep a worker.
//!
//! ## Getting Started
//!
//! ```no_run
//! use actor::{
//!     Actor, ActorContext, Error, ExecutorConfig, SchedulerConfig, SpawnOptions,
//!     create_scheduler,
//! };
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct Counter {
//!     value: u64,
//! }
//!
//! impl Actor for Counter {
//!     type Message = u64;
//!
//!     fn receive(
//!         &mut self,
//!         message: u64,
//!         _ctx: &mut ActorContext<Self>,
//!     ) -> Result<(), Error> {
//!         self.value += message;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Error> {
//! let (scheduler, executor) =
//!     create_scheduler(ExecutorConfig::default(), SchedulerConfig::default())?;
//!
//! let counter = scheduler.spawn(Counter::default(), SpawnOptions::named("counter"))?;
//! counter.tell(5)?;
//!
//! scheduler.shutdown(true, Duration::from_secs(5));
//! executor.shutdown(true, Some(Duration::from_secs(5)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Fault tolerance
//!
//! Children spawned through a [`SupervisorActor`] report every failed
//! `receive` to their supervisor. The supervisor's [`SupervisionStrategy`]
//! decides, based on its [`RestartPolicy`], whether to restart the child
//! (after a backoff delay), stop it, or escalate to the parent supervisor.
//!
//! ## Logging
//!
//! The crate logs through `tracing`: lifecycle transitions at `debug`,
//! rejected work at `warn`, user failures and caught panics at `error`. No
//! subscriber is installed.
//!

mod actor;
mod dispatch;
mod error;
mod executor;
mod mailbox;
mod message_loop;
mod scheduler;
mod supervision;
mod timer;

//
// Actors
//

/// The actor trait: a `receive` handler plus lifecycle hooks.
pub use actor::Actor;

/// Context handed to actor hooks, with access to the actor's own reference.
pub use actor::ActorContext;

/// Type-erased view of an actor, used by registries.
pub use actor::ActorHandle;

/// Cheap, cloneable handle used to send messages to an actor.
pub use actor::ActorRef;

/// Lifecycle states of an actor.
pub use actor::ActorState;

/// User message or stop request, as stored in a mailbox.
pub use actor::Envelope;

/// Callback notified of actor failures.
pub use actor::FailureListener;

/// Creates and starts a standalone actor.
pub use actor::spawn;

//
// Mailboxes
//

pub use mailbox::{
    BoundedMailbox, DEFAULT_CAPACITY, DEFAULT_PRIORITY, Mailbox, MailboxType, PriorityFn,
    PriorityMailbox, UnboundedMailbox, create_mailbox,
};

//
// Message processing
//

/// Binds a mailbox to a message processor.
pub use message_loop::MessageLoop;

pub use message_loop::{
    ActorMessageProcessor, LoopMetrics, LoopState, MessageLoopConfig, MessageProcessor,
};

//
// Execution
//

/// Work-stealing thread pool.
pub use executor::ThreadPoolExecutor;

pub use executor::{
    ExecutorConfig, ExecutorMetrics, ExecutorState, Task, TaskPriority, WorkStealingQueue,
    WorkerStats,
};

/// Delayed, cancellable callbacks on a background thread.
pub use timer::{DelayedTaskTimer, ScheduledTask};

//
// Scheduling
//

/// Registry of live actors running on a [`ThreadPoolExecutor`].
pub use scheduler::ActorScheduler;

pub use scheduler::{
    ActorMetrics, PriorityActorScheduler, PriorityDistribution, Scheduler, SchedulerConfig,
    SchedulerMetrics, SchedulerState, SchedulingPolicy, SpawnOptions, create_scheduler,
};

//
// Supervision
//

/// Actor that restarts, stops or escalates failing children.
pub use supervision::SupervisorActor;

/// Strategy deciding how a supervisor reacts to a child failure.
pub use supervision::SupervisionStrategy;

/// Source of retry delays used by restart policies.
pub use supervision::RetryStrategy;

pub use supervision::{
    BackoffStrategy, ExponentialBackoffStrategy, FixedIntervalStrategy, LinearIntervalStrategy,
    NoIntervalStrategy, OneForAllStrategy, OneForOneStrategy, RestForOneStrategy,
    RestartPolicy, RestartStats, SupervisorDirective, SupervisorMessage,
};

//
// Errors
//

/// Error type of the actor runtime.
pub use error::Error;
