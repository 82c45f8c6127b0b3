// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor scheduler
//!
//! The [`ActorScheduler`] is the registry of live actors. Spawning an actor
//! registers it under a unique name, runs `pre_start`, and hands its mailbox
//! to a dispatcher that processes messages on the shared
//! [`ThreadPoolExecutor`]. The scheduler also owns a [`DelayedTaskTimer`]
//! for delayed, cancellable callbacks.
//!
//! ```ignore
//! let (scheduler, executor) =
//!     create_scheduler(ExecutorConfig::default(), SchedulerConfig::default())?;
//! let counter = scheduler.spawn(Counter::default(), SpawnOptions::named("counter"))?;
//! counter.send(1)?;
//! scheduler.shutdown(true, Duration::from_secs(5));
//! executor.shutdown(true, Some(Duration::from_secs(5)));
//! ```
//!

use crate::{
    Error,
    actor::{Actor, ActorHandle, ActorRef},
    dispatch::ActorDispatcher,
    executor::{ExecutorConfig, TaskPriority, ThreadPoolExecutor},
    mailbox::MailboxType,
    timer::DelayedTaskTimer,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use std::{
    collections::HashMap,
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

/// How the scheduler orders actors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// Every actor gets the same share of the executor.
    #[default]
    Fair,
    /// Actor priority selects the executor queue of its cycles.
    Priority,
    /// Cycles go through the global executor queue, in submission order.
    Fifo,
}

/// Scheduler lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    ShuttingDown,
    Terminated,
}

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicy,
    /// Ceiling on live actors.
    pub max_actors: usize,
    /// Messages per cycle for actors spawned without `max_throughput`.
    pub default_throughput: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::Fair,
            max_actors: 10_000,
            default_throughput: 32,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_actors == 0 {
            return Err(Error::Config("max_actors must be greater than 0".to_owned()));
        }
        if self.default_throughput == 0 {
            return Err(Error::Config(
                "default_throughput must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Options for [`ActorScheduler::spawn`].
pub struct SpawnOptions<M> {
    /// Actor name. Generated as `actor-{n}` when `None`.
    pub name: Option<String>,
    /// Positive is high, zero normal, negative low.
    pub priority: i32,
    pub mailbox: MailboxType<M>,
    /// Messages per cycle. Falls back to the scheduler default.
    pub max_throughput: Option<usize>,
}

impl<M> SpawnOptions<M> {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mailbox(mut self, mailbox: MailboxType<M>) -> Self {
        self.mailbox = mailbox;
        self
    }

    pub fn with_max_throughput(mut self, max_throughput: usize) -> Self {
        self.max_throughput = Some(max_throughput);
        self
    }
}

impl<M> Default for SpawnOptions<M> {
    fn default() -> Self {
        Self {
            name: None,
            priority: 0,
            mailbox: MailboxType::Unbounded,
            max_throughput: None,
        }
    }
}

/// Per-actor counters kept by the scheduler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActorMetrics {
    pub spawned_at: SystemTime,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub last_active_at: SystemTime,
    pub priority: i32,
}

impl ActorMetrics {
    fn new(priority: i32) -> Self {
        let now = SystemTime::now();
        Self {
            spawned_at: now,
            messages_received: 0,
            messages_processed: 0,
            last_active_at: now,
            priority,
        }
    }

    pub fn uptime(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.spawned_at)
            .unwrap_or_default()
    }

    /// Processed messages per second of uptime.
    pub fn message_rate(&self) -> f64 {
        let uptime = self.uptime().as_secs_f64();
        if uptime <= 0.0 {
            return 0.0;
        }
        self.messages_processed as f64 / uptime
    }
}

/// Snapshot of the scheduler counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub state: SchedulerState,
    pub policy: SchedulingPolicy,
    pub active_actors: usize,
    pub total_spawned: u64,
    pub total_stopped: u64,
    pub max_actors: usize,
    pub total_messages: u64,
    pub uptime: Duration,
}

/// Actor counts per priority class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityDistribution {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

struct Registered {
    handle: Arc<dyn ActorHandle>,
    metrics: ActorMetrics,
}

struct SchedulerInner {
    executor: Arc<ThreadPoolExecutor>,
    config: SchedulerConfig,
    state: RwLock<SchedulerState>,
    actors: RwLock<HashMap<String, Registered>>,
    total_spawned: AtomicU64,
    total_stopped: AtomicU64,
    total_messages: AtomicU64,
    started_at: RwLock<Option<Instant>>,
    timer: Arc<DelayedTaskTimer>,
}

impl SchedulerInner {
    fn update_actor_stats(&self, name: &str, received: u64, processed: u64) -> bool {
        let mut actors = self.actors.write();
        let Some(registered) = actors.get_mut(name) else {
            return false;
        };
        registered.metrics.messages_received += received;
        registered.metrics.messages_processed += processed;
        if processed > 0 {
            registered.metrics.last_active_at = SystemTime::now();
            self.total_messages.fetch_add(processed, Ordering::Relaxed);
        }
        true
    }
}

/// Registry and launcher of actors.
#[derive(Clone)]
pub struct ActorScheduler {
    inner: Arc<SchedulerInner>,
}

impl ActorScheduler {
    /// Creates an idle scheduler on top of `executor`.
    pub fn new(
        executor: Arc<ThreadPoolExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                executor,
                config,
                state: RwLock::new(SchedulerState::Idle),
                actors: RwLock::new(HashMap::new()),
                total_spawned: AtomicU64::new(0),
                total_stopped: AtomicU64::new(0),
                total_messages: AtomicU64::new(0),
                started_at: RwLock::new(None),
                timer: Arc::new(DelayedTaskTimer::new("scheduler")),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn executor(&self) -> &Arc<ThreadPoolExecutor> {
        &self.inner.executor
    }

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.read()
    }

    /// Only valid from `Idle`.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.write();
        if *state != SchedulerState::Idle {
            return Err(Error::InvalidState(format!(
                "scheduler cannot start from {:?}",
                *state
            )));
        }
        *state = SchedulerState::Running;
        *self.inner.started_at.write() = Some(Instant::now());
        debug!("Scheduler started.");
        Ok(())
    }

    /// Registers `actor`, starts it and schedules its first cycle.
    pub fn spawn<A: Actor>(
        &self,
        actor: A,
        options: SpawnOptions<A::Message>,
    ) -> Result<ActorRef<A>, Error> {
        if self.state() != SchedulerState::Running {
            return Err(Error::InvalidState(format!(
                "cannot spawn actor in state {:?}",
                self.state()
            )));
        }

        let SpawnOptions {
            name,
            priority,
            mailbox,
            max_throughput,
        } = options;

        let actor_ref = {
            let mut actors = self.inner.actors.write();
            let name = match name {
                Some(name) => name,
                None => {
                    // User-chosen names may already use the generated form.
                    let mut n = self.inner.total_spawned.load(Ordering::Relaxed) + 1;
                    while actors.contains_key(&format!("actor-{}", n)) {
                        n += 1;
                    }
                    format!("actor-{}", n)
                }
            };

            if let Some(existing) = actors.get(&name) {
                if !existing.handle.is_stopped() {
                    return Err(Error::Exists(name));
                }
                // The previous owner of the name stopped on its own.
                actors.remove(&name);
                self.inner.total_stopped.fetch_add(1, Ordering::Relaxed);
            }
            if actors.len() >= self.inner.config.max_actors {
                return Err(Error::Limit(self.inner.config.max_actors));
            }

            let actor_ref = ActorRef::with_mailbox(&name, actor, mailbox)?;
            actors.insert(
                name,
                Registered {
                    handle: Arc::new(actor_ref.clone()),
                    metrics: ActorMetrics::new(priority),
                },
            );
            self.inner.total_spawned.fetch_add(1, Ordering::Relaxed);
            actor_ref
        };

        if let Err(e) = actor_ref.start() {
            self.rollback(actor_ref.name());
            return Err(e);
        }

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let stats_name = actor_ref.name().to_owned();
        let dispatcher = match ActorDispatcher::attach(
            &actor_ref,
            self.inner.executor.clone(),
            Some(self.inner.timer.clone()),
            self.task_priority(priority),
            max_throughput.unwrap_or(self.inner.config.default_throughput),
            Some(Box::new(move |received, processed| {
                if let Some(inner) = weak.upgrade() {
                    inner.update_actor_stats(&stats_name, received, processed);
                }
            })),
        ) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                actor_ref.stop();
                self.rollback(actor_ref.name());
                return Err(e);
            }
        };

        if !dispatcher.try_schedule() {
            actor_ref.detach_dispatcher();
            actor_ref.stop();
            self.rollback(actor_ref.name());
            return Err(Error::Submit(actor_ref.name().to_owned()));
        }

        debug!("Actor {} spawned.", actor_ref.name());
        Ok(actor_ref)
    }

    fn rollback(&self, name: &str) {
        if self.inner.actors.write().remove(name).is_some() {
            self.inner.total_spawned.fetch_sub(1, Ordering::Relaxed);
        }
        warn!("Spawn of actor {} rolled back.", name);
    }

    fn task_priority(&self, priority: i32) -> TaskPriority {
        match self.inner.config.policy {
            SchedulingPolicy::Fair => TaskPriority::Normal,
            // The global queue is the only strictly FIFO executor queue.
            SchedulingPolicy::Fifo => TaskPriority::Low,
            SchedulingPolicy::Priority => match priority {
                p if p > 0 => TaskPriority::High,
                p if p < 0 => TaskPriority::Low,
                _ => TaskPriority::Normal,
            },
        }
    }

    /// Asks the actor to stop and removes it from the registry. Returns
    /// `false` for unknown names.
    ///
    /// Queued messages are still handled before the actor stops. If no
    /// cycle can carry the request out, the actor is stopped right away.
    pub fn stop_actor(&self, name: &str) -> bool {
        let Some(registered) = self.inner.actors.write().remove(name) else {
            return false;
        };
        Self::stop_handle(registered.handle.as_ref());
        self.inner.total_stopped.fetch_add(1, Ordering::Relaxed);
        debug!("Actor {} removed from the scheduler.", name);
        true
    }

    fn stop_handle(handle: &dyn ActorHandle) {
        if let Err(e) = handle.request_stop() {
            warn!(
                "Stop request for actor {} not delivered, stopping now: {}",
                handle.name(),
                e
            );
            handle.stop();
        }
    }

    /// Typed lookup.
    pub fn get_actor<A: Actor>(&self, name: &str) -> Option<ActorRef<A>> {
        let actors = self.inner.actors.read();
        actors
            .get(name)?
            .handle
            .as_any()
            .downcast_ref::<ActorRef<A>>()
            .cloned()
    }

    /// Type-erased lookup.
    pub fn get_actor_handle(&self, name: &str) -> Option<Arc<dyn ActorHandle>> {
        self.inner
            .actors
            .read()
            .get(name)
            .map(|registered| registered.handle.clone())
    }

    pub fn get_active_actors(&self) -> Vec<String> {
        self.inner.actors.read().keys().cloned().collect()
    }

    pub fn get_actor_count(&self) -> usize {
        self.inner.actors.read().len()
    }

    pub fn get_metrics(&self) -> SchedulerMetrics {
        let uptime = self
            .inner
            .started_at
            .read()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        SchedulerMetrics {
            state: self.state(),
            policy: self.inner.config.policy,
            active_actors: self.get_actor_count(),
            total_spawned: self.inner.total_spawned.load(Ordering::Relaxed),
            total_stopped: self.inner.total_stopped.load(Ordering::Relaxed),
            max_actors: self.inner.config.max_actors,
            total_messages: self.inner.total_messages.load(Ordering::Relaxed),
            uptime,
        }
    }

    pub fn get_actor_metrics(&self, name: &str) -> Option<ActorMetrics> {
        self.inner
            .actors
            .read()
            .get(name)
            .map(|registered| registered.metrics.clone())
    }

    pub fn get_all_actor_metrics(&self) -> HashMap<String, ActorMetrics> {
        self.inner
            .actors
            .read()
            .iter()
            .map(|(name, registered)| (name.clone(), registered.metrics.clone()))
            .collect()
    }

    /// Adds deltas to the counters of `name`. Returns `false` for unknown
    /// names.
    pub fn update_actor_stats(&self, name: &str, received: u64, processed: u64) -> bool {
        self.inner.update_actor_stats(name, received, processed)
    }

    /// Runs `callback` once `delay` has elapsed. See
    /// [`DelayedTaskTimer::schedule`].
    pub fn schedule_delayed<F>(
        &self,
        callback: F,
        delay: Duration,
        task_id: Option<String>,
    ) -> Result<String, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.timer.schedule(callback, delay, task_id)
    }

    pub fn cancel_scheduled_task(&self, task_id: &str) -> bool {
        self.inner.timer.cancel(task_id)
    }

    /// Stops every actor and the timer. No-op unless `Running`.
    ///
    /// Stop requests are sent until `timeout` runs out. With `wait`, the
    /// caller then sleeps up to 500 ms of the remaining budget so the
    /// actors can drain their mailboxes.
    pub fn shutdown(&self, wait: bool, timeout: Duration) {
        {
            let mut state = self.inner.state.write();
            if *state != SchedulerState::Running {
                return;
            }
            *state = SchedulerState::ShuttingDown;
        }
        debug!("Scheduler shutting down.");

        let started = Instant::now();
        let handles: Vec<_> = self
            .inner
            .actors
            .read()
            .values()
            .map(|registered| registered.handle.clone())
            .collect();
        for handle in handles {
            if started.elapsed() > timeout {
                warn!("Scheduler shutdown ran out of time.");
                break;
            }
            Self::stop_handle(handle.as_ref());
        }

        if wait {
            let remaining = timeout.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                thread::sleep(remaining.min(Duration::from_millis(500)));
            }
        }

        self.inner.timer.shutdown();
        *self.inner.state.write() = SchedulerState::Terminated;
        debug!("Scheduler terminated.");
    }
}

/// Scheduler with the `Priority` policy. Actor cycles run on the executor
/// queue matching the actor priority.
#[derive(Clone)]
pub struct PriorityActorScheduler {
    scheduler: ActorScheduler,
}

impl PriorityActorScheduler {
    pub fn new(
        executor: Arc<ThreadPoolExecutor>,
        config: SchedulerConfig,
    ) -> Result<Self, Error> {
        let config = SchedulerConfig {
            policy: SchedulingPolicy::Priority,
            ..config
        };
        Ok(Self {
            scheduler: ActorScheduler::new(executor, config)?,
        })
    }

    /// Live actors per priority class: high (> 0), normal (0), low (< 0).
    pub fn get_priority_distribution(&self) -> PriorityDistribution {
        let actors = self.scheduler.inner.actors.read();
        actors
            .values()
            .fold(PriorityDistribution::default(), |mut distribution, registered| {
                match registered.metrics.priority {
                    p if p > 0 => distribution.high += 1,
                    p if p < 0 => distribution.low += 1,
                    _ => distribution.normal += 1,
                }
                distribution
            })
    }
}

impl Deref for PriorityActorScheduler {
    type Target = ActorScheduler;

    fn deref(&self) -> &ActorScheduler {
        &self.scheduler
    }
}

/// Scheduler built by [`create_scheduler`].
#[derive(Clone)]
pub enum Scheduler {
    Standard(ActorScheduler),
    Priority(PriorityActorScheduler),
}

impl Scheduler {
    /// Priority view, when the scheduler uses the `Priority` policy.
    pub fn as_priority(&self) -> Option<&PriorityActorScheduler> {
        match self {
            Scheduler::Priority(scheduler) => Some(scheduler),
            Scheduler::Standard(_) => None,
        }
    }
}

impl Deref for Scheduler {
    type Target = ActorScheduler;

    fn deref(&self) -> &ActorScheduler {
        match self {
            Scheduler::Standard(scheduler) => scheduler,
            Scheduler::Priority(scheduler) => &scheduler.scheduler,
        }
    }
}

/// Builds and starts an executor and a scheduler on top of it.
pub fn create_scheduler(
    executor_config: ExecutorConfig,
    scheduler_config: SchedulerConfig,
) -> Result<(Scheduler, Arc<ThreadPoolExecutor>), Error> {
    let executor = Arc::new(ThreadPoolExecutor::new(executor_config)?);
    executor.start()?;

    let scheduler = match scheduler_config.policy {
        SchedulingPolicy::Priority => Scheduler::Priority(PriorityActorScheduler::new(
            executor.clone(),
            scheduler_config,
        )?),
        _ => Scheduler::Standard(ActorScheduler::new(executor.clone(), scheduler_config)?),
    };
    scheduler.start()?;
    Ok((scheduler, executor))
}
