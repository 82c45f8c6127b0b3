// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Supervision
//!
//! A [`SupervisorActor`] owns a set of children and reacts to their
//! failures. When a child's `receive` returns an error, the message loop
//! reports it to the supervisor, which records it and asks its
//! [`SupervisionStrategy`] what to do:
//!
//! - [`OneForOneStrategy`] only touches the failed child.
//! - [`OneForAllStrategy`] applies the directive to every child.
//! - [`RestForOneStrategy`] applies it to the failed child and to every
//!   child spawned after it.
//!
//! Restarts are never immediate. The delay comes from the strategy's
//! [`RestartPolicy`] and the restart itself runs on the supervisor's timer
//! thread, so a failing child does not block its supervisor. A child that
//! keeps failing inside the policy window is escalated to the parent
//! supervisor, or stopped when there is none.
//!
//! Delays are produced by [`RetryStrategy`] implementations, the same
//! abstraction used for retry intervals elsewhere in the crate.
//!

use crate::{
    Error,
    actor::{Actor, ActorContext, ActorHandle, ActorRef},
    dispatch::ActorDispatcher,
    executor::{TaskPriority, ThreadPoolExecutor},
    mailbox::MailboxType,
    timer::DelayedTaskTimer,
};

use backoff::{ExponentialBackoffBuilder, backoff::Backoff as InnerBackoff};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Weak},
    time::{Duration, Instant, SystemTime},
};

/// Messages per cycle of supervised children.
const CHILD_THROUGHPUT: usize = 32;

/// Source of successive retry delays.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Maximum number of retries.
    fn max_retries(&self) -> usize;
    /// Delay before the next retry, `None` to retry immediately.
    fn next_backoff(&mut self) -> Option<Duration>;
}

/// Retries without waiting.
#[derive(Debug, Default)]
pub struct NoIntervalStrategy {
    max_retries: usize,
}

impl NoIntervalStrategy {
    pub fn new(max_retries: usize) -> Self {
        NoIntervalStrategy { max_retries }
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// Same delay for every retry.
#[derive(Debug, Default)]
pub struct FixedIntervalStrategy {
    max_retries: usize,
    duration: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: usize, duration: Duration) -> Self {
        FixedIntervalStrategy {
            max_retries,
            duration,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// `initial`, `2 * initial`, `3 * initial`... capped at `max`.
#[derive(Debug, Default)]
pub struct LinearIntervalStrategy {
    max_retries: usize,
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl LinearIntervalStrategy {
    pub fn new(max_retries: usize, initial: Duration, max: Duration) -> Self {
        LinearIntervalStrategy {
            max_retries,
            initial,
            max,
            attempt: 0,
        }
    }
}

impl RetryStrategy for LinearIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        Some(self.initial.saturating_mul(self.attempt).min(self.max))
    }
}

/// Doubling delays, capped at `max`. No jitter.
#[derive(Debug)]
pub struct ExponentialBackoffStrategy {
    max_retries: usize,
    inner: backoff::ExponentialBackoff,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: usize, initial: Duration, max: Duration) -> Self {
        ExponentialBackoffStrategy {
            max_retries,
            inner: ExponentialBackoffBuilder::new()
                .with_initial_interval(initial)
                .with_randomization_factor(0.0)
                .with_multiplier(2.0)
                .with_max_interval(max)
                .with_max_elapsed_time(None)
                .build(),
        }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.inner.next_backoff()
    }
}

/// What a supervisor does with a failed child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorDirective {
    /// Keep the child as it is.
    Resume,
    /// Restart the child after the policy delay.
    Restart,
    /// Stop the child for good.
    Stop,
    /// Hand the failure to the parent supervisor.
    Escalate,
}

/// Shape of the restart delay curve.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Limits and delays applied to restarts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restarts allowed inside `within_time_window`.
    pub max_retries: usize,
    pub within_time_window: Duration,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            within_time_window: Duration::from_secs(60),
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Retry strategy producing this policy's delays, first retry first.
    pub fn retry_strategy(&self) -> Box<dyn RetryStrategy> {
        if self.initial_delay.is_zero() {
            return Box::new(NoIntervalStrategy::new(self.max_retries));
        }
        match self.backoff_strategy {
            BackoffStrategy::Constant => Box::new(FixedIntervalStrategy::new(
                self.max_retries,
                self.initial_delay.min(self.max_delay),
            )),
            BackoffStrategy::Linear => Box::new(LinearIntervalStrategy::new(
                self.max_retries,
                self.initial_delay,
                self.max_delay,
            )),
            BackoffStrategy::Exponential => Box::new(ExponentialBackoffStrategy::new(
                self.max_retries,
                self.initial_delay,
                self.max_delay,
            )),
        }
    }

    /// Delay before restart number `retry_count` (zero based), capped at
    /// `max_delay`.
    pub fn calculate_delay(&self, retry_count: u32) -> Duration {
        let mut strategy = self.retry_strategy();
        let mut delay = Duration::ZERO;
        for _ in 0..=retry_count {
            delay = strategy.next_backoff().unwrap_or_default();
            if delay >= self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }

    /// True while the restarts recorded inside the window stay below
    /// `max_retries`.
    pub fn should_restart(&self, stats: &RestartStats) -> bool {
        stats.failures_in_window(self.within_time_window) < self.max_retries
    }
}

/// Failure and restart history of one child.
#[derive(Clone, Debug, Default)]
pub struct RestartStats {
    pub failure_count: u32,
    pub last_failure_time: Option<SystemTime>,
    pub restart_times: Vec<Instant>,
    pub total_restarts: u64,
}

impl RestartStats {
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(SystemTime::now());
    }

    pub fn record_restart(&mut self) {
        self.restart_times.push(Instant::now());
        self.total_restarts += 1;
    }

    pub fn reset_failure_count(&mut self) {
        self.failure_count = 0;
    }

    /// Restarts recorded during the last `window`.
    pub fn failures_in_window(&self, window: Duration) -> usize {
        self.restart_times
            .iter()
            .filter(|restart| restart.elapsed() < window)
            .count()
    }
}

/// Decides how a supervisor reacts to a child failure.
pub trait SupervisionStrategy: Send + Sync {
    /// Strategy name, for logs.
    fn name(&self) -> &'static str;

    fn restart_policy(&self) -> &RestartPolicy;

    /// Children affected by a directive about `failed`.
    fn scope(&self, supervisor: &SupervisorActor, failed: &str) -> Vec<String>;

    /// Restart while the policy allows it, escalate afterwards.
    fn decide_directive(
        &self,
        stats: &RestartStats,
        child: &str,
        _error: &Error,
    ) -> SupervisorDirective {
        if self.restart_policy().should_restart(stats) {
            SupervisorDirective::Restart
        } else {
            warn!("Child {} exceeded its restart limit, escalating.", child);
            SupervisorDirective::Escalate
        }
    }

    /// Applies the directive to the strategy scope.
    fn handle_failure(&self, supervisor: &SupervisorActor, child: &str, error: &Error) {
        info!("{}: child {} failed with {}.", self.name(), child, error);
        let stats = supervisor.get_restart_stats(child).unwrap_or_default();
        match self.decide_directive(&stats, child, error) {
            SupervisorDirective::Resume => {
                info!("Resuming child {}.", child);
            }
            SupervisorDirective::Restart => {
                for name in self.scope(supervisor, child) {
                    supervisor.restart_child(&name);
                }
            }
            SupervisorDirective::Stop => {
                for name in self.scope(supervisor, child) {
                    supervisor.stop_child(&name);
                }
            }
            SupervisorDirective::Escalate => supervisor.escalate_failure(child, error),
        }
    }
}

/// Only the failed child is affected.
#[derive(Debug, Default)]
pub struct OneForOneStrategy {
    policy: RestartPolicy,
}

impl OneForOneStrategy {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }
}

impl SupervisionStrategy for OneForOneStrategy {
    fn name(&self) -> &'static str {
        "OneForOne"
    }

    fn restart_policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn scope(&self, _supervisor: &SupervisorActor, failed: &str) -> Vec<String> {
        vec![failed.to_owned()]
    }
}

/// Every child is affected.
#[derive(Debug, Default)]
pub struct OneForAllStrategy {
    policy: RestartPolicy,
}

impl OneForAllStrategy {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }
}

impl SupervisionStrategy for OneForAllStrategy {
    fn name(&self) -> &'static str {
        "OneForAll"
    }

    fn restart_policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn scope(&self, supervisor: &SupervisorActor, _failed: &str) -> Vec<String> {
        supervisor.get_all_children()
    }
}

/// The failed child and the children spawned after it are affected.
#[derive(Debug, Default)]
pub struct RestForOneStrategy {
    policy: RestartPolicy,
}

impl RestForOneStrategy {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }
}

impl SupervisionStrategy for RestForOneStrategy {
    fn name(&self) -> &'static str {
        "RestForOne"
    }

    fn restart_policy(&self) -> &RestartPolicy {
        &self.policy
    }

    fn scope(&self, supervisor: &SupervisorActor, failed: &str) -> Vec<String> {
        let mut scope = vec![failed.to_owned()];
        scope.extend(supervisor.get_children_after(failed));
        scope
    }
}

/// Messages understood by a supervisor running as an actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorMessage {
    ChildFailed { child: String, error: Error },
    RestartChild(String),
    StopChild(String),
}

#[derive(Default)]
struct Children {
    order: Vec<String>,
    handles: HashMap<String, Arc<dyn ActorHandle>>,
    stats: HashMap<String, RestartStats>,
}

struct SupervisorInner {
    name: String,
    strategy: Box<dyn SupervisionStrategy>,
    parent: Option<Weak<SupervisorInner>>,
    executor: RwLock<Option<Arc<ThreadPoolExecutor>>>,
    children: RwLock<Children>,
    pending_restarts: Mutex<HashMap<String, String>>,
    timer: Arc<DelayedTaskTimer>,
}

/// Supervisor of a group of child actors.
///
/// Cloning is cheap; every clone manages the same children. A supervisor is
/// itself an [`Actor`], so it can be spawned as the child of another
/// supervisor to build a tree.
#[derive(Clone)]
pub struct SupervisorActor {
    inner: Arc<SupervisorInner>,
}

impl SupervisorActor {
    pub fn new<S>(name: &str, strategy: S) -> Self
    where
        S: SupervisionStrategy + 'static,
    {
        Self::build(name, Box::new(strategy), None, None)
    }

    /// Supervisor that escalates to `parent`.
    pub fn with_parent<S>(name: &str, strategy: S, parent: &SupervisorActor) -> Self
    where
        S: SupervisionStrategy + 'static,
    {
        Self::build(
            name,
            Box::new(strategy),
            Some(Arc::downgrade(&parent.inner)),
            parent.inner.executor.read().clone(),
        )
    }

    /// Children spawned from now on are driven by `executor`.
    pub fn with_executor(self, executor: Arc<ThreadPoolExecutor>) -> Self {
        *self.inner.executor.write() = Some(executor);
        self
    }

    fn build(
        name: &str,
        strategy: Box<dyn SupervisionStrategy>,
        parent: Option<Weak<SupervisorInner>>,
        executor: Option<Arc<ThreadPoolExecutor>>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                name: name.to_owned(),
                strategy,
                parent,
                executor: RwLock::new(executor),
                children: RwLock::new(Children::default()),
                pending_restarts: Mutex::new(HashMap::new()),
                timer: Arc::new(DelayedTaskTimer::new(name)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn strategy(&self) -> &dyn SupervisionStrategy {
        self.inner.strategy.as_ref()
    }

    /// Spawns a supervised child with an unbounded mailbox.
    pub fn spawn_child<A: Actor>(&self, actor: A, name: &str) -> Result<ActorRef<A>, Error> {
        self.spawn_child_with_mailbox(actor, name, MailboxType::Unbounded)
    }

    /// Spawns a supervised child.
    ///
    /// The child is started and registered in spawn order. When the
    /// supervisor has an executor the child's mailbox is processed there;
    /// otherwise the caller drives it, for instance with a
    /// [`MessageLoop`](crate::MessageLoop).
    pub fn spawn_child_with_mailbox<A: Actor>(
        &self,
        actor: A,
        name: &str,
        mailbox: MailboxType<A::Message>,
    ) -> Result<ActorRef<A>, Error> {
        let child = {
            let mut children = self.inner.children.write();
            if children.handles.contains_key(name) {
                return Err(Error::Exists(name.to_owned()));
            }
            let child = ActorRef::with_mailbox(name, actor, mailbox)?;
            children.order.push(name.to_owned());
            children
                .handles
                .insert(name.to_owned(), Arc::new(child.clone()));
            children.stats.insert(name.to_owned(), RestartStats::default());
            child
        };

        let supervisor = Arc::downgrade(&self.inner);
        child.set_failure_listener(Arc::new(move |child: &str, error: &Error| {
            if let Some(inner) = supervisor.upgrade() {
                SupervisorActor { inner }.handle_child_failure(child, error);
            }
        }));

        if let Err(e) = child.start() {
            self.forget_child(name);
            return Err(e);
        }

        let executor = self.inner.executor.read().clone();
        if let Some(executor) = executor {
            let dispatched = ActorDispatcher::attach(
                &child,
                executor,
                Some(self.inner.timer.clone()),
                TaskPriority::Normal,
                CHILD_THROUGHPUT,
                None,
            )
            .map(|dispatcher| dispatcher.try_schedule());
            if !matches!(dispatched, Ok(true)) {
                child.detach_dispatcher();
                child.stop();
                self.forget_child(name);
                return Err(Error::Submit(name.to_owned()));
            }
        }

        debug!("Supervisor {} spawned child {}.", self.inner.name, name);
        Ok(child)
    }

    fn forget_child(&self, name: &str) -> Option<Arc<dyn ActorHandle>> {
        let mut children = self.inner.children.write();
        children.order.retain(|child| child != name);
        children.stats.remove(name);
        children.handles.remove(name)
    }

    /// Stops a child and forgets it. Returns `false` for unknown names.
    pub fn stop_child(&self, name: &str) -> bool {
        self.cancel_pending_restarts(name);
        match self.forget_child(name) {
            Some(handle) => {
                handle.stop();
                debug!("Supervisor {} stopped child {}.", self.inner.name, name);
                true
            }
            None => false,
        }
    }

    /// Names of the children, in spawn order.
    pub fn get_all_children(&self) -> Vec<String> {
        self.inner.children.read().order.clone()
    }

    /// Children spawned after `name`, in spawn order.
    pub fn get_children_after(&self, name: &str) -> Vec<String> {
        let children = self.inner.children.read();
        children
            .order
            .iter()
            .skip_while(|child| child.as_str() != name)
            .skip(1)
            .cloned()
            .collect()
    }

    pub fn get_child<A: Actor>(&self, name: &str) -> Option<ActorRef<A>> {
        let children = self.inner.children.read();
        children
            .handles
            .get(name)?
            .as_any()
            .downcast_ref::<ActorRef<A>>()
            .cloned()
    }

    pub fn get_child_handle(&self, name: &str) -> Option<Arc<dyn ActorHandle>> {
        self.inner.children.read().handles.get(name).cloned()
    }

    pub fn get_restart_stats(&self, name: &str) -> Option<RestartStats> {
        self.inner.children.read().stats.get(name).cloned()
    }

    /// Records a failure of `name` and applies the strategy.
    pub fn handle_child_failure(&self, name: &str, error: &Error) {
        {
            let mut children = self.inner.children.write();
            let Some(stats) = children.stats.get_mut(name) else {
                warn!(
                    "Supervisor {} got a failure for unknown child {}.",
                    self.inner.name, name
                );
                return;
            };
            stats.record_failure();
        }
        error!(
            "Child {} of supervisor {} failed: {}",
            name, self.inner.name, error
        );
        self.inner.strategy.handle_failure(self, name, error);
    }

    /// Schedules a restart of `name` after the policy delay. A pending
    /// restart of the same child is replaced.
    pub fn restart_child(&self, name: &str) -> bool {
        let Some((handle, failure_count)) = ({
            let children = self.inner.children.read();
            children.handles.get(name).map(|handle| {
                let failures = children
                    .stats
                    .get(name)
                    .map_or(0, |stats| stats.failure_count);
                (handle.clone(), failures)
            })
        }) else {
            warn!(
                "Supervisor {} cannot restart unknown child {}.",
                self.inner.name, name
            );
            return false;
        };

        let policy = self.inner.strategy.restart_policy();
        let delay = policy.calculate_delay(failure_count);
        info!(
            "Restarting child {} in {:?} (attempt {}/{}).",
            name, delay, failure_count, policy.max_retries
        );

        let mut pending = self.inner.pending_restarts.lock();
        if let Some(previous) = pending.remove(name) {
            self.inner.timer.cancel(&previous);
        }

        let supervisor = Arc::downgrade(&self.inner);
        let child = name.to_owned();
        let scheduled = self.inner.timer.schedule(
            move || {
                if let Some(inner) = supervisor.upgrade() {
                    SupervisorActor { inner }.complete_restart(&child, handle.as_ref());
                }
            },
            delay,
            None,
        );
        match scheduled {
            Ok(task_id) => {
                pending.insert(name.to_owned(), task_id);
                true
            }
            Err(e) => {
                error!("Restart of child {} not scheduled: {}", name, e);
                false
            }
        }
    }

    fn complete_restart(&self, name: &str, handle: &dyn ActorHandle) {
        self.inner.pending_restarts.lock().remove(name);
        match handle.restart(None) {
            Ok(()) => {
                if let Some(stats) = self.inner.children.write().stats.get_mut(name) {
                    stats.record_restart();
                }
                info!("Child {} restarted.", name);
            }
            Err(e) => error!("Child {} could not be restarted: {}", name, e),
        }
    }

    /// Cancels the pending restart of `name`. Returns how many were
    /// cancelled.
    pub fn cancel_pending_restarts(&self, name: &str) -> usize {
        match self.inner.pending_restarts.lock().remove(name) {
            Some(task_id) => usize::from(self.inner.timer.cancel(&task_id)),
            None => 0,
        }
    }

    /// Hands the failure to the parent supervisor, or stops the child when
    /// there is no parent.
    pub fn escalate_failure(&self, name: &str, error: &Error) {
        let parent = self
            .inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| SupervisorActor { inner });
        match parent {
            Some(parent) => {
                warn!(
                    "Escalating failure of child {} to supervisor {}.",
                    name,
                    parent.name()
                );
                parent.handle_child_failure(&self.inner.name, error);
            }
            None => {
                error!(
                    "Supervisor {} has no parent, stopping child {}.",
                    self.inner.name, name
                );
                self.stop_child(name);
            }
        }
    }
}

impl Actor for SupervisorActor {
    type Message = SupervisorMessage;

    fn receive(
        &mut self,
        message: SupervisorMessage,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        debug!("Supervisor {} received {:?}.", self.inner.name, message);
        match message {
            SupervisorMessage::ChildFailed { child, error } => {
                self.handle_child_failure(&child, &error)
            }
            SupervisorMessage::RestartChild(child) => {
                if !self.restart_child(&child) {
                    return Err(Error::NotFound(child));
                }
            }
            SupervisorMessage::StopChild(child) => {
                if !self.stop_child(&child) {
                    return Err(Error::NotFound(child));
                }
            }
        }
        Ok(())
    }

    fn pre_restart(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        _error: Option<&Error>,
    ) -> Result<(), Error> {
        for child in self.get_all_children() {
            self.stop_child(&child);
        }
        Ok(())
    }

    fn post_restart(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        _error: Option<&Error>,
    ) -> Result<(), Error> {
        info!("Supervisor {} restarted.", self.inner.name);
        Ok(())
    }

    fn post_stop(&mut self, _ctx: &mut ActorContext<Self>) -> Result<(), Error> {
        for child in self.get_all_children() {
            self.stop_child(&child);
        }
        Ok(())
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        self.timer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_interval_strategy() {
        let mut strategy = NoIntervalStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_fixed_interval_strategy() {
        let mut strategy = FixedIntervalStrategy::new(3, Duration::from_secs(1));
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_linear_interval_strategy() {
        let mut strategy =
            LinearIntervalStrategy::new(3, Duration::from_secs(1), Duration::from_secs(3));
        let delays: Vec<_> = (0..4).filter_map(|_| strategy.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(3)
            ]
        );
    }

    #[test]
    fn test_exponential_backoff_strategy() {
        let mut strategy = ExponentialBackoffStrategy::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert_eq!(strategy.max_retries(), 3);
        let delays: Vec<_> = (0..4).filter_map(|_| strategy.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500)
            ]
        );
    }

    #[test]
    fn test_calculate_delay() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(2));
        assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(30));

        let policy = RestartPolicy {
            backoff_strategy: BackoffStrategy::Linear,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(2), Duration::from_secs(3));
        assert_eq!(policy.calculate_delay(100), Duration::from_secs(30));

        let policy = RestartPolicy {
            backoff_strategy: BackoffStrategy::Constant,
            initial_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(30));

        let policy = RestartPolicy {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(4), Duration::ZERO);
    }

    #[test]
    fn test_should_restart_window() {
        let policy = RestartPolicy {
            max_retries: 2,
            within_time_window: Duration::from_millis(50),
            ..Default::default()
        };
        let mut stats = RestartStats::default();
        assert!(policy.should_restart(&stats));
        stats.record_restart();
        assert!(policy.should_restart(&stats));
        stats.record_restart();
        assert!(!policy.should_restart(&stats));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(stats.failures_in_window(Duration::from_millis(50)), 0);
        assert!(policy.should_restart(&stats));
        assert_eq!(stats.total_restarts, 2);
    }

    #[test]
    fn test_restart_stats() {
        let mut stats = RestartStats::default();
        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.failure_count, 2);
        assert!(stats.last_failure_time.is_some());
        stats.reset_failure_count();
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn test_default_directive() {
        let strategy = OneForOneStrategy::new(RestartPolicy {
            max_retries: 1,
            ..Default::default()
        });
        let error = Error::Functional("boom".to_owned());
        let mut stats = RestartStats::default();
        assert_eq!(
            strategy.decide_directive(&stats, "child", &error),
            SupervisorDirective::Restart
        );
        stats.record_restart();
        assert_eq!(
            strategy.decide_directive(&stats, "child", &error),
            SupervisorDirective::Escalate
        );
    }
}
