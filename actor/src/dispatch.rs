// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Dispatcher
//!
//! Drives an actor's [`MessageLoop`] from executor threads. A send marks the
//! dispatcher as scheduled and submits one cycle; the cycle handles at most
//! `max_throughput` messages and resubmits itself while mail is waiting.
//! The `scheduled` flag keeps at most one cycle of a given actor in the
//! executor at any time. A cycle the executor refuses because its queue is
//! full is submitted again from the retry timer.
//!

use crate::{
    Error,
    actor::{Actor, ActorRef, Dispatch, Envelope},
    executor::{TaskPriority, ThreadPoolExecutor},
    mailbox::Mailbox,
    message_loop::{MessageLoop, MessageLoopConfig},
    timer::DelayedTaskTimer,
};

use tracing::{debug, warn};

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

/// Delay before a refused cycle is offered to the executor again.
const RESUBMIT_DELAY: Duration = Duration::from_millis(1);

/// Called after every cycle with `(received, processed)` deltas.
pub(crate) type CycleListener = Box<dyn Fn(u64, u64) + Send + Sync>;

pub(crate) struct ActorDispatcher<A: Actor> {
    name: String,
    task_name: String,
    actor_ref: ActorRef<A>,
    message_loop: MessageLoop<Envelope<A::Message>>,
    mailbox: Arc<dyn Mailbox<Envelope<A::Message>>>,
    executor: Arc<ThreadPoolExecutor>,
    retry_timer: Option<Arc<DelayedTaskTimer>>,
    priority: TaskPriority,
    scheduled: AtomicBool,
    seen_messages: AtomicU64,
    on_cycle: Option<CycleListener>,
    myself: Weak<ActorDispatcher<A>>,
}

impl<A: Actor> ActorDispatcher<A> {
    /// Builds a dispatcher for `actor_ref` and attaches it to the actor.
    ///
    /// Without a `retry_timer` a cycle refused by the executor is dropped
    /// and its mail waits for the next send.
    pub(crate) fn attach(
        actor_ref: &ActorRef<A>,
        executor: Arc<ThreadPoolExecutor>,
        retry_timer: Option<Arc<DelayedTaskTimer>>,
        priority: TaskPriority,
        max_throughput: usize,
        on_cycle: Option<CycleListener>,
    ) -> Result<Arc<Self>, Error> {
        let message_loop = MessageLoop::for_actor(
            actor_ref,
            MessageLoopConfig {
                max_throughput: Some(max_throughput),
                ..Default::default()
            },
        );
        message_loop.activate()?;

        let dispatcher = Arc::new_cyclic(|myself| Self {
            name: actor_ref.name().to_owned(),
            task_name: format!("MessageLoop-{}", actor_ref.name()),
            actor_ref: actor_ref.clone(),
            message_loop,
            mailbox: actor_ref.mailbox(),
            executor,
            retry_timer,
            priority,
            scheduled: AtomicBool::new(false),
            seen_messages: AtomicU64::new(0),
            on_cycle,
            myself: myself.clone(),
        });
        actor_ref.attach_dispatcher(dispatcher.clone());
        Ok(dispatcher)
    }

    /// Submits a cycle unless one is already queued. Returns `false` when
    /// no cycle will run: the executor is gone or its queue is full with
    /// no timer to retry on.
    pub(crate) fn try_schedule(&self) -> bool {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.submit_cycle()
    }

    /// Hands the cycle claimed through `scheduled` to the executor.
    /// `scheduled` stays set while a retry is armed.
    fn submit_cycle(&self) -> bool {
        let Some(this) = self.myself.upgrade() else {
            self.scheduled.store(false, Ordering::Release);
            return false;
        };
        if self.executor.submit_with_priority(
            move || this.run_cycle(),
            Some(&self.task_name),
            self.priority,
        ) {
            return true;
        }
        if self.arm_retry() {
            return true;
        }
        self.scheduled.store(false, Ordering::Release);
        warn!("Cycle of actor {} was not accepted by the executor.", self.name);
        false
    }

    fn arm_retry(&self) -> bool {
        if !self.executor.is_running() {
            return false;
        }
        let (Some(timer), Some(this)) = (&self.retry_timer, self.myself.upgrade()) else {
            return false;
        };
        match timer.schedule(
            move || {
                this.submit_cycle();
            },
            RESUBMIT_DELAY,
            None,
        ) {
            Ok(_) => {
                debug!("Executor queue full, cycle of actor {} deferred.", self.name);
                true
            }
            Err(e) => {
                debug!("Cycle of actor {} cannot be deferred: {}", self.name, e);
                false
            }
        }
    }

    fn run_cycle(&self) {
        // Only user messages count, stop envelopes are bookkeeping.
        let processed_before = self.actor_ref.message_count();
        self.message_loop.run_cycle();
        let processed = self.actor_ref.message_count() - processed_before;

        if let Some(on_cycle) = &self.on_cycle {
            let accepted = self.mailbox.message_count();
            let received = accepted - self.seen_messages.swap(accepted, Ordering::AcqRel);
            on_cycle(received, processed);
        }

        self.scheduled.store(false, Ordering::Release);
        if self.message_loop.has_pending() {
            self.try_schedule();
        }
    }
}

impl<A: Actor> Dispatch for ActorDispatcher<A> {
    fn schedule(&self) -> bool {
        self.try_schedule()
    }
}

impl<A: Actor> Drop for ActorDispatcher<A> {
    fn drop(&mut self) {
        debug!("Dispatcher of actor {} released.", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        actor::ActorContext,
        executor::ExecutorConfig,
        mailbox::MailboxType,
    };

    use parking_lot::Mutex;

    use std::{
        thread,
        time::{Duration, Instant},
    };

    struct Slow {
        in_flight: Arc<AtomicU64>,
        overlaps: Arc<AtomicU64>,
        order: Arc<Mutex<Vec<u32>>>,
    }

    impl Actor for Slow {
        type Message = u32;

        fn receive(&mut self, message: u32, _: &mut ActorContext<Self>) -> Result<(), Error> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            self.order.lock().push(message);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_one_cycle_in_flight() {
        let executor = Arc::new(
            ThreadPoolExecutor::new(ExecutorConfig {
                min_threads: 4,
                max_threads: 4,
                ..Default::default()
            })
            .unwrap(),
        );
        executor.start().unwrap();

        let overlaps = Arc::new(AtomicU64::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let actor_ref = ActorRef::with_mailbox(
            "slow",
            Slow {
                in_flight: Arc::new(AtomicU64::new(0)),
                overlaps: overlaps.clone(),
                order: order.clone(),
            },
            MailboxType::Unbounded,
        )
        .unwrap();
        actor_ref.start().unwrap();

        let processed = Arc::new(AtomicU64::new(0));
        let counter = processed.clone();
        ActorDispatcher::attach(
            &actor_ref,
            executor.clone(),
            None,
            TaskPriority::Normal,
            3,
            Some(Box::new(move |_, handled| {
                counter.fetch_add(handled, Ordering::SeqCst);
            })),
        )
        .unwrap();

        for i in 0..50 {
            actor_ref.send(i).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while processed.load(Ordering::SeqCst) < 50 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(processed.load(Ordering::SeqCst), 50);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());

        actor_ref.stop();
        executor.shutdown(true, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_send_without_executor_fails() {
        let executor = Arc::new(ThreadPoolExecutor::new(ExecutorConfig::default()).unwrap());
        executor.start().unwrap();
        executor.shutdown(true, Some(Duration::from_secs(1)));

        let actor_ref = ActorRef::with_mailbox(
            "stranded",
            Slow {
                in_flight: Arc::new(AtomicU64::new(0)),
                overlaps: Arc::new(AtomicU64::new(0)),
                order: Arc::new(Mutex::new(Vec::new())),
            },
            MailboxType::Unbounded,
        )
        .unwrap();
        actor_ref.start().unwrap();
        let timer = Arc::new(DelayedTaskTimer::new("retry"));
        ActorDispatcher::attach(
            &actor_ref,
            executor,
            Some(timer.clone()),
            TaskPriority::Low,
            1,
            None,
        )
        .unwrap();

        assert_eq!(actor_ref.send(1), Err(Error::Submit("stranded".to_owned())));
        assert_eq!(actor_ref.mailbox_size(), 1);
        assert_eq!(timer.pending_count(), 0);

        actor_ref.stop();
        timer.shutdown();
    }
}
