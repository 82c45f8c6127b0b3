// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Message loop
//!
//! A [`MessageLoop`] pulls messages out of a [`Mailbox`] and hands them, one
//! at a time, to a [`MessageProcessor`]. The processor is locked for the
//! whole cycle, which is what guarantees that an actor never sees two
//! messages concurrently.
//!
//! A loop runs in one of two modes:
//!
//! - **threaded**: [`MessageLoop::start`] spawns a dedicated thread that
//!   runs cycles until [`MessageLoop::stop`];
//! - **dispatched**: [`MessageLoop::activate`] only flips the state, and an
//!   external driver (the scheduler's dispatcher) calls
//!   [`MessageLoop::run_cycle`] from executor threads.
//!

use crate::{
    Error,
    actor::{Actor, ActorRef, ActorState, Envelope},
    error::panic_message,
    mailbox::Mailbox,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Message loop state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
}

/// Message loop configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageLoopConfig {
    /// Maximum messages handled per cycle. `None` drains the mailbox.
    pub max_throughput: Option<usize>,
    /// Sleep of the dedicated thread when the mailbox is empty.
    pub idle_sleep: Duration,
}

impl Default for MessageLoopConfig {
    fn default() -> Self {
        Self {
            max_throughput: None,
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Snapshot of the loop counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoopMetrics {
    pub state: LoopState,
    pub messages_processed: u64,
    pub errors_count: u64,
    pub cycles_count: u64,
    pub average_processing_time: Duration,
}

/// Strategy that turns a dequeued message into work.
pub trait MessageProcessor<M>: Send {
    /// Handles one message.
    fn process_message(&mut self, message: M) -> Result<(), Error>;

    /// Called with the error returned by `process_message`.
    fn handle_error(&mut self, _error: &Error) -> Result<(), Error> {
        Ok(())
    }

    /// Called at the end of a cycle that left the mailbox empty.
    fn on_drained(&mut self) {}
}

/// Processor that feeds an actor's `receive`.
pub struct ActorMessageProcessor<A: Actor> {
    actor_ref: ActorRef<A>,
}

impl<A: Actor> ActorMessageProcessor<A> {
    pub fn new(actor_ref: ActorRef<A>) -> Self {
        Self { actor_ref }
    }
}

impl<A: Actor> MessageProcessor<Envelope<A::Message>> for ActorMessageProcessor<A> {
    fn process_message(&mut self, message: Envelope<A::Message>) -> Result<(), Error> {
        match message {
            Envelope::Stop => {
                self.actor_ref.stop();
                Ok(())
            }
            Envelope::Message(message) => {
                match self.actor_ref.state() {
                    ActorState::Stopping | ActorState::Stopped => {
                        debug!("Dead letter for actor {}.", self.actor_ref.name());
                        Ok(())
                    }
                    _ => self.actor_ref.handle(message),
                }
            }
        }
    }

    fn handle_error(&mut self, error: &Error) -> Result<(), Error> {
        error!("Actor {} failed: {}", self.actor_ref.name(), error);
        self.actor_ref.report_failure(error);
        Ok(())
    }

    // A stop requested while the mailbox was full never got its envelope
    // queued.
    fn on_drained(&mut self) {
        self.actor_ref.complete_pending_stop();
    }
}

struct LoopInner<M> {
    name: String,
    mailbox: Arc<dyn Mailbox<M>>,
    processor: Mutex<Box<dyn MessageProcessor<M>>>,
    config: MessageLoopConfig,
    state: RwLock<LoopState>,
    messages_processed: AtomicU64,
    errors_count: AtomicU64,
    cycles_count: AtomicU64,
    processing_nanos: AtomicU64,
}

impl<M> LoopInner<M> {
    fn state(&self) -> LoopState {
        *self.state.read()
    }

    fn run_cycle(&self) -> usize {
        if self.state() != LoopState::Running {
            return 0;
        }
        let mut processor = self.processor.lock();
        self.cycles_count.fetch_add(1, Ordering::Relaxed);

        let mut handled = 0;
        loop {
            if let Some(max) = self.config.max_throughput {
                if handled >= max {
                    break;
                }
            }
            if self.state() != LoopState::Running {
                break;
            }
            let Some(message) = self.mailbox.dequeue() else {
                break;
            };

            let started = Instant::now();
            let result =
                catch_unwind(AssertUnwindSafe(|| processor.process_message(message)));
            match result {
                Ok(Ok(())) => {
                    self.messages_processed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.errors_count.fetch_add(1, Ordering::Relaxed);
                    let handled_error =
                        catch_unwind(AssertUnwindSafe(|| processor.handle_error(&e)));
                    match handled_error {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            self.errors_count.fetch_add(1, Ordering::Relaxed);
                            error!("Error handler of loop {} failed: {}", self.name, e);
                        }
                        Err(payload) => {
                            self.errors_count.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "Error handler of loop {} panicked: {}",
                                self.name,
                                panic_message(payload.as_ref())
                            );
                        }
                    }
                }
                Err(payload) => {
                    self.errors_count.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Processor of loop {} panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    );
                }
            }
            let elapsed = started.elapsed().as_nanos() as u64;
            self.processing_nanos.fetch_add(elapsed, Ordering::Relaxed);
            handled += 1;
        }

        if self.mailbox.is_empty() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| processor.on_drained())) {
                self.errors_count.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Drain hook of loop {} panicked: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }
        handled
    }
}

/// Binds a mailbox to a processor.
pub struct MessageLoop<M: Send + 'static> {
    inner: Arc<LoopInner<M>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    token: Mutex<Option<CancellationToken>>,
}

impl<M: Send + 'static> MessageLoop<M> {
    /// Creates an idle loop.
    pub fn new<P>(
        name: &str,
        mailbox: Arc<dyn Mailbox<M>>,
        processor: P,
        config: MessageLoopConfig,
    ) -> Self
    where
        P: MessageProcessor<M> + 'static,
    {
        Self {
            inner: Arc::new(LoopInner {
                name: name.to_owned(),
                mailbox,
                processor: Mutex::new(Box::new(processor)),
                config,
                state: RwLock::new(LoopState::Idle),
                messages_processed: AtomicU64::new(0),
                errors_count: AtomicU64::new(0),
                cycles_count: AtomicU64::new(0),
                processing_nanos: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
            token: Mutex::new(None),
        }
    }

    /// Name of the loop.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        self.inner.state()
    }

    /// True while the loop is `Running`.
    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Loop configuration.
    pub fn config(&self) -> &MessageLoopConfig {
        &self.inner.config
    }

    fn begin(&self) -> Result<(), Error> {
        let mut state = self.inner.state.write();
        match *state {
            LoopState::Running => {
                Err(Error::InvalidState("already running".to_owned()))
            }
            LoopState::Paused => {
                Err(Error::InvalidState("paused, use resume".to_owned()))
            }
            _ => {
                *state = LoopState::Running;
                Ok(())
            }
        }
    }

    /// Starts the loop on a dedicated thread.
    pub fn start(&self) -> Result<(), Error> {
        self.begin()?;

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let cancelled = token.clone();
        let spawned = thread::Builder::new()
            .name(format!("strand-loop-{}", self.inner.name))
            .spawn(move || {
                debug!("Message loop {} started.", inner.name);
                while !cancelled.is_cancelled() {
                    match inner.state() {
                        LoopState::Running => {
                            if inner.run_cycle() == 0 {
                                thread::sleep(inner.config.idle_sleep);
                            }
                        }
                        LoopState::Paused => thread::sleep(inner.config.idle_sleep),
                        _ => break,
                    }
                }
                debug!("Message loop {} finished.", inner.name);
            });

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                *self.token.lock() = Some(token);
                Ok(())
            }
            Err(e) => {
                *self.inner.state.write() = LoopState::Idle;
                Err(Error::Start(e.to_string()))
            }
        }
    }

    /// Moves the loop to `Running` without a thread. Cycles are then driven
    /// by [`MessageLoop::run_cycle`].
    pub fn activate(&self) -> Result<(), Error> {
        self.begin()
    }

    /// Stops the loop, waiting at most `timeout` for its thread.
    ///
    /// A thread that misses the deadline is detached; it exits at its next
    /// state check.
    pub fn stop(&self, timeout: Option<Duration>) -> Result<(), Error> {
        {
            let mut state = self.inner.state.write();
            if !matches!(*state, LoopState::Running | LoopState::Paused) {
                return Err(Error::InvalidState("not running".to_owned()));
            }
            *state = LoopState::Stopping;
        }

        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("Message loop {} stopped from its own thread.", self.inner.name);
            } else {
                let deadline = timeout.map(|t| Instant::now() + t);
                while !handle.is_finished() {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                if handle.is_finished() {
                    if handle.join().is_err() {
                        error!("Message loop {} thread panicked.", self.inner.name);
                    }
                } else {
                    debug!(
                        "Message loop {} did not finish in time, detaching.",
                        self.inner.name
                    );
                }
            }
        }

        *self.inner.state.write() = LoopState::Stopped;
        debug!("Message loop {} stopped.", self.inner.name);
        Ok(())
    }

    /// Suspends processing. Only valid from `Running`.
    pub fn pause(&self) -> Result<(), Error> {
        let mut state = self.inner.state.write();
        if *state != LoopState::Running {
            return Err(Error::InvalidState("not running".to_owned()));
        }
        *state = LoopState::Paused;
        Ok(())
    }

    /// Resumes processing. Only valid from `Paused`.
    pub fn resume(&self) -> Result<(), Error> {
        let mut state = self.inner.state.write();
        if *state != LoopState::Paused {
            return Err(Error::InvalidState("not paused".to_owned()));
        }
        *state = LoopState::Running;
        Ok(())
    }

    /// Runs one cycle and returns how many messages were handled.
    pub fn run_cycle(&self) -> usize {
        self.inner.run_cycle()
    }

    /// True if the mailbox has messages waiting.
    pub fn has_pending(&self) -> bool {
        !self.inner.mailbox.is_empty()
    }

    pub fn messages_processed(&self) -> u64 {
        self.inner.messages_processed.load(Ordering::Relaxed)
    }

    pub fn errors_count(&self) -> u64 {
        self.inner.errors_count.load(Ordering::Relaxed)
    }

    pub fn cycles_count(&self) -> u64 {
        self.inner.cycles_count.load(Ordering::Relaxed)
    }

    /// Mean time per successfully processed message.
    pub fn average_processing_time(&self) -> Duration {
        let processed = self.messages_processed();
        if processed == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.inner.processing_nanos.load(Ordering::Relaxed) / processed)
    }

    pub fn metrics(&self) -> LoopMetrics {
        LoopMetrics {
            state: self.state(),
            messages_processed: self.messages_processed(),
            errors_count: self.errors_count(),
            cycles_count: self.cycles_count(),
            average_processing_time: self.average_processing_time(),
        }
    }
}

impl<M: Send + 'static> MessageLoop<Envelope<M>> {
    /// Wires the mailbox of `actor_ref` to an [`ActorMessageProcessor`].
    pub fn for_actor<A>(actor_ref: &ActorRef<A>, config: MessageLoopConfig) -> Self
    where
        A: Actor<Message = M>,
    {
        Self::new(
            actor_ref.name(),
            actor_ref.mailbox(),
            ActorMessageProcessor::new(actor_ref.clone()),
            config,
        )
    }
}

impl<M: Send + 'static> Drop for MessageLoop<M> {
    fn drop(&mut self) {
        if let Some(token) = self.token.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        actor::{ActorContext, spawn},
        mailbox::{MailboxType, UnboundedMailbox},
    };

    struct Collect {
        seen: Arc<Mutex<Vec<i32>>>,
    }

    impl MessageProcessor<i32> for Collect {
        fn process_message(&mut self, message: i32) -> Result<(), Error> {
            if message < 0 {
                return Err(Error::Functional(format!("negative {}", message)));
            }
            if message == 666 {
                panic!("cursed message");
            }
            self.seen.lock().push(message);
            Ok(())
        }

        fn handle_error(&mut self, error: &Error) -> Result<(), Error> {
            if *error == Error::Functional("negative -2".to_owned()) {
                return Err(Error::Functional("handler gave up".to_owned()));
            }
            Ok(())
        }
    }

    fn collecting_loop(
        max_throughput: Option<usize>,
    ) -> (MessageLoop<i32>, Arc<UnboundedMailbox<i32>>, Arc<Mutex<Vec<i32>>>) {
        let mailbox = Arc::new(UnboundedMailbox::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let message_loop = MessageLoop::new(
            "collect",
            mailbox.clone(),
            Collect { seen: seen.clone() },
            MessageLoopConfig {
                max_throughput,
                ..Default::default()
            },
        );
        (message_loop, mailbox, seen)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_state_machine() {
        let (message_loop, _, _) = collecting_loop(None);
        assert_eq!(message_loop.state(), LoopState::Idle);
        assert!(message_loop.stop(None).is_err());
        assert!(message_loop.pause().is_err());

        message_loop.start().unwrap();
        assert_eq!(
            message_loop.start(),
            Err(Error::InvalidState("already running".to_owned()))
        );
        assert!(message_loop.resume().is_err());

        message_loop.pause().unwrap();
        assert_eq!(
            message_loop.start(),
            Err(Error::InvalidState("paused, use resume".to_owned()))
        );
        message_loop.resume().unwrap();

        message_loop.stop(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(message_loop.state(), LoopState::Stopped);
        assert!(message_loop.stop(None).is_err());
    }

    #[test]
    fn test_threaded_processing() {
        let (message_loop, mailbox, seen) = collecting_loop(Some(4));
        for i in 0..20 {
            mailbox.enqueue(i);
        }
        message_loop.start().unwrap();
        assert!(wait_until(|| seen.lock().len() == 20));
        message_loop.stop(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(message_loop.messages_processed(), 20);
        assert!(message_loop.cycles_count() >= 5);
    }

    #[test]
    fn test_throughput_limit() {
        let (message_loop, mailbox, seen) = collecting_loop(Some(3));
        for i in 0..7 {
            mailbox.enqueue(i);
        }
        assert_eq!(message_loop.run_cycle(), 0);
        message_loop.activate().unwrap();
        assert_eq!(message_loop.run_cycle(), 3);
        assert_eq!(message_loop.run_cycle(), 3);
        assert_eq!(message_loop.run_cycle(), 1);
        assert_eq!(message_loop.run_cycle(), 0);
        assert_eq!(seen.lock().len(), 7);
        assert_eq!(message_loop.cycles_count(), 4);
    }

    #[test]
    fn test_errors_do_not_kill_the_loop() {
        let (message_loop, mailbox, seen) = collecting_loop(None);
        for message in [1, -1, 666, -2, 2] {
            mailbox.enqueue(message);
        }
        message_loop.activate().unwrap();
        assert_eq!(message_loop.run_cycle(), 5);

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(message_loop.messages_processed(), 2);
        // -1 once, the panic once, -2 plus its failing handler.
        assert_eq!(message_loop.errors_count(), 4);
        assert_eq!(message_loop.metrics().state, LoopState::Running);
    }

    #[test]
    fn test_paused_loop_holds_messages() {
        let (message_loop, mailbox, seen) = collecting_loop(None);
        message_loop.start().unwrap();
        message_loop.pause().unwrap();
        thread::sleep(Duration::from_millis(10));
        mailbox.enqueue(7);
        thread::sleep(Duration::from_millis(20));
        assert!(seen.lock().is_empty());

        message_loop.resume().unwrap();
        assert!(wait_until(|| seen.lock().len() == 1));
        message_loop.stop(Some(Duration::from_secs(1))).unwrap();
    }

    struct Greeter {
        greeted: Arc<Mutex<Vec<String>>>,
    }

    impl Actor for Greeter {
        type Message = String;

        fn receive(
            &mut self,
            message: String,
            ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            if message == "bye" {
                ctx.stop_self();
                return Ok(());
            }
            if message.is_empty() {
                return Err(Error::Functional("empty".to_owned()));
            }
            self.greeted.lock().push(message);
            Ok(())
        }
    }

    #[test]
    fn test_actor_loop() {
        let greeted = Arc::new(Mutex::new(Vec::new()));
        let actor_ref = spawn(
            Greeter {
                greeted: greeted.clone(),
            },
            Some("greeter"),
        )
        .unwrap();
        let failures = Arc::new(AtomicU64::new(0));
        let counter = failures.clone();
        actor_ref.set_failure_listener(Arc::new(move |_: &str, _: &Error| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let message_loop = MessageLoop::for_actor(&actor_ref, MessageLoopConfig::default());
        message_loop.activate().unwrap();
        for message in ["ana", "", "luis", "bye", "late"] {
            actor_ref.send(message.to_owned()).unwrap();
        }
        // The stop request lands behind "late", which is still handled.
        message_loop.run_cycle();
        assert_eq!(actor_ref.state(), ActorState::Stopped);

        assert_eq!(*greeted.lock(), vec!["ana", "luis", "late"]);
        assert_eq!(actor_ref.message_count(), 4);
        assert_eq!(actor_ref.error_count(), 1);
        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert!(actor_ref.send("after".to_owned()).is_err());
    }

    #[test]
    fn test_stop_deferred_by_full_mailbox() {
        let greeted = Arc::new(Mutex::new(Vec::new()));
        let actor_ref = ActorRef::with_mailbox(
            "crowded",
            Greeter {
                greeted: greeted.clone(),
            },
            MailboxType::Bounded(1),
        )
        .unwrap();
        actor_ref.start().unwrap();
        actor_ref.send("ana".to_owned()).unwrap();

        // No room for the stop envelope, the request is still recorded.
        assert_eq!(actor_ref.request_stop(), Ok(()));
        assert!(actor_ref.is_stop_requested());
        assert_eq!(actor_ref.mailbox_size(), 1);
        assert_eq!(actor_ref.state(), ActorState::Running);
        assert_eq!(
            actor_ref.send("luis".to_owned()),
            Err(Error::ActorStopped("crowded".to_owned()))
        );

        let message_loop = MessageLoop::for_actor(&actor_ref, MessageLoopConfig::default());
        message_loop.activate().unwrap();
        message_loop.run_cycle();
        assert_eq!(*greeted.lock(), vec!["ana"]);
        assert!(actor_ref.is_stopped());
        assert_eq!(message_loop.messages_processed(), 1);
    }
}
