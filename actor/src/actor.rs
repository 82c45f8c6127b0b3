// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actors
//!
//! This module defines the [`Actor`] trait, the [`ActorRef`] handle used to
//! talk to an actor, and the [`ActorContext`] that gives an actor access to
//! its own reference.
//!
//! # Execution model
//!
//! An actor owns its state exclusively. The state is only touched from the
//! thread currently running the actor's message loop, and at most one call to
//! [`Actor::receive`] is in flight for a given actor at any instant. The
//! sequential-processing guarantee is what lets actor code mutate `self`
//! without any locking of its own.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --start--> Starting --pre_start--> Running
//! Running --restart--> Restarting --pre_restart/post_restart--> Running
//! Running --stop--> Stopping --post_stop--> Stopped
//! ```
//!
//! Hooks are never called by the actor itself. They are invoked by the
//! infrastructure at the transitions shown above: the scheduler or
//! [`spawn`] call `pre_start` before the first message, [`ActorRef::stop`]
//! calls `post_stop` after the last one, and a supervisor brackets a restart
//! with `pre_restart` and `post_restart`.
//!
//! # Identity
//!
//! Two references are equal when their names are equal, regardless of the
//! backing instance. Registries (the scheduler, supervisors) reject a name
//! while another actor with that name is alive, which keeps the name a
//! faithful identity.
//!

use crate::{
    Error,
    mailbox::{Mailbox, MailboxType, create_mailbox},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

/// Lifecycle state of an actor.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum ActorState {
    /// Created, `pre_start` not called yet.
    Uninitialized,
    /// `pre_start` is running.
    Starting,
    /// Processing messages.
    Running,
    /// `post_stop` is running.
    Stopping,
    /// Terminal state.
    Stopped,
    /// A supervisor is running `pre_restart`/`post_restart`.
    Restarting,
}

/// The actor trait.
///
/// Implementors hold private state and react to messages in
/// [`Actor::receive`]. Every hook has an empty default implementation.
///
/// # Example
///
/// ```
/// use actor::{Actor, ActorContext, Error};
///
/// struct Counter {
///     value: u64,
/// }
///
/// impl Actor for Counter {
///     type Message = u64;
///
///     fn receive(
///         &mut self,
///         message: u64,
///         _ctx: &mut ActorContext<Self>,
///     ) -> Result<(), Error> {
///         self.value += message;
///         Ok(())
///     }
/// }
/// ```
pub trait Actor: Send + Sized + 'static {
    /// Type of the messages this actor accepts.
    type Message: Send + 'static;

    /// Handles one message. An `Err` is reported to the message loop error
    /// path (and from there to the supervisor, if any), it never stops the
    /// loop.
    fn receive(
        &mut self,
        message: Self::Message,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error>;

    /// Called once, before the first message.
    fn pre_start(&mut self, _ctx: &mut ActorContext<Self>) -> Result<(), Error> {
        Ok(())
    }

    /// Called once, after the last message.
    fn post_stop(&mut self, _ctx: &mut ActorContext<Self>) -> Result<(), Error> {
        Ok(())
    }

    /// Called by a supervisor before the actor is reset.
    fn pre_restart(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        _error: Option<&Error>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called by a supervisor once the actor is back in service.
    fn post_restart(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        _error: Option<&Error>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// What actually travels through an actor mailbox: either a user message or
/// the conventional stop request.
#[derive(Debug)]
pub enum Envelope<M> {
    /// User message.
    Message(M),
    /// Stop the actor once every message queued before this one is handled.
    Stop,
}

/// Callback invoked when an actor reports a failure. Receives the actor name
/// and the error.
pub type FailureListener = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Hook used by an executor-backed dispatcher to learn that new mail arrived.
pub(crate) trait Dispatch: Send + Sync {
    /// Makes sure a message-loop cycle is scheduled for the actor. Returns
    /// `false` when no cycle will run.
    fn schedule(&self) -> bool;
}

/// Execution context handed to every actor hook.
///
/// The context holds a non-owning back-reference to the actor's own cell. It
/// is created once, together with the cell, and never reassigned.
pub struct ActorContext<A: Actor> {
    name: String,
    myself: Weak<ActorCell<A>>,
}

impl<A: Actor> ActorContext<A> {
    /// Name of the actor.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference to the actor itself. `None` once every [`ActorRef`] has
    /// been dropped.
    pub fn myself(&self) -> Option<ActorRef<A>> {
        self.myself.upgrade().map(|cell| ActorRef { cell })
    }

    /// Asks the message loop to stop this actor after the messages already
    /// queued. Returns `false` if the request could not be recorded.
    ///
    /// This is the way to stop from inside [`Actor::receive`]: calling
    /// [`ActorRef::stop`] there would wait on the actor currently running.
    pub fn stop_self(&self) -> bool {
        self.myself()
            .is_some_and(|myself| myself.request_stop().is_ok())
    }
}

struct ActorSlot<A: Actor> {
    actor: A,
    ctx: ActorContext<A>,
}

/// Shared heart of an actor: the instance, its mailbox and its bookkeeping.
pub(crate) struct ActorCell<A: Actor> {
    name: String,
    slot: Mutex<ActorSlot<A>>,
    state: RwLock<ActorState>,
    mailbox: Arc<dyn Mailbox<Envelope<A::Message>>>,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    message_count: AtomicU64,
    error_count: AtomicU64,
    dispatcher: RwLock<Option<Arc<dyn Dispatch>>>,
    failure_listener: RwLock<Option<FailureListener>>,
}

/// Location-transparent handle to an actor.
///
/// Cloning an `ActorRef` is cheap: every clone points at the same actor.
/// Equality and hashing only look at the name.
pub struct ActorRef<A: Actor> {
    cell: Arc<ActorCell<A>>,
}

impl<A: Actor> ActorRef<A> {
    /// Builds an actor reference around `actor` and `mailbox`.
    ///
    /// The actor starts `Uninitialized`; call [`ActorRef::start`] to run
    /// `pre_start` and move it to `Running`.
    pub fn new(
        name: &str,
        actor: A,
        mailbox: Arc<dyn Mailbox<Envelope<A::Message>>>,
    ) -> Self {
        // Two-phase construction: the context gets a weak pointer to the
        // cell that is being built around it.
        let cell = Arc::new_cyclic(|myself: &Weak<ActorCell<A>>| ActorCell {
            name: name.to_owned(),
            slot: Mutex::new(ActorSlot {
                actor,
                ctx: ActorContext {
                    name: name.to_owned(),
                    myself: myself.clone(),
                },
            }),
            state: RwLock::new(ActorState::Uninitialized),
            mailbox,
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            dispatcher: RwLock::new(None),
            failure_listener: RwLock::new(None),
        });
        debug!("Actor {} created.", name);
        Self { cell }
    }

    /// Builds an actor reference with a mailbox of the given kind.
    pub fn with_mailbox(
        name: &str,
        actor: A,
        kind: MailboxType<A::Message>,
    ) -> Result<Self, Error> {
        let mailbox = create_mailbox(envelope_mailbox_type(kind))?;
        Ok(Self::new(name, actor, mailbox))
    }

    /// Name of the actor.
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    /// Location-transparent path of the actor.
    pub fn path(&self) -> String {
        format!("local://{}", self.cell.name)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ActorState {
        *self.cell.state.read()
    }

    /// True once [`ActorRef::stop`] has completed.
    pub fn is_stopped(&self) -> bool {
        self.cell.stopped.load(Ordering::Acquire)
    }

    /// True once a stop was requested, even if it has not completed yet.
    pub fn is_stop_requested(&self) -> bool {
        self.cell.stop_requested.load(Ordering::Acquire)
    }

    /// Messages successfully handled by `receive`.
    pub fn message_count(&self) -> u64 {
        self.cell.message_count.load(Ordering::Relaxed)
    }

    /// Messages for which `receive` returned an error.
    pub fn error_count(&self) -> u64 {
        self.cell.error_count.load(Ordering::Relaxed)
    }

    /// Number of envelopes waiting in the mailbox.
    pub fn mailbox_size(&self) -> usize {
        self.cell.mailbox.size()
    }

    /// Mailbox of the actor.
    pub fn mailbox(&self) -> Arc<dyn Mailbox<Envelope<A::Message>>> {
        self.cell.mailbox.clone()
    }

    /// Runs `pre_start` and moves the actor to `Running`.
    ///
    /// Only valid from `Uninitialized`. If `pre_start` fails the actor ends
    /// `Stopped` and the error is returned.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.cell.state.write();
            if *state != ActorState::Uninitialized {
                return Err(Error::InvalidState(format!(
                    "actor {} cannot start from {:?}",
                    self.cell.name, *state
                )));
            }
            *state = ActorState::Starting;
        }

        let mut slot = self.cell.slot.lock();
        let ActorSlot { actor, ctx } = &mut *slot;
        if let Err(e) = actor.pre_start(ctx) {
            error!("Actor {} failed to start: {}", self.cell.name, e);
            *self.cell.state.write() = ActorState::Stopped;
            self.cell.stopped.store(true, Ordering::Release);
            return Err(e);
        }
        *self.cell.state.write() = ActorState::Running;
        debug!("Actor {} is started.", self.cell.name);
        Ok(())
    }

    /// Sends a message to the actor (fire-and-forget).
    ///
    /// Messages from one sender are handled in send order.
    pub fn send(&self, message: A::Message) -> Result<(), Error> {
        self.enqueue(Envelope::Message(message))
    }

    /// Alias of [`ActorRef::send`].
    pub fn tell(&self, message: A::Message) -> Result<(), Error> {
        self.send(message)
    }

    /// Requests a graceful stop. The message loop stops the actor once the
    /// messages queued before the request are handled.
    ///
    /// From here on new messages are refused with [`Error::ActorStopped`].
    /// When the mailbox is full the stop stays pending and completes as soon
    /// as the loop finds the mailbox drained. Fails with [`Error::Submit`]
    /// when no cycle can be scheduled to carry the stop out.
    pub fn request_stop(&self) -> Result<(), Error> {
        if self.is_stopped() {
            return Ok(());
        }
        self.cell.stop_requested.store(true, Ordering::Release);
        if !self.cell.mailbox.enqueue(Envelope::Stop) {
            debug!(
                "Mailbox of actor {} is full, stop deferred until it drains.",
                self.cell.name
            );
        }
        self.notify_dispatcher()
    }

    /// Stops the actor if a stop was requested and nothing is left to
    /// handle. Returns `true` if this call stopped it.
    pub(crate) fn complete_pending_stop(&self) -> bool {
        if !self.is_stop_requested() || self.is_stopped() || !self.cell.mailbox.is_empty() {
            return false;
        }
        debug!("Mailbox of actor {} drained, completing stop.", self.cell.name);
        self.stop();
        true
    }

    fn enqueue(&self, envelope: Envelope<A::Message>) -> Result<(), Error> {
        if self.is_stopped() || self.is_stop_requested() {
            return Err(Error::ActorStopped(self.cell.name.clone()));
        }
        if !self.cell.mailbox.enqueue(envelope) {
            return Err(Error::MailboxFull(self.cell.name.clone()));
        }
        self.notify_dispatcher()
    }

    /// Wakes the dispatcher, if any. The message stays queued when the
    /// dispatcher cannot run a cycle.
    fn notify_dispatcher(&self) -> Result<(), Error> {
        let dispatcher = self.cell.dispatcher.read().clone();
        match dispatcher {
            Some(dispatcher) if !dispatcher.schedule() => {
                Err(Error::Submit(self.cell.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Stops the actor.
    ///
    /// Moves `Running -> Stopping`, calls `post_stop`, then marks the actor
    /// `Stopped`. Calling it again is a no-op. Must not be called from inside
    /// the actor's own `receive`; use [`ActorContext::stop_self`] there.
    pub fn stop(&self) {
        {
            let mut state = self.cell.state.write();
            if matches!(*state, ActorState::Stopping | ActorState::Stopped) {
                return;
            }
            *state = ActorState::Stopping;
        }

        {
            let mut slot = self.cell.slot.lock();
            let ActorSlot { actor, ctx } = &mut *slot;
            if let Err(e) = actor.post_stop(ctx) {
                error!("Actor {} failed in post_stop: {}", self.cell.name, e);
            }
        }

        *self.cell.state.write() = ActorState::Stopped;
        self.cell.stopped.store(true, Ordering::Release);
        // Drops the dispatcher -> loop -> processor -> cell cycle.
        self.cell.dispatcher.write().take();
        debug!("Actor {} is stopped.", self.cell.name);
    }

    /// Restarts the actor in place: `pre_restart`, then `post_restart`.
    ///
    /// The actor keeps its mailbox and its instance. State is reset by the
    /// hooks, not by reconstruction.
    pub fn restart(&self, error: Option<&Error>) -> Result<(), Error> {
        let mut slot = self.cell.slot.lock();
        {
            let mut state = self.cell.state.write();
            if matches!(*state, ActorState::Stopping | ActorState::Stopped) {
                return Err(Error::ActorStopped(self.cell.name.clone()));
            }
            *state = ActorState::Restarting;
        }

        let ActorSlot { actor, ctx } = &mut *slot;
        let result = actor
            .pre_restart(ctx, error)
            .and_then(|_| actor.post_restart(ctx, error));
        *self.cell.state.write() = ActorState::Running;

        match result {
            Ok(()) => {
                debug!("Actor {} is restarted.", self.cell.name);
                Ok(())
            }
            Err(e) => {
                error!("Actor {} failed to restart: {}", self.cell.name, e);
                Err(Error::Restart(e.to_string()))
            }
        }
    }

    /// Runs `receive` for one message. Used by the message loop.
    pub(crate) fn handle(&self, message: A::Message) -> Result<(), Error> {
        let mut slot = self.cell.slot.lock();
        let state = self.state();
        if state != ActorState::Running {
            return Err(Error::NotRunning(self.cell.name.clone()));
        }
        let ActorSlot { actor, ctx } = &mut *slot;
        match actor.receive(message, ctx) {
            Ok(()) => {
                self.cell.message_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.cell.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Installs the listener notified of `receive` failures.
    pub fn set_failure_listener(&self, listener: FailureListener) {
        *self.cell.failure_listener.write() = Some(listener);
    }

    /// Forwards a failure to the listener, if any.
    pub(crate) fn report_failure(&self, error: &Error) {
        let listener = self.cell.failure_listener.read().clone();
        match listener {
            Some(listener) => listener(&self.cell.name, error),
            None => warn!(
                "Actor {} failed without a supervisor: {}",
                self.cell.name, error
            ),
        }
    }

    pub(crate) fn attach_dispatcher(&self, dispatcher: Arc<dyn Dispatch>) {
        *self.cell.dispatcher.write() = Some(dispatcher);
    }

    pub(crate) fn detach_dispatcher(&self) {
        self.cell.dispatcher.write().take();
    }
}

impl<A: Actor> Clone for ActorRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: Actor> PartialEq for ActorRef<A> {
    fn eq(&self, other: &Self) -> bool {
        self.cell.name == other.cell.name
    }
}

impl<A: Actor> Eq for ActorRef<A> {}

impl<A: Actor> Hash for ActorRef<A> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cell.name.hash(state);
    }
}

impl<A: Actor> fmt::Debug for ActorRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_stopped() { "stopped" } else { "running" };
        write!(f, "ActorRef({}, {})", self.cell.name, status)
    }
}

/// Type-erased view of an [`ActorRef`], used by registries that hold actors
/// of different types.
pub trait ActorHandle: Send + Sync {
    /// Name of the actor.
    fn name(&self) -> &str;
    /// Current lifecycle state.
    fn state(&self) -> ActorState;
    /// True once the actor is stopped.
    fn is_stopped(&self) -> bool;
    /// See [`ActorRef::stop`].
    fn stop(&self);
    /// See [`ActorRef::request_stop`].
    fn request_stop(&self) -> Result<(), Error>;
    /// See [`ActorRef::restart`].
    fn restart(&self, error: Option<&Error>) -> Result<(), Error>;
    /// Messages successfully handled.
    fn message_count(&self) -> u64;
    /// Messages that failed.
    fn error_count(&self) -> u64;
    /// Downcasting support, see [`ActorHandle::as_any`] users in the scheduler.
    fn as_any(&self) -> &dyn Any;
}

impl<A: Actor> ActorHandle for ActorRef<A> {
    fn name(&self) -> &str {
        ActorRef::name(self)
    }

    fn state(&self) -> ActorState {
        ActorRef::state(self)
    }

    fn is_stopped(&self) -> bool {
        ActorRef::is_stopped(self)
    }

    fn stop(&self) {
        ActorRef::stop(self)
    }

    fn request_stop(&self) -> Result<(), Error> {
        ActorRef::request_stop(self)
    }

    fn restart(&self, error: Option<&Error>) -> Result<(), Error> {
        ActorRef::restart(self, error)
    }

    fn message_count(&self) -> u64 {
        ActorRef::message_count(self)
    }

    fn error_count(&self) -> u64 {
        ActorRef::error_count(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Maps a mailbox kind over user messages to the same kind over envelopes.
/// The stop request gets the default priority.
pub(crate) fn envelope_mailbox_type<M: Send + 'static>(
    kind: MailboxType<M>,
) -> MailboxType<Envelope<M>> {
    match kind {
        MailboxType::Unbounded => MailboxType::Unbounded,
        MailboxType::Bounded(capacity) => MailboxType::Bounded(capacity),
        MailboxType::Priority(priority_fn) => {
            MailboxType::priority(move |envelope: &Envelope<M>| match envelope {
                Envelope::Message(message) => priority_fn(message),
                Envelope::Stop => crate::mailbox::DEFAULT_PRIORITY,
            })
        }
    }
}

static STANDALONE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates and starts a standalone actor with an unbounded mailbox.
///
/// Without a name, one is generated from the actor type. The returned actor
/// is `Running` but nothing drives its mailbox: attach a
/// [`MessageLoop`](crate::MessageLoop) or spawn it through a scheduler
/// instead when messages must be processed.
pub fn spawn<A: Actor>(actor: A, name: Option<&str>) -> Result<ActorRef<A>, Error> {
    let name = match name {
        Some(name) => name.to_owned(),
        None => {
            let n = STANDALONE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
            let type_name = std::any::type_name::<A>();
            let short = type_name.rsplit("::").next().unwrap_or(type_name);
            format!("{}-{}", short, n)
        }
    };
    let actor_ref = ActorRef::with_mailbox(&name, actor, MailboxType::Unbounded)?;
    actor_ref.start()?;
    Ok(actor_ref)
}
