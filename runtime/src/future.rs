// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Futures
//!
//! Every future of the runtime is a [`std::future::Future`] whose output is
//! `Result<T, Error>`. This module holds the constructors ([`ready`],
//! [`failed`], [`all`], [`race`], [`timeout`]...) and the combinators
//! reachable through [`FutureExt`].
//!
//! Combinators own their inner futures behind `Pin<Box<_>>`, so all of them
//! are `Unpin` and can be polled through `Pin::new`. A combinator that already
//! returned `Ready` answers any further poll with [`Error::IllegalState`].
//!

use crate::Error;

use parking_lot::Mutex;
use tracing::warn;

use std::{
    future::Future,
    marker::PhantomData,
    mem,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

/// Boxed, sendable runtime future.
pub type BoxFuture<T> = futures::future::BoxFuture<'static, Result<T, Error>>;

fn polled_after_completion() -> Error {
    Error::IllegalState("future polled after completion".to_owned())
}

/// Future that is ready on its first poll.
#[must_use = "futures do nothing unless polled"]
pub struct Ready<T> {
    value: Option<Result<T, Error>>,
}

impl<T> Unpin for Ready<T> {}

impl<T> Future for Ready<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(
            self.value
                .take()
                .unwrap_or_else(|| Err(polled_after_completion())),
        )
    }
}

pub fn ready<T>(value: T) -> Ready<T> {
    from_result(Ok(value))
}

pub fn failed<T>(error: Error) -> Ready<T> {
    from_result(Err(error))
}

pub fn from_result<T>(result: Result<T, Error>) -> Ready<T> {
    Ready {
        value: Some(result),
    }
}

/// Future that never completes.
#[must_use = "futures do nothing unless polled"]
pub struct Pending<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Pending
    }
}

pub fn pending<T>() -> Pending<T> {
    Pending {
        _marker: PhantomData,
    }
}

/// See [`FutureExt::map`].
#[must_use = "futures do nothing unless polled"]
pub struct Map<F, G> {
    inner: Pin<Box<F>>,
    f: Option<G>,
}

impl<F, G> Unpin for Map<F, G> {}

impl<F, G, T, U> Future for Map<F, G>
where
    F: Future<Output = Result<T, Error>>,
    G: FnOnce(T) -> U,
{
    type Output = Result<U, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.f.is_none() {
            return Poll::Ready(Err(polled_after_completion()));
        }
        match this.inner.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => match this.f.take() {
                Some(f) => Poll::Ready(result.map(f)),
                None => Poll::Ready(Err(polled_after_completion())),
            },
        }
    }
}

enum FlatMapState<F, G, N> {
    First(Pin<Box<F>>, G),
    Second(Pin<Box<N>>),
    Done,
}

/// See [`FutureExt::flat_map`].
#[must_use = "futures do nothing unless polled"]
pub struct FlatMap<F, G, N> {
    state: FlatMapState<F, G, N>,
}

impl<F, G, N> Unpin for FlatMap<F, G, N> {}

impl<F, G, N, T, U> Future for FlatMap<F, G, N>
where
    F: Future<Output = Result<T, Error>>,
    G: FnOnce(T) -> N,
    N: Future<Output = Result<U, Error>>,
{
    type Output = Result<U, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match mem::replace(&mut this.state, FlatMapState::Done) {
                FlatMapState::First(mut inner, f) => match inner.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = FlatMapState::First(inner, f);
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(value)) => {
                        this.state = FlatMapState::Second(Box::pin(f(value)));
                    }
                },
                FlatMapState::Second(mut next) => {
                    return match next.as_mut().poll(cx) {
                        Poll::Pending => {
                            this.state = FlatMapState::Second(next);
                            Poll::Pending
                        }
                        Poll::Ready(result) => Poll::Ready(result),
                    };
                }
                FlatMapState::Done => return Poll::Ready(Err(polled_after_completion())),
            }
        }
    }
}

/// See [`FutureExt::then`].
#[must_use = "futures do nothing unless polled"]
pub struct Then<F, G> {
    inner: Pin<Box<F>>,
    f: Option<G>,
}

impl<F, G> Unpin for Then<F, G> {}

impl<F, G, T, U> Future for Then<F, G>
where
    F: Future<Output = Result<T, Error>>,
    G: FnOnce(Result<T, Error>) -> Result<U, Error>,
{
    type Output = Result<U, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.f.is_none() {
            return Poll::Ready(Err(polled_after_completion()));
        }
        match this.inner.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => match this.f.take() {
                Some(f) => Poll::Ready(f(result)),
                None => Poll::Ready(Err(polled_after_completion())),
            },
        }
    }
}

/// See [`FutureExt::catch`].
#[must_use = "futures do nothing unless polled"]
pub struct Catch<F, G> {
    inner: Pin<Box<F>>,
    f: Option<G>,
}

impl<F, G> Unpin for Catch<F, G> {}

impl<F, G, T> Future for Catch<F, G>
where
    F: Future<Output = Result<T, Error>>,
    G: FnOnce(Error) -> T,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.f.is_none() {
            return Poll::Ready(Err(polled_after_completion()));
        }
        match this.inner.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => {
                this.f = None;
                Poll::Ready(Ok(value))
            }
            Poll::Ready(Err(e)) => match this.f.take() {
                Some(f) => Poll::Ready(Ok(f(e))),
                None => Poll::Ready(Err(polled_after_completion())),
            },
        }
    }
}

/// A future and, once it finished, its output.
enum Slot<F: Future> {
    Running(Pin<Box<F>>),
    Done(F::Output),
    Taken,
}

impl<F: Future> Slot<F> {
    fn new(future: F) -> Self {
        Slot::Running(Box::pin(future))
    }

    /// Polls a running future. Returns `true` once it has an output.
    fn poll_slot(&mut self, cx: &mut Context<'_>) -> bool {
        match self {
            Slot::Running(future) => match future.as_mut().poll(cx) {
                Poll::Ready(output) => {
                    *self = Slot::Done(output);
                    true
                }
                Poll::Pending => false,
            },
            Slot::Done(_) => true,
            Slot::Taken => false,
        }
    }

    fn take(&mut self) -> Option<F::Output> {
        match mem::replace(self, Slot::Taken) {
            Slot::Done(output) => Some(output),
            other => {
                *self = other;
                None
            }
        }
    }
}

/// See [`join`].
#[must_use = "futures do nothing unless polled"]
pub struct And<A: Future, B: Future> {
    a: Slot<A>,
    b: Slot<B>,
    done: bool,
}

impl<A: Future, B: Future> Unpin for And<A, B> {}

impl<A, B, TA, TB> Future for And<A, B>
where
    A: Future<Output = Result<TA, Error>>,
    B: Future<Output = Result<TB, Error>>,
{
    type Output = Result<(TA, TB), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(polled_after_completion()));
        }

        let a_ready = this.a.poll_slot(cx);
        if matches!(this.a, Slot::Done(Err(_))) {
            this.done = true;
            if let Some(Err(e)) = this.a.take() {
                return Poll::Ready(Err(e));
            }
        }
        let b_ready = this.b.poll_slot(cx);
        if matches!(this.b, Slot::Done(Err(_))) {
            this.done = true;
            if let Some(Err(e)) = this.b.take() {
                return Poll::Ready(Err(e));
            }
        }
        if !(a_ready && b_ready) {
            return Poll::Pending;
        }

        this.done = true;
        match (this.a.take(), this.b.take()) {
            (Some(Ok(a)), Some(Ok(b))) => Poll::Ready(Ok((a, b))),
            _ => Poll::Ready(Err(polled_after_completion())),
        }
    }
}

/// See [`select`].
#[must_use = "futures do nothing unless polled"]
pub struct Or<A, B> {
    a: Pin<Box<A>>,
    b: Pin<Box<B>>,
    done: bool,
}

impl<A, B> Unpin for Or<A, B> {}

impl<A, B, T> Future for Or<A, B>
where
    A: Future<Output = Result<T, Error>>,
    B: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(polled_after_completion()));
        }
        if let Poll::Ready(result) = this.a.as_mut().poll(cx) {
            this.done = true;
            return Poll::Ready(result);
        }
        if let Poll::Ready(result) = this.b.as_mut().poll(cx) {
            this.done = true;
            return Poll::Ready(result);
        }
        Poll::Pending
    }
}

/// See [`all`].
#[must_use = "futures do nothing unless polled"]
pub struct All<F: Future> {
    slots: Vec<Slot<F>>,
    done: bool,
}

impl<F: Future> Unpin for All<F> {}

impl<F, T> Future for All<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<Vec<T>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(polled_after_completion()));
        }

        let mut all_ready = true;
        for slot in this.slots.iter_mut() {
            if !slot.poll_slot(cx) {
                all_ready = false;
                continue;
            }
            if matches!(slot, Slot::Done(Err(_))) {
                this.done = true;
                if let Some(Err(e)) = slot.take() {
                    return Poll::Ready(Err(e));
                }
            }
        }
        if !all_ready {
            return Poll::Pending;
        }

        this.done = true;
        let mut values = Vec::with_capacity(this.slots.len());
        for slot in this.slots.iter_mut() {
            match slot.take() {
                Some(Ok(value)) => values.push(value),
                _ => return Poll::Ready(Err(polled_after_completion())),
            }
        }
        Poll::Ready(Ok(values))
    }
}

/// See [`race`].
#[must_use = "futures do nothing unless polled"]
pub struct Race<F> {
    futures: Vec<Pin<Box<F>>>,
    done: bool,
}

impl<F> Unpin for Race<F> {}

impl<F, T> Future for Race<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(polled_after_completion()));
        }
        for future in this.futures.iter_mut() {
            if let Poll::Ready(result) = future.as_mut().poll(cx) {
                this.done = true;
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

/// See [`timeout`].
#[must_use = "futures do nothing unless polled"]
pub struct Timeout<F> {
    inner: Pin<Box<F>>,
    duration: Duration,
    deadline: Option<Instant>,
    // Latest waker, woken by the alarm thread at the deadline.
    alarm: Option<Arc<Mutex<Option<std::task::Waker>>>>,
    done: bool,
}

impl<F> Unpin for Timeout<F> {}

impl<F> Timeout<F> {
    fn arm(&mut self, deadline: Instant, waker: std::task::Waker) {
        if let Some(slot) = &self.alarm {
            *slot.lock() = Some(waker);
            return;
        }

        let slot = Arc::new(Mutex::new(Some(waker)));
        let alarm: Weak<Mutex<Option<std::task::Waker>>> = Arc::downgrade(&slot);
        self.alarm = Some(slot);
        let spawned = thread::Builder::new()
            .name("strand-timeout".to_owned())
            .spawn(move || {
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                let waker = alarm.upgrade().and_then(|slot| slot.lock().take());
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
        if let Err(e) = spawned {
            warn!("Timeout alarm thread could not be spawned: {}", e);
        }
    }
}

impl<F, T> Future for Timeout<F>
where
    F: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(polled_after_completion()));
        }
        if let Poll::Ready(result) = this.inner.as_mut().poll(cx) {
            this.done = true;
            return Poll::Ready(result);
        }

        let duration = this.duration;
        let deadline = *this
            .deadline
            .get_or_insert_with(|| Instant::now() + duration);
        if Instant::now() >= deadline {
            this.done = true;
            return Poll::Ready(Err(Error::Timeout(duration)));
        }
        this.arm(deadline, cx.waker().clone());
        Poll::Pending
    }
}

/// Resolves with every output, in input order. The first failure fails the
/// whole future. An empty input resolves to an empty vector.
pub fn all<I, F, T>(futures: I) -> All<F>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, Error>>,
{
    All {
        slots: futures.into_iter().map(Slot::new).collect(),
        done: false,
    }
}

/// Resolves with the first completed output, success or failure. An empty
/// input never resolves.
pub fn race<I, F, T>(futures: I) -> Race<F>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T, Error>>,
{
    Race {
        futures: futures.into_iter().map(Box::pin).collect(),
        done: false,
    }
}

/// Runs both futures and resolves with both outputs.
pub fn join<A, B, TA, TB>(a: A, b: B) -> And<A, B>
where
    A: Future<Output = Result<TA, Error>>,
    B: Future<Output = Result<TB, Error>>,
{
    And {
        a: Slot::new(a),
        b: Slot::new(b),
        done: false,
    }
}

/// Resolves with whichever future completes first. `a` wins ties.
pub fn select<A, B, T>(a: A, b: B) -> Or<A, B>
where
    A: Future<Output = Result<T, Error>>,
    B: Future<Output = Result<T, Error>>,
{
    Or {
        a: Box::pin(a),
        b: Box::pin(b),
        done: false,
    }
}

/// Fails with [`Error::Timeout`] if `future` is still pending `duration`
/// after its first poll.
pub fn timeout<F, T>(future: F, duration: Duration) -> Timeout<F>
where
    F: Future<Output = Result<T, Error>>,
{
    Timeout {
        inner: Box::pin(future),
        duration,
        deadline: None,
        alarm: None,
        done: false,
    }
}

/// Combinators for runtime futures.
pub trait FutureExt<T>: Future<Output = Result<T, Error>> + Sized {
    /// Transforms the success value.
    fn map<U, G>(self, f: G) -> Map<Self, G>
    where
        G: FnOnce(T) -> U,
    {
        Map {
            inner: Box::pin(self),
            f: Some(f),
        }
    }

    /// Chains a second future built from the success value.
    fn flat_map<U, N, G>(self, f: G) -> FlatMap<Self, G, N>
    where
        G: FnOnce(T) -> N,
        N: Future<Output = Result<U, Error>>,
    {
        FlatMap {
            state: FlatMapState::First(Box::pin(self), f),
        }
    }

    /// Transforms the whole outcome, success or failure.
    fn then<U, G>(self, f: G) -> Then<Self, G>
    where
        G: FnOnce(Result<T, Error>) -> Result<U, Error>,
    {
        Then {
            inner: Box::pin(self),
            f: Some(f),
        }
    }

    /// Recovers from a failure.
    fn catch<G>(self, f: G) -> Catch<Self, G>
    where
        G: FnOnce(Error) -> T,
    {
        Catch {
            inner: Box::pin(self),
            f: Some(f),
        }
    }

    /// See [`join`].
    fn and<B, U>(self, other: B) -> And<Self, B>
    where
        B: Future<Output = Result<U, Error>>,
    {
        join(self, other)
    }

    /// See [`select`].
    fn or<B>(self, other: B) -> Or<Self, B>
    where
        B: Future<Output = Result<T, Error>>,
    {
        select(self, other)
    }

    /// See [`timeout`].
    fn with_timeout(self, duration: Duration) -> Timeout<Self> {
        timeout(self, duration)
    }

    fn boxed(self) -> BoxFuture<T>
    where
        Self: Send + 'static,
    {
        Box::pin(self)
    }
}

impl<T, F> FutureExt<T> for F where F: Future<Output = Result<T, Error>> {}
