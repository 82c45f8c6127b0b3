// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Promise
//!
//! A [`Promise`] is the write side of a [`PromiseFuture`]. It completes
//! exactly once: a second `resolve` or `reject` fails with
//! [`Error::IllegalState`] and leaves the first value in place. Completing
//! the promise wakes the task awaiting its future, if any.
//!

use crate::{Error, error::panic_message};

use parking_lot::Mutex;
use tracing::{debug, error};

use std::{
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    thread::{self, JoinHandle},
};

struct PromiseState<T> {
    result: Option<Result<T, Error>>,
    completed: bool,
    future_taken: bool,
    waker: Option<Waker>,
}

type Shared<T> = Arc<Mutex<PromiseState<T>>>;

/// Write-once handle completing a [`PromiseFuture`].
///
/// Clones complete the same future, so a promise can be handed to another
/// thread while the original is kept to check [`Promise::is_completed`].
pub struct Promise<T> {
    shared: Shared<T>,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(PromiseState {
                result: None,
                completed: false,
                future_taken: false,
                waker: None,
            })),
        }
    }

    /// Promise already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.complete(Ok(value)).ok();
        promise
    }

    /// Promise already rejected with `error`.
    pub fn rejected(error: Error) -> Self {
        let promise = Self::new();
        promise.complete(Err(error)).ok();
        promise
    }

    pub fn resolve(&self, value: T) -> Result<(), Error> {
        self.complete(Ok(value))
    }

    pub fn reject(&self, error: Error) -> Result<(), Error> {
        self.complete(Err(error))
    }

    fn complete(&self, result: Result<T, Error>) -> Result<(), Error> {
        let waker = {
            let mut state = self.shared.lock();
            if state.completed {
                return Err(Error::IllegalState(
                    "promise is already completed".to_owned(),
                ));
            }
            state.completed = true;
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// True once a value or an error has been written.
    pub fn is_completed(&self) -> bool {
        self.shared.lock().completed
    }

    /// The read side. A promise hands out a single future.
    pub fn future(&self) -> Result<PromiseFuture<T>, Error> {
        let mut state = self.shared.lock();
        if state.future_taken {
            return Err(Error::IllegalState(
                "promise future was already taken".to_owned(),
            ));
        }
        state.future_taken = true;
        Ok(PromiseFuture {
            shared: self.shared.clone(),
        })
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

/// Read side of a [`Promise`].
#[must_use = "futures do nothing unless polled"]
pub struct PromiseFuture<T> {
    shared: Shared<T>,
}

impl<T> PromiseFuture<T> {
    pub fn is_completed(&self) -> bool {
        self.shared.lock().completed
    }
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();
        if let Some(result) = state.result.take() {
            return Poll::Ready(result);
        }
        if state.completed {
            return Poll::Ready(Err(Error::IllegalState(
                "promise future polled after completion".to_owned(),
            )));
        }
        match &state.waker {
            Some(waker) if waker.will_wake(cx.waker()) => {}
            _ => state.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

/// Runs `callback` on a new thread with a promise to complete.
///
/// A panicking callback rejects the promise with [`Error::Panicked`], unless
/// it completed the promise first.
pub fn promise_from_callback<T, F>(
    callback: F,
) -> Result<(PromiseFuture<T>, JoinHandle<()>), Error>
where
    T: Send + 'static,
    F: FnOnce(Promise<T>) + Send + 'static,
{
    let promise = Promise::new();
    let future = promise.future()?;
    let resolver = promise.clone();
    let handle = thread::Builder::new()
        .name("strand-promise".to_owned())
        .spawn(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(resolver))) {
                let message = panic_message(payload.as_ref());
                error!("Promise callback panicked: {}", message);
                if promise.reject(Error::Panicked(message)).is_err() {
                    debug!("Promise was completed before the callback panicked.");
                }
            }
        })
        .map_err(|e| Error::IllegalState(format!("cannot spawn promise thread: {}", e)))?;
    Ok((future, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::waker::Waker as RuntimeWaker;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_write_once() {
        let promise = Promise::new();
        assert!(!promise.is_completed());
        promise.resolve(1).unwrap();
        assert!(promise.is_completed());
        assert!(matches!(promise.resolve(2), Err(Error::IllegalState(_))));
        assert!(matches!(
            promise.reject(Error::Cancelled),
            Err(Error::IllegalState(_))
        ));

        let future = promise.future().unwrap();
        assert!(matches!(promise.future(), Err(Error::IllegalState(_))));
        assert_eq!(futures::executor::block_on(future), Ok(1));
    }

    #[test]
    fn test_completion_wakes_once() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let waker = RuntimeWaker::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .to_std();
        let mut cx = Context::from_waker(&waker);

        let promise = Promise::<u8>::new();
        let mut future = promise.future().unwrap();
        assert_eq!(Pin::new(&mut future).poll(&mut cx), Poll::Pending);
        assert_eq!(Pin::new(&mut future).poll(&mut cx), Poll::Pending);

        promise.reject(Error::Failed("nope".to_owned())).unwrap();
        assert!(promise.resolve(3).is_err());
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
        assert_eq!(
            Pin::new(&mut future).poll(&mut cx),
            Poll::Ready(Err(Error::Failed("nope".to_owned())))
        );
        assert!(matches!(
            Pin::new(&mut future).poll(&mut cx),
            Poll::Ready(Err(Error::IllegalState(_)))
        ));
    }

    #[test]
    fn test_factories() {
        let resolved = Promise::resolved("done");
        assert!(resolved.is_completed());
        assert_eq!(
            futures::executor::block_on(resolved.future().unwrap()),
            Ok("done")
        );

        let rejected = Promise::<()>::rejected(Error::Cancelled);
        assert_eq!(
            futures::executor::block_on(rejected.future().unwrap()),
            Err(Error::Cancelled)
        );
    }

    #[test]
    fn test_from_callback() {
        let (future, handle) = promise_from_callback(|promise| {
            promise.resolve(7).unwrap();
        })
        .unwrap();
        assert_eq!(futures::executor::block_on(future), Ok(7));
        handle.join().unwrap();

        let (future, handle) =
            promise_from_callback::<u8, _>(|_| panic!("callback failed")).unwrap();
        handle.join().unwrap();
        assert_eq!(
            futures::executor::block_on(future),
            Err(Error::Panicked("callback failed".to_owned()))
        );
    }
}
