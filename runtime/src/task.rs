// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Task
//!
//! A [`Task`] wraps a future together with its state:
//! `Pending -> Running -> Completed | Failed | Cancelled`. The executor polls
//! tasks, the [`TaskHandle`] reads their outcome. Polling a task that
//! already finished is an [`Error::IllegalState`].
//!

use crate::{Error, error::panic_message, future::BoxFuture};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::error;

use std::{
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Completed, failed or cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

struct TaskInner<T> {
    state: TaskState,
    future: Option<BoxFuture<T>>,
    result: Option<Result<T, Error>>,
    // Woken when the task finishes.
    handle_waker: Option<Waker>,
    // Waker of the last poll, woken on cancellation.
    poll_waker: Option<Waker>,
}

impl<T> TaskInner<T> {
    /// Moves to a terminal state. Returns the wakers to notify once the
    /// lock is released.
    fn finish(&mut self, state: TaskState, result: Result<T, Error>) -> Vec<Waker> {
        self.state = state;
        self.result = Some(result);
        self.future = None;
        self.handle_waker
            .take()
            .into_iter()
            .chain(self.poll_waker.take())
            .collect()
    }
}

struct TaskCore<T> {
    id: TaskId,
    inner: Mutex<TaskInner<T>>,
}

/// A future and its execution state.
pub struct Task<T> {
    core: Arc<TaskCore<T>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Self {
            core: Arc::new(TaskCore {
                id: TaskId::next(),
                inner: Mutex::new(TaskInner {
                    state: TaskState::Pending,
                    future: Some(Box::pin(future)),
                    result: None,
                    handle_waker: None,
                    poll_waker: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn state(&self) -> TaskState {
        self.core.inner.lock().state
    }

    pub fn handle(&self) -> TaskHandle<T> {
        TaskHandle {
            core: self.core.clone(),
        }
    }

    /// Polls the wrapped future once.
    ///
    /// Returns `Ready` once the task finished, whatever the outcome, and
    /// [`Error::IllegalState`] if it had already finished before this call.
    /// An error returned by the future fails the task, and so does a panic.
    pub fn poll(&self, cx: &mut Context<'_>) -> Result<Poll<()>, Error> {
        let mut future = {
            let mut inner = self.core.inner.lock();
            if inner.state.is_finished() {
                return Err(Error::IllegalState(format!(
                    "{} polled in state {:?}",
                    self.core.id, inner.state
                )));
            }
            let Some(future) = inner.future.take() else {
                return Err(Error::IllegalState(format!(
                    "{} is already being polled",
                    self.core.id
                )));
            };
            inner.state = TaskState::Running;
            future
        };

        let polled = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx)));

        let wakers = match polled {
            Ok(Poll::Pending) => {
                let mut inner = self.core.inner.lock();
                if inner.state == TaskState::Cancelled {
                    return Ok(Poll::Ready(()));
                }
                inner.future = Some(future);
                inner.poll_waker = Some(cx.waker().clone());
                return Ok(Poll::Pending);
            }
            Ok(Poll::Ready(result)) => {
                let mut inner = self.core.inner.lock();
                if inner.state == TaskState::Cancelled {
                    return Ok(Poll::Ready(()));
                }
                let state = if result.is_ok() {
                    TaskState::Completed
                } else {
                    TaskState::Failed
                };
                inner.finish(state, result)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("{} panicked: {}", self.core.id, message);
                let mut inner = self.core.inner.lock();
                if inner.state == TaskState::Cancelled {
                    return Ok(Poll::Ready(()));
                }
                inner.finish(TaskState::Failed, Err(Error::Panicked(message)))
            }
        };
        for waker in wakers {
            waker.wake();
        }
        Ok(Poll::Ready(()))
    }
}

/// Type-erased task, as stored by the executor.
pub(crate) trait Schedulable: Send + Sync {
    fn id(&self) -> TaskId;
    fn run(&self, cx: &mut Context<'_>) -> Result<Poll<()>, Error>;
}

impl<T: Send + 'static> Schedulable for Task<T> {
    fn id(&self) -> TaskId {
        Task::id(self)
    }

    fn run(&self, cx: &mut Context<'_>) -> Result<Poll<()>, Error> {
        self.poll(cx)
    }
}

/// Read side of a task. Awaiting the handle yields the task result.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    pub fn state(&self) -> TaskState {
        self.core.inner.lock().state
    }

    /// Not finished yet.
    pub fn is_pending(&self) -> bool {
        !self.state().is_finished()
    }

    /// Finished successfully.
    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Cancels an unfinished task. The future is dropped and the result
    /// becomes [`Error::Cancelled`]. Returns `false` if the task had already
    /// finished.
    pub fn cancel(&self) -> bool {
        let wakers = {
            let mut inner = self.core.inner.lock();
            if inner.state.is_finished() {
                return false;
            }
            inner.finish(TaskState::Cancelled, Err(Error::Cancelled))
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Takes the result of a finished task. The result can be taken once.
    pub fn result(&self) -> Result<T, Error> {
        let mut inner = self.core.inner.lock();
        if !inner.state.is_finished() {
            return Err(Error::IllegalState(format!(
                "{} is not finished",
                self.core.id
            )));
        }
        inner.result.take().unwrap_or_else(|| {
            Err(Error::IllegalState(format!(
                "result of {} was already taken",
                self.core.id
            )))
        })
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        {
            let mut inner = self.core.inner.lock();
            if !inner.state.is_finished() {
                inner.handle_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
        }
        Poll::Ready(self.result())
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        future::{self, FutureExt},
        promise::Promise,
        waker::Waker as RuntimeWaker,
    };

    fn poll(task: &Task<u32>) -> Result<Poll<()>, Error> {
        let waker = RuntimeWaker::noop().to_std();
        task.poll(&mut Context::from_waker(&waker))
    }

    #[test]
    fn test_completed_task() {
        let task = Task::new(future::ready(5));
        let handle = task.handle();
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(handle.is_pending());

        assert_eq!(poll(&task), Ok(Poll::Ready(())));
        assert!(handle.is_completed());
        assert!(matches!(poll(&task), Err(Error::IllegalState(_))));
        assert_eq!(handle.result(), Ok(5));
        assert!(matches!(handle.result(), Err(Error::IllegalState(_))));
        assert!(!handle.cancel());
    }

    #[test]
    fn test_failed_and_panicked_tasks() {
        let task = Task::new(future::failed(Error::Failed("bad".to_owned())));
        assert_eq!(poll(&task), Ok(Poll::Ready(())));
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.handle().result(), Err(Error::Failed("bad".to_owned())));

        let task = Task::new(future::ready(1).map(|_: u32| -> u32 { panic!("exploded") }));
        assert_eq!(poll(&task), Ok(Poll::Ready(())));
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.handle().result(),
            Err(Error::Panicked("exploded".to_owned()))
        );
    }

    #[test]
    fn test_cancelled_task() {
        let promise = Promise::new();
        let task = Task::new(promise.future().unwrap());
        let handle = task.handle();

        assert_eq!(poll(&task), Ok(Poll::Pending));
        assert_eq!(task.state(), TaskState::Running);
        assert!(matches!(handle.result(), Err(Error::IllegalState(_))));

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(matches!(poll(&task), Err(Error::IllegalState(_))));
        assert_eq!(handle.result(), Err(Error::Cancelled));
        promise.resolve(3).unwrap();
    }

    #[test]
    fn test_handle_is_awaitable() {
        let promise = Promise::new();
        let task = Task::new(promise.future().unwrap().map(|v: u32| v + 1));
        let handle = task.handle();
        assert_eq!(poll(&task), Ok(Poll::Pending));

        let waiter = std::thread::spawn(move || futures::executor::block_on(handle));
        promise.resolve(41).unwrap();
        while poll(&task) == Ok(Poll::Pending) {
            std::thread::yield_now();
        }
        assert_eq!(waiter.join().unwrap(), Ok(42));
    }
}
