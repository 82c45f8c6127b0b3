// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Executor
//!
//! Single-threaded cooperative event loop. Spawned tasks sit in a ready
//! queue; [`Executor::step`] polls one of them with a fresh [`Waker`]. A
//! task returning `Pending` is parked in the waiting map until its waker
//! fires and moves it back to the ready queue. The executor never blocks
//! on a task: all waiting happens through wakers.
//!

use crate::{
    Error,
    task::{Schedulable, Task, TaskHandle, TaskId},
    waker::Waker,
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

/// Idle steps tolerated by [`Executor::run_until_complete`] before it gives
/// up on the awaited task.
pub const DEFAULT_MAX_IDLE_ITERATIONS: usize = 1000;

const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Default)]
struct Queues {
    ready: VecDeque<Arc<dyn Schedulable>>,
    waiting: HashMap<TaskId, Arc<dyn Schedulable>>,
    wakers: HashMap<TaskId, Waker>,
}

/// Cooperative event loop.
pub struct Executor {
    queues: Arc<Mutex<Queues>>,
    running: AtomicBool,
    max_idle_iterations: usize,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(Queues::default())),
            running: AtomicBool::new(false),
            max_idle_iterations: DEFAULT_MAX_IDLE_ITERATIONS,
        }
    }

    /// Idle steps [`Executor::run_until_complete`] tolerates before failing
    /// with [`Error::Stuck`].
    pub fn with_max_idle_iterations(mut self, max_idle_iterations: usize) -> Self {
        self.max_idle_iterations = max_idle_iterations;
        self
    }

    /// Queues `future` as a new task.
    pub fn spawn<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let task = Task::new(future);
        let handle = task.handle();
        debug!("Spawned {}.", task.id());
        self.queues.lock().ready.push_back(Arc::new(task));
        handle
    }

    /// Polls one ready task. Returns `false` when the ready queue is empty.
    pub fn step(&self) -> bool {
        let Some(task) = self.queues.lock().ready.pop_front() else {
            return false;
        };
        let id = task.id();

        let queues = Arc::downgrade(&self.queues);
        let waker = Waker::new(move || {
            let Some(queues) = queues.upgrade() else {
                return;
            };
            let mut queues = queues.lock();
            if let Some(task) = queues.waiting.remove(&id) {
                queues.wakers.remove(&id);
                queues.ready.push_back(task);
            }
        });

        let std_waker = waker.to_std();
        let mut cx = Context::from_waker(&std_waker);
        match task.run(&mut cx) {
            Ok(Poll::Pending) => {
                let mut queues = self.queues.lock();
                // A wake during the poll found nothing to move.
                if waker.is_woken() {
                    queues.ready.push_back(task);
                } else {
                    queues.waiting.insert(id, task);
                    queues.wakers.insert(id, waker);
                }
            }
            Ok(Poll::Ready(())) => {
                self.queues.lock().wakers.remove(&id);
            }
            Err(e) => {
                debug!("Dropped {}: {}", id, e);
                self.queues.lock().wakers.remove(&id);
            }
        }
        true
    }

    /// Steps until [`Executor::stop`] or until `max_iterations` steps were
    /// taken, sleeping 1 ms whenever nothing is ready.
    pub fn run(&self, max_iterations: Option<usize>) {
        self.running.store(true, Ordering::Release);
        let mut iterations = 0;
        while self.running.load(Ordering::Acquire) {
            if max_iterations.is_some_and(|max| iterations >= max) {
                break;
            }
            if !self.step() {
                thread::sleep(IDLE_SLEEP);
            }
            iterations += 1;
        }
        self.running.store(false, Ordering::Release);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns `future` and steps until it finishes.
    ///
    /// Fails with [`Error::Timeout`] (and cancels the task) once `timeout`
    /// elapsed, and with [`Error::Stuck`] after too many consecutive steps
    /// with nothing ready.
    pub fn run_until_complete<T, F>(&self, future: F, timeout: Option<Duration>) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let handle = self.spawn(future);
        let started = Instant::now();
        let mut idle = 0;

        while handle.is_pending() {
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    handle.cancel();
                    warn!("{} cancelled after {:?}.", handle.id(), timeout);
                    return Err(Error::Timeout(timeout));
                }
            }

            if self.step() {
                idle = 0;
                continue;
            }
            idle += 1;
            if idle > self.max_idle_iterations && handle.is_pending() {
                warn!("{} made no progress, giving up.", handle.id());
                return Err(Error::Stuck(self.max_idle_iterations));
            }
            thread::sleep(IDLE_SLEEP);
        }
        handle.result()
    }

    /// Tasks ready or waiting.
    pub fn active_tasks(&self) -> usize {
        let queues = self.queues.lock();
        queues.ready.len() + queues.waiting.len()
    }

    pub fn waiting_tasks(&self) -> usize {
        self.queues.lock().waiting.len()
    }

    pub fn ready_tasks(&self) -> usize {
        self.queues.lock().ready.len()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("ready", &self.ready_tasks())
            .field("waiting", &self.waiting_tasks())
            .finish()
    }
}

/// Runs `future` to completion on a fresh executor.
pub fn block_on<T, F>(future: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Error>> + Send + 'static,
{
    Executor::new().run_until_complete(future, None)
}

/// Handle to an [`Executor`], cheap to clone and pass around.
#[derive(Clone, Debug, Default)]
pub struct Runtime {
    executor: Arc<Executor>,
}

static GLOBAL_RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_executor(executor: Executor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }

    /// Process-wide runtime, created on first use and never torn down.
    pub fn global() -> &'static Runtime {
        GLOBAL_RUNTIME.get_or_init(Runtime::new)
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn spawn<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.executor.spawn(future)
    }

    pub fn block_on<T, F>(&self, future: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        self.executor.run_until_complete(future, None)
    }

    pub fn run(&self, max_iterations: Option<usize>) {
        self.executor.run(max_iterations);
    }

    pub fn stop(&self) {
        self.executor.stop();
    }

    pub fn active_tasks(&self) -> usize {
        self.executor.active_tasks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        future::{self, FutureExt},
        promise::Promise,
        task::TaskState,
    };

    #[test]
    fn test_spawn_and_step() {
        let executor = Executor::new();
        let first = executor.spawn(future::ready(1));
        let second = executor.spawn(future::ready(2).map(|v| v * 10));
        assert_eq!(executor.ready_tasks(), 2);

        assert!(executor.step());
        assert!(executor.step());
        assert!(!executor.step());
        assert_eq!(first.result(), Ok(1));
        assert_eq!(second.result(), Ok(20));
        assert_eq!(executor.active_tasks(), 0);
    }

    #[test]
    fn test_wake_moves_task_back_to_ready() {
        let executor = Executor::new();
        let promise = Promise::new();
        let handle = executor.spawn(promise.future().unwrap());

        assert!(executor.step());
        assert_eq!(executor.waiting_tasks(), 1);
        assert_eq!(executor.ready_tasks(), 0);
        assert!(!executor.step());

        promise.resolve("woken").unwrap();
        assert_eq!(executor.waiting_tasks(), 0);
        assert_eq!(executor.ready_tasks(), 1);
        assert!(executor.step());
        assert_eq!(handle.result(), Ok("woken"));
    }

    #[test]
    fn test_cancel_releases_waiting_task() {
        let executor = Executor::new();
        let handle = executor.spawn(future::pending::<u8>());
        assert!(executor.step());
        assert_eq!(executor.waiting_tasks(), 1);

        assert!(handle.cancel());
        assert!(executor.step());
        assert_eq!(executor.active_tasks(), 0);
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_run_until_complete() {
        let executor = Executor::new();
        let (future, producer) = crate::promise::promise_from_callback(|promise| {
            thread::sleep(Duration::from_millis(20));
            promise.resolve(5).unwrap();
        })
        .unwrap();
        assert_eq!(
            executor.run_until_complete(future.map(|v| v + 1), None),
            Ok(6)
        );
        producer.join().unwrap();

        assert_eq!(
            executor.run_until_complete(future::failed::<u8>(Error::Cancelled), None),
            Err(Error::Cancelled)
        );
        assert_eq!(block_on(future::ready(9)), Ok(9));
    }

    #[test]
    fn test_run_until_complete_timeout_and_stuck() {
        let executor = Executor::new();
        let promise = Promise::<u8>::new();
        assert_eq!(
            executor.run_until_complete(
                promise.future().unwrap(),
                Some(Duration::from_millis(20))
            ),
            Err(Error::Timeout(Duration::from_millis(20)))
        );

        let executor = Executor::new().with_max_idle_iterations(5);
        assert_eq!(
            executor.run_until_complete(future::pending::<u8>(), None),
            Err(Error::Stuck(5))
        );
    }

    #[test]
    fn test_timeout_future_is_rescheduled() {
        let executor = Executor::new();
        let result = executor.run_until_complete(
            future::pending::<u8>().with_timeout(Duration::from_millis(30)),
            None,
        );
        assert_eq!(result, Err(Error::Timeout(Duration::from_millis(30))));
    }

    #[test]
    fn test_run_stops() {
        let runtime = Runtime::new();
        runtime.run(Some(3));
        assert!(!runtime.executor().is_running());

        let handle = runtime.spawn(future::ready(1));
        let stopper = runtime.clone();
        let worker = thread::spawn(move || stopper.run(None));
        while handle.is_pending() {
            thread::yield_now();
        }
        runtime.stop();
        worker.join().unwrap();
        assert_eq!(handle.result(), Ok(1));
        assert!(std::ptr::eq(Runtime::global(), Runtime::global()));
    }
}
