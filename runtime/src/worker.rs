// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Worker pool
//!
//! Fixed pool of OS threads for blocking work. [`Worker::spawn_on`] runs a
//! closure on a pool and exposes its outcome as a [`WorkerFuture`], which
//! the cooperative executor (or any std executor) can await.
//!

use crate::{
    Error,
    error::panic_message,
    future::{self, All},
    promise::{Promise, PromiseFuture},
};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

static GLOBAL_POOL: OnceLock<WorkerPool> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = parking_lot::const_mutex(());
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed set of threads pulling jobs from a shared queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
    active: Arc<AtomicUsize>,
    shutdown: AtomicBool,
}

impl WorkerPool {
    /// Starts `size` threads, or one per CPU when `size` is `None`.
    pub fn new(size: Option<usize>) -> Result<Self, Error> {
        let max_workers = size.unwrap_or_else(num_cpus::get).max(1);
        let (sender, receiver) = channel::unbounded::<Job>();
        let active = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::with_capacity(max_workers);
        for index in 0..max_workers {
            let jobs = receiver.clone();
            let active = active.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-pool-{}", index))
                .spawn(move || {
                    for job in jobs.iter() {
                        active.fetch_add(1, Ordering::AcqRel);
                        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                            error!(
                                "Pool job panicked: {}",
                                panic_message(payload.as_ref())
                            );
                        }
                        active.fetch_sub(1, Ordering::AcqRel);
                    }
                    debug!("Pool thread {} exiting.", index);
                })
                .map_err(|e| Error::Config(format!("cannot start pool thread: {}", e)))?;
            threads.push(handle);
        }
        debug!("Worker pool started with {} threads.", max_workers);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            threads: Mutex::new(threads),
            max_workers,
            active,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Process-wide pool, created with the default size on first use.
    pub fn get_global() -> Result<&'static WorkerPool, Error> {
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(pool);
        }
        let _init = GLOBAL_INIT.lock();
        if let Some(pool) = GLOBAL_POOL.get() {
            return Ok(pool);
        }
        let pool = WorkerPool::new(None)?;
        Ok(GLOBAL_POOL.get_or_init(|| pool))
    }

    /// Creates the global pool with `size` threads.
    ///
    /// Fails with [`Error::AlreadyInitialized`] once the global pool exists.
    pub fn configure_global(size: usize) -> Result<&'static WorkerPool, Error> {
        let _init = GLOBAL_INIT.lock();
        if GLOBAL_POOL.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let pool = WorkerPool::new(Some(size))?;
        Ok(GLOBAL_POOL.get_or_init(|| pool))
    }

    /// Queues `job`. Returns `false` after shutdown.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(Box::new(job)).is_ok(),
            None => {
                warn!("Job rejected, the worker pool is shut down.");
                false
            }
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Threads currently running a job.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Jobs waiting for a free thread.
    pub fn queued_count(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Closes the job queue. Queued jobs still run. With `wait`, blocks
    /// until every thread has exited.
    pub fn shutdown(&self, wait: bool) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.sender.lock().take();
            debug!("Worker pool shutting down.");
        }
        if !wait {
            return;
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Pool thread terminated abnormally.");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.max_workers)
            .field("active", &self.active_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// Future of a job submitted through [`Worker`].
pub type WorkerFuture<T> = PromiseFuture<T>;

/// Handle to a job submitted through [`Worker`].
pub struct WorkerHandle<T> {
    worker_id: u64,
    name: Option<String>,
    promise: Promise<T>,
    timeout: Option<Duration>,
    cancelled: CancellationToken,
    completed: Arc<AtomicBool>,
}

impl<T> WorkerHandle<T> {
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Cancels the job. A job not started yet is skipped, a running one
    /// will not resolve its future. Returns `false` if the job already
    /// finished or was cancelled before.
    pub fn cancel(&self) -> bool {
        if self.completed.load(Ordering::Acquire) || self.cancelled.is_cancelled() {
            return false;
        }
        self.cancelled.cancel();
        debug!("Worker {} cancelled.", self.worker_id);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// The job ran to the end and completed its future.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        self.promise.is_completed()
    }
}

impl<T> fmt::Debug for WorkerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Entry points for running blocking closures on a [`WorkerPool`].
pub struct Worker;

impl Worker {
    /// Runs `f` on `pool`.
    ///
    /// The timeout counts from submission: a job that starts late, or that
    /// overruns, rejects its future with [`Error::Timeout`].
    pub fn spawn_on<T, F>(
        pool: &WorkerPool,
        f: F,
        timeout: Option<Duration>,
        name: Option<&str>,
    ) -> Result<(WorkerFuture<T>, WorkerHandle<T>), Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let worker_id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let promise = Promise::new();
        let future = promise.future()?;
        let cancelled = CancellationToken::new();
        let completed = Arc::new(AtomicBool::new(false));

        let handle = WorkerHandle {
            worker_id,
            name: name.map(str::to_owned),
            promise: promise.clone(),
            timeout,
            cancelled: cancelled.clone(),
            completed: completed.clone(),
        };

        let label = name.map_or_else(|| format!("worker-{}", worker_id), str::to_owned);
        let submitted = Instant::now();
        let job = move || {
            if cancelled.is_cancelled() {
                debug!("{} cancelled before start, skipped.", label);
                return;
            }
            if let Some(timeout) = timeout {
                if submitted.elapsed() > timeout {
                    warn!("{} timed out before start.", label);
                    finish(&promise, &completed, Err(Error::Timeout(timeout)));
                    return;
                }
            }

            let result = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("{} panicked: {}", label, message);
                    Err(Error::Panicked(message))
                }
            };

            if cancelled.is_cancelled() {
                debug!("{} cancelled while running, result dropped.", label);
                return;
            }
            let result = match timeout {
                Some(timeout) if submitted.elapsed() > timeout => {
                    warn!("{} overran its timeout of {:?}.", label, timeout);
                    Err(Error::Timeout(timeout))
                }
                _ => result,
            };
            finish(&promise, &completed, result);
        };

        if !pool.submit(job) {
            return Err(Error::Closed);
        }
        Ok((future, handle))
    }

    /// Runs `f` on the global pool.
    pub fn spawn<T, F>(
        f: F,
        timeout: Option<Duration>,
        name: Option<&str>,
    ) -> Result<(WorkerFuture<T>, WorkerHandle<T>), Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        Self::spawn_on(WorkerPool::get_global()?, f, timeout, name)
    }

    /// Runs every closure on the global pool. The returned future yields
    /// the results in input order.
    pub fn spawn_all<T, F, I>(jobs: I) -> Result<All<WorkerFuture<T>>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Error> + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        let futures = jobs
            .into_iter()
            .map(|job| Self::spawn(job, None, None).map(|(future, _)| future))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(future::all(futures))
    }
}

fn finish<T>(promise: &Promise<T>, completed: &AtomicBool, result: Result<T, Error>) {
    completed.store(true, Ordering::Release);
    let completion = match result {
        Ok(value) => promise.resolve(value),
        Err(e) => promise.reject(e),
    };
    if completion.is_err() {
        debug!("Worker promise was already completed.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    #[test]
    fn test_pool_runs_jobs() {
        let pool = WorkerPool::new(Some(2)).unwrap();
        assert_eq!(pool.max_workers(), 2);

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            assert!(pool.submit(move || tx.send(i).unwrap()));
        }
        let mut received = rx.iter().take(10).collect::<Vec<_>>();
        received.sort();
        assert_eq!(received, (0..10).collect::<Vec<_>>());

        assert!(pool.submit(|| panic!("job panicked")));
        pool.shutdown(true);
        pool.shutdown(true);
        assert!(pool.is_shutdown());
        assert!(!pool.submit(|| {}));
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.queued_count(), 0);
    }

    #[test]
    fn test_spawn_on_outcomes() {
        let pool = WorkerPool::new(Some(2)).unwrap();

        let (future, handle) = Worker::spawn_on(&pool, || Ok(21 * 2), None, Some("answer"))
            .unwrap();
        assert_eq!(futures::executor::block_on(future), Ok(42));
        assert!(handle.is_completed());
        assert_eq!(handle.name(), Some("answer"));
        assert!(!handle.cancel());

        let (future, _) = Worker::spawn_on::<u8, _>(
            &pool,
            || Err(Error::Failed("bad input".to_owned())),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            futures::executor::block_on(future),
            Err(Error::Failed("bad input".to_owned()))
        );

        let (future, _) =
            Worker::spawn_on::<u8, _>(&pool, || panic!("worker blew up"), None, None).unwrap();
        assert_eq!(
            futures::executor::block_on(future),
            Err(Error::Panicked("worker blew up".to_owned()))
        );
    }

    #[test]
    fn test_spawn_on_timeouts() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let timeout = Duration::from_millis(20);

        let (overrun, _) = Worker::spawn_on(
            &pool,
            || {
                thread::sleep(Duration::from_millis(60));
                Ok(1)
            },
            Some(timeout),
            None,
        )
        .unwrap();
        // Queued behind the overrunning job, so it starts too late.
        let (late, late_handle) =
            Worker::spawn_on(&pool, || Ok(2), Some(timeout), None).unwrap();

        assert_eq!(
            futures::executor::block_on(overrun),
            Err(Error::Timeout(timeout))
        );
        assert_eq!(
            futures::executor::block_on(late),
            Err(Error::Timeout(timeout))
        );
        assert_eq!(late_handle.timeout(), Some(timeout));
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let pool = WorkerPool::new(Some(1)).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (_blocker, _) = Worker::spawn_on(
            &pool,
            move || {
                gate_rx.recv().ok();
                Ok(())
            },
            None,
            None,
        )
        .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (future, handle) = Worker::spawn_on(
            &pool,
            move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            None,
            None,
        )
        .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        gate_tx.send(()).unwrap();

        pool.shutdown(true);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!future.is_completed());
        assert!(!handle.is_resolved());
    }
}
