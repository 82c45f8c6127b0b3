// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Thread pool executor
//!
//! A fixed set of worker threads, each owning a [`WorkStealingQueue`]. A
//! worker looks for work in this order:
//!
//! 1. the high-priority injector;
//! 2. its own local queue (LIFO);
//! 3. the local queues of its siblings, stealing from the FIFO end;
//! 4. the bounded global queue.
//!
//! Tasks run under `catch_unwind`, so a panicking task never takes its
//! worker down.
//!

use crate::{Error, error::panic_message};

use crossbeam::{
    deque::{Injector, Steal, Stealer, Worker},
    queue::ArrayQueue,
    utils::Backoff,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unit of work run by the executor.
pub struct Task {
    id: u64,
    name: String,
    func: Option<Box<dyn FnOnce() + Send>>,
    created_at: Instant,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
}

impl Task {
    /// Wraps `func`. Without a name the task is called `Task-{id}`.
    pub fn new<F>(func: F, name: Option<&str>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            name: name.map_or_else(|| format!("Task-{}", id), str::to_owned),
            func: Some(Box::new(func)),
            created_at: Instant::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// Time spent queued. `None` until the task starts.
    pub fn wait_time(&self) -> Option<Duration> {
        self.started_at.map(|started| started - self.created_at)
    }

    /// Time spent running. `None` until the task completes.
    pub fn execution_time(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Runs the task once. A panic is caught and returned as a message.
    pub fn run(&mut self) -> Result<(), String> {
        let Some(func) = self.func.take() else {
            return Err(format!("task {} already ran", self.name));
        };
        self.started_at = Some(Instant::now());
        let result = catch_unwind(AssertUnwindSafe(func));
        self.completed_at = Some(Instant::now());
        result.map_err(|payload| panic_message(payload.as_ref()))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Per-worker deque. The owner pushes and pops at the back, thieves take
/// from the front.
pub struct WorkStealingQueue {
    local: Mutex<Worker<Task>>,
    stealer: Stealer<Task>,
}

impl WorkStealingQueue {
    pub fn new() -> Self {
        let local = Worker::new_lifo();
        let stealer = local.stealer();
        Self {
            local: Mutex::new(local),
            stealer,
        }
    }

    pub fn push(&self, task: Task) {
        self.local.lock().push(task);
    }

    /// Owner side, most recent task first.
    pub fn pop(&self) -> Option<Task> {
        self.local.lock().pop()
    }

    /// Thief side, oldest task first.
    pub fn steal(&self) -> Option<Task> {
        loop {
            match self.stealer.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.stealer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stealer.is_empty()
    }
}

impl Default for WorkStealingQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Executor lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    Idle,
    Running,
    ShuttingDown,
    Terminated,
}

/// Queue selection for [`ThreadPoolExecutor::submit_with_priority`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Served before any local or global work.
    High,
    #[default]
    Normal,
    /// Served after local and stolen work.
    Low,
}

/// Executor configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub min_threads: usize,
    /// Upper bound on worker threads. The pool does not grow yet, the value
    /// is only validated.
    pub max_threads: usize,
    /// Capacity of the global queue.
    pub queue_size: usize,
    /// Route submissions to per-worker queues and let idle workers steal.
    pub enable_work_stealing: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_threads: 2,
            max_threads: 8,
            queue_size: 1000,
            enable_work_stealing: true,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_threads == 0 {
            return Err(Error::Config("min_threads must be at least 1".to_owned()));
        }
        if self.max_threads < self.min_threads {
            return Err(Error::Config(
                "max_threads must not be lower than min_threads".to_owned(),
            ));
        }
        if self.queue_size == 0 {
            return Err(Error::Config("queue_size must be greater than 0".to_owned()));
        }
        Ok(())
    }
}

/// Counters of one worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub tasks_executed: u64,
    pub tasks_stolen: u64,
    pub idle_time: Duration,
    pub active_time: Duration,
}

/// Snapshot of the executor counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub state: ExecutorState,
    pub active_threads: usize,
    pub queue_size: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_rejected: u64,
    pub tasks_stolen: u64,
    pub total_idle_time: Duration,
    pub total_active_time: Duration,
    pub work_stealing_enabled: bool,
    pub worker_stats: Vec<WorkerStats>,
}

struct Shared {
    config: ExecutorConfig,
    state: RwLock<ExecutorState>,
    locals: Vec<WorkStealingQueue>,
    global: ArrayQueue<Task>,
    high: Injector<Task>,
    stats: Vec<Mutex<WorkerStats>>,
    next_local: AtomicUsize,
    active_threads: AtomicUsize,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_rejected: AtomicU64,
    shutdown: CancellationToken,
    abort: AtomicBool,
}

impl Shared {
    fn queued(&self) -> usize {
        self.global.len()
            + self.high.len()
            + self.locals.iter().map(WorkStealingQueue::len).sum::<usize>()
    }

    fn next_task(&self, worker_id: usize) -> Option<(Task, bool)> {
        loop {
            match self.high.steal() {
                Steal::Success(task) => return Some((task, false)),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if let Some(task) = self.locals[worker_id].pop() {
            return Some((task, false));
        }

        if self.config.enable_work_stealing {
            let count = self.locals.len();
            for offset in 1..count {
                let victim = (worker_id + offset) % count;
                if let Some(task) = self.locals[victim].steal() {
                    return Some((task, true));
                }
            }
        }

        self.global.pop().map(|task| (task, false))
    }

    fn reject(&self, name: &str, reason: &str) -> bool {
        self.tasks_rejected.fetch_add(1, Ordering::Relaxed);
        warn!("Task {} rejected: {}.", name, reason);
        false
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!("Worker {} started.", worker_id);
    shared.active_threads.fetch_add(1, Ordering::Relaxed);
    let backoff = Backoff::new();

    while !shared.abort.load(Ordering::Acquire) {
        let idle_since = Instant::now();
        match shared.next_task(worker_id) {
            Some((mut task, stolen)) => {
                backoff.reset();
                if let Err(message) = task.run() {
                    error!("Task {} panicked: {}", task.name(), message);
                }
                shared.tasks_completed.fetch_add(1, Ordering::Relaxed);

                let mut stats = shared.stats[worker_id].lock();
                stats.tasks_executed += 1;
                if stolen {
                    stats.tasks_stolen += 1;
                }
                stats.active_time += task.execution_time().unwrap_or_default();
            }
            None => {
                if shared.shutdown.is_cancelled() {
                    break;
                }
                if backoff.is_completed() {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    backoff.snooze();
                }
                shared.stats[worker_id].lock().idle_time += idle_since.elapsed();
            }
        }
    }

    shared.active_threads.fetch_sub(1, Ordering::Relaxed);
    debug!("Worker {} finished.", worker_id);
}

/// Work-stealing thread pool.
pub struct ThreadPoolExecutor {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    /// Creates an idle executor. Call [`ThreadPoolExecutor::start`] to spawn
    /// the workers.
    pub fn new(config: ExecutorConfig) -> Result<Self, Error> {
        config.validate()?;
        let workers = config.min_threads;
        let shared = Shared {
            locals: (0..workers).map(|_| WorkStealingQueue::new()).collect(),
            global: ArrayQueue::new(config.queue_size),
            high: Injector::new(),
            stats: (0..workers)
                .map(|worker_id| {
                    Mutex::new(WorkerStats {
                        worker_id,
                        ..Default::default()
                    })
                })
                .collect(),
            config,
            state: RwLock::new(ExecutorState::Idle),
            next_local: AtomicUsize::new(0),
            active_threads: AtomicUsize::new(0),
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_rejected: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            abort: AtomicBool::new(false),
        };
        Ok(Self {
            shared: Arc::new(shared),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ExecutorState {
        *self.shared.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    /// Spawns the worker threads. Only valid from `Idle`.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write();
        if *state != ExecutorState::Idle {
            return Err(Error::InvalidState(format!(
                "executor cannot start from {:?}",
                *state
            )));
        }

        let mut handles = self.handles.lock();
        for worker_id in 0..self.shared.locals.len() {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", worker_id))
                .spawn(move || worker_loop(shared, worker_id))
                .map_err(|e| {
                    // Workers spawned so far must not outlive the failure.
                    self.shared.abort.store(true, Ordering::Release);
                    self.shared.shutdown.cancel();
                    Error::Start(e.to_string())
                })?;
            handles.push(handle);
        }
        *state = ExecutorState::Running;
        debug!("Executor started with {} workers.", handles.len());
        Ok(())
    }

    /// Submits a normal-priority task. Returns `false` when rejected.
    pub fn submit<F>(&self, func: F, name: Option<&str>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with_priority(func, name, TaskPriority::Normal)
    }

    /// Submits a task to the queue matching `priority`.
    pub fn submit_with_priority<F>(
        &self,
        func: F,
        name: Option<&str>,
        priority: TaskPriority,
    ) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new(func, name);
        let state = self.shared.state.read();
        if *state != ExecutorState::Running {
            return self.shared.reject(task.name(), "executor is not running");
        }

        match priority {
            TaskPriority::High => self.shared.high.push(task),
            TaskPriority::Normal if self.shared.config.enable_work_stealing => {
                let count = self.shared.locals.len();
                let index = self.shared.next_local.fetch_add(1, Ordering::Relaxed) % count;
                self.shared.locals[index].push(task);
            }
            TaskPriority::Normal | TaskPriority::Low => {
                if let Err(task) = self.shared.global.push(task) {
                    return self.shared.reject(task.name(), "global queue is full");
                }
            }
        }
        self.shared.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Stops the executor.
    ///
    /// With `wait`, workers drain every queued task before exiting and the
    /// caller waits for them up to `timeout`. Workers still busy past the
    /// deadline are detached. Without `wait`, workers exit once their
    /// current task returns and queued tasks are dropped.
    pub fn shutdown(&self, wait: bool, timeout: Option<Duration>) {
        {
            let mut state = self.shared.state.write();
            match *state {
                ExecutorState::Idle => {
                    *state = ExecutorState::Terminated;
                    return;
                }
                ExecutorState::Running => *state = ExecutorState::ShuttingDown,
                ExecutorState::ShuttingDown | ExecutorState::Terminated => return,
            }
        }
        debug!("Executor shutting down, wait: {}.", wait);

        if !wait {
            self.shared.abort.store(true, Ordering::Release);
        }
        self.shared.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let deadline = timeout.map(|t| Instant::now() + t);
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            while wait && !handle.is_finished() {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() || (wait && deadline.is_none()) {
                if handle.join().is_err() {
                    error!("A worker thread panicked.");
                }
            } else {
                debug!("Worker {:?} detached.", handle.thread().name());
            }
        }

        *self.shared.state.write() = ExecutorState::Terminated;
        debug!("Executor terminated.");
    }

    /// Tasks waiting in any queue.
    pub fn queue_size(&self) -> usize {
        self.shared.queued()
    }

    pub fn active_threads(&self) -> usize {
        self.shared.active_threads.load(Ordering::Relaxed)
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.shared
            .stats
            .iter()
            .map(|stats| stats.lock().clone())
            .collect()
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let worker_stats = self.worker_stats();
        ExecutorMetrics {
            state: self.state(),
            active_threads: self.active_threads(),
            queue_size: self.queue_size(),
            tasks_submitted: self.shared.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.shared.tasks_completed.load(Ordering::Relaxed),
            tasks_rejected: self.shared.tasks_rejected.load(Ordering::Relaxed),
            tasks_stolen: worker_stats.iter().map(|s| s.tasks_stolen).sum(),
            total_idle_time: worker_stats.iter().map(|s| s.idle_time).sum(),
            total_active_time: worker_stats.iter().map(|s| s.active_time).sum(),
            work_stealing_enabled: self.shared.config.enable_work_stealing,
            worker_stats,
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::Release);
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    fn started(config: ExecutorConfig) -> ThreadPoolExecutor {
        let executor = ThreadPoolExecutor::new(config).unwrap();
        executor.start().unwrap();
        executor
    }

    #[test]
    fn test_config_validation() {
        assert!(ExecutorConfig::default().validate().is_ok());
        let config = ExecutorConfig {
            min_threads: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = ExecutorConfig {
            min_threads: 4,
            max_threads: 2,
            ..Default::default()
        };
        assert!(ThreadPoolExecutor::new(config).is_err());
    }

    #[test]
    fn test_task_timings() {
        let mut task = Task::new(|| thread::sleep(Duration::from_millis(5)), None);
        assert_eq!(task.name(), format!("Task-{}", task.id()));
        assert!(task.wait_time().is_none());
        assert!(task.run().is_ok());
        assert!(task.execution_time().unwrap() >= Duration::from_millis(5));
        assert!(task.run().is_err());

        let mut task = Task::new(|| panic!("task blew up"), Some("bad"));
        assert_eq!(task.run(), Err("task blew up".to_owned()));
    }

    #[test]
    fn test_queue_ends() {
        let queue = WorkStealingQueue::new();
        for name in ["a", "b", "c"] {
            queue.push(Task::new(|| {}, Some(name)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().name(), "c");
        assert_eq!(queue.steal().unwrap().name(), "a");
        assert_eq!(queue.pop().unwrap().name(), "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_submit_requires_running() {
        let executor = ThreadPoolExecutor::new(ExecutorConfig::default()).unwrap();
        assert!(!executor.submit(|| {}, None));
        assert_eq!(executor.metrics().tasks_rejected, 1);

        executor.start().unwrap();
        assert!(executor.start().is_err());
        executor.shutdown(true, Some(Duration::from_secs(1)));
        assert_eq!(executor.state(), ExecutorState::Terminated);
        assert!(!executor.submit(|| {}, None));
        executor.shutdown(true, None);
    }

    #[test]
    fn test_runs_all_tasks() {
        let executor = started(ExecutorConfig::default());
        let (sender, receiver) = mpsc::channel();
        for i in 0..100 {
            let sender = sender.clone();
            assert!(executor.submit(move || sender.send(i).unwrap(), None));
        }
        let mut results: Vec<i32> = (0..100).map(|_| receiver.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, (0..100).collect::<Vec<_>>());
        executor.shutdown(true, Some(Duration::from_secs(1)));
        assert_eq!(executor.metrics().tasks_completed, 100);
    }

    #[test]
    fn test_panicking_task_keeps_worker() {
        let executor = started(ExecutorConfig {
            min_threads: 1,
            max_threads: 1,
            ..Default::default()
        });
        executor.submit(|| panic!("boom"), Some("bad"));
        let (sender, receiver) = mpsc::channel();
        executor.submit(move || sender.send(42).unwrap(), Some("good"));
        assert_eq!(receiver.recv_timeout(Duration::from_secs(2)), Ok(42));
        assert_eq!(executor.active_threads(), 1);
        executor.shutdown(true, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_global_queue_bound() {
        let executor = started(ExecutorConfig {
            min_threads: 1,
            max_threads: 1,
            queue_size: 2,
            enable_work_stealing: false,
        });
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel();
        executor.submit(
            move || {
                ready_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            },
            Some("blocker"),
        );
        ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(executor.submit(|| {}, None));
        assert!(executor.submit(|| {}, None));
        assert!(!executor.submit(|| {}, None));
        assert_eq!(executor.metrics().tasks_rejected, 1);

        gate_tx.send(()).unwrap();
        executor.shutdown(true, Some(Duration::from_secs(2)));
        assert_eq!(executor.metrics().tasks_completed, 3);
    }

    #[test]
    fn test_high_priority_first() {
        let executor = started(ExecutorConfig {
            min_threads: 1,
            max_threads: 1,
            ..Default::default()
        });
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel();
        executor.submit(
            move || {
                ready_tx.send(()).unwrap();
                let _ = gate_rx.recv();
            },
            None,
        );
        ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [
            ("low", TaskPriority::Low),
            ("normal", TaskPriority::Normal),
            ("high", TaskPriority::High),
        ] {
            let order = order.clone();
            executor.submit_with_priority(
                move || order.lock().push(label),
                None,
                priority,
            );
        }
        gate_tx.send(()).unwrap();
        executor.shutdown(true, Some(Duration::from_secs(2)));
        assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
    }

    #[test]
    fn test_shutdown_without_wait_drops_queue() {
        let executor = started(ExecutorConfig {
            min_threads: 1,
            max_threads: 1,
            ..Default::default()
        });
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel();
        executor.submit(
            move || {
                ready_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(Duration::from_millis(50));
            },
            None,
        );
        ready_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor.submit(move || flag.store(true, Ordering::SeqCst), None);

        executor.shutdown(false, None);
        drop(gate_tx);
        thread::sleep(Duration::from_millis(100));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(executor.state(), ExecutorState::Terminated);
    }
}
