// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Delayed tasks
//!
//! [`DelayedTaskTimer`] runs callbacks after a delay on a single background
//! thread. Pending tasks sit in a min-heap ordered by deadline; cancelling a
//! task only flags it, and the timer thread discards it when it surfaces.
//!

use crate::{Error, error::panic_message};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Longest the timer thread sleeps between two checks.
const TICK: Duration = Duration::from_millis(10);

type Callback = Box<dyn FnOnce() + Send>;

/// A callback waiting for its deadline.
pub struct ScheduledTask {
    id: String,
    execute_at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: Callback,
}

impl ScheduledTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn execute_at(&self) -> Instant {
        self.execute_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed, so the std max-heap pops the earliest deadline.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .execute_at
            .cmp(&self.execute_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<ScheduledTask>,
    pending: HashMap<String, Arc<AtomicBool>>,
    running: bool,
    shutdown: bool,
}

struct TimerShared {
    name: String,
    queue: Mutex<TimerQueue>,
    signal: Condvar,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

/// Single-thread timer for delayed, cancellable callbacks.
pub struct DelayedTaskTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedTaskTimer {
    pub fn new(name: &str) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                name: name.to_owned(),
                queue: Mutex::new(TimerQueue::default()),
                signal: Condvar::new(),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Schedules `callback` to run once `delay` has elapsed.
    ///
    /// Without an id one is generated as `scheduled-{n}`. An id that is
    /// still pending is rejected with [`Error::Exists`].
    pub fn schedule<F>(
        &self,
        callback: F,
        delay: Duration,
        task_id: Option<String>,
    ) -> Result<String, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = task_id.unwrap_or_else(|| {
            format!(
                "scheduled-{}",
                self.shared.next_id.fetch_add(1, Ordering::Relaxed)
            )
        });

        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(Error::InvalidState(format!(
                "timer {} is shut down",
                self.shared.name
            )));
        }
        if queue.pending.contains_key(&id) {
            return Err(Error::Exists(id));
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        queue.pending.insert(id.clone(), cancelled.clone());
        queue.heap.push(ScheduledTask {
            id: id.clone(),
            execute_at: Instant::now() + delay,
            seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled,
            callback: Box::new(callback),
        });

        if !queue.running {
            self.spawn_thread()?;
            queue.running = true;
        }
        self.shared.signal.notify_one();
        debug!("Task {} scheduled in {:?}.", id, delay);
        Ok(id)
    }

    /// Cancels a pending task. Returns `false` for unknown, already fired
    /// or already cancelled ids.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut queue = self.shared.queue.lock();
        match queue.pending.remove(task_id) {
            Some(cancelled) => {
                cancelled.store(true, Ordering::Release);
                debug!("Task {} cancelled.", task_id);
                true
            }
            None => false,
        }
    }

    /// True while `task_id` waits for its deadline.
    pub fn is_pending(&self, task_id: &str) -> bool {
        self.shared.queue.lock().pending.contains_key(task_id)
    }

    /// Number of pending, non-cancelled tasks.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Stops the timer thread. Pending tasks are discarded.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.heap.clear();
            for (_, cancelled) in queue.pending.drain() {
                cancelled.store(true, Ordering::Release);
            }
            self.shared.signal.notify_all();
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id()
                && handle.join().is_err()
            {
                error!("Timer {} thread panicked.", self.shared.name);
            }
        }
        debug!("Timer {} stopped.", self.shared.name);
    }

    fn spawn_thread(&self) -> Result<(), Error> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("strand-timer-{}", self.shared.name))
            .spawn(move || timer_loop(shared))
            .map_err(|e| Error::Start(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }
}

impl Drop for DelayedTaskTimer {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        queue.heap.clear();
        self.shared.signal.notify_all();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    debug!("Timer {} thread started.", shared.name);
    loop {
        let mut due = Vec::new();
        {
            let mut queue = shared.queue.lock();
            if queue.shutdown {
                break;
            }
            let now = Instant::now();
            while let Some(next) = queue.heap.peek() {
                if next.execute_at > now {
                    break;
                }
                let Some(task) = queue.heap.pop() else {
                    break;
                };
                if task.is_cancelled() {
                    continue;
                }
                queue.pending.remove(&task.id);
                due.push(task);
            }

            if due.is_empty() {
                let wait = queue
                    .heap
                    .peek()
                    .map(|next| next.execute_at.saturating_duration_since(now))
                    .map_or(TICK, |until| until.min(TICK));
                shared.signal.wait_for(&mut queue, wait);
                continue;
            }
        }

        for task in due {
            let id = task.id;
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task.callback)) {
                error!(
                    "Scheduled task {} panicked: {}",
                    id,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
    debug!("Timer {} thread finished.", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = DelayedTaskTimer::new("order");
        let (sender, receiver) = mpsc::channel();
        for (label, delay) in [("late", 40), ("early", 10), ("middle", 25)] {
            let sender = sender.clone();
            timer
                .schedule(
                    move || sender.send(label).unwrap(),
                    Duration::from_millis(delay),
                    None,
                )
                .unwrap();
        }
        let fired: Vec<_> = (0..3)
            .map(|_| receiver.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(fired, vec!["early", "middle", "late"]);
        assert_eq!(timer.pending_count(), 0);
        timer.shutdown();
    }

    #[test]
    fn test_cancel() {
        let timer = DelayedTaskTimer::new("cancel");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = timer
            .schedule(
                move || flag.store(true, Ordering::SeqCst),
                Duration::from_millis(30),
                None,
            )
            .unwrap();
        assert!(id.starts_with("scheduled-"));
        assert!(timer.is_pending(&id));
        assert!(timer.cancel(&id));
        assert!(!timer.cancel(&id));
        assert!(!timer.cancel("unknown"));

        thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
        timer.shutdown();
    }

    #[test]
    fn test_duplicate_id() {
        let timer = DelayedTaskTimer::new("dup");
        timer
            .schedule(|| {}, Duration::from_secs(10), Some("job".to_owned()))
            .unwrap();
        assert_eq!(
            timer.schedule(|| {}, Duration::from_secs(10), Some("job".to_owned())),
            Err(Error::Exists("job".to_owned()))
        );
        assert!(timer.cancel("job"));
        assert!(
            timer
                .schedule(|| {}, Duration::from_secs(10), Some("job".to_owned()))
                .is_ok()
        );
        timer.shutdown();
    }

    #[test]
    fn test_panicking_callback() {
        let timer = DelayedTaskTimer::new("panic");
        let (sender, receiver) = mpsc::channel();
        timer
            .schedule(|| panic!("timer boom"), Duration::from_millis(1), None)
            .unwrap();
        timer
            .schedule(
                move || sender.send(()).unwrap(),
                Duration::from_millis(5),
                None,
            )
            .unwrap();
        assert!(receiver.recv_timeout(Duration::from_secs(2)).is_ok());
        timer.shutdown();
        assert!(timer.schedule(|| {}, Duration::ZERO, None).is_err());
    }
}
