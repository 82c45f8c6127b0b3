// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Mailboxes
//!
//! A mailbox is the ordered queue that sits in front of every actor. Three
//! variants share the [`Mailbox`] contract:
//!
//! - [`UnboundedMailbox`]: always accepts. Memory grows with the backlog.
//! - [`BoundedMailbox`]: rejects once `size() == capacity` and counts the
//!   rejection. This is the only backpressure point at the mailbox layer, so
//!   producers must look at the `bool` returned by `enqueue`.
//! - [`PriorityMailbox`]: dequeues the lowest `(priority, insertion_seq)`
//!   pair first. Equal priorities keep arrival order.
//!
//! Every variant guards its queue with a mutex and can be shared freely
//! between threads.

use crate::Error;

use parking_lot::Mutex;
use tracing::warn;

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Priority given to every message when no priority function is supplied.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Capacity used by [`MailboxType::bounded_default`].
pub const DEFAULT_CAPACITY: usize = 1000;

/// Pure function that assigns a priority to a message. Lower values are
/// dequeued first.
pub type PriorityFn<M> = Arc<dyn Fn(&M) -> i64 + Send + Sync>;

/// Queue contract shared by every mailbox variant.
pub trait Mailbox<M>: Send + Sync {
    /// Tries to add a message. Returns `false` when the mailbox refuses it.
    fn enqueue(&self, message: M) -> bool;

    /// Removes the next message, if any.
    fn dequeue(&self) -> Option<M>;

    /// Number of queued messages.
    fn size(&self) -> usize;

    /// True if no message is queued.
    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of messages accepted over the mailbox lifetime.
    fn message_count(&self) -> u64;

    /// Number of messages refused over the mailbox lifetime.
    fn rejected_count(&self) -> u64 {
        0
    }
}

/// FIFO mailbox without a size limit.
pub struct UnboundedMailbox<M> {
    queue: Mutex<VecDeque<M>>,
    message_count: AtomicU64,
}

impl<M> UnboundedMailbox<M> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            message_count: AtomicU64::new(0),
        }
    }
}

impl<M> Default for UnboundedMailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send> Mailbox<M> for UnboundedMailbox<M> {
    fn enqueue(&self, message: M) -> bool {
        self.queue.lock().push_back(message);
        self.message_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn dequeue(&self) -> Option<M> {
        self.queue.lock().pop_front()
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }
}

/// FIFO mailbox with a fixed capacity.
pub struct BoundedMailbox<M> {
    capacity: usize,
    queue: Mutex<VecDeque<M>>,
    message_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl<M> BoundedMailbox<M> {
    /// Creates a bounded mailbox. The capacity must be positive.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::Config(
                "Mailbox capacity must be positive, got 0".to_owned(),
            ));
        }
        Ok(Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            message_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        })
    }

    /// Maximum number of queued messages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when the next enqueue would be rejected.
    pub fn is_full(&self) -> bool {
        self.queue.lock().len() >= self.capacity
    }
}

impl<M: Send> Mailbox<M> for BoundedMailbox<M> {
    fn enqueue(&self, message: M) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            let rejected = self.rejected_count.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Bounded mailbox full (capacity {}), message rejected ({} so far).",
                self.capacity, rejected
            );
            return false;
        }
        queue.push_back(message);
        self.message_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn dequeue(&self) -> Option<M> {
        self.queue.lock().pop_front()
    }

    fn size(&self) -> usize {
        self.queue.lock().len()
    }

    fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }
}

/// Heap entry. The ordering is reversed so that `BinaryHeap`, a max-heap,
/// pops the smallest `(priority, seq)` pair.
struct Prioritized<M> {
    priority: i64,
    seq: u64,
    message: M,
}

impl<M> PartialEq for Prioritized<M> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<M> Eq for Prioritized<M> {}

impl<M> PartialOrd for Prioritized<M> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Prioritized<M> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct PriorityQueue<M> {
    heap: BinaryHeap<Prioritized<M>>,
    // Monotonic, never reset. It is the tie-breaker for equal priorities.
    next_seq: u64,
}

/// Mailbox ordered by a user supplied priority function.
pub struct PriorityMailbox<M> {
    queue: Mutex<PriorityQueue<M>>,
    priority_fn: PriorityFn<M>,
    message_count: AtomicU64,
}

impl<M> PriorityMailbox<M> {
    /// Creates a priority mailbox that ranks messages with `priority_fn`.
    pub fn new<F>(priority_fn: F) -> Self
    where
        F: Fn(&M) -> i64 + Send + Sync + 'static,
    {
        Self::from_fn(Arc::new(priority_fn))
    }

    /// Creates a priority mailbox from a shared priority function.
    pub fn from_fn(priority_fn: PriorityFn<M>) -> Self {
        Self {
            queue: Mutex::new(PriorityQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            priority_fn,
            message_count: AtomicU64::new(0),
        }
    }
}

impl<M: 'static> PriorityMailbox<M> {
    /// Creates a priority mailbox where every message has
    /// [`DEFAULT_PRIORITY`], which degrades to FIFO order.
    pub fn with_default_priority() -> Self {
        Self::new(|_| DEFAULT_PRIORITY)
    }
}

impl<M: Send> Mailbox<M> for PriorityMailbox<M> {
    fn enqueue(&self, message: M) -> bool {
        let priority = (self.priority_fn)(&message);
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Prioritized {
            priority,
            seq,
            message,
        });
        self.message_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn dequeue(&self) -> Option<M> {
        self.queue.lock().heap.pop().map(|entry| entry.message)
    }

    fn size(&self) -> usize {
        self.queue.lock().heap.len()
    }

    fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }
}

/// Mailbox selection used by the factory and by spawn options.
pub enum MailboxType<M> {
    /// See [`UnboundedMailbox`].
    Unbounded,
    /// See [`BoundedMailbox`].
    Bounded(usize),
    /// See [`PriorityMailbox`].
    Priority(PriorityFn<M>),
}

impl<M> MailboxType<M> {
    /// Bounded mailbox with [`DEFAULT_CAPACITY`].
    pub fn bounded_default() -> Self {
        MailboxType::Bounded(DEFAULT_CAPACITY)
    }

    /// Priority mailbox built from a closure.
    pub fn priority<F>(priority_fn: F) -> Self
    where
        F: Fn(&M) -> i64 + Send + Sync + 'static,
    {
        MailboxType::Priority(Arc::new(priority_fn))
    }
}

impl<M> Default for MailboxType<M> {
    fn default() -> Self {
        MailboxType::Unbounded
    }
}

impl<M> Clone for MailboxType<M> {
    fn clone(&self) -> Self {
        match self {
            MailboxType::Unbounded => MailboxType::Unbounded,
            MailboxType::Bounded(capacity) => MailboxType::Bounded(*capacity),
            MailboxType::Priority(priority_fn) => {
                MailboxType::Priority(priority_fn.clone())
            }
        }
    }
}

impl<M> fmt::Debug for MailboxType<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxType::Unbounded => write!(f, "Unbounded"),
            MailboxType::Bounded(capacity) => write!(f, "Bounded({})", capacity),
            MailboxType::Priority(_) => write!(f, "Priority"),
        }
    }
}

/// Builds the mailbox described by `kind`.
pub fn create_mailbox<M>(kind: MailboxType<M>) -> Result<Arc<dyn Mailbox<M>>, Error>
where
    M: Send + 'static,
{
    Ok(match kind {
        MailboxType::Unbounded => Arc::new(UnboundedMailbox::new()),
        MailboxType::Bounded(capacity) => Arc::new(BoundedMailbox::new(capacity)?),
        MailboxType::Priority(priority_fn) => {
            Arc::new(PriorityMailbox::from_fn(priority_fn))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_unbounded_fifo() {
        let mailbox = UnboundedMailbox::new();
        assert!(mailbox.is_empty());
        for i in 0..100 {
            assert!(mailbox.enqueue(i));
        }
        assert_eq!(mailbox.size(), 100);
        assert_eq!(mailbox.message_count(), 100);
        for i in 0..100 {
            assert_eq!(mailbox.dequeue(), Some(i));
        }
        assert_eq!(mailbox.dequeue(), None);
        assert_eq!(mailbox.message_count(), 100);
        assert_eq!(mailbox.rejected_count(), 0);
    }

    #[test]
    fn test_bounded_rejects_when_full() {
        let mailbox = BoundedMailbox::new(3).unwrap();
        assert_eq!(mailbox.capacity(), 3);
        assert!(mailbox.enqueue("a"));
        assert!(mailbox.enqueue("b"));
        assert!(mailbox.enqueue("c"));
        assert!(mailbox.is_full());

        assert!(!mailbox.enqueue("d"));
        assert_eq!(mailbox.rejected_count(), 1);
        assert_eq!(mailbox.size(), 3);
        assert_eq!(mailbox.message_count(), 3);

        assert_eq!(mailbox.dequeue(), Some("a"));
        assert!(!mailbox.is_full());
        assert!(mailbox.enqueue("e"));
        assert_eq!(mailbox.rejected_count(), 1);
    }

    #[test]
    fn test_bounded_zero_capacity() {
        let result = BoundedMailbox::<u8>::new(0);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_priority_order_is_stable() {
        let mailbox = PriorityMailbox::new(|msg: &(i64, &'static str)| msg.0);
        mailbox.enqueue((5, "first-5"));
        mailbox.enqueue((1, "first-1"));
        mailbox.enqueue((5, "second-5"));
        mailbox.enqueue((1, "second-1"));

        let order: Vec<_> =
            std::iter::from_fn(|| mailbox.dequeue()).map(|m| m.1).collect();
        assert_eq!(order, vec!["first-1", "second-1", "first-5", "second-5"]);
    }

    #[test]
    fn test_priority_default_is_fifo() {
        let mailbox = PriorityMailbox::with_default_priority();
        for i in 0..10 {
            mailbox.enqueue(i);
        }
        for i in 0..10 {
            assert_eq!(mailbox.dequeue(), Some(i));
        }
    }

    #[test]
    fn test_create_mailbox() {
        let unbounded = create_mailbox::<u32>(MailboxType::Unbounded).unwrap();
        assert!(unbounded.enqueue(1));

        let bounded = create_mailbox::<u32>(MailboxType::Bounded(1)).unwrap();
        assert!(bounded.enqueue(1));
        assert!(!bounded.enqueue(2));
        assert_eq!(bounded.rejected_count(), 1);

        let priority =
            create_mailbox(MailboxType::priority(|m: &u32| -(*m as i64))).unwrap();
        priority.enqueue(1);
        priority.enqueue(7);
        assert_eq!(priority.dequeue(), Some(7));

        assert!(create_mailbox::<u32>(MailboxType::Bounded(0)).is_err());
    }

    #[test]
    fn test_concurrent_producers() {
        let mailbox = Arc::new(UnboundedMailbox::new());
        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let mailbox = mailbox.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        mailbox.enqueue((producer, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mailbox.size(), 1000);

        // Per-producer FIFO survives the interleaving.
        let mut last = [None::<i32>; 4];
        while let Some((producer, i)) = mailbox.dequeue() {
            if let Some(previous) = last[producer] {
                assert!(i > previous);
            }
            last[producer] = Some(i);
        }
    }
}
