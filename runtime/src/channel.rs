// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Channel
//!
//! Blocking multi-producer single-consumer channel. A bounded channel makes
//! senders wait while the buffer is full; an unbounded one never blocks a
//! sender. The channel closes when the receiver closes it (or is dropped)
//! or when the last sender is released.
//!

use crate::Error;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

struct State<T> {
    buffer: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
    sender_count: usize,
}

impl<T> State<T> {
    fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.buffer.len() >= capacity)
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Shared<T> {
    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// Channel constructors.
pub struct Channel;

impl Channel {
    /// Unbounded channel.
    pub fn new<T>() -> (Sender<T>, Receiver<T>) {
        Self::with_capacity(None)
    }

    pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
        Self::with_capacity(None)
    }

    /// Channel holding at most `capacity` messages. A capacity of zero is
    /// treated as one.
    pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
        Self::with_capacity(Some(capacity.max(1)))
    }

    fn with_capacity<T>(capacity: Option<usize>) -> (Sender<T>, Receiver<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: VecDeque::new(),
                capacity,
                closed: false,
                sender_count: 1,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        });
        (
            Sender {
                shared: shared.clone(),
                released: AtomicBool::new(false),
            },
            Receiver { shared },
        )
    }
}

/// Sending half. Clones count as separate senders.
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
    released: AtomicBool,
}

impl<T> Sender<T> {
    /// Sends `value`, waiting for room in a bounded channel.
    pub fn send(&self, value: T) -> Result<(), Error> {
        self.send_until(value, None)
    }

    /// Like [`Sender::send`], failing with [`Error::SendTimeout`] if no room
    /// frees up within `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), Error> {
        self.send_until(value, Some(Instant::now() + timeout))
    }

    fn send_until(&self, value: T, deadline: Option<Instant>) -> Result<(), Error> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            if !state.is_full() {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .not_full
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.is_full()
                        && !state.closed
                    {
                        return Err(Error::SendTimeout);
                    }
                }
                None => self.shared.not_full.wait(&mut state),
            }
        }
        state.buffer.push_back(value);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Sends without waiting. Returns `false` if the channel is full or
    /// closed.
    pub fn try_send(&self, value: T) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.shared.state.lock();
        if state.closed || state.is_full() {
            return false;
        }
        state.buffer.push_back(value);
        drop(state);
        self.shared.not_empty.notify_one();
        true
    }

    /// Releases this sender. The channel closes when the last sender is
    /// released.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.shared.state.lock();
        state.sender_count = state.sender_count.saturating_sub(1);
        if state.sender_count == 0 {
            drop(state);
            debug!("Last sender released, closing channel.");
            self.shared.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.state.lock().sender_count += 1;
        Self {
            shared: self.shared.clone(),
            released: AtomicBool::new(false),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half. There is exactly one per channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Waits for the next message. Returns `None` once the channel is
    /// closed and drained.
    pub fn receive(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.buffer.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    pub fn try_receive(&self) -> Option<T> {
        let value = self.shared.state.lock().buffer.pop_front();
        if value.is_some() {
            self.shared.not_full.notify_one();
        }
        value
    }

    /// Like [`Receiver::receive`], failing with [`Error::RecvTimeout`] if
    /// nothing arrives within `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<T>, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = state.buffer.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(Some(value));
            }
            if state.closed {
                return Ok(None);
            }
            if self
                .shared
                .not_empty
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.buffer.is_empty()
                && !state.closed
            {
                return Err(Error::RecvTimeout);
            }
        }
    }

    /// Closes the channel for senders. Buffered messages stay readable.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

impl<T> Iterator for Receiver<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receive()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    #[test]
    fn test_send_and_receive_in_order() {
        let (sender, receiver) = Channel::new();
        for i in 1..=3 {
            sender.send(i).unwrap();
        }
        assert_eq!(receiver.len(), 3);
        drop(sender);
        assert!(receiver.is_closed());
        assert_eq!(receiver.collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_bounded_backpressure() {
        let (sender, receiver) = Channel::bounded(1);
        sender.send(1).unwrap();
        assert!(!sender.try_send(2));
        assert_eq!(
            sender.send_timeout(2, Duration::from_millis(20)),
            Err(Error::SendTimeout)
        );

        let producer = thread::spawn(move || {
            sender.send(2).unwrap();
            sender.send(3).unwrap();
        });
        assert_eq!(receiver.receive(), Some(1));
        assert_eq!(receiver.receive(), Some(2));
        assert_eq!(receiver.receive(), Some(3));
        producer.join().unwrap();
        assert_eq!(receiver.receive(), None);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let (sender, receiver) = Channel::bounded(0);
        assert!(sender.try_send("a"));
        assert!(!sender.try_send("b"));
        assert_eq!(receiver.try_receive(), Some("a"));
        assert_eq!(receiver.try_receive(), None);
    }

    #[test]
    fn test_closing() {
        let (sender, receiver) = Channel::unbounded();
        let second = sender.clone();
        sender.send(1).unwrap();
        sender.close();
        assert_eq!(sender.send(2), Err(Error::Closed));
        assert!(!second.is_closed());
        second.send(3).unwrap();

        receiver.close();
        assert!(second.is_closed());
        assert_eq!(second.send(4), Err(Error::Closed));
        assert!(!second.try_send(4));
        assert_eq!(receiver.receive(), Some(1));
        assert_eq!(receiver.receive(), Some(3));
        assert_eq!(receiver.receive(), None);
        assert_eq!(receiver.receive_timeout(Duration::from_millis(5)), Ok(None));
    }

    #[test]
    fn test_closes_after_last_sender() {
        let (sender, receiver) = Channel::unbounded::<()>();
        let first = sender.clone();
        let second = sender.clone();

        sender.close();
        assert!(!receiver.is_closed());
        first.close();
        assert!(!receiver.is_closed());
        first.close();
        assert!(!second.is_closed());

        second.close();
        assert!(receiver.is_closed());
        assert_eq!(receiver.receive(), None);
    }

    #[test]
    fn test_receive_timeout() {
        let (sender, receiver) = Channel::unbounded::<u8>();
        assert_eq!(
            receiver.receive_timeout(Duration::from_millis(10)),
            Err(Error::RecvTimeout)
        );
        sender.send(8).unwrap();
        assert_eq!(receiver.receive_timeout(Duration::from_millis(10)), Ok(Some(8)));
        assert!(receiver.is_empty());

        drop(receiver);
        assert_eq!(sender.send(9), Err(Error::Closed));
    }
}
