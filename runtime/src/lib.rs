// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Strand Async Runtime
//!
//! Cooperative single-threaded runtime plus the primitives that connect it
//! to blocking code.
//!
//! ## Overview
//!
//! Every future in this crate is a [`std::future::Future`] whose output is
//! `Result<T, Error>`. The [`FutureExt`] combinators build on that shape,
//! and any std future with the same output can be spawned on an
//! [`Executor`]. The executor polls one task per [`Executor::step`]; a task
//! that returns `Pending` waits until its [`Waker`] fires.
//!
//! Blocking work runs on a [`WorkerPool`]. [`Worker::spawn`] returns a
//! future completed by the pool thread through a [`Promise`], so the
//! executor never blocks on it. [`Channel`] moves values between threads
//! with optional backpressure.
//!
//! ```
//! use runtime::{Error, FutureExt, Runtime, Worker, future};
//!
//! # fn main() -> Result<(), Error> {
//! let runtime = Runtime::new();
//! let (sum, _handle) = Worker::spawn(|| Ok((1..=10).sum::<u32>()), None, Some("sum"))?;
//! let doubled = runtime.block_on(sum.map(|total| total * 2))?;
//! assert_eq!(doubled, 110);
//!
//! let pair = runtime.block_on(future::join(future::ready(1), future::ready("one")))?;
//! assert_eq!(pair, (1, "one"));
//! # Ok(())
//! # }
//! ```
//!

mod channel;
mod error;
mod executor;
pub mod future;
mod promise;
mod task;
mod waker;
mod worker;

pub use channel::{Channel, Receiver, Sender};
pub use error::Error;
pub use executor::{DEFAULT_MAX_IDLE_ITERATIONS, Executor, Runtime, block_on};
pub use future::{BoxFuture, FutureExt};
pub use promise::{Promise, PromiseFuture, promise_from_callback};
pub use task::{Task, TaskHandle, TaskId, TaskState};
pub use waker::Waker;
pub use worker::{Worker, WorkerFuture, WorkerHandle, WorkerPool};
