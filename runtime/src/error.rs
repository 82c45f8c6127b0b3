// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::time::Duration;

/// Error type for the async runtime, channels and worker pool.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Operation not allowed in the current state, such as resolving a
    /// promise twice or polling a finished task.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    /// The deadline elapsed before the operation completed.
    #[error("Timed out after {0:?}.")]
    Timeout(Duration),
    /// The executor ran out of work while the awaited task was still pending.
    #[error("Future appears to be stuck after {0} idle iterations.")]
    Stuck(usize),
    /// The task was cancelled.
    #[error("Task was cancelled.")]
    Cancelled,
    /// User code panicked.
    #[error("Panicked: {0}")]
    Panicked(String),
    /// Failure reported by user code.
    #[error("Error: {0}")]
    Failed(String),
    /// The channel is closed.
    #[error("Channel is closed.")]
    Closed,
    #[error("Send operation timed out.")]
    SendTimeout,
    #[error("Receive operation timed out.")]
    RecvTimeout,
    /// The global worker pool already exists.
    #[error("Global worker pool is already initialized.")]
    AlreadyInitialized,
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
