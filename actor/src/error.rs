// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the actor runtime.
///
/// Rejections caused by capacity (a full bounded mailbox, a full executor
/// queue) are reported as `bool` returns wherever the operation allows it.
/// The variants below cover the remaining failures: programming errors such
/// as invalid state transitions or duplicate names, user failures returned
/// from `receive`, and configuration mistakes.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// A message was sent to an actor that has already been stopped.
    #[error("Actor {0} is stopped.")]
    ActorStopped(String),
    /// The bounded mailbox of the actor rejected the message.
    #[error("Mailbox of actor {0} is full.")]
    MailboxFull(String),
    /// An actor or a scheduled task with the same name already exists.
    #[error("Actor {0} exist.")]
    Exists(String),
    /// No actor with the given name is registered.
    #[error("Actor {0} not found.")]
    NotFound(String),
    /// The actor is not in the `Running` state.
    #[error("Actor {0} is not running.")]
    NotRunning(String),
    /// A state machine was asked for a transition it does not allow.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// The scheduler reached its actor ceiling.
    #[error("Max actors limit reached: {0}.")]
    Limit(usize),
    /// The executor refused a task.
    #[error("Failed to submit {0} to the executor.")]
    Submit(String),
    /// An error occurred while starting an actor.
    #[error("An error occurred while starting the actor: {0}")]
    Start(String),
    /// An error occurred while stopping an actor.
    #[error("An error occurred while stopping the actor: {0}")]
    Stop(String),
    /// An error occurred while restarting an actor.
    #[error("An error occurred while restarting the actor: {0}")]
    Restart(String),
    /// User code panicked.
    #[error("Panicked: {0}")]
    Panicked(String),
    /// Error that does not compromise the operation of the system.
    #[error("Error: {0}")]
    Functional(String),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::ActorStopped("counter".to_owned());
        assert_eq!(error.to_string(), "Actor counter is stopped.");
        let error = Error::Limit(10);
        assert_eq!(error.to_string(), "Max actors limit reached: 10.");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> =
            Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
