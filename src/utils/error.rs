//! The `error` module defines the error types shared across the crate.
//!
//! Only synchronous validation failures are ever returned to callers of the
//! broker. Delivery failures stay inside the dispatcher and are reported
//! through logging and the fault channel.

use config::ConfigError;
use thiserror::Error;

use crate::broker::message::MessageKind;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("message kind '{0}' is not supported by this operation")]
    UnsupportedKind(MessageKind),

    #[error("no tokio runtime available to host the dispatcher")]
    NoRuntime,

    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Failure reported by a transport channel when a message cannot be handed over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel for session {0} is closed")]
    Closed(String),

    #[error("channel for session {session} faulted: {reason}")]
    Faulted { session: String, reason: String },
}
