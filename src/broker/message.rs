//! Message and registration request definitions
//!
//! `Message` is the unit the broker routes. The broker never looks inside
//! `content`; `format` is a free-form hint for consumers (for example a MIME
//! type or an application-defined payload marker).
//!
//! Notes on fields:
//! - `time`: UTC instant the producer stamped on the message
//! - `kind`: `Topic` for broadcast delivery, `Queue` for single-consumer delivery
//! - `name`: the topic or queue the message is routed to
//! - `content`: opaque payload bytes

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::error::BusError;

/// Routing kind of a message or registration.
///
/// Values decoded by a transport that match neither known kind land in
/// `Unknown` and are rejected by every broker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Topic,
    Queue,
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Returns `self` if the broker can route this kind.
    pub fn supported(self) -> Result<Self, BusError> {
        match self {
            MessageKind::Topic | MessageKind::Queue => Ok(self),
            MessageKind::Unknown => Err(BusError::UnsupportedKind(self)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Topic => f.write_str("Topic"),
            MessageKind::Queue => f.write_str("Queue"),
            MessageKind::Unknown => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub time: DateTime<Utc>,
    pub kind: MessageKind,
    pub name: String,
    pub format: String,
    pub content: Vec<u8>,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(
        kind: MessageKind,
        name: impl Into<String>,
        format: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        Self {
            time: Utc::now(),
            kind,
            name: name.into(),
            format: format.into(),
            content,
        }
    }

    pub fn topic(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self::new(MessageKind::Topic, name, "", content)
    }

    pub fn queue(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self::new(MessageKind::Queue, name, "", content)
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }
}

/// Whether a client registers to send or to receive messages of a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationIntent {
    Produce,
    Consume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub intent: RegistrationIntent,
    pub kind: MessageKind,
    pub name: String,
}

impl RegistrationRequest {
    pub fn new(intent: RegistrationIntent, kind: MessageKind, name: impl Into<String>) -> Self {
        Self {
            intent,
            kind,
            name: name.into(),
        }
    }

    pub fn consume_topic(name: impl Into<String>) -> Self {
        Self::new(RegistrationIntent::Consume, MessageKind::Topic, name)
    }

    pub fn produce_topic(name: impl Into<String>) -> Self {
        Self::new(RegistrationIntent::Produce, MessageKind::Topic, name)
    }

    pub fn consume_queue(name: impl Into<String>) -> Self {
        Self::new(RegistrationIntent::Consume, MessageKind::Queue, name)
    }

    pub fn produce_queue(name: impl Into<String>) -> Self {
        Self::new(RegistrationIntent::Produce, MessageKind::Queue, name)
    }
}
