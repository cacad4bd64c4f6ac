//! Transport boundary
//!
//! The broker never talks to a socket. Each connected client is represented by
//! a [`Channel`] supplied by the transport: it can push a message to the remote
//! end, be closed, and report faults/closure to a single attached
//! [`ChannelListener`]. The broker attaches its listener when a client first
//! registers and detaches it when the client is disconnected.
//!
//! [`LocalChannel`] is the in-process implementation used by hosts that embed
//! the broker directly, and by the tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::broker::message::Message;
use crate::utils::error::ChannelError;

/// Callbacks a transport fires when a channel stops being usable.
pub trait ChannelListener: Send + Sync {
    fn on_faulted(&self, session_id: &str);
    fn on_closing(&self, session_id: &str);
}

pub trait Channel: Send + Sync {
    /// Stable identity of the connection, supplied by the transport.
    fn session_id(&self) -> &str;

    /// Hand a message to the remote end. Must not block on the consumer.
    fn send(&self, message: &Message) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;

    /// Close the channel. Fires `on_closing` on the attached listener the
    /// first time it is called on an open channel.
    fn close(&self);

    /// Attach the listener notified on fault/closure, replacing any previous one.
    fn attach(&self, listener: Arc<dyn ChannelListener>);

    fn detach(&self);
}

/// In-process channel backed by an unbounded tokio mpsc.
pub struct LocalChannel {
    session_id: String,
    sender: UnboundedSender<Message>,
    open: AtomicBool,
    listener: Mutex<Option<Arc<dyn ChannelListener>>>,
}

/// Receiving half of a [`LocalChannel`].
#[derive(Debug)]
pub struct Inbox {
    receiver: UnboundedReceiver<Message>,
}

impl LocalChannel {
    /// Create a channel with a generated `client-<uuid>` session id.
    pub fn new() -> (Arc<Self>, Inbox) {
        Self::with_session(format!("client-{}", Uuid::new_v4()))
    }

    pub fn with_session(session_id: impl Into<String>) -> (Arc<Self>, Inbox) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            session_id: session_id.into(),
            sender,
            open: AtomicBool::new(true),
            listener: Mutex::new(None),
        });
        (channel, Inbox { receiver })
    }

    /// Simulate the transport reporting a broken connection.
    pub fn fault(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener() {
                listener.on_faulted(&self.session_id);
            }
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    // Clone out so callbacks run without the slot locked.
    fn listener(&self) -> Option<Arc<dyn ChannelListener>> {
        self.listener.lock().clone()
    }
}

impl Channel for LocalChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn send(&self, message: &Message) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.session_id.clone()));
        }
        // Listener is not fired here: the dispatcher still holds the
        // registration lock and closes failed channels afterwards.
        self.sender
            .send(message.clone())
            .map_err(|_| ChannelError::Faulted {
                session: self.session_id.clone(),
                reason: "receiver dropped".to_string(),
            })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(listener) = self.listener() {
                listener.on_closing(&self.session_id);
            }
        }
    }

    fn attach(&self, listener: Arc<dyn ChannelListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn detach(&self) {
        self.listener.lock().take();
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel")
            .field("session_id", &self.session_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Inbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Everything delivered so far, in delivery order.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            out.push(message);
        }
        out
    }
}
