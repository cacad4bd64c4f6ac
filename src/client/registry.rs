//! Connected clients
//!
//! `ClientInfo` is owned by the [`ClientRegistry`] and shared (via `Arc`) with
//! every registration the client has joined. The registry lock only guards the
//! map itself; the counters on each client are atomics.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::Serialize;

use super::channel::Channel;

pub struct ClientInfo {
    session_id: String,
    connected_at: DateTime<Utc>,
    messages_produced: AtomicU64,
    messages_consumed: AtomicU64,
    channel: Arc<dyn Channel>,
}

/// Point-in-time copy of a client's statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientSummary {
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
    pub messages_produced: u64,
    pub messages_consumed: u64,
}

impl ClientInfo {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            session_id: channel.session_id().to_string(),
            connected_at: Utc::now(),
            messages_produced: AtomicU64::new(0),
            messages_consumed: AtomicU64::new(0),
            channel,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn messages_produced(&self) -> u64 {
        self.messages_produced.load(Ordering::Relaxed)
    }

    pub fn messages_consumed(&self) -> u64 {
        self.messages_consumed.load(Ordering::Relaxed)
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub(crate) fn record_produced(&self) {
        self.messages_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consumed(&self) {
        self.messages_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            session_id: self.session_id.clone(),
            connected_at: self.connected_at,
            messages_produced: self.messages_produced(),
            messages_consumed: self.messages_consumed(),
        }
    }
}

impl std::fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInfo")
            .field("session_id", &self.session_id)
            .field("connected_at", &self.connected_at)
            .field("messages_produced", &self.messages_produced())
            .field("messages_consumed", &self.messages_consumed())
            .finish()
    }
}

/// Thread-safe map of session id to client.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<ClientInfo>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client for `channel`'s session, creating it on first sight.
    ///
    /// The boolean is `true` only for the call that inserted the client, so
    /// exactly one caller performs first-connection work per session.
    pub fn get_or_create(&self, channel: &Arc<dyn Channel>) -> (Arc<ClientInfo>, bool) {
        let session_id = channel.session_id();
        if let Some(client) = self.clients.read().get(session_id) {
            return (Arc::clone(client), false);
        }

        let clients = self.clients.upgradable_read();
        if let Some(client) = clients.get(session_id) {
            return (Arc::clone(client), false);
        }
        let mut clients = RwLockUpgradableReadGuard::upgrade(clients);
        let client = Arc::new(ClientInfo::new(Arc::clone(channel)));
        clients.insert(session_id.to_string(), Arc::clone(&client));
        (client, true)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ClientInfo>> {
        self.clients.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<ClientInfo>> {
        self.clients.write().remove(session_id)
    }

    pub fn list(&self) -> Vec<Arc<ClientInfo>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
