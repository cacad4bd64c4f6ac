//! Registration management
//!
//! A `RegistrationInfo` is the routing entry for one `(kind, name)` pair: who
//! produces it, who consumes it, and how many messages went through. Entries
//! live in a [`RegistrationTable`], one table per kind, so a queue and a topic
//! may share a name without conflict.
//!
//! Locking: the table's `RwLock` is held only long enough to fetch or insert
//! an entry. Membership (and the latest message) sit behind a `Mutex` owned by
//! the entry itself, taken after the table lock is released. No code path
//! holds two entry locks at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockUpgradableReadGuard};
use serde::Serialize;

use crate::broker::message::{Message, MessageKind, RegistrationIntent};
use crate::client::ClientInfo;

/// State guarded by the entry lock.
#[derive(Debug, Default)]
pub(crate) struct RegistrationState {
    pub(crate) producers: Vec<Arc<ClientInfo>>,
    pub(crate) consumers: Vec<Arc<ClientInfo>>,
    pub(crate) latest_message: Option<Message>,
}

impl RegistrationState {
    fn members_mut(&mut self, intent: RegistrationIntent) -> &mut Vec<Arc<ClientInfo>> {
        match intent {
            RegistrationIntent::Produce => &mut self.producers,
            RegistrationIntent::Consume => &mut self.consumers,
        }
    }

    pub(crate) fn is_consumer(&self, session_id: &str) -> bool {
        self.consumers.iter().any(|c| c.session_id() == session_id)
    }
}

#[derive(Debug)]
pub struct RegistrationInfo {
    kind: MessageKind,
    name: String,
    state: Mutex<RegistrationState>,
    messages_received: AtomicU64,
    messages_processed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationSummary {
    pub kind: MessageKind,
    pub name: String,
    pub producers: Vec<String>,
    pub consumers: Vec<String>,
    pub messages_received: u64,
    pub messages_processed: u64,
    pub latest_message_time: Option<DateTime<Utc>>,
}

impl RegistrationInfo {
    pub fn new(kind: MessageKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            state: Mutex::new(RegistrationState::default()),
            messages_received: AtomicU64::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the entry lock. Callers must not hold any other entry's lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistrationState> {
        self.state.lock()
    }

    /// Add `client` to the producer or consumer list. Returns `false` if it
    /// was already a member.
    pub fn join(&self, intent: RegistrationIntent, client: &Arc<ClientInfo>) -> bool {
        let mut state = self.lock();
        let members = state.members_mut(intent);
        if members.iter().any(|c| c.session_id() == client.session_id()) {
            return false;
        }
        members.push(Arc::clone(client));
        true
    }

    /// Remove a session from the producer or consumer list. Removing a
    /// non-member is a no-op and returns `false`.
    pub fn leave(&self, intent: RegistrationIntent, session_id: &str) -> bool {
        let mut state = self.lock();
        let members = state.members_mut(intent);
        match members.iter().position(|c| c.session_id() == session_id) {
            Some(index) => {
                members.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop a session from both lists.
    pub fn remove_client(&self, session_id: &str) {
        let mut state = self.lock();
        state.producers.retain(|c| c.session_id() != session_id);
        state.consumers.retain(|c| c.session_id() != session_id);
    }

    pub fn clear_members(&self) {
        let mut state = self.lock();
        state.producers.clear();
        state.consumers.clear();
    }

    pub fn is_member(&self, intent: RegistrationIntent, session_id: &str) -> bool {
        let state = self.lock();
        let members = match intent {
            RegistrationIntent::Produce => &state.producers,
            RegistrationIntent::Consume => &state.consumers,
        };
        members.iter().any(|c| c.session_id() == session_id)
    }

    pub fn producer_count(&self) -> usize {
        self.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn latest_message(&self) -> Option<Message> {
        self.lock().latest_message.clone()
    }

    /// Latest distributed message, visible only to current consumers.
    pub fn latest_message_for(&self, session_id: &str) -> Option<Message> {
        let state = self.lock();
        if state.is_consumer(session_id) {
            state.latest_message.clone()
        } else {
            None
        }
    }

    pub fn summary(&self) -> RegistrationSummary {
        let state = self.lock();
        RegistrationSummary {
            kind: self.kind,
            name: self.name.clone(),
            producers: state
                .producers
                .iter()
                .map(|c| c.session_id().to_string())
                .collect(),
            consumers: state
                .consumers
                .iter()
                .map(|c| c.session_id().to_string())
                .collect(),
            messages_received: self.messages_received(),
            messages_processed: self.messages_processed(),
            latest_message_time: state.latest_message.as_ref().map(|m| m.time),
        }
    }
}

/// Name to registration map for a single kind.
///
/// Names are matched case-insensitively; the spelling of the first
/// registration is kept for reporting.
#[derive(Debug)]
pub struct RegistrationTable {
    kind: MessageKind,
    entries: RwLock<HashMap<String, Arc<RegistrationInfo>>>,
}

fn table_key(name: &str) -> String {
    name.to_lowercase()
}

impl RegistrationTable {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn get_or_create(&self, name: &str) -> Arc<RegistrationInfo> {
        let key = table_key(name);
        if let Some(entry) = self.entries.read().get(&key) {
            return Arc::clone(entry);
        }

        let entries = self.entries.upgradable_read();
        if let Some(entry) = entries.get(&key) {
            return Arc::clone(entry);
        }
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let entry = Arc::new(RegistrationInfo::new(self.kind, name));
        entries.insert(key, Arc::clone(&entry));
        entry
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<RegistrationInfo>> {
        self.entries.read().get(&table_key(name)).cloned()
    }

    /// Snapshot of all entries, ordered by name.
    pub fn list(&self) -> Vec<Arc<RegistrationInfo>> {
        let mut entries: Vec<_> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove a session from every entry. The table read lock is held while
    /// each entry lock is taken in turn, never two entries at once.
    pub fn remove_client(&self, session_id: &str) {
        let entries = self.entries.read();
        for entry in entries.values() {
            entry.remove_client(session_id);
        }
    }

    pub fn clear_members(&self) {
        let entries = self.entries.read();
        for entry in entries.values() {
            entry.clear_members();
        }
    }
}
