//! Broker engine
//!
//! `Broker` is the operation surface of the bus. It owns:
//! - the client registry (one entry per connected session)
//! - two registration tables, one for queues and one for topics
//! - the dispatcher that performs all delivery
//!
//! Concurrency and usage notes:
//! - Every method takes `&self` and is safe to call from any thread; share the
//!   broker behind an `Arc`.
//! - `publish` validates and enqueues, then returns. Delivery outcomes are never
//!   reported back to the producer.
//! - The client registry and the two tables each have their own `RwLock`, so
//!   lookups in one never wait on another. Membership changes take only the
//!   lock of the registration involved.
//! - A client is disconnected when its channel reports a fault or closure, or
//!   when the broker is stopped. Disconnecting removes it from the registry and
//!   from every registration of both kinds.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::broker::dispatcher::{
    DispatchFault, Dispatcher, DispatcherConfig, DispatcherStats, ProcessingMode, PublishContext,
};
use crate::broker::message::{Message, MessageKind, RegistrationIntent, RegistrationRequest};
use crate::broker::registration::{RegistrationInfo, RegistrationSummary, RegistrationTable};
use crate::client::{Channel, ChannelListener, ClientInfo, ClientRegistry, ClientSummary};
use crate::config::BrokerSettings;
use crate::utils::error::BusError;

#[derive(Debug)]
struct BrokerCore {
    clients: ClientRegistry,
    queues: RegistrationTable,
    topics: RegistrationTable,
    dispatcher: Dispatcher,
}

/// Listener attached to every client channel; routes transport notifications
/// back to the broker without keeping it alive.
struct DisconnectHook {
    core: Weak<BrokerCore>,
}

impl ChannelListener for DisconnectHook {
    fn on_faulted(&self, session_id: &str) {
        if let Some(core) = self.core.upgrade() {
            debug!(session = session_id, "channel faulted");
            core.disconnect_client(session_id);
        }
    }

    fn on_closing(&self, session_id: &str) {
        if let Some(core) = self.core.upgrade() {
            debug!(session = session_id, "channel closing");
            core.disconnect_client(session_id);
        }
    }
}

#[derive(Debug)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl Broker {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                clients: ClientRegistry::new(),
                queues: RegistrationTable::new(MessageKind::Queue),
                topics: RegistrationTable::new(MessageKind::Topic),
                dispatcher: Dispatcher::new(config),
            }),
        }
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(DispatcherConfig::from(settings))
    }

    /// Start the dispatcher workers on the current tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        self.core.dispatcher.start()?;
        info!("service bus started");
        Ok(())
    }

    /// Tear everything down: stop delivery, disconnect (and close) every
    /// client and empty every registration.
    pub fn stop(&self) {
        self.core.dispatcher.stop();
        for session_id in self.core.clients.session_ids() {
            self.core.disconnect_client(&session_id);
        }
        self.core.queues.clear_members();
        self.core.topics.clear_members();
        info!("service bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.core.dispatcher.is_running()
    }

    /// Join the channel's session to the producers or consumers of a queue or
    /// topic, creating the client and the registration as needed. Repeating
    /// a registration is a no-op.
    pub fn register(
        &self,
        request: &RegistrationRequest,
        channel: Arc<dyn Channel>,
    ) -> Result<(), BusError> {
        let table = self.core.table(request.kind)?;

        let (client, created) = self.core.clients.get_or_create(&channel);
        if created {
            let hook = DisconnectHook {
                core: Arc::downgrade(&self.core),
            };
            client.channel().attach(Arc::new(hook));
            info!(session = client.session_id(), "client connected");
        }

        let registration = table.get_or_create(&request.name);
        let joined = registration.join(request.intent, &client);

        // Lost a race with a disconnect of the same session.
        let still_connected = self
            .core
            .clients
            .get(client.session_id())
            .is_some_and(|current| Arc::ptr_eq(&current, &client));
        if !still_connected {
            registration.remove_client(client.session_id());
            return Ok(());
        }
        debug!(
            session = client.session_id(),
            kind = %request.kind,
            name = %request.name,
            intent = ?request.intent,
            joined,
            "register"
        );

        // Retained queue messages can go out right away.
        if joined && request.intent == RegistrationIntent::Consume {
            self.core.dispatcher.notify();
        }
        Ok(())
    }

    /// Leave the producer or consumer list of a registration. Unknown names,
    /// unknown sessions and non-members are ignored.
    pub fn unregister(
        &self,
        request: &RegistrationRequest,
        session_id: &str,
    ) -> Result<(), BusError> {
        let table = self.core.table(request.kind)?;
        if let Some(registration) = table.try_get(&request.name) {
            let left = registration.leave(request.intent, session_id);
            debug!(
                session = session_id,
                kind = %request.kind,
                name = %request.name,
                intent = ?request.intent,
                left,
                "unregister"
            );
        }
        Ok(())
    }

    /// Validate and enqueue a message for distribution.
    ///
    /// Fails only for an unsupported kind. A message whose name was never
    /// registered has nowhere to go and is dropped.
    pub fn publish(&self, message: Message, session_id: &str) -> Result<(), BusError> {
        let table = self.core.table(message.kind)?;

        if let Some(client) = self.core.clients.get(session_id) {
            client.record_produced();
        }

        let Some(registration) = table.try_get(&message.name) else {
            debug!(kind = %message.kind, name = %message.name, "no registration, message dropped");
            return Ok(());
        };

        registration.record_received();
        self.core
            .dispatcher
            .enqueue(PublishContext::new(message, registration));
        Ok(())
    }

    /// The latest message distributed on a topic, if `session_id` currently
    /// consumes it. Queues have no latest message to hand out.
    pub fn latest_message(
        &self,
        request: &RegistrationRequest,
        session_id: &str,
    ) -> Result<Option<Message>, BusError> {
        match request.kind.supported()? {
            MessageKind::Topic => Ok(self
                .core
                .topics
                .try_get(&request.name)
                .and_then(|topic| topic.latest_message_for(session_id))),
            _ => Ok(None),
        }
    }

    /// Handle a transport disconnect for `session_id`.
    pub fn disconnect_client(&self, session_id: &str) -> bool {
        self.core.disconnect_client(session_id)
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        let mut clients: Vec<_> = self
            .core
            .clients
            .list()
            .iter()
            .map(|c| c.summary())
            .collect();
        clients.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        clients
    }

    pub fn queues(&self) -> Vec<RegistrationSummary> {
        self.core.queues.list().iter().map(|r| r.summary()).collect()
    }

    pub fn topics(&self) -> Vec<RegistrationSummary> {
        self.core.topics.list().iter().map(|r| r.summary()).collect()
    }

    pub fn client(&self, session_id: &str) -> Option<Arc<ClientInfo>> {
        self.core.clients.get(session_id)
    }

    pub fn queue(&self, name: &str) -> Option<Arc<RegistrationInfo>> {
        self.core.queues.try_get(name)
    }

    pub fn topic(&self, name: &str) -> Option<Arc<RegistrationInfo>> {
        self.core.topics.try_get(name)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.core.dispatcher
    }

    pub fn stats(&self) -> DispatcherStats {
        self.core.dispatcher.stats()
    }

    /// Subscribe to dispatch faults.
    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.core.dispatcher.faults()
    }

    pub fn status_report(&self) -> StatusReport {
        let config = self.core.dispatcher.config();
        StatusReport {
            buffer_threshold: config.buffer_threshold,
            processing_mode: config.processing_mode,
            stats: self.stats(),
            clients: self.clients(),
            queues: self.queues(),
            topics: self.topics(),
        }
    }

    /// Human-readable status text.
    pub fn status(&self) -> String {
        self.status_report().to_string()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl BrokerCore {
    fn table(&self, kind: MessageKind) -> Result<&RegistrationTable, BusError> {
        match kind.supported()? {
            MessageKind::Queue => Ok(&self.queues),
            _ => Ok(&self.topics),
        }
    }

    fn disconnect_client(&self, session_id: &str) -> bool {
        let Some(client) = self.clients.remove(session_id) else {
            return false;
        };

        // Detach first so closing does not call back into us.
        let channel = client.channel();
        channel.detach();
        if channel.is_open() {
            channel.close();
        }

        self.queues.remove_client(session_id);
        self.topics.remove_client(session_id);
        info!(
            session = session_id,
            produced = client.messages_produced(),
            consumed = client.messages_consumed(),
            "client disconnected"
        );
        true
    }
}

/// Snapshot of everything the broker knows, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub buffer_threshold: i64,
    pub processing_mode: ProcessingMode,
    pub stats: DispatcherStats,
    pub clients: Vec<ClientSummary>,
    pub queues: Vec<RegistrationSummary>,
    pub topics: Vec<RegistrationSummary>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.buffer_threshold < 0 {
            writeln!(f, "          Buffer threshold: Disabled")?;
        } else {
            writeln!(f, "          Buffer threshold: {}", self.buffer_threshold)?;
        }
        writeln!(f, "           Processing mode: {}", self.processing_mode)?;
        writeln!(f, "         Messages received: {}", self.stats.received())?;
        writeln!(f, "        Messages discarded: {}", self.stats.discarded)?;
        writeln!(f, "        Messages processed: {}", self.stats.processed)?;
        writeln!(f, "  Messages being processed: {}", self.stats.in_flight)?;

        writeln!(f, "         Number of clients: {}", self.clients.len())?;
        for client in &self.clients {
            writeln!(f)?;
            writeln!(f, "                 Client Id: {}", client.session_id)?;
            writeln!(f, "              Connected at: {}", client.connected_at)?;
            writeln!(f, "         Messages produced: {}", client.messages_produced)?;
            writeln!(f, "         Messages consumed: {}", client.messages_consumed)?;
        }
        if !self.clients.is_empty() {
            writeln!(f)?;
        }

        write_registrations(f, "queue", "Queue", &self.queues)?;
        write_registrations(f, "topic", "Topic", &self.topics)
    }
}

fn write_registrations(
    f: &mut fmt::Formatter<'_>,
    plural: &str,
    label: &str,
    registrations: &[RegistrationSummary],
) -> fmt::Result {
    writeln!(f, "{:>26}: {}", format!("Number of {plural}s"), registrations.len())?;
    for registration in registrations {
        writeln!(f)?;
        writeln!(f, "{:>26}: {}", format!("{label} name"), registration.name)?;
        writeln!(f, "       Number of producers: {}", registration.producers.len())?;
        writeln!(f, "       Number of consumers: {}", registration.consumers.len())?;
        writeln!(f, "         Messages received: {}", registration.messages_received)?;
        writeln!(f, "        Messages processed: {}", registration.messages_processed)?;
        if let Some(time) = registration.latest_message_time {
            writeln!(f, "       Latest message time: {time}")?;
        }
    }
    if !registrations.is_empty() {
        writeln!(f)?;
    }
    Ok(())
}
