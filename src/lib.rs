//! # ServiceBus
//!
//! `servicebus` is an in-process message distribution engine. Disjoint
//! clients register as producers or consumers of named **topics** (every
//! consumer gets every message, best effort) or **queues** (each message goes
//! to exactly one consumer and is retained until someone takes it), publish
//! messages, and have them routed and delivered asynchronously.
//!
//! ## Core Modules
//!
//! - `broker`: the `Broker` facade, registration tables and the dispatcher.
//! - `client`: connected clients, their registry and the transport `Channel` boundary.
//! - `config`: loading `Settings` from files and environment.
//! - `utils`: error types and logging setup.
//!
//! ## Example
//!
//! ```no_run
//! use servicebus::broker::{Broker, Message, RegistrationRequest};
//! use servicebus::client::LocalChannel;
//!
//! # async fn run() -> Result<(), servicebus::BusError> {
//! let broker = Broker::default();
//! broker.start()?;
//!
//! let (consumer, mut inbox) = LocalChannel::new();
//! broker.register(&RegistrationRequest::consume_topic("alerts"), consumer)?;
//!
//! broker.publish(Message::topic("alerts", vec![1, 2, 3]), "")?;
//! let delivered = inbox.recv().await;
//! assert!(delivered.is_some());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod utils;

pub use broker::Broker;
pub use utils::error::{BusError, ChannelError};
