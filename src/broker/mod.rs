//! The `broker` module is the message-distribution engine of the bus.
//!
//! - `message`: the routed `Message` and the `RegistrationRequest` input
//! - `registration`: per-name routing entries and the per-kind tables
//! - `dispatcher`: the asynchronous, batched delivery loop
//! - `engine`: the `Broker` facade composing all of the above

pub mod dispatcher;
pub mod engine;
pub mod message;
pub mod registration;

pub use dispatcher::{
    CycleReport, DispatchFault, Dispatcher, DispatcherConfig, DispatcherStats, ProcessingMode,
    PublishContext,
};
pub use engine::{Broker, StatusReport};
pub use message::{Message, MessageKind, RegistrationIntent, RegistrationRequest};
pub use registration::{RegistrationInfo, RegistrationSummary, RegistrationTable};
