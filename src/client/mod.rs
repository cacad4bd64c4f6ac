//! The `client` module models the connected endpoints of the bus.
//!
//! It provides the transport boundary ([`Channel`], [`ChannelListener`]), an
//! in-process channel ([`LocalChannel`]), the per-session [`ClientInfo`] and the
//! thread-safe [`ClientRegistry`] the broker keeps them in.

pub mod channel;
pub mod registry;

pub use channel::{Channel, ChannelListener, Inbox, LocalChannel};
pub use registry::{ClientInfo, ClientRegistry, ClientSummary};
