//! Publish/subscribe transport for the agent mesh.
//!
//! A [`TransportSession`] owns one connection to a subject-based broker and
//! exposes publish, subscribe, and request/reply on top of a pluggable
//! [`Backend`]. Two backends ship with the crate: [`MemoryBroker`] for
//! in-process meshes and tests, and a NATS backend behind the `nats` feature.

#![warn(missing_docs, clippy::pedantic)]

mod backend;
mod error;
mod lifecycle;
mod memory;
#[cfg(feature = "nats")]
mod nats;
mod session;

pub use backend::{
    Backend, Connector, InboundMessage, Link, LinkEvent, MessageHandler, MessageStream,
};
pub use error::{TransportError, TransportResult};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleResult, SessionEvent, SessionState};
pub use memory::MemoryBroker;
#[cfg(feature = "nats")]
pub use nats::{NatsBackend, NatsConnector};
pub use session::{SessionNotice, SubscriptionHandle, TransportConfig, TransportSession};
