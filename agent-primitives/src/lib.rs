//! Core shared types for agents on the messaging fabric.

#![warn(missing_docs, clippy::pedantic)]

pub mod channels;
mod clock;
mod envelope;
mod error;
mod identity;
mod metadata;

/// Wire timestamp helpers.
pub use clock::{now_iso8601, parse_iso8601};
/// Message envelope and its routing kinds.
pub use envelope::{MessageEnvelope, MessageType, Priority};
/// Error type and result alias shared across the SDK.
pub use error::{Error, Result};
/// Human-readable agent identity and its channel-safe normalization.
pub use identity::{AgentName, normalize};
/// Agent metadata advertised on the all-agents channel.
pub use metadata::{AgentMetadata, AgentMetadataBuilder, AgentStatus};
