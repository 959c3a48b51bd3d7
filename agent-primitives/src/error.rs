//! Shared error definitions for agent primitives.

use thiserror::Error;

/// Result alias used throughout the agent mesh.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating agent primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied agent identity failed validation.
    #[error("invalid agent identity `{name}`: {reason}")]
    InvalidIdentity {
        /// The offending identity string.
        name: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// An inbound payload could not be decoded into a message envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// Human-readable reason describing the decoding failure.
        reason: String,
    },

    /// An envelope could not be encoded.
    #[error("failed to encode envelope: {source}")]
    Encode {
        /// Source [`serde_json::Error`].
        source: serde_json::Error,
    },

    /// Priority value fell outside the supported `1..=5` range.
    #[error("priority {0} is outside the supported range 1..=5")]
    InvalidPriority(u8),

    /// Agent metadata snapshot could not be decoded or failed validation.
    #[error("invalid agent metadata: {reason}")]
    InvalidMetadata {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Convenience helper to construct malformed envelope errors.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}
