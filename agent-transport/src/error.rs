//! Error types for the transport layer.

use std::time::Duration;

use thiserror::Error;

use crate::SessionState;

/// Errors surfaced by transport sessions and backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connecting to the server failed or timed out.
    #[error("connection error: {reason}")]
    Connection {
        /// Human-readable context.
        reason: String,
    },
    /// The link dropped and every reconnect attempt failed.
    #[error("transport lost after {attempts} reconnect attempts")]
    TransportLost {
        /// Number of reconnect attempts made.
        attempts: usize,
    },
    /// A publish could not be delivered to the server.
    #[error("publish error: {reason}")]
    Publish {
        /// Human-readable context.
        reason: String,
    },
    /// The payload exceeds the configured maximum.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Encoded payload size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },
    /// No reply arrived within the request timeout.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),
    /// Nobody is subscribed to the request subject.
    #[error("no responders on {subject}")]
    NoResponders {
        /// Subject the request was sent to.
        subject: String,
    },
    /// The server rejected a subscription.
    #[error("subscribe error on {subject}: {reason}")]
    Subscribe {
        /// Subject of the failed subscription.
        subject: String,
        /// Human-readable context.
        reason: String,
    },
    /// The operation is not valid in the session's current state.
    #[error("cannot {action} while session is {state}")]
    InvalidState {
        /// Attempted operation.
        action: &'static str,
        /// State at the time of the attempt.
        state: SessionState,
    },
    /// Transport configuration was invalid.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(&'static str),
}

impl TransportError {
    /// Convenience helper to construct connection errors.
    #[must_use]
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Convenience helper to construct publish errors.
    #[must_use]
    pub fn publish(reason: impl Into<String>) -> Self {
        Self::Publish {
            reason: reason.into(),
        }
    }

    /// Convenience helper to construct subscribe errors.
    #[must_use]
    pub fn subscribe(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` when a request simply went unanswered.
    #[must_use]
    pub const fn is_unanswered(&self) -> bool {
        matches!(self, Self::RequestTimeout(_) | Self::NoResponders { .. })
    }
}

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
