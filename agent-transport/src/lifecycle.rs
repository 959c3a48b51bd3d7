//! Connection state machine for transport sessions.

use std::fmt;

use thiserror::Error;
use tracing::debug;

/// States a transport session can occupy during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session constructed, or a connect attempt failed.
    Disconnected,
    /// Connect attempt in progress.
    Connecting,
    /// Link established; publishes and subscriptions are accepted.
    Connected,
    /// Link dropped; reconnect attempts are running.
    Reconnecting,
    /// Session shut down, either by the owner or after reconnects ran out.
    Closed,
}

impl SessionState {
    /// Returns `true` while the link is usable.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns `true` once the session can no longer be used.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Events that drive session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Begin a connect attempt.
    Dial,
    /// Connect attempt succeeded.
    Established,
    /// Connect attempt failed or timed out.
    Failed,
    /// Established link dropped.
    LinkLost,
    /// A reconnect attempt succeeded.
    Restored,
    /// Reconnect attempts ran out.
    Exhausted,
    /// Owner closed the session.
    Close,
}

/// Session state manager.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    state: SessionState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Constructs a lifecycle in the [`SessionState::Disconnected`] state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: SessionEvent) -> LifecycleResult<SessionState> {
        let next = match (self.state, event) {
            (SessionState::Disconnected, SessionEvent::Dial) => Some(SessionState::Connecting),
            (SessionState::Connecting, SessionEvent::Established)
            | (SessionState::Reconnecting, SessionEvent::Restored) => Some(SessionState::Connected),
            (SessionState::Connecting, SessionEvent::Failed) => Some(SessionState::Disconnected),
            (SessionState::Connected, SessionEvent::LinkLost) => Some(SessionState::Reconnecting),
            (SessionState::Reconnecting, SessionEvent::Exhausted) | (_, SessionEvent::Close) => {
                Some(SessionState::Closed)
            }
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            debug!(from = %self.state, to = %next_state, ?event, "transport session transition");
            self.state = next_state;
        }

        Ok(self.state)
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid session transition from {from} via {event:?}")]
    InvalidTransition {
        /// State prior to the attempted transition.
        from: SessionState,
        /// Event that triggered the failure.
        event: SessionEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_flow() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
        lifecycle.transition(SessionEvent::Dial).unwrap();
        assert_eq!(lifecycle.state(), SessionState::Connecting);
        lifecycle.transition(SessionEvent::Established).unwrap();
        assert!(lifecycle.state().is_connected());
    }

    #[test]
    fn failed_connect_can_be_retried() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(SessionEvent::Dial).unwrap();
        lifecycle.transition(SessionEvent::Failed).unwrap();
        assert_eq!(lifecycle.state(), SessionState::Disconnected);
        lifecycle.transition(SessionEvent::Dial).unwrap();
    }

    #[test]
    fn reconnect_cycle_and_exhaustion() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(SessionEvent::Dial).unwrap();
        lifecycle.transition(SessionEvent::Established).unwrap();
        lifecycle.transition(SessionEvent::LinkLost).unwrap();
        assert_eq!(lifecycle.state(), SessionState::Reconnecting);
        lifecycle.transition(SessionEvent::Restored).unwrap();
        assert!(lifecycle.state().is_connected());
        lifecycle.transition(SessionEvent::LinkLost).unwrap();
        lifecycle.transition(SessionEvent::Exhausted).unwrap();
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn close_is_global_and_repeatable() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.transition(SessionEvent::Close).unwrap();
        lifecycle.transition(SessionEvent::Close).unwrap();
        assert_eq!(lifecycle.state(), SessionState::Closed);
    }

    #[test]
    fn invalid_transition_errors() {
        let mut lifecycle = Lifecycle::new();
        let err = lifecycle
            .transition(SessionEvent::Restored)
            .expect_err("restore should fail while disconnected");
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: SessionState::Disconnected,
                event: SessionEvent::Restored,
            }
        );

        lifecycle.transition(SessionEvent::Close).unwrap();
        assert!(lifecycle.transition(SessionEvent::Dial).is_err());
    }
}
