//! Agent-side coordination on the messaging fabric.
//!
//! This crate turns a transport session into mesh membership: presence
//! announcements and heartbeats, the four communication primitives, routing
//! of inbound envelopes to an [`AgentBehavior`], peer liveness tracking, and
//! a scheduler that owns every background task.

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod dispatch;
mod liveness;
mod messaging;
mod presence;
mod scheduler;

pub use client::{MessagingClient, MessagingClientBuilder};
pub use dispatch::{
    AgentBehavior, BehaviorError, BehaviorResult, ChannelKind, Dispatcher, MeshObserver,
};
pub use liveness::{PeerRecord, PeerRegistry};
pub use messaging::{MessagingError, MessagingResult, Messenger};
pub use presence::PresenceManager;
pub use scheduler::{SchedulerConfig, SchedulerError, SchedulerResult, TaskHandle, TaskScheduler};
