//! Coordination layer for multi-agent systems over NATS.
//!
//! Depend on this crate via `cargo add agent-mesh`. It bundles the internal
//! crates behind feature flags so downstream users can leave out the parts
//! they do not need, for example the NATS backend in tests that only use the
//! in-process broker.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use agent_primitives as primitives;

/// Presence, messaging primitives and inbound dispatch (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Publish/subscribe session and backends (enabled by `transport` feature).
#[cfg(feature = "transport")]
pub use agent_transport as transport;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;

/// Tracing setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;
