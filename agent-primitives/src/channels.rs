//! Subject naming for the agent fabric.
//!
//! These templates are fixed: any peer that wants to talk to agents on the
//! fabric has to reproduce them exactly. Subjects are never created
//! explicitly; publishing or subscribing materializes them.

use crate::normalize;

/// Subject shared by every agent for presence and broadcasts.
pub const ALL_AGENTS: &str = "agents.all";
/// Prefix of per-agent fire-and-forget subjects.
pub const DIRECT_PREFIX: &str = "agents.direct";
/// Prefix of per-agent request/reply subjects.
pub const REQUEST_PREFIX: &str = "agents.request";
/// Prefix of explicit response subjects.
pub const RESPONSE_PREFIX: &str = "agents.response";
/// Prefix of handoff audit subjects.
pub const HANDOFF_PREFIX: &str = "agents.handoff";

/// Returns the all-agents subject.
#[must_use]
pub fn all_agents_channel() -> &'static str {
    ALL_AGENTS
}

/// Returns the direct-message subject of `agent`.
#[must_use]
pub fn direct_channel(agent: &str) -> String {
    format!("{DIRECT_PREFIX}.{}", normalize(agent))
}

/// Returns the request subject of `agent`.
#[must_use]
pub fn request_channel(agent: &str) -> String {
    format!("{REQUEST_PREFIX}.{}", normalize(agent))
}

/// Returns the response subject for `request_id` issued by `agent`.
#[must_use]
pub fn response_channel(agent: &str, request_id: &str) -> String {
    format!("{RESPONSE_PREFIX}.{}.{request_id}", normalize(agent))
}

/// Returns the subject recording handoffs from `from_agent` to `to_agent`.
#[must_use]
pub fn handoff_channel(from_agent: &str, to_agent: &str) -> String {
    format!(
        "{HANDOFF_PREFIX}.{}.to.{}",
        normalize(from_agent),
        normalize(to_agent)
    )
}

/// Wildcard subject matching every handoff, for audit subscribers.
#[must_use]
pub fn all_handoffs_channel() -> String {
    format!("{HANDOFF_PREFIX}.>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_channel_is_case_and_space_insensitive() {
        assert_eq!(direct_channel("Weather Bot"), direct_channel("weather bot"));
        assert_eq!(direct_channel("Weather Bot"), "agents.direct.weather_bot");
    }

    #[test]
    fn channel_templates() {
        assert_eq!(all_agents_channel(), "agents.all");
        assert_eq!(request_channel("Trip Planner"), "agents.request.trip_planner");
        assert_eq!(
            response_channel("Trip Planner", "42"),
            "agents.response.trip_planner.42"
        );
        assert_eq!(handoff_channel("A", "Weather Bot"), "agents.handoff.a.to.weather_bot");
        assert_eq!(all_handoffs_channel(), "agents.handoff.>");
    }
}
