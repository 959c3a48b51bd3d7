//! Agent identity types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Human-readable name identifying an agent on the messaging fabric.
///
/// Every channel an agent listens on is derived from the [normalized](normalize)
/// form of this name. Two agents whose names normalize to the same string
/// share channels; keeping names distinct is a deployment convention.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    /// Creates a new agent name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] when the name is blank.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidIdentity {
                name,
                reason: "name cannot be empty",
            });
        }
        Ok(Self(name))
    }

    /// Returns the name exactly as supplied.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the channel-safe form of the name.
    #[must_use]
    pub fn normalized(&self) -> String {
        normalize(&self.0)
    }

    /// Returns `true` when `other` refers to this agent after normalization.
    #[must_use]
    pub fn is(&self, other: &str) -> bool {
        normalize(other) == self.normalized()
    }
}

/// Lowercases a name and replaces spaces with underscores.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

impl Display for AgentName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AgentName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for AgentName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgentName> for String {
    fn from(value: AgentName) -> Self {
        value.0
    }
}

impl FromStr for AgentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_spaces() {
        let name = AgentName::new("Weather Bot").unwrap();
        assert_eq!(name.normalized(), "weather_bot");
        assert_eq!(name.as_str(), "Weather Bot");
        assert!(name.is("weather bot"));
        assert!(name.is("WEATHER_BOT"));
        assert!(!name.is("weatherbot"));
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(AgentName::new("   ").is_err());
        assert!("".parse::<AgentName>().is_err());
    }
}
