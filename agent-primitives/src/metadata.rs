//! Agent metadata advertised on the all-agents channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::now_iso8601;
use crate::{AgentName, Error};

const DEFAULT_DESCRIPTION: &str = "An AI agent";
const DEFAULT_MODEL: &str = "unknown";
const DEFAULT_VERSION: &str = "1.0.0";

/// Availability reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Agent accepts new work.
    #[default]
    Available,
    /// Agent is online but occupied.
    Busy,
    /// Agent has left the fabric or stopped sending heartbeats.
    Offline,
}

impl AgentStatus {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive record of an agent, owned and mutated only by that agent.
///
/// Other agents receive it as a read-only snapshot inside announcement and
/// heartbeat envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    name: String,
    description: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    status: AgentStatus,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default = "now_iso8601")]
    registered_at: String,
    #[serde(default = "now_iso8601")]
    last_heartbeat: String,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_owned()
}

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

impl AgentMetadata {
    /// Starts building metadata for the supplied agent.
    #[must_use]
    pub fn builder(name: &AgentName) -> AgentMetadataBuilder {
        AgentMetadataBuilder {
            name: name.as_str().to_owned(),
            description: None,
            capabilities: Vec::new(),
            tools: Vec::new(),
            model: None,
            version: None,
        }
    }

    /// Returns the agent display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the free-text description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the advertised capability tags.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Returns the names of the tools the agent can call.
    #[must_use]
    pub fn tools(&self) -> &[String] {
        &self.tools
    }

    /// Returns the reported availability.
    #[must_use]
    pub const fn status(&self) -> AgentStatus {
        self.status
    }

    /// Returns the model identifier.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the semantic version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the registration timestamp.
    #[must_use]
    pub fn registered_at(&self) -> &str {
        &self.registered_at
    }

    /// Returns the timestamp of the most recent heartbeat.
    #[must_use]
    pub fn last_heartbeat(&self) -> &str {
        &self.last_heartbeat
    }

    /// Updates the availability.
    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
    }

    /// Stamps the heartbeat timestamp with the current time.
    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat = now_iso8601();
    }

    /// Renders the metadata as a JSON object for an envelope's `metadata` field.
    #[must_use]
    pub fn to_metadata_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Reads a metadata snapshot out of an envelope's `metadata` field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] when required fields are missing or
    /// have the wrong shape.
    pub fn from_metadata_map(map: &Map<String, Value>) -> crate::Result<Self> {
        serde_json::from_value(Value::Object(map.clone())).map_err(|err| {
            Error::InvalidMetadata {
                reason: err.to_string(),
            }
        })
    }
}

/// Builder for [`AgentMetadata`].
#[derive(Debug)]
pub struct AgentMetadataBuilder {
    name: String,
    description: Option<String>,
    capabilities: Vec<String>,
    tools: Vec<String>,
    model: Option<String>,
    version: Option<String>,
}

impl AgentMetadataBuilder {
    /// Sets the free-text description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replaces the capability tags.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Replaces the tool names.
    #[must_use]
    pub fn tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the model identifier.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the semantic version string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] when the version string is empty.
    pub fn version(mut self, version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(Error::InvalidMetadata {
                reason: "version cannot be empty".into(),
            });
        }
        self.version = Some(version);
        Ok(self)
    }

    /// Consumes the builder, stamping registration and heartbeat times.
    #[must_use]
    pub fn build(self) -> AgentMetadata {
        let now = now_iso8601();
        AgentMetadata {
            name: self.name,
            description: self
                .description
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_owned()),
            capabilities: self.capabilities,
            tools: self.tools.into_iter().filter(|t| !t.is_empty()).collect(),
            status: AgentStatus::Available,
            model: self.model.unwrap_or_else(default_model),
            version: self.version.unwrap_or_else(default_version),
            registered_at: now.clone(),
            last_heartbeat: now,
        }
    }
}
