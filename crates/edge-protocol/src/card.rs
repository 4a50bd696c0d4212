//! Agent card: the discovery document each agent serves about itself.

use serde::{Deserialize, Serialize};

/// Which side of the collaboration an agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Owns the sensor, detects anomalies, asks for analysis.
    Site,
    /// Owns the long history, answers analysis requests.
    Control,
}

impl AgentRole {
    /// Capabilities advertised for this role.
    pub fn capabilities(self) -> Vec<String> {
        let caps: &[&str] = match self {
            AgentRole::Site => &["sensor_reading", "anomaly_detection", "lfm_reasoning"],
            AgentRole::Control => &["historical_analysis", "lfm_reasoning", "dashboard_hosting"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Site => "site",
            AgentRole::Control => "control",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "site" => Ok(AgentRole::Site),
            "control" => Ok(AgentRole::Control),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}

/// Self-reported health of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Degraded,
    Offline,
}

/// Where an agent can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Protocol message endpoint (`POST`).
    pub a2a: String,
    /// Health endpoint (`GET`).
    pub health: String,
    /// WebSocket stream endpoint.
    pub stream: String,
    /// Discovery document (`GET`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card: Option<String>,
}

impl Endpoints {
    /// Derive endpoints from an `http(s)://host:port` base URL.
    pub fn from_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self {
            a2a: format!("{base}/a2a/message"),
            health: format!("{base}/health"),
            stream: format!("{ws_base}/stream"),
            card: Some(format!("{base}{}", AgentCard::WELL_KNOWN_PATH)),
        }
    }
}

/// Discovery and capability advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRole>,
    pub capabilities: Vec<String>,
    pub model: String,
    pub endpoints: Endpoints,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
}

fn default_status() -> AgentStatus {
    AgentStatus::Active
}

impl AgentCard {
    /// Path the card is served at.
    pub const WELL_KNOWN_PATH: &'static str = "/.well-known/agent-card.json";

    pub fn new(agent_id: impl Into<String>, role: AgentRole, model: impl Into<String>, base_url: &str) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: Some(role),
            capabilities: role.capabilities(),
            model: model.into(),
            endpoints: Endpoints::from_base_url(base_url),
            status: AgentStatus::Active,
        }
    }
}
