//! Agent configuration.
//!
//! Loaded by the binary from defaults, a TOML file, and `EDGE_AGENT__SECTION__KEY`
//! environment variables. Every section falls back to its defaults when absent.

use std::time::Duration;

use edge_protocol::AgentRole;
use serde::{Deserialize, Serialize};

pub const SITE_AGENT_ID: &str = "jetson-site-a";
pub const CONTROL_AGENT_ID: &str = "macmini-control";
pub const SITE_PORT: u16 = 8080;
pub const CONTROL_PORT: u16 = 8081;
pub const SITE_LOCATION: &str = "Site A - Server Room";

fn default_agent_id(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Site => SITE_AGENT_ID,
        AgentRole::Control => CONTROL_AGENT_ID,
    }
}

fn default_port(role: AgentRole) -> u16 {
    match role {
        AgentRole::Site => SITE_PORT,
        AgentRole::Control => CONTROL_PORT,
    }
}

fn peer_role(role: AgentRole) -> AgentRole {
    match role {
        AgentRole::Site => AgentRole::Control,
        AgentRole::Control => AgentRole::Site,
    }
}

fn default_peer_url(role: AgentRole) -> String {
    format!("http://localhost:{}", default_port(peer_role(role)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub peer: PeerConfig,
    pub sensor: SensorConfig,
    pub thresholds: ThresholdConfig,
    pub liveness: LivenessConfig,
    pub history: HistoryConfig,
    pub delivery: DeliveryConfig,
    pub analysis: AnalysisConfig,
    pub reasoning: ReasoningConfig,
    pub stream: StreamConfig,
    pub record: RecordConfig,
    pub router: RouterConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::for_role(AgentRole::Site)
    }
}

impl AgentConfig {
    /// Defaults for one side of the deployment.
    pub fn for_role(role: AgentRole) -> Self {
        Self {
            agent: AgentSection::for_role(role),
            peer: PeerConfig::for_role(role),
            sensor: SensorConfig::default(),
            thresholds: ThresholdConfig::default(),
            liveness: LivenessConfig::default(),
            history: HistoryConfig::default(),
            delivery: DeliveryConfig::default(),
            analysis: AnalysisConfig::default(),
            reasoning: ReasoningConfig::default(),
            stream: StreamConfig::default(),
            record: RecordConfig::default(),
            router: RouterConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Switch role, moving any identity settings still at the old role's
    /// defaults to the new role's defaults.
    pub fn apply_role(&mut self, role: AgentRole) {
        let old = self.agent.role;
        if old == role {
            return;
        }
        self.agent.role = role;
        if self.agent.id == default_agent_id(old) {
            self.agent.id = default_agent_id(role).to_string();
        }
        if self.agent.port == default_port(old) {
            self.agent.port = default_port(role);
        }
        if self.agent.location.as_deref() == AgentSection::for_role(old).location.as_deref() {
            self.agent.location = AgentSection::for_role(role).location;
        }
        if self.peer.id == default_agent_id(peer_role(old)) {
            self.peer.id = default_agent_id(peer_role(role)).to_string();
        }
        if self.peer.url == default_peer_url(old) {
            self.peer.url = default_peer_url(role);
        }
    }

    /// Give a loaded config the identity defaults of its configured role.
    ///
    /// Missing fields deserialize to site defaults and a generated config file
    /// spells those out, so identity values still equal to the site defaults
    /// are treated as unset.
    pub fn resolve_role(&mut self) {
        let role = self.agent.role;
        self.agent.role = AgentRole::Site;
        self.apply_role(role);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub id: String,
    pub role: AgentRole,
    pub host: String,
    pub port: u16,
    /// URL advertised in the agent card. Derived from host and port when unset.
    pub public_url: Option<String>,
    pub location: Option<String>,
    /// Model name advertised in the agent card.
    pub model: String,
    /// CORS origins for the dashboard. Any origin when empty.
    pub allowed_origins: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self::for_role(AgentRole::Site)
    }
}

impl AgentSection {
    fn for_role(role: AgentRole) -> Self {
        Self {
            id: default_agent_id(role).to_string(),
            role,
            host: "0.0.0.0".to_string(),
            port: default_port(role),
            public_url: None,
            location: match role {
                AgentRole::Site => Some(SITE_LOCATION.to_string()),
                AgentRole::Control => None,
            },
            model: "lfm2.5-thinking".to_string(),
            allowed_origins: Vec::new(),
        }
    }

    pub fn base_url(&self) -> String {
        if let Some(url) = &self.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::for_role(AgentRole::Site)
    }
}

impl PeerConfig {
    fn for_role(role: AgentRole) -> Self {
        Self {
            id: default_agent_id(peer_role(role)).to_string(),
            url: default_peer_url(role),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// HTTP endpoint returning the current reading. No sensor when unset.
    pub url: Option<String>,
    pub name: String,
    pub poll_interval_secs: u64,
    /// Read failures within this period after start are reported as warm-up.
    pub warmup_secs: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            url: None,
            name: edge_protocol::messages::DEFAULT_SENSOR.to_string(),
            poll_interval_secs: 5,
            warmup_secs: 60,
        }
    }
}

impl SensorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Degrees Celsius between consecutive readings.
    pub temp_delta: f64,
    /// ppm.
    pub eco2: i64,
    /// ppb.
    pub tvoc: i64,
    /// Triggers at or above.
    pub aqi: i64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            temp_delta: 5.0,
            eco2: 1000,
            tvoc: 500,
            aqi: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub heartbeat_interval_secs: u64,
    /// Consecutive missed intervals before a peer is offline.
    pub offline_after_missed: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 10,
            offline_after_missed: 3,
        }
    }
}

impl LivenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub horizon_hours: u64,
    /// Default size of `/api/history`.
    pub recent_limit: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            horizon_hours: 24,
            recent_limit: 20,
        }
    }
}

impl HistoryConfig {
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::hours(self.horizon_hours as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_jitter_ms: u64,
    pub request_timeout_secs: u64,
    /// Per-destination pending queue bound.
    pub queue_capacity: usize,
    pub redelivery_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1000,
            max_jitter_ms: 250,
            request_timeout_secs: 5,
            queue_capacity: 100,
            redelivery_interval_secs: 15,
        }
    }
}

impl DeliveryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn redelivery_interval(&self) -> Duration {
        Duration::from_secs(self.redelivery_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub response_deadline_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            response_deadline_secs: 30,
        }
    }
}

impl AnalysisConfig {
    pub fn response_deadline(&self) -> Duration {
        Duration::from_secs(self.response_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub enabled: bool,
    /// Ollama base URL.
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://localhost:11434".to_string(),
            model: "lfm2.5-thinking".to_string(),
            timeout_secs: 20,
            max_tokens: 256,
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    pub buffer: usize,
    pub ping_interval_secs: u64,
    /// Protocol messages kept for `/api/messages`.
    pub recent_messages: usize,
    /// Anomaly and analysis events kept for `/api/reasoning`.
    pub recent_reasoning: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            ping_interval_secs: 30,
            recent_messages: crate::events::RECENT_MESSAGES,
            recent_reasoning: crate::events::RECENT_REASONING,
        }
    }
}

impl StreamConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// JSONL log path. Defaults to `<state dir>/<agent id>.jsonl`.
    pub file: Option<String>,
    pub max_consecutive_failures: u32,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            file: None,
            max_consecutive_failures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of message ids remembered for replay detection.
    pub replay_cache: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            replay_cache: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
