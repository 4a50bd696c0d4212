//! Protocol envelope and message payloads.
//!
//! Every message on the wire is a flat JSON object: the envelope fields plus the
//! payload fields, discriminated by `type`.
//!
//! ```json
//! {"message_id":"7c1e...","timestamp":"2026-01-08T10:00:00Z","from":"jetson-site-a",
//!  "to":"macmini-control","type":"heartbeat","status":"active"}
//! ```

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::card::{AgentCard, AgentStatus};
use crate::sensor::SensorReading;

// ============================================================================
// Envelope
// ============================================================================

/// A protocol message with its routing metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique within the sender's lifetime. Set once at creation.
    pub message_id: String,

    /// Non-decreasing per sender. Set once at creation.
    pub timestamp: DateTime<Utc>,

    /// Sending agent id.
    pub from: String,

    /// Receiving agent id; absent means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// The typed payload.
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// True when the message is addressed to `agent_id` or broadcast.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.to.as_deref().is_none_or(|to| to == agent_id)
    }
}

// ============================================================================
// Message payloads
// ============================================================================

/// All message kinds, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Discovery and capability advertisement.
    AgentCard(AgentCard),

    /// One timestamped sensor reading.
    SensorObservation(SensorObservation),

    /// Ask the peer to reason about an anomaly.
    AnalysisRequest(AnalysisRequest),

    /// The peer's reasoned answer to an [`AnalysisRequest`].
    AnalysisResponse(AnalysisResponse),

    /// Final joint conclusion of one request/response cycle.
    Decision(Decision),

    /// Liveness signal.
    Heartbeat(Heartbeat),

    /// Free-form operator question forwarded to the peer.
    Query(Query),

    /// Data-backed answer to a [`Query`].
    QueryResponse(QueryResponse),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::AgentCard(_) => MessageKind::AgentCard,
            MessageBody::SensorObservation(_) => MessageKind::SensorObservation,
            MessageBody::AnalysisRequest(_) => MessageKind::AnalysisRequest,
            MessageBody::AnalysisResponse(_) => MessageKind::AnalysisResponse,
            MessageBody::Decision(_) => MessageKind::Decision,
            MessageBody::Heartbeat(_) => MessageKind::Heartbeat,
            MessageBody::Query(_) => MessageKind::Query,
            MessageBody::QueryResponse(_) => MessageKind::QueryResponse,
        }
    }
}

/// Payload-free discriminator, used for logging and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AgentCard,
    SensorObservation,
    AnalysisRequest,
    AnalysisResponse,
    Decision,
    Heartbeat,
    Query,
    QueryResponse,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::AgentCard => "agent_card",
            MessageKind::SensorObservation => "sensor_observation",
            MessageKind::AnalysisRequest => "analysis_request",
            MessageKind::AnalysisResponse => "analysis_response",
            MessageKind::Decision => "decision",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Query => "query",
            MessageKind::QueryResponse => "query_response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_SENSOR: &str = "ENS160+AHT21";

fn default_sensor() -> String {
    DEFAULT_SENSOR.to_string()
}

/// One sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorObservation {
    #[serde(default = "default_sensor")]
    pub sensor: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub eco2: Option<i64>,
    #[serde(default)]
    pub tvoc: Option<i64>,
    #[serde(default)]
    pub aqi: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl SensorObservation {
    pub fn new(sensor: impl Into<String>, reading: &SensorReading, location: Option<String>) -> Self {
        Self {
            sensor: sensor.into(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            eco2: reading.eco2,
            tvoc: reading.tvoc,
            aqi: reading.aqi,
            location,
        }
    }

    pub fn reading(&self) -> SensorReading {
        SensorReading {
            temperature: self.temperature,
            humidity: self.humidity,
            eco2: self.eco2,
            tvoc: self.tvoc,
            aqi: self.aqi,
        }
    }
}

/// Analysis request sent by the agent that detected an anomaly.
///
/// The envelope `message_id` is the reply target for the [`AnalysisResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub question: String,
    /// Arbitrary structured payload: the raw sample and the conditions that fired.
    #[serde(default)]
    pub context: Value,
    /// Local reasoning produced before asking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    /// `message_id` of the request being answered.
    pub in_reply_to: String,
    pub answer: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
}

pub const CONSENSUS_COLLABORATIVE: &str = "collaborative_analysis";
pub const CONSENSUS_DEGRADED: &str = "degraded";

/// The finalized joint conclusion for one originating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub participants: BTreeSet<String>,
    pub summary: String,
    pub consensus: String,
    #[serde(default)]
    pub reasoning: String,
    /// The originating [`AnalysisRequest`] `message_id`.
    pub request_id: String,
    /// The [`AnalysisResponse`] `message_id`; absent for degraded decisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    /// Reached without the peer.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: AgentStatus,
}

fn default_query_source() -> String {
    "dashboard".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub question: String,
    #[serde(default = "default_query_source")]
    pub source: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub in_reply_to: String,
    pub answer: String,
    #[serde(default)]
    pub data: Value,
    pub source_agent: String,
}

// ============================================================================
// Acknowledgement
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Response body of `POST /a2a/message` for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: AckStatus,
    pub message_id: String,
}

impl Ack {
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Accepted,
            message_id: message_id.into(),
        }
    }
}

/// Response body of `POST /a2a/message` for a rejected message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub status: AckStatus,
    /// Absent when the body could not be parsed far enough to find it.
    pub message_id: Option<String>,
    pub error: String,
    pub code: String,
}

// ============================================================================
// Message factory
// ============================================================================

/// Creates envelopes for one sender with unique ids and non-decreasing timestamps.
#[derive(Debug)]
pub struct MessageFactory {
    agent_id: String,
    last_micros: AtomicI64,
}

impl MessageFactory {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            last_micros: AtomicI64::new(i64::MIN),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Next timestamp, never earlier than any previously issued one.
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let prev = self.last_micros.fetch_max(now, Ordering::SeqCst);
        let micros = prev.max(now);
        DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
    }

    pub fn envelope(&self, to: Option<&str>, body: MessageBody) -> Envelope {
        self.envelope_with_id(Self::new_id(), to, body)
    }

    /// Envelope with a pre-allocated id, for messages whose id must be known
    /// before the payload is complete.
    pub fn envelope_with_id(&self, message_id: String, to: Option<&str>, body: MessageBody) -> Envelope {
        Envelope {
            message_id,
            timestamp: self.next_timestamp(),
            from: self.agent_id.clone(),
            to: to.map(str::to_string),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::AgentRole;
    use serde_json::json;

    fn factory() -> MessageFactory {
        MessageFactory::new("jetson-site-a")
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = factory().envelope(
            Some("macmini-control"),
            MessageBody::Heartbeat(Heartbeat {
                status: AgentStatus::Active,
            }),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["status"], "active");
        assert_eq!(json["from"], "jetson-site-a");
        assert_eq!(json["to"], "macmini-control");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_broadcast_omits_to() {
        let env = factory().envelope(
            None,
            MessageBody::Heartbeat(Heartbeat {
                status: AgentStatus::Degraded,
            }),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("to").is_none());
        assert!(env.is_for("anyone"));
    }

    #[test]
    fn test_observation_parse_from_wire() {
        let raw = json!({
            "message_id": "m-1",
            "timestamp": "2026-01-08T10:00:00Z",
            "from": "jetson-site-a",
            "type": "sensor_observation",
            "temperature": 24.5,
            "humidity": 65.2,
            "eco2": 1200,
            "tvoc": 120,
            "aqi": 1,
            "location": "Site A - Server Room"
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        let MessageBody::SensorObservation(obs) = &env.body else {
            panic!("expected observation, got {:?}", env.kind());
        };
        assert_eq!(obs.sensor, DEFAULT_SENSOR);
        assert_eq!(obs.eco2, Some(1200));
        assert_eq!(obs.reading().temperature, Some(24.5));
    }

    #[test]
    fn test_every_kind_survives_transport() {
        let f = factory();
        let bodies = vec![
            MessageBody::AgentCard(AgentCard::new(
                "jetson-site-a",
                AgentRole::Site,
                "lfm2.5-thinking:1.2b",
                "http://10.0.0.2:8080",
            )),
            MessageBody::SensorObservation(SensorObservation {
                sensor: DEFAULT_SENSOR.into(),
                temperature: Some(24.5),
                humidity: None,
                eco2: Some(1200),
                tvoc: Some(120),
                aqi: Some(1),
                location: Some("Site A - Server Room".into()),
            }),
            MessageBody::AnalysisRequest(AnalysisRequest {
                question: "Is this eCO2 spike concerning?".into(),
                context: json!({"reading": {"eco2": 1200}, "anomalies": ["eco2"]}),
                reasoning_trace: Some("ventilation?".into()),
            }),
            MessageBody::AnalysisResponse(AnalysisResponse {
                in_reply_to: "req-1".into(),
                answer: "Likely occupancy.".into(),
                confidence: 0.8,
                reasoning: json!({"eco2": {"mean": 640.5}}),
                reasoning_trace: None,
            }),
            MessageBody::Decision(Decision {
                decision_id: "d-1".into(),
                participants: ["jetson-site-a".to_string(), "macmini-control".to_string()].into(),
                summary: "Increase ventilation".into(),
                consensus: CONSENSUS_COLLABORATIVE.into(),
                reasoning: "eco2 above threshold".into(),
                request_id: "req-1".into(),
                response_id: Some("resp-1".into()),
                degraded: false,
            }),
            MessageBody::Heartbeat(Heartbeat {
                status: AgentStatus::Offline,
            }),
            MessageBody::Query(Query {
                question: "What is the humidity?".into(),
                source: "dashboard".into(),
                context: Value::Null,
            }),
            MessageBody::QueryResponse(QueryResponse {
                in_reply_to: "q-1".into(),
                answer: "Humidity is 65.2%".into(),
                data: json!({"humidity": 65.2}),
                source_agent: "jetson-site-a".into(),
            }),
        ];

        for body in bodies {
            let env = f.envelope(Some("macmini-control"), body);
            let wire = serde_json::to_string(&env).unwrap();
            let back: Envelope = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, env, "kind {} changed in transit", env.kind());
        }
    }

    #[test]
    fn test_timestamps_non_decreasing() {
        let f = factory();
        let mut prev = f.next_timestamp();
        for _ in 0..1000 {
            let next = f.next_timestamp();
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_ids_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| MessageFactory::new_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_ack_serialization() {
        let ack = Ack::accepted("m-1");
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"status": "accepted", "message_id": "m-1"})
        );
    }
}
