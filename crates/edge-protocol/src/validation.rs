//! Decoding and schema validation of inbound messages.

use serde_json::Value;

use crate::messages::{Envelope, MessageBody};

pub const TEMPERATURE_RANGE: (f64, f64) = (-50.0, 150.0);
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
pub const AQI_RANGE: (i64, i64) = (1, 5);

/// Why a message was rejected. Never retried by the receiver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Body is not JSON.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// JSON that does not match any message schema.
    #[error("schema violation: {0}")]
    Schema(String),

    #[error("field '{field}' must not be empty")]
    Empty { field: &'static str },

    #[error("field '{field}' = {value} outside {expected}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("message addressed to '{to}', this agent is '{agent}'")]
    Misaddressed { to: String, agent: String },
}

impl ValidationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed",
            ValidationError::Schema(_) => "schema_violation",
            ValidationError::Empty { .. } => "missing_field",
            ValidationError::OutOfRange { .. } => "out_of_range",
            ValidationError::Misaddressed { .. } => "misaddressed",
        }
    }

    /// True when the body could not be parsed at all.
    pub fn is_unparseable(&self) -> bool {
        matches!(self, ValidationError::Malformed(_))
    }
}

/// A validation failure with whatever `message_id` could be recovered.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct DecodeError {
    pub message_id: Option<String>,
    #[source]
    pub error: ValidationError,
}

/// Parse and validate one raw message body.
///
/// The body is parsed to a JSON value first so the `message_id` can be reported
/// back even when the payload fails its schema.
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| DecodeError {
        message_id: None,
        error: ValidationError::Malformed(e.to_string()),
    })?;

    let message_id = value
        .get("message_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let envelope: Envelope = serde_json::from_value(value).map_err(|e| DecodeError {
        message_id: message_id.clone(),
        error: ValidationError::Schema(e.to_string()),
    })?;

    envelope.validate().map_err(|error| DecodeError { message_id, error })?;
    Ok(envelope)
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

fn in_range_f64(
    field: &'static str,
    value: Option<f64>,
    (lo, hi): (f64, f64),
    expected: &'static str,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < lo || v > hi => Err(ValidationError::OutOfRange {
            field,
            value: v,
            expected,
        }),
        _ => Ok(()),
    }
}

fn in_range_i64(
    field: &'static str,
    value: Option<i64>,
    (lo, hi): (i64, i64),
    expected: &'static str,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if v < lo || v > hi => Err(ValidationError::OutOfRange {
            field,
            value: v as f64,
            expected,
        }),
        _ => Ok(()),
    }
}

impl Envelope {
    /// Check required fields and value ranges for the declared type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        non_empty("message_id", &self.message_id)?;
        non_empty("from", &self.from)?;

        match &self.body {
            MessageBody::AgentCard(card) => {
                non_empty("agent_id", &card.agent_id)?;
            }
            MessageBody::SensorObservation(obs) => {
                in_range_f64("temperature", obs.temperature, TEMPERATURE_RANGE, "[-50, 150]")?;
                in_range_f64("humidity", obs.humidity, HUMIDITY_RANGE, "[0, 100]")?;
                in_range_i64("eco2", obs.eco2, (0, i64::MAX), ">= 0")?;
                in_range_i64("tvoc", obs.tvoc, (0, i64::MAX), ">= 0")?;
                in_range_i64("aqi", obs.aqi, AQI_RANGE, "[1, 5]")?;
            }
            MessageBody::AnalysisRequest(req) => {
                non_empty("question", &req.question)?;
            }
            MessageBody::AnalysisResponse(resp) => {
                non_empty("in_reply_to", &resp.in_reply_to)?;
                non_empty("answer", &resp.answer)?;
                in_range_f64("confidence", Some(resp.confidence), (0.0, 1.0), "[0, 1]")?;
            }
            MessageBody::Decision(decision) => {
                non_empty("decision_id", &decision.decision_id)?;
                non_empty("request_id", &decision.request_id)?;
                if decision.participants.is_empty() {
                    return Err(ValidationError::Empty {
                        field: "participants",
                    });
                }
            }
            MessageBody::Heartbeat(_) => {}
            MessageBody::Query(query) => {
                non_empty("question", &query.question)?;
            }
            MessageBody::QueryResponse(resp) => {
                non_empty("in_reply_to", &resp.in_reply_to)?;
                non_empty("answer", &resp.answer)?;
            }
        }
        Ok(())
    }

    /// Reject messages addressed to a different agent.
    pub fn check_recipient(&self, agent_id: &str) -> Result<(), ValidationError> {
        match self.to.as_deref() {
            Some(to) if to != agent_id => Err(ValidationError::Misaddressed {
                to: to.to_string(),
                agent: agent_id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
