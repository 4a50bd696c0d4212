//! API request handlers.

use std::collections::BTreeMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
};
use edge_protocol::{Ack, AgentCard, AgentRole, SensorField};
use serde::{Deserialize, Serialize};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::agent::{ChatAnswer, StatusReport};
use crate::events::AgentEvent;
use crate::history::{FieldSummary, HistoryContext, ObservationRecord, cross_parameter};

/// Upper bound for `/api/history?limit=`.
const MAX_HISTORY_LIMIT: usize = 1000;
/// Default for `/api/messages?limit=`.
const DEFAULT_MESSAGE_LIMIT: usize = 50;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub agent_id: String,
    pub role: AgentRole,
    pub version: String,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        agent_id: state.agent.agent_id().to_string(),
        role: state.agent.role(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Agent-to-agent message endpoint.
///
/// POST /a2a/message
pub async fn post_message(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Ack>> {
    let ack = state.agent.handle_inbound(&body)?;
    Ok(Json(ack))
}

/// GET /.well-known/agent-card.json
pub async fn agent_card(State(state): State<AppState>) -> Json<AgentCard> {
    Json(state.agent.card())
}

/// GET /api/status
pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.agent.status_report())
}

/// GET /api/sensor/current
pub async fn sensor_current(State(state): State<AppState>) -> ApiResult<Json<ObservationRecord>> {
    state
        .agent
        .latest()
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no sensor data yet"))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub readings: Vec<ObservationRecord>,
}

/// Most recent readings, oldest first.
///
/// GET /api/history?limit=
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<HistoryResponse> {
    let limit = query
        .limit
        .unwrap_or(state.agent.config().history.recent_limit)
        .min(MAX_HISTORY_LIMIT);
    let readings = state.agent.history().recent(limit);
    Json(HistoryResponse {
        count: readings.len(),
        readings,
    })
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub count: usize,
    pub messages: Vec<AgentEvent>,
}

/// Recently sent and received protocol messages, oldest first.
///
/// GET /api/messages?limit=
pub async fn messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Json<MessagesResponse> {
    let messages = state
        .agent
        .recent()
        .messages(query.limit.unwrap_or(DEFAULT_MESSAGE_LIMIT));
    Json(MessagesResponse {
        count: messages.len(),
        messages,
    })
}

#[derive(Debug, Serialize)]
pub struct ReasoningResponse {
    pub count: usize,
    pub events: Vec<AgentEvent>,
}

/// Recent anomalies, analysis responses and decisions, oldest first.
///
/// GET /api/reasoning
pub async fn reasoning(State(state): State<AppState>) -> Json<ReasoningResponse> {
    let events = state.agent.recent().reasoning();
    Json(ReasoningResponse {
        count: events.len(),
        events,
    })
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub window_hours: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub window_hours: f64,
    pub total_readings: usize,
    pub fields: BTreeMap<SensorField, FieldSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_parameter: Option<String>,
}

/// Per-field statistics and trends over a window (default: the full horizon).
///
/// GET /api/stats?window_hours=
pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<StatsResponse>> {
    let horizon = state.agent.history().horizon();
    let (window, window_hours) = match query.window_hours {
        Some(hours) if !hours.is_finite() || hours <= 0.0 => {
            return Err(ApiError::bad_request("window_hours must be a positive number"));
        }
        Some(hours) => (
            Some(chrono::Duration::milliseconds((hours * 3_600_000.0) as i64)),
            hours,
        ),
        None => (None, horizon.num_minutes() as f64 / 60.0),
    };

    let context = HistoryContext::collect(state.agent.history(), window);
    let cross_parameter = cross_parameter(&context.trends());
    Ok(Json(StatsResponse {
        window_hours,
        total_readings: context.total_readings,
        fields: context.fields,
        cross_parameter,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: String,
}

/// Operator question.
///
/// POST /api/chat
pub async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Json<ChatAnswer> {
    Json(state.agent.chat(&request.question).await)
}
