//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use edge_protocol::AgentCard;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;
use crate::ws::stream_handler;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/sensor/current", get(handlers::sensor_current))
        .route("/history", get(handlers::history))
        .route("/messages", get(handlers::messages))
        .route("/reasoning", get(handlers::reasoning))
        .route("/stats", get(handlers::stats))
        .route("/chat", post(handlers::chat));

    Router::new()
        .route("/health", get(handlers::health))
        .route(AgentCard::WELL_KNOWN_PATH, get(handlers::agent_card))
        .route("/a2a/message", post(handlers::post_message))
        .route("/stream", get(stream_handler))
        .nest("/api", api_routes)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

fn build_cors_layer(state: &AppState) -> CorsLayer {
    let allowed_origins = &state.agent.config().agent.allowed_origins;

    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN];

    if allowed_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();
    tracing::info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
}
