//! API integration tests.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::{CONTROL, SITE, heartbeat_from, observation_from, reading, test_app};

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn post(app: &Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .method(Method::POST)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    read(response).await
}

async fn read(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _site) = test_app();

    let (status, json) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["agent_id"], SITE);
    assert_eq!(json["role"], "site");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_agent_card_discovery() {
    let (app, _site) = test_app();

    let (status, json) = get(&app, "/.well-known/agent-card.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["agent_id"], SITE);
    assert_eq!(json["role"], "site");
    assert!(json["endpoints"]["a2a"].as_str().unwrap().ends_with("/a2a/message"));
    assert_eq!(json["status"], "active");
    assert!(json["capabilities"].is_array());
}

#[tokio::test]
async fn test_message_accepted_and_replay_is_idempotent() {
    let (app, site) = test_app();
    let envelope = observation_from(CONTROL, SITE, &reading(21.0, 640));
    let raw = serde_json::to_vec(&envelope).unwrap();

    let (status, json) = post(&app, "/a2a/message", raw.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "accepted");
    assert_eq!(json["message_id"], envelope.message_id.as_str());

    let (status, replay) = post(&app, "/a2a/message", raw).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay, json);

    // Handled once: one received event, one history entry.
    assert_eq!(site.events("sensor_observation").len(), 1);
    assert_eq!(site.agent.history().len(), 1);
}

#[tokio::test]
async fn test_unparseable_message_is_bad_request() {
    let (app, site) = test_app();

    let (status, json) = post(&app, "/a2a/message", "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], "rejected");
    assert_eq!(json["code"], "malformed");
    assert!(json["message_id"].is_null());
    assert!(site.sink.is_empty());
}

#[tokio::test]
async fn test_out_of_range_message_is_unprocessable() {
    let (app, site) = test_app();
    let body = json!({
        "message_id": "obs-range",
        "timestamp": "2026-01-08T10:00:00Z",
        "from": CONTROL,
        "to": SITE,
        "type": "sensor_observation",
        "aqi": 9,
    });

    let (status, json) = post(&app, "/a2a/message", body.to_string()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "out_of_range");
    assert_eq!(json["message_id"], "obs-range");
    assert!(site.agent.history().is_empty());
}

#[tokio::test]
async fn test_misaddressed_and_loopback_messages_rejected() {
    let (app, _site) = test_app();

    let misaddressed = observation_from(CONTROL, "someone-else", &reading(21.0, 640));
    let (status, json) = post(&app, "/a2a/message", serde_json::to_vec(&misaddressed).unwrap()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "misaddressed");

    let own = observation_from(SITE, SITE, &reading(21.0, 640));
    let (status, json) = post(&app, "/a2a/message", serde_json::to_vec(&own).unwrap()).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "loopback");
}

#[tokio::test]
async fn test_sensor_current_follows_latest_observation() {
    let (app, site) = test_app();

    let (status, json) = get(&app, "/api/sensor/current").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["code"], "NOT_FOUND");

    site.agent.ingest_sample(reading(22.5, 700));
    let (status, json) = get(&app, "/api/sensor/current").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["agent_id"], SITE);
    assert_eq!(json["temperature"], 22.5);
    assert_eq!(json["eco2"], 700);
}

#[tokio::test]
async fn test_history_limit() {
    let (app, site) = test_app();
    for i in 0..5 {
        site.agent.ingest_sample(reading(20.0 + i as f64, 600));
    }

    let (status, json) = get(&app, "/api/history?limit=3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 3);
    let readings = json["readings"].as_array().unwrap();
    assert_eq!(readings.len(), 3);
    assert_eq!(readings[2]["temperature"], 24.0);

    let (_, json) = get(&app, "/api/history").await;
    assert_eq!(json["count"], 5);
}

#[tokio::test]
async fn test_stats_rejects_bad_window() {
    let (app, site) = test_app();
    site.agent.ingest_sample(reading(21.0, 600));
    site.agent.ingest_sample(reading(21.4, 620));

    let (status, json) = get(&app, "/api/stats?window_hours=0").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");

    let (status, json) = get(&app, "/api/stats?window_hours=1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total_readings"], 2);
    assert_eq!(json["fields"]["eco2"]["count"], 2);
}

#[tokio::test]
async fn test_status_reports_capabilities_and_peer() {
    let (app, _site) = test_app();

    let (status, json) = get(&app, "/api/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["agent_id"], SITE);
    assert_eq!(json["history"]["count"], 0);
    assert!(
        json["capabilities"]["reasoning"]
            .as_str()
            .unwrap()
            .starts_with("unavailable")
    );
    let peers = json["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["peer_id"], CONTROL);
}

#[tokio::test]
async fn test_chat_empty_question() {
    let (app, site) = test_app();

    let (status, json) = post(&app, "/api/chat", json!({ "question": "   " }).to_string()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["answer"], "Please ask a question.");
    assert_eq!(json["source"], "none");
    assert!(site.events("chat_exchange").is_empty());
}

#[tokio::test]
async fn test_chat_answers_from_data_without_model() {
    let (app, site) = test_app();
    site.agent.ingest_sample(reading(23.0, 650));

    let (status, json) = post(
        &app,
        "/api/chat",
        json!({ "question": "What is the humidity?" }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["source"], "data");
    assert_eq!(json["data_used"], true);
    assert!(json["answer"].as_str().unwrap().contains("humidity"));

    // Forwarded to the peer and recorded.
    let forwarded = json["forwarded_query_id"].as_str().unwrap();
    let queries = site.events("query");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["message_id"], forwarded);
    assert_eq!(queries[0]["direction"], "sent");
    assert_eq!(site.events("chat_exchange").len(), 1);
}

#[tokio::test]
async fn test_recent_messages_replay() {
    let (app, site) = test_app();
    let inbound = observation_from(CONTROL, SITE, &reading(21.0, 640));
    let (status, _) = post(&app, "/a2a/message", serde_json::to_vec(&inbound).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let heartbeat = heartbeat_from(CONTROL, SITE);
    let (status, _) = post(&app, "/a2a/message", serde_json::to_vec(&heartbeat).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let outbound = site.agent.ingest_sample(reading(21.5, 650));

    let (status, json) = get(&app, "/api/messages").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 2);
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages[0]["message_id"], inbound.message_id.as_str());
    assert_eq!(messages[0]["direction"], "received");
    assert_eq!(messages[1]["message_id"], outbound.message_id.as_str());
    assert_eq!(messages[1]["direction"], "sent");

    let (_, json) = get(&app, "/api/messages?limit=1").await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["messages"][0]["message_id"], outbound.message_id.as_str());
}

#[tokio::test]
async fn test_reasoning_lists_anomalies() {
    let (app, site) = test_app();

    let (status, json) = get(&app, "/api/reasoning").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["count"], 0);

    site.agent.ingest_sample(reading(22.0, 1500));
    let (_, json) = get(&app, "/api/reasoning").await;
    assert_eq!(json["count"], 1);
    let event = &json["events"][0];
    assert_eq!(event["type"], "anomaly_detected");
    assert_eq!(event["reading"]["eco2"], 1500);
    assert_eq!(event["coalesced"], false);
}
