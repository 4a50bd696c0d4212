//! Site and control agents collaborating over an in-process network.

use std::time::Duration;

use edge_protocol::{AgentRole, AgentStatus, AnalysisResponse, MessageBody, MessageFactory};
use serde_json::{Value, json};

mod common;
use common::{CONTROL, LoopbackNetwork, SITE, TestAgent, advance, reading, settle};

fn request_id(site: &TestAgent) -> String {
    let detected = site.events("anomaly_detected");
    detected[0]["request_id"].as_str().unwrap().to_string()
}

fn participants(decision: &Value) -> Vec<&str> {
    decision["participants"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_anomaly_reaches_collaborative_decision() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let control = network.spawn_agent(AgentRole::Control);

    site.agent.ingest_sample(reading(22.0, 600));
    site.agent.ingest_sample(reading(22.5, 1500));
    advance(Duration::from_secs(1)).await;

    let request_id = request_id(&site);

    // Control saw both observations and the request, and answered it.
    assert_eq!(control.events("sensor_observation").len(), 2);
    assert_eq!(control.agent.history().len(), 2);
    let requests = control.events("analysis_request");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["message_id"], request_id.as_str());
    assert!(
        requests[0]["context"]["anomaly_reasons"][0]
            .as_str()
            .unwrap()
            .contains("eCO2 1500ppm")
    );

    let responses = site.events("analysis_response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["direction"], "received");
    assert_eq!(responses[0]["in_reply_to"], request_id.as_str());
    assert_eq!(responses[0]["reasoning"]["source"], "statistical");

    // Exactly one decision, made by the site and delivered to control.
    let decisions = control.events("decision");
    assert_eq!(decisions.len(), 1);
    let decision = &decisions[0];
    assert_eq!(decision["direction"], "received");
    assert_eq!(decision["consensus"], "collaborative_analysis");
    assert_eq!(decision["degraded"], false);
    assert_eq!(decision["request_id"], request_id.as_str());
    assert_eq!(decision["response_id"], responses[0]["message_id"]);
    assert_eq!(participants(decision), vec![SITE, CONTROL]);
    assert!(site.agent.pending().is_empty());

    // The deadline passing afterwards changes nothing.
    advance(Duration::from_secs(60)).await;
    assert_eq!(site.events("decision").len(), 1);
    assert_eq!(control.events("decision").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_peer_yields_one_degraded_decision() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let control = network.spawn_agent(AgentRole::Control);
    network.set_down(CONTROL, true);

    site.agent.ingest_sample(reading(22.0, 1400));
    settle().await;
    let request_id = request_id(&site);
    assert_eq!(site.agent.pending().len(), 1);

    // Retries exhaust within a few seconds; the messages stay queued.
    advance(Duration::from_secs(10)).await;
    assert_eq!(site.agent.status(), AgentStatus::Degraded);
    assert!(site.agent.dispatcher().queue_depth(CONTROL) >= 1);
    assert!(site.events("decision").is_empty());

    advance(Duration::from_secs(30)).await;
    let decisions = site.events("decision");
    assert_eq!(decisions.len(), 1);
    let decision = &decisions[0];
    assert_eq!(decision["direction"], "local");
    assert_eq!(decision["consensus"], "degraded");
    assert_eq!(decision["degraded"], true);
    assert_eq!(decision["request_id"], request_id.as_str());
    assert!(decision["response_id"].is_null());
    assert_eq!(participants(decision), vec![SITE]);
    assert!(site.agent.pending().is_empty());
    assert!(control.sink.is_empty());

    // A response arriving after the deadline is accepted but decides nothing.
    let late = MessageFactory::new(CONTROL).envelope(
        Some(SITE),
        MessageBody::AnalysisResponse(AnalysisResponse {
            in_reply_to: request_id.clone(),
            answer: "Ventilation fault".to_string(),
            confidence: 0.8,
            reasoning: json!({}),
            reasoning_trace: None,
        }),
    );
    let ack = site
        .agent
        .handle_inbound(&serde_json::to_vec(&late).unwrap())
        .unwrap();
    assert_eq!(ack.message_id, late.message_id);
    settle().await;
    assert_eq!(site.events("decision").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_messages_drain_in_order_after_recovery() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let control = network.spawn_agent(AgentRole::Control);
    network.set_down(CONTROL, true);

    let first = site.agent.ingest_sample(reading(21.0, 600));
    let second = site.agent.ingest_sample(reading(21.2, 610));
    advance(Duration::from_secs(10)).await;
    assert_eq!(site.agent.dispatcher().queue_depth(CONTROL), 2);

    network.set_down(CONTROL, false);
    site.agent.liveness().observe(CONTROL);
    // The lane redelivers on its next tick at 15s.
    advance(Duration::from_secs(25)).await;

    assert_eq!(site.agent.dispatcher().queue_depth(CONTROL), 0);
    let received: Vec<Value> = control.events("sensor_observation");
    assert_eq!(received.len(), 2);
    assert_eq!(received[0]["message_id"], first.message_id.as_str());
    assert_eq!(received[1]["message_id"], second.message_id.as_str());
}

#[tokio::test(start_paused = true)]
async fn test_anomalies_coalesce_into_one_request() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let _control = network.spawn_agent(AgentRole::Control);
    network.set_down(CONTROL, true);

    site.agent.ingest_sample(reading(22.0, 1400));
    site.agent.ingest_sample(reading(22.1, 1600));
    settle().await;

    let detected = site.events("anomaly_detected");
    assert_eq!(detected.len(), 2);
    assert_eq!(detected[0]["coalesced"], false);
    assert_eq!(detected[1]["coalesced"], true);
    assert_eq!(detected[0]["request_id"], detected[1]["request_id"]);
    assert_eq!(site.agent.pending().len(), 1);

    advance(Duration::from_secs(40)).await;
    assert_eq!(site.events("analysis_request").len(), 1);
    let decisions = site.events("decision");
    assert_eq!(decisions.len(), 1);
    assert!(
        decisions[0]["reasoning"]
            .as_str()
            .unwrap()
            .contains("1 further anomaly was folded into this request")
    );
}

#[tokio::test(start_paused = true)]
async fn test_peer_query_answered_with_data() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let control = network.spawn_agent(AgentRole::Control);

    site.agent.ingest_sample(reading(24.0, 800));
    advance(Duration::from_secs(1)).await;

    let answer = control.agent.chat("What is the temperature?").await;
    assert_eq!(answer.source, "data");
    advance(Duration::from_secs(1)).await;

    let queries = site.events("query");
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0]["direction"], "received");

    let replies = control.events("query_response");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["in_reply_to"], queries[0]["message_id"]);
    assert_eq!(replies[0]["source_agent"], SITE);
    assert_eq!(replies[0]["data"]["current"]["temperature"], 24.0);
}

#[tokio::test(start_paused = true)]
async fn test_started_agents_exchange_cards_and_heartbeats() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let control = network.spawn_agent(AgentRole::Control);

    site.agent.start();
    control.agent.start();
    advance(Duration::from_secs(25)).await;

    assert_eq!(site.agent.status(), AgentStatus::Active);
    let status = site.agent.status_report();
    assert_eq!(status.peers[0].peer_id, CONTROL);
    assert!(status.peers[0].card.is_some());
    assert!(!control.events("heartbeat").is_empty() || !control.events("agent_card").is_empty());
    assert!(!site.events("peer_status").is_empty());

    site.agent.shutdown(Duration::from_secs(1)).await;
    control.agent.shutdown(Duration::from_secs(1)).await;
    assert_eq!(site.agent.status(), AgentStatus::Offline);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_outstanding_request() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    network.set_down(CONTROL, true);

    site.agent.ingest_sample(reading(22.0, 1400));
    settle().await;
    assert_eq!(site.agent.pending().len(), 1);

    site.agent.shutdown(Duration::from_secs(1)).await;
    assert!(site.agent.pending().is_empty());
    assert!(site.agent.status_report().pending_requests.is_empty());
    assert!(site.events("decision").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_request_prepared_during_shutdown_is_released() {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);

    site.agent.ingest_sample(reading(22.0, 1400));
    assert_eq!(site.agent.pending().len(), 1);
    site.agent.shutdown_token().cancel();
    settle().await;

    assert!(site.agent.pending().is_empty());
    assert!(site.events("analysis_request").is_empty());
}
