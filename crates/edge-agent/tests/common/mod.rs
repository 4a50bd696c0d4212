//! Test utilities and common setup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use dashmap::{DashMap, DashSet};
use edge_agent::api::{AppState, create_router};
use edge_agent::delivery::{Destination, Transport, TransportError};
use edge_agent::reasoning::Capability;
use edge_agent::sink::MemorySink;
use edge_agent::{Agent, AgentConfig, AgentDeps};
use edge_protocol::{
    Ack, AgentCard, AgentRole, AgentStatus, Envelope, Heartbeat, MessageBody, MessageFactory, SensorObservation,
    SensorReading,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

pub const SITE: &str = "jetson-site-a";
pub const CONTROL: &str = "macmini-control";

/// In-process network: delivering to an agent calls its inbound handler directly.
#[derive(Default)]
pub struct LoopbackNetwork {
    agents: DashMap<String, Agent>,
    down: DashSet<String>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build an agent with default settings for `role`, reachable on this network.
    pub fn spawn_agent(self: &Arc<Self>, role: AgentRole) -> TestAgent {
        self.spawn_agent_with(AgentConfig::for_role(role))
    }

    pub fn spawn_agent_with(self: &Arc<Self>, config: AgentConfig) -> TestAgent {
        let sink = Arc::new(MemorySink::new());
        let transport: Arc<dyn Transport> = self.clone();
        let deps = AgentDeps {
            transport,
            sink: sink.clone(),
            sensor: Capability::Unavailable("no sensor in tests".to_string()),
            reasoning: Capability::Unavailable("no model in tests".to_string()),
        };
        let agent = Agent::new(config, deps, CancellationToken::new());
        self.agents.insert(agent.agent_id().to_string(), agent.clone());
        TestAgent { agent, sink }
    }

    /// Make an agent unreachable (or reachable again).
    pub fn set_down(&self, agent_id: &str, down: bool) {
        if down {
            self.down.insert(agent_id.to_string());
        } else {
            self.down.remove(agent_id);
        }
    }

    fn reachable(&self, destination: &Destination) -> Result<Agent, TransportError> {
        if self.down.contains(&destination.agent_id) {
            return Err(TransportError::Connect(format!("{} is down", destination.agent_id)));
        }
        self.agents
            .get(&destination.agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Connect(format!("no agent {}", destination.agent_id)))
    }
}

#[async_trait]
impl Transport for LoopbackNetwork {
    async fn deliver(&self, destination: &Destination, envelope: &Envelope) -> Result<Ack, TransportError> {
        let agent = self.reachable(destination)?;
        let raw = serde_json::to_vec(envelope).map_err(|e| TransportError::Protocol(e.to_string()))?;
        agent.handle_inbound(&raw).map_err(|e| TransportError::Rejected {
            status: if e.is_unparseable() { 400 } else { 422 },
            message: e.code().to_string(),
        })
    }

    async fn fetch_card(&self, destination: &Destination) -> Result<AgentCard, TransportError> {
        Ok(self.reachable(destination)?.card())
    }
}

pub struct TestAgent {
    pub agent: Agent,
    pub sink: Arc<MemorySink>,
}

impl TestAgent {
    /// Recorded events of one type.
    pub fn events(&self, type_name: &str) -> Vec<Value> {
        self.sink.of_type(type_name)
    }
}

/// A site agent behind its HTTP router, with no reachable peer.
pub fn test_app() -> (Router, TestAgent) {
    let network = LoopbackNetwork::new();
    let site = network.spawn_agent(AgentRole::Site);
    let app = create_router(AppState::new(site.agent.clone()));
    (app, site)
}

pub fn reading(temperature: f64, eco2: i64) -> SensorReading {
    SensorReading {
        temperature: Some(temperature),
        humidity: Some(45.0),
        eco2: Some(eco2),
        tvoc: Some(120),
        aqi: Some(2),
    }
}

/// A wire-format observation from `from` to `to`.
pub fn observation_from(from: &str, to: &str, reading: &SensorReading) -> Envelope {
    MessageFactory::new(from).envelope(
        Some(to),
        MessageBody::SensorObservation(SensorObservation::new("ENS160+AHT21", reading, None)),
    )
}

pub fn heartbeat_from(from: &str, to: &str) -> Envelope {
    MessageFactory::new(from).envelope(
        Some(to),
        MessageBody::Heartbeat(Heartbeat {
            status: AgentStatus::Active,
        }),
    )
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Move a paused clock forward, running everything that becomes due.
pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}
