//! Agent orchestration.
//!
//! One [`Agent`] owns every component of a running agent: router, dispatcher,
//! detector, pending table, history, liveness, reasoning gate and event outlets.
//! Handles are cheap to clone and share one state object.
//!
//! ```text
//! sensor poll ──▶ ingest_sample ──▶ history / latest
//!                     │  └────────▶ detector ──anomaly──▶ analysis task ──▶ dispatcher ──▶ peer
//!                     └───────────▶ dispatcher (observation) ──▶ peer
//! POST /a2a/message ──▶ router ──▶ Inbound handlers (this module)
//! ```

mod analysis;
mod inbound;
mod query;
mod tasks;

pub use query::ChatAnswer;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use edge_protocol::{
    Ack, AgentCard, AgentRole, AgentStatus, Envelope, MessageBody, MessageFactory, SensorObservation,
    SensorReading,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AgentConfig;
use crate::delivery::{DeliveryDispatcher, Destination, QueueDepth, Transport};
use crate::detector::{AnomalyDetector, AnomalyThresholds, PendingSnapshot, PendingTable};
use crate::events::{AgentEvent, EventOutlets, LocalEventKind, RecentEvents};
use crate::history::{HistoricalAggregator, ObservationRecord};
use crate::liveness::{PeerSnapshot, PeerState, PeerTracker, PeerTransition};
use crate::reasoning::{Capability, Inference, InferenceError, ReasoningEngine, ReasoningGate};
use crate::router::{MessageRouter, ProtocolError};
use crate::sensor::SensorSource;
use crate::sink::RecordSink;
use crate::ws::StreamBroadcaster;

/// External collaborators, decided by the caller.
pub struct AgentDeps {
    pub transport: Arc<dyn Transport>,
    pub sink: Arc<dyn RecordSink>,
    pub sensor: Capability<Arc<dyn SensorSource>>,
    pub reasoning: Capability<Arc<dyn ReasoningEngine>>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    factory: MessageFactory,
    peer: Destination,
    outlets: EventOutlets,
    router: MessageRouter,
    dispatcher: DeliveryDispatcher,
    liveness: PeerTracker,
    transitions: Mutex<Option<mpsc::UnboundedReceiver<PeerTransition>>>,
    detector: AnomalyDetector,
    pending: PendingTable,
    history: HistoricalAggregator,
    latest: RwLock<Option<ObservationRecord>>,
    reasoning: ReasoningGate,
    sensor: Capability<Arc<dyn SensorSource>>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started_at: DateTime<Utc>,
}

/// Everything the status surface shows.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub uptime_secs: i64,
    pub peers: Vec<PeerSnapshot>,
    pub queues: Vec<QueueDepth>,
    pub pending_requests: Vec<PendingSnapshot>,
    pub stream_subscribers: usize,
    pub history: HistoryStatus,
    pub capabilities: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStatus {
    pub count: usize,
    pub horizon_hours: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(config: AgentConfig, deps: AgentDeps, shutdown: CancellationToken) -> Self {
        let agent_id = config.agent.id.clone();
        let peer = Destination::new(config.peer.id.clone(), config.peer.url.clone());

        let stream = StreamBroadcaster::new(config.stream.buffer);
        let recent = RecentEvents::new(config.stream.recent_messages, config.stream.recent_reasoning);
        let outlets = EventOutlets::with_recent(deps.sink, stream, recent);

        let (liveness, transitions) = PeerTracker::new(
            config.liveness.heartbeat_interval(),
            config.liveness.offline_after_missed,
        );
        liveness.track(&peer.agent_id);

        let dispatcher = DeliveryDispatcher::from_config(
            &config.delivery,
            deps.transport.clone(),
            liveness.clone(),
            outlets.clone(),
            shutdown.child_token(),
        );
        let router = MessageRouter::new(agent_id.clone(), config.router.replay_cache, outlets.clone());
        let detector = AnomalyDetector::new(AnomalyThresholds::from(&config.thresholds));
        let history = HistoricalAggregator::new(config.history.horizon());
        let reasoning = ReasoningGate::new(deps.reasoning, config.reasoning.timeout());

        Self {
            inner: Arc::new(AgentInner {
                factory: MessageFactory::new(agent_id),
                peer,
                outlets,
                router,
                dispatcher,
                liveness,
                transitions: Mutex::new(Some(transitions)),
                detector,
                pending: PendingTable::new(),
                history,
                latest: RwLock::new(None),
                reasoning,
                sensor: deps.sensor,
                transport: deps.transport,
                shutdown,
                tasks: TaskTracker::new(),
                started_at: Utc::now(),
                config,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        self.inner.factory.agent_id()
    }

    pub fn role(&self) -> AgentRole {
        self.inner.config.agent.role
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn peer(&self) -> &Destination {
        &self.inner.peer
    }

    pub fn stream(&self) -> &StreamBroadcaster {
        self.inner.outlets.stream()
    }

    /// Recently emitted messages and analysis events.
    pub fn recent(&self) -> &RecentEvents {
        self.inner.outlets.recent()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn history(&self) -> &HistoricalAggregator {
        &self.inner.history
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    pub fn liveness(&self) -> &PeerTracker {
        &self.inner.liveness
    }

    pub fn dispatcher(&self) -> &DeliveryDispatcher {
        &self.inner.dispatcher
    }

    /// Latest observation this agent knows of, local or from the peer.
    pub fn latest(&self) -> Option<ObservationRecord> {
        self.inner.latest.read().clone()
    }

    /// Entry point for `POST /a2a/message`.
    pub fn handle_inbound(&self, raw: &[u8]) -> Result<Ack, ProtocolError> {
        self.inner.router.handle(raw, self)
    }

    /// Discovery document. Only `status` changes over the agent's life.
    pub fn card(&self) -> AgentCard {
        let section = &self.inner.config.agent;
        let mut card = AgentCard::new(self.agent_id(), section.role, &section.model, &section.base_url());
        card.status = self.status();
        card
    }

    /// Degraded while the peer is not reachable or messages are queued for it.
    pub fn status(&self) -> AgentStatus {
        if self.inner.shutdown.is_cancelled() {
            return AgentStatus::Offline;
        }
        let peer = &self.inner.peer.agent_id;
        let backlog = self.inner.dispatcher.queue_depth(peer) > 0;
        match self.inner.liveness.state(peer) {
            PeerState::Degraded | PeerState::Offline => AgentStatus::Degraded,
            _ if backlog => AgentStatus::Degraded,
            _ => AgentStatus::Active,
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let bounds = self.inner.history.bounds();
        let mut capabilities = BTreeMap::new();
        capabilities.insert("sensor", self.inner.sensor.describe());
        capabilities.insert("reasoning", self.inner.reasoning.describe());

        StatusReport {
            agent_id: self.agent_id().to_string(),
            role: self.role(),
            status: self.status(),
            uptime_secs: (Utc::now() - self.inner.started_at).num_seconds(),
            peers: self.inner.liveness.snapshot(),
            queues: self.inner.dispatcher.queue_depths(),
            pending_requests: self.inner.pending.snapshot(),
            stream_subscribers: self.stream().subscriber_count(),
            history: HistoryStatus {
                count: self.inner.history.len(),
                horizon_hours: self.inner.history.horizon().num_hours(),
                oldest: bounds.map(|(oldest, _)| oldest),
                newest: bounds.map(|(_, newest)| newest),
            },
            capabilities,
        }
    }

    /// Take one local sensor sample through the pipeline.
    ///
    /// Records it, sends it to the peer, and starts an analysis cycle if it is
    /// anomalous. Returns the observation envelope.
    pub fn ingest_sample(&self, reading: SensorReading) -> Envelope {
        let inner = &self.inner;
        let sensor_name = inner
            .sensor
            .available()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| inner.config.sensor.name.clone());
        let observation = SensorObservation::new(sensor_name, &reading, inner.config.agent.location.clone());
        let envelope = inner.factory.envelope(
            Some(&inner.peer.agent_id),
            MessageBody::SensorObservation(observation.clone()),
        );

        self.remember(ObservationRecord::from_envelope(&envelope, &observation));
        let (anomalies, previous) = inner.detector.evaluate(self.agent_id(), &reading);
        inner.dispatcher.submit(&inner.peer, envelope.clone());

        if !anomalies.is_empty() {
            self.begin_analysis(&envelope, reading, previous, anomalies);
        }
        envelope
    }

    /// Add to history and move the latest pointer forward.
    fn remember(&self, record: ObservationRecord) {
        self.inner.history.record(record.clone());
        let mut latest = self.inner.latest.write();
        if latest.as_ref().is_none_or(|l| l.timestamp <= record.timestamp) {
            *latest = Some(record);
        }
    }

    /// Run a prompt through the gate, streaming tokens as `reasoning_token` events.
    async fn reason(&self, prompt: &str, request_id: Option<String>) -> Result<Inference, InferenceError> {
        if !self.inner.reasoning.is_available() {
            return self.inner.reasoning.infer(prompt, None).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let outlets = self.inner.outlets.clone();
        let forward = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                outlets.publish(AgentEvent::local(LocalEventKind::ReasoningToken {
                    request_id: request_id.clone(),
                    token,
                }));
            }
        });
        let result = self.inner.reasoning.infer(prompt, Some(tx)).await;
        let _ = forward.await;
        result
    }

    fn emit(&self, kind: LocalEventKind) {
        self.inner.outlets.emit(AgentEvent::local(kind));
    }

    /// Where to reply to `agent_id`. Only the configured peer is addressable.
    fn destination_for(&self, agent_id: &str) -> Option<Destination> {
        if agent_id == self.inner.peer.agent_id {
            Some(self.inner.peer.clone())
        } else {
            warn!("No route to agent {}, only {} is configured", agent_id, self.inner.peer.agent_id);
            None
        }
    }

    /// Stop background work: lanes first, then inference, then tasks.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Agent {} shutting down", self.agent_id());
        self.inner.shutdown.cancel();
        self.inner.dispatcher.close().await;
        self.inner.reasoning.drain(grace).await;
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!("Background tasks still running after {:?}, abandoning", grace);
        } else {
            debug!("Background tasks stopped");
        }
    }
}
