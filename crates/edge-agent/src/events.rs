//! Events emitted by an agent.
//!
//! An event is either a protocol message (sent, received, or produced locally)
//! or a local signal. The same serialized event goes to the record sink and to
//! stream subscribers, so both see identical JSON.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use edge_protocol::{Envelope, MessageKind, SensorReading};
use parking_lot::Mutex;
use serde::Serialize;

use crate::detector::Anomaly;
use crate::liveness::PeerState;
use crate::sink::RecordSink;
use crate::ws::StreamBroadcaster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
    /// Produced and kept locally, never delivered.
    Local,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AgentEvent {
    Message {
        direction: Direction,
        #[serde(flatten)]
        envelope: Envelope,
    },
    Local(LocalEvent),
}

impl AgentEvent {
    pub fn sent(envelope: Envelope) -> Self {
        AgentEvent::Message {
            direction: Direction::Sent,
            envelope,
        }
    }

    pub fn received(envelope: Envelope) -> Self {
        AgentEvent::Message {
            direction: Direction::Received,
            envelope,
        }
    }

    pub fn local_message(envelope: Envelope) -> Self {
        AgentEvent::Message {
            direction: Direction::Local,
            envelope,
        }
    }

    pub fn local(kind: LocalEventKind) -> Self {
        AgentEvent::Local(LocalEvent {
            timestamp: Utc::now(),
            kind,
        })
    }

    /// The `type` field as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            AgentEvent::Message { envelope, .. } => envelope.kind().as_str(),
            AgentEvent::Local(local) => local.kind.type_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LocalEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Delivered,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalEventKind {
    /// First event on a new stream connection.
    Connected { agent_id: String },

    AnomalyDetected {
        stream: String,
        observation_id: String,
        reading: SensorReading,
        anomalies: Vec<Anomaly>,
        /// Folded into an already outstanding request.
        coalesced: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    PeerStatus {
        peer_id: String,
        previous: PeerState,
        status: PeerState,
    },

    DeliveryAttempt {
        message_id: String,
        message_type: MessageKind,
        destination: String,
        attempt: u32,
        outcome: AttemptOutcome,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    MessageQueued {
        message_id: String,
        destination: String,
        queue_depth: usize,
        reason: String,
    },

    MessageDropped {
        message_id: String,
        destination: String,
        reason: String,
    },

    ReasoningToken {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        token: String,
    },

    ChatExchange {
        question: String,
        answer: String,
        source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        forwarded_query_id: Option<String>,
    },
}

impl LocalEventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LocalEventKind::Connected { .. } => "connected",
            LocalEventKind::AnomalyDetected { .. } => "anomaly_detected",
            LocalEventKind::PeerStatus { .. } => "peer_status",
            LocalEventKind::DeliveryAttempt { .. } => "delivery_attempt",
            LocalEventKind::MessageQueued { .. } => "message_queued",
            LocalEventKind::MessageDropped { .. } => "message_dropped",
            LocalEventKind::ReasoningToken { .. } => "reasoning_token",
            LocalEventKind::ChatExchange { .. } => "chat_exchange",
        }
    }
}

/// Default number of protocol messages kept for replay.
pub const RECENT_MESSAGES: usize = 100;
/// Default number of anomaly and analysis events kept for replay.
pub const RECENT_REASONING: usize = 20;

/// Bounded replay of recent emitted events for the read API.
///
/// `messages` keeps protocol messages except heartbeats and cards.
/// `reasoning` keeps `anomaly_detected`, analysis responses and decisions.
pub struct RecentEvents {
    messages: Mutex<VecDeque<AgentEvent>>,
    reasoning: Mutex<VecDeque<AgentEvent>>,
    message_capacity: usize,
    reasoning_capacity: usize,
}

impl Default for RecentEvents {
    fn default() -> Self {
        Self::new(RECENT_MESSAGES, RECENT_REASONING)
    }
}

impl RecentEvents {
    pub fn new(message_capacity: usize, reasoning_capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            reasoning: Mutex::new(VecDeque::new()),
            message_capacity: message_capacity.max(1),
            reasoning_capacity: reasoning_capacity.max(1),
        }
    }

    fn observe(&self, event: &AgentEvent) {
        let (is_message, is_reasoning) = match event {
            AgentEvent::Message { envelope, .. } => {
                let kind = envelope.kind();
                (
                    !matches!(kind, MessageKind::Heartbeat | MessageKind::AgentCard),
                    matches!(kind, MessageKind::AnalysisResponse | MessageKind::Decision),
                )
            }
            AgentEvent::Local(local) => (
                false,
                matches!(local.kind, LocalEventKind::AnomalyDetected { .. }),
            ),
        };
        if is_message {
            push_bounded(&self.messages, event, self.message_capacity);
        }
        if is_reasoning {
            push_bounded(&self.reasoning, event, self.reasoning_capacity);
        }
    }

    /// Up to `limit` most recent messages, oldest first.
    pub fn messages(&self, limit: usize) -> Vec<AgentEvent> {
        let messages = self.messages.lock();
        let skip = messages.len().saturating_sub(limit);
        messages.iter().skip(skip).cloned().collect()
    }

    /// Retained anomaly and analysis events, oldest first.
    pub fn reasoning(&self) -> Vec<AgentEvent> {
        self.reasoning.lock().iter().cloned().collect()
    }
}

fn push_bounded(ring: &Mutex<VecDeque<AgentEvent>>, event: &AgentEvent, capacity: usize) {
    let mut ring = ring.lock();
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(event.clone());
}

/// Where events go: the record sink, the stream, the replay rings.
#[derive(Clone)]
pub struct EventOutlets {
    sink: Arc<dyn RecordSink>,
    stream: StreamBroadcaster,
    recent: Arc<RecentEvents>,
}

impl EventOutlets {
    pub fn new(sink: Arc<dyn RecordSink>, stream: StreamBroadcaster) -> Self {
        Self::with_recent(sink, stream, RecentEvents::default())
    }

    pub fn with_recent(sink: Arc<dyn RecordSink>, stream: StreamBroadcaster, recent: RecentEvents) -> Self {
        Self {
            sink,
            stream,
            recent: Arc::new(recent),
        }
    }

    /// Record, keep for replay, and broadcast.
    pub fn emit(&self, event: AgentEvent) {
        let event = Arc::new(event);
        self.sink.append(&event);
        self.recent.observe(&event);
        self.stream.publish(event);
    }

    /// Record only.
    pub fn record(&self, event: AgentEvent) {
        self.sink.append(&event);
    }

    /// Broadcast only.
    pub fn publish(&self, event: AgentEvent) {
        self.stream.publish(Arc::new(event));
    }

    pub fn stream(&self) -> &StreamBroadcaster {
        &self.stream
    }

    pub fn recent(&self) -> &RecentEvents {
        &self.recent
    }
}
