//! Inbound message routing.
//!
//! `handle` decodes and validates one raw message, drops replays of a known
//! `message_id` with the ack it returned the first time, then records,
//! broadcasts, and dispatches the message to the matching [`Inbound`] handler.

use std::collections::{HashMap, VecDeque};

use edge_protocol::{
    Ack, AgentCard, AnalysisRequest, AnalysisResponse, AckStatus, Decision, DecodeError, Envelope, Heartbeat,
    MessageBody, Query, QueryResponse, Rejection, SensorObservation, decode,
};
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::events::{AgentEvent, EventOutlets};

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Invalid(#[from] DecodeError),

    /// The message claims to come from this agent.
    #[error("message {message_id} claims to be from this agent")]
    Loopback { message_id: String },
}

impl ProtocolError {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            ProtocolError::Invalid(e) => e.message_id.as_deref(),
            ProtocolError::Loopback { message_id } => Some(message_id),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Invalid(e) => e.error.code(),
            ProtocolError::Loopback { .. } => "loopback",
        }
    }

    /// Body could not be parsed as JSON at all.
    pub fn is_unparseable(&self) -> bool {
        matches!(self, ProtocolError::Invalid(e) if e.error.is_unparseable())
    }

    pub fn rejection(&self) -> Rejection {
        Rejection {
            status: AckStatus::Rejected,
            message_id: self.message_id().map(str::to_string),
            error: self.to_string(),
            code: self.code().to_string(),
        }
    }
}

/// Consumers of accepted messages, one method per kind.
///
/// Called synchronously from `handle`; long work must be spawned.
pub trait Inbound: Send + Sync {
    /// Any accepted message, before its kind-specific handler.
    fn on_accepted(&self, _envelope: &Envelope) {}

    fn on_agent_card(&self, envelope: &Envelope, card: &AgentCard);
    fn on_observation(&self, envelope: &Envelope, observation: &SensorObservation);
    fn on_analysis_request(&self, envelope: &Envelope, request: &AnalysisRequest);
    fn on_analysis_response(&self, envelope: &Envelope, response: &AnalysisResponse);
    fn on_decision(&self, envelope: &Envelope, decision: &Decision);
    fn on_heartbeat(&self, envelope: &Envelope, heartbeat: &Heartbeat);
    fn on_query(&self, envelope: &Envelope, query: &Query);
    fn on_query_response(&self, envelope: &Envelope, response: &QueryResponse);
}

/// Bounded memory of processed message ids and their acks.
struct SeenCache {
    acks: HashMap<String, Ack>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            acks: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Prior ack if `message_id` was seen, otherwise remember `ack`.
    fn check_and_insert(&mut self, message_id: &str, ack: &Ack) -> Option<Ack> {
        if let Some(prior) = self.acks.get(message_id) {
            return Some(prior.clone());
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.acks.remove(&oldest);
            }
        }
        self.order.push_back(message_id.to_string());
        self.acks.insert(message_id.to_string(), ack.clone());
        None
    }
}

pub struct MessageRouter {
    agent_id: String,
    seen: Mutex<SeenCache>,
    outlets: EventOutlets,
}

impl MessageRouter {
    pub fn new(agent_id: impl Into<String>, replay_cache: usize, outlets: EventOutlets) -> Self {
        Self {
            agent_id: agent_id.into(),
            seen: Mutex::new(SeenCache::new(replay_cache)),
            outlets,
        }
    }

    pub fn handle(&self, raw: &[u8], inbound: &dyn Inbound) -> Result<Ack, ProtocolError> {
        let envelope = decode(raw)?;
        envelope.check_recipient(&self.agent_id).map_err(|error| DecodeError {
            message_id: Some(envelope.message_id.clone()),
            error,
        })?;
        if envelope.from == self.agent_id {
            return Err(ProtocolError::Loopback {
                message_id: envelope.message_id,
            });
        }

        let ack = Ack::accepted(envelope.message_id.clone());
        if let Some(prior) = self.seen.lock().check_and_insert(&envelope.message_id, &ack) {
            debug!(
                "Replay of {} {} from {}, returning prior ack",
                envelope.kind(),
                envelope.message_id,
                envelope.from
            );
            return Ok(prior);
        }

        debug!(
            "Accepted {} {} from {}",
            envelope.kind(),
            envelope.message_id,
            envelope.from
        );
        self.outlets.emit(AgentEvent::received(envelope.clone()));
        inbound.on_accepted(&envelope);

        match &envelope.body {
            MessageBody::AgentCard(card) => inbound.on_agent_card(&envelope, card),
            MessageBody::SensorObservation(obs) => inbound.on_observation(&envelope, obs),
            MessageBody::AnalysisRequest(req) => inbound.on_analysis_request(&envelope, req),
            MessageBody::AnalysisResponse(resp) => inbound.on_analysis_response(&envelope, resp),
            MessageBody::Decision(decision) => inbound.on_decision(&envelope, decision),
            MessageBody::Heartbeat(hb) => inbound.on_heartbeat(&envelope, hb),
            MessageBody::Query(query) => inbound.on_query(&envelope, query),
            MessageBody::QueryResponse(resp) => inbound.on_query_response(&envelope, resp),
        }
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::ws::StreamBroadcaster;
    use edge_protocol::{AgentStatus, MessageFactory, SensorReading};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, what: &str, envelope: &Envelope) {
            self.calls.lock().push(format!("{what}:{}", envelope.message_id));
        }
    }

    impl Inbound for Recorder {
        fn on_accepted(&self, envelope: &Envelope) {
            self.push("accepted", envelope);
        }
        fn on_agent_card(&self, e: &Envelope, _: &AgentCard) {
            self.push("agent_card", e);
        }
        fn on_observation(&self, e: &Envelope, _: &SensorObservation) {
            self.push("observation", e);
        }
        fn on_analysis_request(&self, e: &Envelope, _: &AnalysisRequest) {
            self.push("analysis_request", e);
        }
        fn on_analysis_response(&self, e: &Envelope, _: &AnalysisResponse) {
            self.push("analysis_response", e);
        }
        fn on_decision(&self, e: &Envelope, _: &Decision) {
            self.push("decision", e);
        }
        fn on_heartbeat(&self, e: &Envelope, _: &Heartbeat) {
            self.push("heartbeat", e);
        }
        fn on_query(&self, e: &Envelope, _: &Query) {
            self.push("query", e);
        }
        fn on_query_response(&self, e: &Envelope, _: &QueryResponse) {
            self.push("query_response", e);
        }
    }

    fn router() -> (MessageRouter, Arc<MemorySink>, StreamBroadcaster) {
        let sink = Arc::new(MemorySink::new());
        let stream = StreamBroadcaster::new(16);
        let outlets = EventOutlets::new(sink.clone(), stream.clone());
        (MessageRouter::new("control", 100, outlets), sink, stream)
    }

    fn observation(factory: &MessageFactory, eco2: i64) -> Envelope {
        let reading = SensorReading {
            temperature: Some(24.5),
            humidity: Some(65.2),
            eco2: Some(eco2),
            tvoc: Some(120),
            aqi: Some(1),
        };
        factory.envelope(
            Some("control"),
            MessageBody::SensorObservation(SensorObservation::new("ENS160+AHT21", &reading, None)),
        )
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (router, sink, stream) = router();
        let mut sub = stream.subscribe();
        let recorder = Recorder::default();
        let env = observation(&MessageFactory::new("site"), 1200);
        let raw = serde_json::to_vec(&env).unwrap();

        let first = router.handle(&raw, &recorder).unwrap();
        let second = router.handle(&raw, &recorder).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.status, AckStatus::Accepted);

        assert_eq!(sink.len(), 1);
        assert_eq!(recorder.calls.lock().len(), 2);
        assert!(sub.recv().await.is_some());
    }

    #[test]
    fn test_dispatch_by_kind() {
        let (router, _, _) = router();
        let recorder = Recorder::default();
        let factory = MessageFactory::new("site");
        let hb = factory.envelope(
            None,
            MessageBody::Heartbeat(Heartbeat {
                status: AgentStatus::Active,
            }),
        );
        router
            .handle(&serde_json::to_vec(&hb).unwrap(), &recorder)
            .unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            vec![
                format!("accepted:{}", hb.message_id),
                format!("heartbeat:{}", hb.message_id)
            ]
        );
    }

    #[test]
    fn test_invalid_is_rejected_without_side_effects() {
        let (router, sink, _) = router();
        let recorder = Recorder::default();

        let err = router.handle(b"{not json", &recorder).unwrap_err();
        assert!(err.is_unparseable());
        assert_eq!(err.code(), "malformed");
        assert!(err.message_id().is_none());

        let env = observation(&MessageFactory::new("site"), -5);
        let err = router
            .handle(&serde_json::to_vec(&env).unwrap(), &recorder)
            .unwrap_err();
        assert_eq!(err.code(), "out_of_range");
        assert_eq!(err.message_id(), Some(env.message_id.as_str()));
        let rejection = err.rejection();
        assert_eq!(rejection.status, AckStatus::Rejected);

        assert!(sink.is_empty());
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn test_misaddressed_and_loopback() {
        let (router, _, _) = router();
        let recorder = Recorder::default();
        let factory = MessageFactory::new("site");
        let mut env = observation(&factory, 400);
        env.to = Some("someone-else".to_string());
        let err = router
            .handle(&serde_json::to_vec(&env).unwrap(), &recorder)
            .unwrap_err();
        assert_eq!(err.code(), "misaddressed");

        let own = observation(&MessageFactory::new("control"), 400);
        let err = router
            .handle(&serde_json::to_vec(&own).unwrap(), &recorder)
            .unwrap_err();
        assert_eq!(err.code(), "loopback");
    }

    #[test]
    fn test_replay_cache_is_bounded() {
        let mut cache = SeenCache::new(2);
        let ack = |id: &str| Ack::accepted(id);
        assert!(cache.check_and_insert("a", &ack("a")).is_none());
        assert!(cache.check_and_insert("b", &ack("b")).is_none());
        assert!(cache.check_and_insert("c", &ack("c")).is_none());
        assert!(cache.check_and_insert("a", &ack("a")).is_none());
        assert!(cache.check_and_insert("c", &ack("c")).is_some());
    }
}
