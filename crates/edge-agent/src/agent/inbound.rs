use edge_protocol::{
    AgentCard, AnalysisRequest, AnalysisResponse, Decision, Envelope, Heartbeat, Query, QueryResponse,
    SensorObservation,
};
use log::{debug, info, warn};

use super::Agent;
use crate::history::ObservationRecord;
use crate::router::Inbound;

impl Inbound for Agent {
    /// Any accepted message is a successful exchange with its sender.
    fn on_accepted(&self, envelope: &Envelope) {
        if envelope.from == self.inner.peer.agent_id {
            self.inner.liveness.observe(&envelope.from);
        } else {
            debug!("Accepted message from untracked agent {}", envelope.from);
        }
    }

    fn on_agent_card(&self, envelope: &Envelope, card: &AgentCard) {
        if card.agent_id != envelope.from {
            warn!(
                "Card from {} describes agent {}, ignoring",
                envelope.from, card.agent_id
            );
            return;
        }
        self.inner.liveness.observe_card(card.clone());
    }

    fn on_observation(&self, envelope: &Envelope, observation: &SensorObservation) {
        self.remember(ObservationRecord::from_envelope(envelope, observation));
    }

    fn on_analysis_request(&self, envelope: &Envelope, request: &AnalysisRequest) {
        let agent = self.clone();
        let envelope = envelope.clone();
        let request = request.clone();
        self.inner
            .tasks
            .spawn(async move { agent.answer_analysis(envelope, request).await });
    }

    fn on_analysis_response(&self, envelope: &Envelope, response: &AnalysisResponse) {
        self.complete_analysis(envelope, response);
    }

    fn on_decision(&self, envelope: &Envelope, decision: &Decision) {
        info!(
            "Decision {} from {} ({}): {}",
            decision.decision_id, envelope.from, decision.consensus, decision.summary
        );
    }

    fn on_heartbeat(&self, envelope: &Envelope, heartbeat: &Heartbeat) {
        debug!("Heartbeat from {} ({:?})", envelope.from, heartbeat.status);
    }

    fn on_query(&self, envelope: &Envelope, query: &Query) {
        self.answer_query(envelope, query);
    }

    fn on_query_response(&self, envelope: &Envelope, response: &QueryResponse) {
        info!(
            "Answer to query {} from {}: {}",
            response.in_reply_to, response.source_agent, response.answer
        );
        debug!("Query response {} carried {}", envelope.message_id, response.data);
    }
}
