//! The anomaly request/response cycle.
//!
//! The detecting agent reserves a pending entry, reasons locally, sends an
//! `AnalysisRequest` and waits for the response deadline. Whichever of
//! "response arrived" and "deadline passed" takes the pending entry first
//! produces the one decision for that request.

use std::collections::BTreeSet;

use edge_protocol::{
    AnalysisRequest, AnalysisResponse, CONSENSUS_COLLABORATIVE, CONSENSUS_DEGRADED, Decision, Envelope,
    MessageBody, MessageFactory, SensorReading,
};
use log::{debug, info, warn};
use serde_json::{Value, json};
use tokio::time::Instant;

use super::Agent;
use crate::detector::{AnomalySet, PendingEntry, Reservation};
use crate::events::{AgentEvent, LocalEventKind};
use crate::history::{
    HistoryContext, analysis_prompt, cross_parameter, site_prompt, statistical_fallback,
};
use crate::reasoning::InferenceError;

pub(super) const ANALYSIS_QUESTION: &str =
    "Anomaly detected in sensor readings. Please analyze with historical context.";

impl Agent {
    /// Open (or coalesce into) an analysis request for an anomalous sample.
    pub(super) fn begin_analysis(
        &self,
        observation: &Envelope,
        reading: SensorReading,
        previous: Option<SensorReading>,
        anomalies: AnomalySet,
    ) {
        let inner = &self.inner;
        let reasons = anomalies.reasons();
        let fresh_id = MessageFactory::new_id();
        let (request_id, coalesced) =
            match inner
                .pending
                .reserve(&inner.peer.agent_id, &fresh_id, reasons.clone(), reading.clone())
            {
                Reservation::Reserved => (fresh_id, false),
                Reservation::Coalesced { request_id, count } => {
                    info!(
                        "Anomaly in {} folded into outstanding request {} ({} so far)",
                        observation.message_id, request_id, count
                    );
                    (request_id, true)
                }
            };

        warn!(
            "Anomaly detected in {}: {}",
            observation.message_id,
            reasons.join("; ")
        );
        self.emit(LocalEventKind::AnomalyDetected {
            stream: self.agent_id().to_string(),
            observation_id: observation.message_id.clone(),
            reading: reading.clone(),
            anomalies: anomalies.anomalies().to_vec(),
            coalesced,
            request_id: Some(request_id.clone()),
        });
        if coalesced {
            return;
        }

        let agent = self.clone();
        let observation_id = observation.message_id.clone();
        inner.tasks.spawn(async move {
            agent
                .request_analysis(request_id, observation_id, reading, previous, anomalies)
                .await;
        });
    }

    async fn request_analysis(
        self,
        request_id: String,
        observation_id: String,
        reading: SensorReading,
        previous: Option<SensorReading>,
        anomalies: AnomalySet,
    ) {
        let inner = &self.inner;
        let reasons = anomalies.reasons();

        let prompt = site_prompt(&reading, previous.as_ref(), &reasons);
        let trace = match self.reason(&prompt, Some(request_id.clone())).await {
            Ok(inference) => Some(inference.conclusion),
            Err(InferenceError::Unavailable(_)) => None,
            Err(e) => {
                warn!("Local reasoning for {} failed: {}", request_id, e);
                None
            }
        };
        if inner.shutdown.is_cancelled() {
            self.abandon_request(&request_id);
            return;
        }

        let request = AnalysisRequest {
            question: ANALYSIS_QUESTION.to_string(),
            context: json!({
                "current": reading,
                "previous": previous,
                "anomaly_reasons": reasons,
                "anomalies": anomalies,
                "observation_id": observation_id,
                "location": inner.config.agent.location,
            }),
            reasoning_trace: trace.clone(),
        };
        let envelope = inner.factory.envelope_with_id(
            request_id.clone(),
            Some(&inner.peer.agent_id),
            MessageBody::AnalysisRequest(request),
        );

        let deadline = Instant::now() + inner.config.analysis.response_deadline();
        if !inner.pending.arm(&request_id, deadline, trace) {
            debug!("Request {} settled before it was sent", request_id);
            return;
        }
        info!("Requesting analysis {} from {}", request_id, inner.peer.agent_id);
        inner.dispatcher.submit(&inner.peer, envelope);

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => self.expire_request(&request_id),
            _ = inner.shutdown.cancelled() => self.abandon_request(&request_id),
        }
    }

    /// Release a request that will never be decided because the agent is stopping.
    fn abandon_request(&self, request_id: &str) {
        if self.inner.pending.take(request_id).is_some() {
            info!("Abandoning analysis request {} at shutdown", request_id);
        }
    }

    /// Deadline passed: decide locally if the response has not claimed the entry.
    fn expire_request(&self, request_id: &str) {
        let Some(entry) = self.inner.pending.take(request_id) else {
            debug!("Request {} already answered", request_id);
            return;
        };
        warn!(
            "No analysis response for {} from {} within {:?}, deciding without it",
            request_id,
            entry.peer_id,
            self.inner.config.analysis.response_deadline()
        );

        let summary = match &entry.local_conclusion {
            Some(conclusion) => conclusion.clone(),
            None => {
                let context = HistoryContext::collect(&self.inner.history, None);
                statistical_fallback(&entry.reading, &context).0
            }
        };
        let decision = Decision {
            decision_id: MessageFactory::new_id(),
            participants: BTreeSet::from([self.agent_id().to_string()]),
            summary,
            consensus: CONSENSUS_DEGRADED.to_string(),
            reasoning: format!(
                "Peer {} unavailable; local analysis only. Anomaly reasons: {}.{}",
                entry.peer_id,
                entry.reasons.join("; "),
                coalesced_note(&entry)
            ),
            request_id: entry.request_id.clone(),
            response_id: None,
            degraded: true,
        };
        let envelope = self
            .inner
            .factory
            .envelope(None, MessageBody::Decision(decision));
        self.inner.outlets.emit(AgentEvent::local_message(envelope));
    }

    /// A response for one of our requests arrived.
    pub(super) fn complete_analysis(&self, envelope: &Envelope, response: &AnalysisResponse) {
        let Some(entry) = self.inner.pending.take(&response.in_reply_to) else {
            warn!(
                "Dropping analysis response {} from {}: request {} is not pending",
                envelope.message_id, envelope.from, response.in_reply_to
            );
            return;
        };
        if entry.peer_id != envelope.from {
            warn!(
                "Request {} was sent to {} but answered by {}",
                entry.request_id, entry.peer_id, envelope.from
            );
        }

        let local = entry
            .local_conclusion
            .as_deref()
            .unwrap_or("no local reasoning");
        let decision = Decision {
            decision_id: MessageFactory::new_id(),
            participants: BTreeSet::from([self.agent_id().to_string(), envelope.from.clone()]),
            summary: response.answer.clone(),
            consensus: CONSENSUS_COLLABORATIVE.to_string(),
            reasoning: format!(
                "Local: {} Remote ({}, confidence {:.2}): {}.{}",
                local,
                envelope.from,
                response.confidence,
                response.answer,
                coalesced_note(&entry)
            ),
            request_id: entry.request_id.clone(),
            response_id: Some(envelope.message_id.clone()),
            degraded: false,
        };
        info!(
            "Decision for {} reached with {}",
            entry.request_id, envelope.from
        );
        let out = self.inner.factory.envelope(
            Some(&self.inner.peer.agent_id),
            MessageBody::Decision(decision),
        );
        self.inner.dispatcher.submit(&self.inner.peer, out);
    }

    /// Answer a peer's request from local history.
    pub(super) async fn answer_analysis(self, request_envelope: Envelope, request: AnalysisRequest) {
        let inner = &self.inner;
        let Some(destination) = self.destination_for(&request_envelope.from) else {
            return;
        };

        let current = request
            .context
            .get("current")
            .cloned()
            .and_then(|v| serde_json::from_value::<SensorReading>(v).ok())
            .or_else(|| self.latest().map(|l| l.reading))
            .unwrap_or_default();
        let reasons: Vec<String> = request
            .context
            .get("anomaly_reasons")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let context = HistoryContext::collect(&inner.history, None);
        let prompt = analysis_prompt(
            &current,
            &reasons,
            &context,
            request.reasoning_trace.as_deref(),
        );
        let (answer, confidence, trace, source) =
            match self.reason(&prompt, Some(request_envelope.message_id.clone())).await {
                Ok(inference) => (
                    inference.conclusion,
                    inference.confidence,
                    inference.thinking,
                    "model",
                ),
                Err(e) => {
                    if !matches!(e, InferenceError::Unavailable(_)) {
                        warn!(
                            "Reasoning for request {} failed, using statistics: {}",
                            request_envelope.message_id, e
                        );
                    }
                    let (answer, confidence) = statistical_fallback(&current, &context);
                    (answer, confidence, None, "statistical")
                }
            };
        if inner.shutdown.is_cancelled() {
            return;
        }

        let response = AnalysisResponse {
            in_reply_to: request_envelope.message_id.clone(),
            answer,
            confidence,
            reasoning: json!({
                "statistics": context.statistics(),
                "trends": context.trends(),
                "cross_parameter": cross_parameter(&context.trends()),
                "total_readings": context.total_readings,
                "source": source,
            }),
            reasoning_trace: trace,
        };
        let envelope = inner.factory.envelope(
            Some(&destination.agent_id),
            MessageBody::AnalysisResponse(response),
        );
        info!(
            "Answering analysis request {} from {}",
            request_envelope.message_id, destination.agent_id
        );
        inner.dispatcher.submit(&destination, envelope);
    }
}

fn coalesced_note(entry: &PendingEntry) -> String {
    match entry.coalesced {
        0 => String::new(),
        1 => " 1 further anomaly was folded into this request.".to_string(),
        n => format!(" {n} further anomalies were folded into this request."),
    }
}
