//! Operator chat and peer queries.

use edge_protocol::{Envelope, MessageBody, Query, QueryResponse};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use super::Agent;
use crate::events::LocalEventKind;
use crate::history::{HistoryContext, chat_prompt, data_answer};
use crate::reasoning::InferenceError;

const EMPTY_QUESTION_ANSWER: &str = "Please ask a question.";
const DEFAULT_PLACE: &str = "the site";

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    /// `model`, `data`, or `none` for an empty question.
    pub source: &'static str,
    pub data_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_query_id: Option<String>,
}

impl Agent {
    /// Answer an operator question and forward it to the peer.
    pub async fn chat(&self, question: &str) -> ChatAnswer {
        let question = question.trim();
        if question.is_empty() {
            return ChatAnswer {
                answer: EMPTY_QUESTION_ANSWER.to_string(),
                source: "none",
                data_used: false,
                forwarded_query_id: None,
            };
        }

        let latest = self.latest();
        let current = latest.as_ref().map(|l| &l.reading);
        let context = HistoryContext::collect(&self.inner.history, None);
        let data_used = current.is_some() || !context.is_empty();

        let (answer, source) = match self.reason(&chat_prompt(question, current, &context), None).await {
            Ok(inference) => (inference.conclusion, "model"),
            Err(e) => {
                if !matches!(e, InferenceError::Unavailable(_)) {
                    warn!("Chat reasoning failed, answering from data: {}", e);
                }
                (data_answer(question, current, &context, &self.place()), "data")
            }
        };

        let query = Query {
            question: question.to_string(),
            source: "dashboard".to_string(),
            context: json!({ "local_answer": answer }),
        };
        let envelope = self
            .inner
            .factory
            .envelope(Some(&self.inner.peer.agent_id), MessageBody::Query(query));
        let forwarded_query_id = Some(envelope.message_id.clone());
        self.inner.dispatcher.submit(&self.inner.peer, envelope);

        self.emit(LocalEventKind::ChatExchange {
            question: question.to_string(),
            answer: answer.clone(),
            source: source.to_string(),
            forwarded_query_id: forwarded_query_id.clone(),
        });
        ChatAnswer {
            answer,
            source,
            data_used,
            forwarded_query_id,
        }
    }

    /// Reply to a peer's query with a data answer and the latest reading.
    pub(super) fn answer_query(&self, envelope: &Envelope, query: &Query) {
        let Some(destination) = self.destination_for(&envelope.from) else {
            return;
        };
        let latest = self.latest();
        let current = latest.as_ref().map(|l| &l.reading);
        let context = HistoryContext::collect(&self.inner.history, None);
        let answer = data_answer(&query.question, current, &context, &self.place());

        info!("Answering query {} from {}", envelope.message_id, envelope.from);
        let response = QueryResponse {
            in_reply_to: envelope.message_id.clone(),
            answer,
            data: json!({
                "current": latest,
                "statistics": context.statistics(),
                "total_readings": context.total_readings,
            }),
            source_agent: self.agent_id().to_string(),
        };
        let reply = self.inner.factory.envelope(
            Some(&destination.agent_id),
            MessageBody::QueryResponse(response),
        );
        self.inner.dispatcher.submit(&destination, reply);
    }

    /// How answers name the monitored location.
    fn place(&self) -> String {
        self.inner
            .config
            .agent
            .location
            .clone()
            .or_else(|| self.latest().and_then(|l| l.location))
            .unwrap_or_else(|| DEFAULT_PLACE.to_string())
    }
}
