//! Wire transport to a peer agent.

use std::time::Duration;

use async_trait::async_trait;
use edge_protocol::{Ack, AgentCard, Envelope, messages::Rejection};
use reqwest::{Client, StatusCode, Url};

use super::error::TransportError;

/// Where a message is going.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub agent_id: String,
    /// `http(s)://host:port` of the peer.
    pub base_url: String,
}

impl Destination {
    pub fn new(agent_id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            agent_id: agent_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        let url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| TransportError::InvalidDestination(format!("{}: {}", self.base_url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(TransportError::InvalidDestination(format!(
                "unsupported scheme '{}' in {}",
                other, self.base_url
            ))),
        }
    }
}

/// One request/response exchange with a peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message, returning the peer's acknowledgement.
    async fn deliver(&self, destination: &Destination, envelope: &Envelope) -> Result<Ack, TransportError>;

    /// Fetch the peer's discovery document.
    async fn fetch_card(&self, destination: &Destination) -> Result<AgentCard, TransportError>;
}

/// HTTP transport: `POST {base}/a2a/message`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidDestination(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Map a non-success status to a transport error.
    async fn error_for(response: reqwest::Response) -> TransportError {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized {
                status: status.as_u16(),
            },
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                TransportError::Unavailable {
                    status: status.as_u16(),
                }
            }
            s if s.is_server_error() => TransportError::Unavailable {
                status: status.as_u16(),
            },
            _ => {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<Rejection>(&body)
                    .map(|r| format!("{} ({})", r.error, r.code))
                    .unwrap_or(body);
                TransportError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, destination: &Destination, envelope: &Envelope) -> Result<Ack, TransportError> {
        let url = destination.url("/a2a/message")?;
        let response = self.client.post(url).json(envelope).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        response
            .json::<Ack>()
            .await
            .map_err(|e| TransportError::Protocol(format!("parsing ack: {e}")))
    }

    async fn fetch_card(&self, destination: &Destination) -> Result<AgentCard, TransportError> {
        let url = destination.url(AgentCard::WELL_KNOWN_PATH)?;
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }
        response
            .json::<AgentCard>()
            .await
            .map_err(|e| TransportError::Protocol(format!("parsing agent card: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_protocol::{AgentStatus, Heartbeat, MessageBody, MessageFactory};

    #[test]
    fn test_destination_trims_slash() {
        let dest = Destination::new("control", "http://localhost:8081/");
        assert_eq!(dest.base_url, "http://localhost:8081");
        assert_eq!(
            dest.url("/a2a/message").unwrap().as_str(),
            "http://localhost:8081/a2a/message"
        );
    }

    #[test]
    fn test_bad_destination_rejected() {
        let dest = Destination::new("control", "not a url");
        assert!(matches!(
            dest.url("/a2a/message"),
            Err(TransportError::InvalidDestination(_))
        ));

        let ftp = Destination::new("control", "ftp://files.example");
        assert!(matches!(
            ftp.url("/a2a/message"),
            Err(TransportError::InvalidDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_destination_is_not_retryable() {
        let transport = HttpTransport::new(Duration::from_secs(1)).unwrap();
        let env = MessageFactory::new("site").envelope(
            None,
            MessageBody::Heartbeat(Heartbeat {
                status: AgentStatus::Active,
            }),
        );
        let err = transport
            .deliver(&Destination::new("control", "::nope::"), &env)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
