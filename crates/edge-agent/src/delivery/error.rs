//! Delivery error types.

use thiserror::Error;

/// A single transport attempt failed.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Destination URL cannot be used.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// Peer refused our credentials.
    #[error("unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Peer rejected the message itself. Resending it unchanged will not help.
    #[error("rejected by peer (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// Peer answered but is overloaded or failing.
    #[error("peer unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    /// Peer answered 2xx with a body we cannot read.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Transient errors are retried and then queued; the rest abort at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::InvalidDestination(_)
            | TransportError::Unauthorized { .. }
            | TransportError::Rejected { .. } => false,
            TransportError::Unavailable { .. }
            | TransportError::Connect(_)
            | TransportError::Timeout
            | TransportError::Protocol(_) => true,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_builder() {
            TransportError::InvalidDestination(err.to_string())
        } else if err.is_decode() {
            TransportError::Protocol(err.to_string())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Outcome reported to the caller of `send`. Never fatal to the agent.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// All attempts failed; the message waits in the destination's queue.
    #[error("delivery to {destination} failed after {attempts} attempt(s), queued ({queue_depth} pending): {last_error}")]
    Queued {
        destination: String,
        attempts: u32,
        queue_depth: usize,
        last_error: String,
    },

    /// Non-retryable failure; the message is not queued.
    #[error("delivery to {destination} rejected: {source}")]
    Rejected {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// Single-attempt message failed; it is not queued.
    #[error("delivery to {destination} failed: {source}")]
    Failed {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// Single-attempt message skipped because older messages are still queued.
    #[error("{destination} has {queue_depth} queued message(s), not sent")]
    Backlogged {
        destination: String,
        queue_depth: usize,
    },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}
