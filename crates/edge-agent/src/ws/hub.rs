//! Fan-out of agent events to stream subscribers.

use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;

use crate::events::AgentEvent;

/// Default per-subscriber buffer.
pub const EVENT_BUFFER_SIZE: usize = 256;

/// Broadcasts every published event to all current subscribers.
#[derive(Clone)]
pub struct StreamBroadcaster {
    tx: broadcast::Sender<Arc<AgentEvent>>,
}

impl StreamBroadcaster {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Synchronous, non-blocking. Having no subscribers is not an error.
    pub fn publish(&self, event: Arc<AgentEvent>) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> StreamSubscription {
        StreamSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StreamBroadcaster {
    fn default() -> Self {
        Self::new(EVENT_BUFFER_SIZE)
    }
}

/// One subscriber's view of the stream.
pub struct StreamSubscription {
    rx: broadcast::Receiver<Arc<AgentEvent>>,
    dropped: u64,
}

impl StreamSubscription {
    /// Next event, skipping over any lost to overflow. `None` once the
    /// broadcaster is gone.
    pub async fn recv(&mut self) -> Option<Arc<AgentEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!("Stream subscriber lagged, dropped {} oldest event(s)", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Total events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
