//! WebSocket handler for stream subscribers.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::hub::{StreamBroadcaster, StreamSubscription};
use crate::api::AppState;
use crate::events::{AgentEvent, LocalEventKind};

/// WebSocket upgrade handler.
///
/// GET /stream
pub async fn stream_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let agent = state.agent.clone();
    let hub = agent.stream().clone();
    let agent_id = agent.agent_id().to_string();
    let ping_interval = agent.config().stream.ping_interval();
    let shutdown = agent.shutdown_token();

    ws.on_upgrade(move |socket| handle_stream_connection(socket, hub, agent_id, ping_interval, shutdown))
}

/// Handle one subscriber connection.
async fn handle_stream_connection(
    socket: WebSocket,
    hub: StreamBroadcaster,
    agent_id: String,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before greeting so nothing published in between is missed.
    let mut subscription: StreamSubscription = hub.subscribe();
    info!(
        "Stream subscriber connected ({} total)",
        hub.subscriber_count()
    );

    let connected = AgentEvent::local(LocalEventKind::Connected {
        agent_id: agent_id.clone(),
    });
    match serde_json::to_string(&connected) {
        Ok(json) => {
            if let Err(e) = sender.send(Message::Text(json.into())).await {
                warn!("Failed to greet stream subscriber: {}", e);
                return;
            }
        }
        Err(e) => warn!("Failed to serialize connected event: {}", e),
    }

    let send_shutdown = shutdown.clone();
    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(event.as_ref()) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize {} event: {}", event.type_name(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }

                _ = send_shutdown.cancelled() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = shutdown.cancelled() => break,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                debug!("Ignoring client text on stream: {}", text.as_str());
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Ignoring client binary message on stream");
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!("Stream connection error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    info!("Stream subscriber for {} disconnected", agent_id);
}
