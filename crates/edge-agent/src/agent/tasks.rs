//! Background loops: peer transitions, heartbeats, sensor polling.

use std::sync::Arc;

use edge_protocol::{Heartbeat, MessageBody};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::Agent;
use crate::events::LocalEventKind;
use crate::liveness::{PeerState, PeerTransition};
use crate::sensor::{SensorSource, SourceError};

impl Agent {
    /// Spawn the background loops. Must be called inside a runtime; later calls are ignored.
    pub fn start(&self) {
        let Some(transitions) = self.inner.transitions.lock().take() else {
            warn!("Agent {} already started", self.agent_id());
            return;
        };
        info!(
            "Agent {} ({}) starting, peer {} at {}",
            self.agent_id(),
            self.role().as_str(),
            self.inner.peer.agent_id,
            self.inner.peer.base_url
        );

        self.inner.tasks.spawn(self.clone().watch_peers(transitions));
        self.inner.tasks.spawn(self.clone().heartbeat_loop());
        match self.inner.sensor.available() {
            Some(source) => {
                self.inner
                    .tasks
                    .spawn(self.clone().poll_loop(source.clone()));
            }
            None => info!("Sensor polling disabled: {}", self.inner.sensor.describe()),
        }
    }

    async fn watch_peers(self, mut transitions: mpsc::UnboundedReceiver<PeerTransition>) {
        loop {
            let transition = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                next = transitions.recv() => match next {
                    Some(transition) => transition,
                    None => break,
                },
            };

            self.emit(LocalEventKind::PeerStatus {
                peer_id: transition.peer_id.clone(),
                previous: transition.from,
                status: transition.to,
            });
            if transition.to != PeerState::Active {
                continue;
            }
            self.inner.dispatcher.kick(&transition.peer_id);
            if transition.peer_id == self.inner.peer.agent_id
                && matches!(transition.from, PeerState::Unknown | PeerState::Offline)
            {
                self.announce();
            }
        }
    }

    /// Send our card to the peer.
    fn announce(&self) {
        let peer = &self.inner.peer;
        debug!("Announcing card to {}", peer.agent_id);
        let envelope = self
            .inner
            .factory
            .envelope(Some(&peer.agent_id), MessageBody::AgentCard(self.card()));
        self.inner.dispatcher.submit(peer, envelope);
    }

    async fn heartbeat_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.liveness.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.inner.liveness.tick();
            self.exchange_heartbeat().await;
        }
        debug!("Heartbeat loop stopped");
    }

    /// Heartbeat a reachable peer; otherwise probe its card.
    ///
    /// With a backlog the card probe is used too, so a heartbeat never
    /// overtakes queued messages.
    async fn exchange_heartbeat(&self) {
        let peer = &self.inner.peer;
        let reachable = matches!(
            self.inner.liveness.state(&peer.agent_id),
            PeerState::Active | PeerState::Degraded
        );

        if reachable && self.inner.dispatcher.queue_depth(&peer.agent_id) == 0 {
            let envelope = self.inner.factory.envelope(
                Some(&peer.agent_id),
                MessageBody::Heartbeat(Heartbeat {
                    status: self.status(),
                }),
            );
            if let Err(e) = self.inner.dispatcher.probe(peer, envelope).await {
                debug!("Heartbeat to {} not delivered: {}", peer.agent_id, e);
            }
            return;
        }

        let fetched = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => return,
            fetched = self.inner.transport.fetch_card(peer) => fetched,
        };
        match fetched {
            Ok(card) if card.agent_id == peer.agent_id => self.inner.liveness.observe_card(card),
            Ok(card) => warn!(
                "Agent at {} identifies as {}, expected {}",
                peer.base_url, card.agent_id, peer.agent_id
            ),
            Err(e) => debug!("Peer {} not reachable: {}", peer.agent_id, e),
        }
    }

    async fn poll_loop(self, source: Arc<dyn SensorSource>) {
        let mut ticker = tokio::time::interval(self.inner.config.sensor.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Polling {} every {:?}",
            source.name(),
            self.inner.config.sensor.poll_interval()
        );
        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match source.read().await {
                Ok(reading) => {
                    self.ingest_sample(reading);
                }
                Err(SourceError::WarmingUp { remaining, reason }) => {
                    debug!("Sensor warming up ({:?} left): {}", remaining, reason);
                }
                Err(SourceError::Unavailable(reason)) => {
                    info!("No sensor data: {}", reason);
                }
            }
        }
        debug!("Sensor polling stopped");
    }
}
