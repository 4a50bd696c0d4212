//! Peer liveness tracking.
//!
//! Per peer: `unknown -> active -> degraded -> offline`. Any successful exchange
//! returns a peer to `active` from any state. Missed intervals are derived from
//! the time since the last exchange, so `tick` can run on any schedule.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use edge_protocol::AgentCard;
use log::info;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Unknown,
    Active,
    Degraded,
    Offline,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerState::Unknown => "unknown",
            PeerState::Active => "active",
            PeerState::Degraded => "degraded",
            PeerState::Offline => "offline",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTransition {
    pub peer_id: String,
    pub from: PeerState,
    pub to: PeerState,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    state: PeerState,
    last_seen: Option<Instant>,
    missed: u32,
    card: Option<AgentCard>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            state: PeerState::Unknown,
            last_seen: None,
            missed: 0,
            card: None,
        }
    }
}

/// Point-in-time view of one peer, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub state: PeerState,
    pub missed_intervals: u32,
    pub last_seen_secs_ago: Option<f64>,
    pub card: Option<AgentCard>,
}

#[derive(Clone)]
pub struct PeerTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    interval: Duration,
    offline_after: u32,
    peers: DashMap<String, PeerEntry>,
    transitions: mpsc::UnboundedSender<PeerTransition>,
}

impl PeerTracker {
    /// Returns the tracker and the stream of state transitions.
    pub fn new(
        interval: Duration,
        offline_after: u32,
    ) -> (Self, mpsc::UnboundedReceiver<PeerTransition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                interval: interval.max(Duration::from_millis(1)),
                offline_after: offline_after.max(1),
                peers: DashMap::new(),
                transitions: tx,
            }),
        };
        (tracker, rx)
    }

    /// Start tracking a peer in `unknown`.
    pub fn track(&self, peer_id: &str) {
        self.inner
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(PeerEntry::new);
    }

    /// Record a successful exchange with `peer_id`.
    pub fn observe(&self, peer_id: &str) {
        self.observe_at(peer_id, Instant::now());
    }

    pub fn observe_at(&self, peer_id: &str, now: Instant) {
        let previous = {
            let mut entry = self
                .inner
                .peers
                .entry(peer_id.to_string())
                .or_insert_with(PeerEntry::new);
            let previous = entry.state;
            entry.state = PeerState::Active;
            entry.last_seen = Some(now);
            entry.missed = 0;
            previous
        };
        self.transition(peer_id, previous, PeerState::Active);
    }

    /// Record a received agent card. Counts as a successful exchange.
    pub fn observe_card(&self, card: AgentCard) {
        let peer_id = card.agent_id.clone();
        self.inner
            .peers
            .entry(peer_id.clone())
            .or_insert_with(PeerEntry::new)
            .card = Some(card);
        self.observe(&peer_id);
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Re-evaluate every peer against the heartbeat interval.
    pub fn tick_at(&self, now: Instant) {
        let mut changed = Vec::new();
        for mut entry in self.inner.peers.iter_mut() {
            let Some(last_seen) = entry.last_seen else {
                continue;
            };
            let elapsed = now.saturating_duration_since(last_seen);
            let missed = (elapsed.as_nanos() / self.inner.interval.as_nanos()) as u32;
            entry.missed = missed;

            let next = if missed >= self.inner.offline_after {
                PeerState::Offline
            } else if missed >= 1 {
                PeerState::Degraded
            } else {
                PeerState::Active
            };
            if next != entry.state {
                changed.push((entry.key().clone(), entry.state, next));
                entry.state = next;
            }
        }
        for (peer_id, from, to) in changed {
            self.transition(&peer_id, from, to);
        }
    }

    fn transition(&self, peer_id: &str, from: PeerState, to: PeerState) {
        if from == to {
            return;
        }
        info!("Peer {} is now {} (was {})", peer_id, to, from);
        let _ = self.inner.transitions.send(PeerTransition {
            peer_id: peer_id.to_string(),
            from,
            to,
        });
    }

    pub fn state(&self, peer_id: &str) -> PeerState {
        self.inner
            .peers
            .get(peer_id)
            .map(|e| e.state)
            .unwrap_or(PeerState::Unknown)
    }

    pub fn is_active(&self, peer_id: &str) -> bool {
        self.state(peer_id) == PeerState::Active
    }

    pub fn card(&self, peer_id: &str) -> Option<AgentCard> {
        self.inner.peers.get(peer_id).and_then(|e| e.card.clone())
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let now = Instant::now();
        let mut peers: Vec<PeerSnapshot> = self
            .inner
            .peers
            .iter()
            .map(|entry| PeerSnapshot {
                peer_id: entry.key().clone(),
                state: entry.state,
                missed_intervals: entry.missed,
                last_seen_secs_ago: entry
                    .last_seen
                    .map(|t| now.saturating_duration_since(t).as_secs_f64()),
                card: entry.card.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(10);

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerTransition>) -> Vec<(PeerState, PeerState)> {
        let mut out = Vec::new();
        while let Ok(t) = rx.try_recv() {
            out.push((t.from, t.to));
        }
        out
    }

    #[tokio::test]
    async fn test_unknown_until_first_exchange() {
        let (tracker, mut rx) = PeerTracker::new(INTERVAL, 3);
        tracker.track("control");
        tracker.tick();
        assert_eq!(tracker.state("control"), PeerState::Unknown);
        assert!(drain(&mut rx).is_empty());

        tracker.observe("control");
        assert!(tracker.is_active("control"));
        assert_eq!(drain(&mut rx), vec![(PeerState::Unknown, PeerState::Active)]);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (tracker, mut rx) = PeerTracker::new(INTERVAL, 3);
        let t0 = Instant::now();
        tracker.observe_at("control", t0);

        tracker.tick_at(t0 + Duration::from_secs(9));
        assert_eq!(tracker.state("control"), PeerState::Active);

        tracker.tick_at(t0 + Duration::from_secs(10));
        assert_eq!(tracker.state("control"), PeerState::Degraded);

        tracker.tick_at(t0 + Duration::from_secs(25));
        assert_eq!(tracker.state("control"), PeerState::Degraded);

        tracker.tick_at(t0 + Duration::from_secs(30));
        assert_eq!(tracker.state("control"), PeerState::Offline);

        tracker.observe_at("control", t0 + Duration::from_secs(31));
        assert_eq!(tracker.state("control"), PeerState::Active);

        assert_eq!(
            drain(&mut rx),
            vec![
                (PeerState::Unknown, PeerState::Active),
                (PeerState::Active, PeerState::Degraded),
                (PeerState::Degraded, PeerState::Offline),
                (PeerState::Offline, PeerState::Active),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_observe_emits_once() {
        let (tracker, mut rx) = PeerTracker::new(INTERVAL, 3);
        tracker.observe("control");
        tracker.observe("control");
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_card_is_kept() {
        let (tracker, _rx) = PeerTracker::new(INTERVAL, 3);
        let card = AgentCard::new(
            "macmini-control",
            edge_protocol::AgentRole::Control,
            "lfm2.5-thinking",
            "http://localhost:8081",
        );
        tracker.observe_card(card.clone());
        assert_eq!(tracker.card("macmini-control"), Some(card));
        assert!(tracker.is_active("macmini-control"));
        assert_eq!(tracker.snapshot()[0].state, PeerState::Active);
    }
}
