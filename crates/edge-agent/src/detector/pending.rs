//! Outstanding analysis requests awaiting a peer response.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use edge_protocol::SensorReading;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Result of trying to open a request to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns a new pending entry under its request id.
    Reserved,
    /// A request to this peer is already outstanding; the anomaly was folded into it.
    Coalesced { request_id: String, count: u32 },
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub request_id: String,
    pub peer_id: String,
    pub reading: SensorReading,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Set once the request has been handed to the dispatcher.
    pub deadline: Option<Instant>,
    /// Anomalies folded into this request after it was opened.
    pub coalesced: u32,
    /// Local reasoning result, used for a degraded decision.
    pub local_conclusion: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    pub request_id: String,
    pub peer_id: String,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub coalesced: u32,
    /// Seconds until the deadline; absent while still being prepared.
    pub expires_in_secs: Option<f64>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<String, PendingEntry>,
    by_peer: HashMap<String, String>,
}

/// Request id to entry, with at most one entry per peer.
///
/// Entries are removed exactly once, by [`PendingTable::take`]; whoever takes an
/// entry owns the decision for it.
#[derive(Default)]
pub struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(
        &self,
        peer_id: &str,
        request_id: &str,
        reasons: Vec<String>,
        reading: SensorReading,
    ) -> Reservation {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_peer.get(peer_id).cloned() {
            if let Some(entry) = state.entries.get_mut(&existing) {
                entry.coalesced += 1;
                return Reservation::Coalesced {
                    request_id: existing,
                    count: entry.coalesced,
                };
            }
        }

        state
            .by_peer
            .insert(peer_id.to_string(), request_id.to_string());
        state.entries.insert(
            request_id.to_string(),
            PendingEntry {
                request_id: request_id.to_string(),
                peer_id: peer_id.to_string(),
                reading,
                reasons,
                created_at: Utc::now(),
                deadline: None,
                coalesced: 0,
                local_conclusion: None,
            },
        );
        Reservation::Reserved
    }

    /// Start the response deadline. False if the entry is already gone.
    pub fn arm(&self, request_id: &str, deadline: Instant, local_conclusion: Option<String>) -> bool {
        match self.state.lock().entries.get_mut(request_id) {
            Some(entry) => {
                entry.deadline = Some(deadline);
                entry.local_conclusion = local_conclusion;
                true
            }
            None => false,
        }
    }

    /// Remove and return an entry. Only the first caller gets it.
    pub fn take(&self, request_id: &str) -> Option<PendingEntry> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(request_id)?;
        if state.by_peer.get(&entry.peer_id).map(String::as_str) == Some(request_id) {
            state.by_peer.remove(&entry.peer_id);
        }
        Some(entry)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.state.lock().entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        let now = Instant::now();
        let mut out: Vec<PendingSnapshot> = self
            .state
            .lock()
            .entries
            .values()
            .map(|e| PendingSnapshot {
                request_id: e.request_id.clone(),
                peer_id: e.peer_id.clone(),
                reasons: e.reasons.clone(),
                created_at: e.created_at,
                coalesced: e.coalesced,
                expires_in_secs: e
                    .deadline
                    .map(|d| d.saturating_duration_since(now).as_secs_f64()),
            })
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }
}
