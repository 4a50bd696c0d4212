//! Rolling window of sensor observations.
//!
//! Samples are kept in timestamp order and evicted lazily on insert once they
//! fall behind `now - horizon`. Statistics are recomputed from the retained
//! samples on every call, so incremental and batch views cannot drift.

mod prompt;
mod stats;

pub use prompt::{
    FieldSummary, HistoryContext, Trend, analysis_prompt, chat_prompt, cross_parameter, data_answer,
    describe_reading, site_prompt, statistical_fallback, trend,
};
pub use stats::Statistics;

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use edge_protocol::{Envelope, SensorField, SensorObservation, SensorReading};
use parking_lot::RwLock;
use serde::Serialize;

/// One retained observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub message_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub reading: SensorReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ObservationRecord {
    pub fn from_envelope(envelope: &Envelope, observation: &SensorObservation) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            agent_id: envelope.from.clone(),
            timestamp: envelope.timestamp,
            reading: observation.reading(),
            location: observation.location.clone(),
        }
    }
}

#[derive(Default)]
struct Window {
    samples: VecDeque<ObservationRecord>,
    ids: HashSet<String>,
}

pub struct HistoricalAggregator {
    horizon: Duration,
    window: RwLock<Window>,
}

impl HistoricalAggregator {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            window: RwLock::new(Window::default()),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Insert an observation. Returns false for a known `message_id` or a
    /// sample already outside the horizon.
    pub fn record(&self, record: ObservationRecord) -> bool {
        let now = Utc::now().max(record.timestamp);
        self.record_at(record, now)
    }

    pub fn record_at(&self, record: ObservationRecord, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.horizon;
        let mut window = self.window.write();

        if window.ids.contains(&record.message_id) {
            return false;
        }
        while window.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            if let Some(evicted) = window.samples.pop_front() {
                window.ids.remove(&evicted.message_id);
            }
        }
        if record.timestamp < cutoff {
            return false;
        }

        window.ids.insert(record.message_id.clone());
        let pos = window
            .samples
            .partition_point(|s| s.timestamp <= record.timestamp);
        window.samples.insert(pos, record);
        true
    }

    /// Statistics over samples no older than `window` before now; all retained
    /// samples when `window` is `None`.
    pub fn statistics(&self, field: SensorField, window: Option<Duration>) -> Statistics {
        self.statistics_since(field, window.map(|w| Utc::now() - w))
    }

    pub fn statistics_since(&self, field: SensorField, since: Option<DateTime<Utc>>) -> Statistics {
        Statistics::from_values(&self.values_since(field, since))
    }

    /// Non-null values of `field`, oldest first.
    pub fn values_since(&self, field: SensorField, since: Option<DateTime<Utc>>) -> Vec<f64> {
        self.window
            .read()
            .samples
            .iter()
            .filter(|s| since.is_none_or(|t| s.timestamp >= t))
            .filter_map(|s| s.reading.value(field))
            .collect()
    }

    /// Statistics for every field that has data.
    pub fn summary(&self, window: Option<Duration>) -> BTreeMap<SensorField, Statistics> {
        let since = window.map(|w| Utc::now() - w);
        SensorField::ALL
            .into_iter()
            .map(|f| (f, self.statistics_since(f, since)))
            .filter(|(_, s)| !s.is_empty())
            .collect()
    }

    /// The `n` latest observations, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ObservationRecord> {
        let window = self.window.read();
        let skip = window.samples.len().saturating_sub(n);
        window.samples.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<ObservationRecord> {
        self.window.read().samples.back().cloned()
    }

    /// Oldest and newest retained timestamps.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let window = self.window.read();
        Some((window.samples.front()?.timestamp, window.samples.back()?.timestamp))
    }

    pub fn len(&self) -> usize {
        self.window.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
