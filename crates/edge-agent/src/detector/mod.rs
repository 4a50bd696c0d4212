//! Threshold-based anomaly detection.
//!
//! The detector keeps the last reading of each sensor stream and compares the
//! next one against it. The first reading of a stream never produces a
//! temperature-delta anomaly; channels that are `null` are skipped.

mod pending;

pub use pending::{PendingEntry, PendingSnapshot, PendingTable, Reservation};

use std::collections::HashMap;

use edge_protocol::SensorReading;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ThresholdConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TempDelta,
    Eco2,
    Tvoc,
    Aqi,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::TempDelta => "temp_delta",
            AnomalyKind::Eco2 => "eco2",
            AnomalyKind::Tvoc => "tvoc",
            AnomalyKind::Aqi => "aqi",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One triggered condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub value: f64,
    pub threshold: f64,
    pub description: String,
}

/// Conditions triggered by one reading, ordered by kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AnomalySet(Vec<Anomaly>);

impl AnomalySet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn kinds(&self) -> Vec<AnomalyKind> {
        self.0.iter().map(|a| a.kind).collect()
    }

    pub fn contains(&self, kind: AnomalyKind) -> bool {
        self.0.iter().any(|a| a.kind == kind)
    }

    /// Human-readable descriptions, one per condition.
    pub fn reasons(&self) -> Vec<String> {
        self.0.iter().map(|a| a.description.clone()).collect()
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Anomaly> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyThresholds {
    pub temp_delta: f64,
    pub eco2: i64,
    pub tvoc: i64,
    pub aqi: i64,
}

impl From<&ThresholdConfig> for AnomalyThresholds {
    fn from(config: &ThresholdConfig) -> Self {
        Self {
            temp_delta: config.temp_delta,
            eco2: config.eco2,
            tvoc: config.tvoc,
            aqi: config.aqi,
        }
    }
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self::from(&ThresholdConfig::default())
    }
}

/// Evaluates readings against thresholds. Keeps the last reading per stream.
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
    last: Mutex<HashMap<String, SensorReading>>,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            thresholds,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    /// Evaluate `reading` for `stream` and make it the stream's last reading.
    ///
    /// Returns the set together with the reading it was compared against.
    pub fn evaluate(&self, stream: &str, reading: &SensorReading) -> (AnomalySet, Option<SensorReading>) {
        let previous = self
            .last
            .lock()
            .insert(stream.to_string(), reading.clone());
        let set = self.evaluate_with_previous(reading, previous.as_ref());
        (set, previous)
    }

    /// Pure evaluation against an explicit previous reading.
    pub fn evaluate_with_previous(
        &self,
        reading: &SensorReading,
        previous: Option<&SensorReading>,
    ) -> AnomalySet {
        let t = &self.thresholds;
        let mut found = Vec::new();

        if let (Some(current), Some(prior)) = (reading.temperature, previous.and_then(|p| p.temperature)) {
            let delta = (current - prior).abs();
            if delta > t.temp_delta {
                found.push(Anomaly {
                    kind: AnomalyKind::TempDelta,
                    value: delta,
                    threshold: t.temp_delta,
                    description: format!(
                        "Temperature delta {:.1}C exceeds {}C threshold",
                        delta, t.temp_delta
                    ),
                });
            }
        }

        if let Some(eco2) = reading.eco2.filter(|v| *v > t.eco2) {
            found.push(Anomaly {
                kind: AnomalyKind::Eco2,
                value: eco2 as f64,
                threshold: t.eco2 as f64,
                description: format!("eCO2 {}ppm exceeds {}ppm threshold", eco2, t.eco2),
            });
        }

        if let Some(tvoc) = reading.tvoc.filter(|v| *v > t.tvoc) {
            found.push(Anomaly {
                kind: AnomalyKind::Tvoc,
                value: tvoc as f64,
                threshold: t.tvoc as f64,
                description: format!("TVOC {}ppb exceeds {}ppb threshold", tvoc, t.tvoc),
            });
        }

        if let Some(aqi) = reading.aqi.filter(|v| *v >= t.aqi) {
            found.push(Anomaly {
                kind: AnomalyKind::Aqi,
                value: aqi as f64,
                threshold: t.aqi as f64,
                description: format!("AQI {} at or above {} threshold", aqi, t.aqi),
            });
        }

        AnomalySet(found)
    }

    pub fn last_reading(&self, stream: &str) -> Option<SensorReading> {
        self.last.lock().get(stream).cloned()
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyThresholds::default())
    }
}
