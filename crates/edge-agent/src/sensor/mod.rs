//! Sensor sources.
//!
//! A source yields one [`SensorReading`] per call. Failures are never anomalies:
//! the poll loop treats them as "no new data".

mod http;

pub use http::HttpSensorSource;

use std::time::Duration;

use async_trait::async_trait;
use edge_protocol::SensorReading;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Still inside the post-start warm-up period.
    #[error("sensor warming up ({remaining:?} remaining): {reason}")]
    WarmingUp { remaining: Duration, reason: String },

    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SensorSource: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self) -> Result<SensorReading, SourceError>;
}

/// Reports failures during the first `warmup` after creation as [`SourceError::WarmingUp`].
pub struct WarmupSource<S> {
    inner: S,
    started: Instant,
    warmup: Duration,
}

impl<S: SensorSource> WarmupSource<S> {
    pub fn new(inner: S, warmup: Duration) -> Self {
        Self {
            inner,
            started: Instant::now(),
            warmup,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.warmup
            .checked_sub(self.started.elapsed())
            .filter(|d| !d.is_zero())
    }
}

#[async_trait]
impl<S: SensorSource> SensorSource for WarmupSource<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn read(&self) -> Result<SensorReading, SourceError> {
        match self.inner.read().await {
            Ok(reading) => Ok(reading),
            Err(SourceError::Unavailable(reason)) => match self.remaining() {
                Some(remaining) => Err(SourceError::WarmingUp { remaining, reason }),
                None => Err(SourceError::Unavailable(reason)),
            },
            Err(e) => Err(e),
        }
    }
}
