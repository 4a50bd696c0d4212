//! Sensor readings over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use edge_protocol::SensorReading;
use reqwest::Client;
use serde::Deserialize;

use super::{SensorSource, SourceError};

/// Body of the sensor endpoint: a reading or `{"error": "..."}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SensorBody {
    Error { error: String },
    Reading(SensorReading),
}

/// `GET {url}` returning the current reading as JSON.
pub struct HttpSensorSource {
    client: Client,
    url: String,
    name: String,
}

impl HttpSensorSource {
    pub fn new(url: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            name: name.into(),
        })
    }
}

fn parse_body(body: &str) -> Result<SensorReading, SourceError> {
    match serde_json::from_str::<SensorBody>(body) {
        Ok(SensorBody::Error { error }) => Err(SourceError::Unavailable(error)),
        Ok(SensorBody::Reading(reading)) if reading.is_empty() => {
            Err(SourceError::Unavailable("reading has no values".to_string()))
        }
        Ok(SensorBody::Reading(reading)) => Ok(reading),
        Err(e) => Err(SourceError::Unavailable(format!("unreadable sensor body: {e}"))),
    }
}

#[async_trait]
impl SensorSource for HttpSensorSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<SensorReading, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("HTTP {status}: {body}")));
        }
        parse_body(&body)
    }
}
