//! Sensor reading values shared by observations, samples and history.

use serde::{Deserialize, Serialize};

/// One set of ENS160+AHT21 values.
///
/// Every field is optional: a sensor that is still warming up or has faulted on
/// one channel reports `null` for it, and consumers skip that channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Degrees Celsius.
    #[serde(default, alias = "temp")]
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Equivalent CO2, ppm.
    #[serde(default)]
    pub eco2: Option<i64>,
    /// Total volatile organic compounds, ppb.
    #[serde(default)]
    pub tvoc: Option<i64>,
    /// Air quality index, 1 (excellent) to 5 (unhealthy).
    #[serde(default)]
    pub aqi: Option<i64>,
}

impl SensorReading {
    /// Value of one field as a float, if present.
    pub fn value(&self, field: SensorField) -> Option<f64> {
        match field {
            SensorField::Temperature => self.temperature,
            SensorField::Humidity => self.humidity,
            SensorField::Eco2 => self.eco2.map(|v| v as f64),
            SensorField::Tvoc => self.tvoc.map(|v| v as f64),
            SensorField::Aqi => self.aqi.map(|v| v as f64),
        }
    }

    /// True when no channel produced a value.
    pub fn is_empty(&self) -> bool {
        SensorField::ALL.iter().all(|f| self.value(*f).is_none())
    }
}

/// A numeric channel of a [`SensorReading`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorField {
    Temperature,
    Humidity,
    Eco2,
    Tvoc,
    Aqi,
}

impl SensorField {
    pub const ALL: [SensorField; 5] = [
        SensorField::Temperature,
        SensorField::Humidity,
        SensorField::Eco2,
        SensorField::Tvoc,
        SensorField::Aqi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Eco2 => "eco2",
            SensorField::Tvoc => "tvoc",
            SensorField::Aqi => "aqi",
        }
    }

    /// Human label used in prompts and answers.
    pub fn label(self) -> &'static str {
        match self {
            SensorField::Temperature => "temperature",
            SensorField::Humidity => "humidity",
            SensorField::Eco2 => "eCO2",
            SensorField::Tvoc => "TVOC",
            SensorField::Aqi => "AQI",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SensorField::Temperature => "C",
            SensorField::Humidity => "%",
            SensorField::Eco2 => "ppm",
            SensorField::Tvoc => "ppb",
            SensorField::Aqi => "/5",
        }
    }
}

impl std::fmt::Display for SensorField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SensorField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorField::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sensor field: {s}"))
    }
}
