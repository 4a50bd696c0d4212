//! Prompt composition and data-only answers over history.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::Duration;
use edge_protocol::{SensorField, SensorReading};
use serde::Serialize;

use super::{HistoricalAggregator, Statistics};

/// Fewer values than this give [`Trend::Insufficient`].
const MIN_TREND_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
    Insufficient,
}

/// Compare the mean of the newer half against the older half.
///
/// A shift of at most half a standard deviation counts as stable.
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < MIN_TREND_SAMPLES {
        return Trend::Insufficient;
    }
    let (older, newer) = values.split_at(values.len() / 2);
    let delta = Statistics::from_values(newer).mean - Statistics::from_values(older).mean;
    let spread = Statistics::from_values(values).stddev;

    if delta.abs() <= 0.5 * spread {
        Trend::Stable
    } else if delta > 0.0 {
        Trend::Rising
    } else {
        Trend::Falling
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSummary {
    #[serde(flatten)]
    pub stats: Statistics,
    pub trend: Trend,
}

/// Statistics and trends for every field with data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryContext {
    pub fields: BTreeMap<SensorField, FieldSummary>,
    pub total_readings: usize,
}

impl HistoryContext {
    pub fn collect(history: &HistoricalAggregator, window: Option<Duration>) -> Self {
        let since = window.map(|w| chrono::Utc::now() - w);
        let fields = SensorField::ALL
            .into_iter()
            .filter_map(|field| {
                let values = history.values_since(field, since);
                if values.is_empty() {
                    return None;
                }
                Some((
                    field,
                    FieldSummary {
                        stats: Statistics::from_values(&values),
                        trend: trend(&values),
                    },
                ))
            })
            .collect();
        Self {
            fields,
            total_readings: history.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn trends(&self) -> BTreeMap<SensorField, Trend> {
        self.fields.iter().map(|(f, s)| (*f, s.trend)).collect()
    }

    pub fn statistics(&self) -> BTreeMap<SensorField, Statistics> {
        self.fields.iter().map(|(f, s)| (*f, s.stats)).collect()
    }

    fn stats_block(&self) -> String {
        if self.fields.is_empty() {
            return "  No historical data\n".to_string();
        }
        let mut out = String::new();
        for (field, summary) in &self.fields {
            let s = &summary.stats;
            let _ = writeln!(
                out,
                "  {}: mean={:.2}, stddev={:.2}, min={}, max={}, n={}, trend={:?}",
                field.label(),
                s.mean,
                s.stddev,
                s.min,
                s.max,
                s.count,
                summary.trend
            );
        }
        out
    }
}

/// Describe which fields move and which hold, e.g.
/// "eCO2 rising while temperature, humidity stable".
pub fn cross_parameter(trends: &BTreeMap<SensorField, Trend>) -> Option<String> {
    let pick = |wanted: Trend| -> Vec<&'static str> {
        trends
            .iter()
            .filter(|(_, t)| **t == wanted)
            .map(|(f, _)| f.label())
            .collect()
    };
    let rising = pick(Trend::Rising);
    let falling = pick(Trend::Falling);
    let stable = pick(Trend::Stable);

    let mut moving = Vec::new();
    if !rising.is_empty() {
        moving.push(format!("{} rising", rising.join(", ")));
    }
    if !falling.is_empty() {
        moving.push(format!("{} falling", falling.join(", ")));
    }

    match (moving.is_empty(), stable.is_empty()) {
        (true, true) => None,
        (true, false) => Some("all tracked parameters stable".to_string()),
        (false, true) => Some(moving.join(" and ")),
        (false, false) => Some(format!("{} while {} stable", moving.join(" and "), stable.join(", "))),
    }
}

fn show<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
}

/// One-line reading, e.g. `temp=24.5C, humidity=65.2%, eCO2=1200ppm, TVOC=120ppb, AQI=1`.
pub fn describe_reading(reading: &SensorReading) -> String {
    format!(
        "temp={}C, humidity={}%, eCO2={}ppm, TVOC={}ppb, AQI={}",
        show(reading.temperature),
        show(reading.humidity),
        show(reading.eco2),
        show(reading.tvoc),
        show(reading.aqi)
    )
}

/// Local reasoning prompt on the agent that saw the anomaly.
pub fn site_prompt(reading: &SensorReading, previous: Option<&SensorReading>, reasons: &[String]) -> String {
    format!(
        "Analyze this sensor reading: {}. Previous reading: {}. Anomaly reasons: {}. \
         What is happening and what action should be taken?",
        describe_reading(reading),
        previous.map(describe_reading).unwrap_or_else(|| "none".to_string()),
        reasons.join("; ")
    )
}

/// Prompt for answering a peer's analysis request with historical context.
pub fn analysis_prompt(
    current: &SensorReading,
    reasons: &[String],
    context: &HistoryContext,
    peer_trace: Option<&str>,
) -> String {
    let mut prompt = String::from("Historical sensor analysis request.\n");
    let _ = writeln!(prompt, "Current reading: {}.", describe_reading(current));
    let _ = writeln!(prompt, "Anomaly reasons: {}", reasons.join("; "));
    let _ = write!(
        prompt,
        "Historical statistics ({} readings):\n{}",
        context.total_readings,
        context.stats_block()
    );
    if let Some(framing) = cross_parameter(&context.trends()) {
        let _ = writeln!(prompt, "Cross-parameter pattern: {framing}.");
    }
    let _ = writeln!(prompt, "Site agent's analysis: {}", peer_trace.unwrap_or("N/A"));
    prompt.push_str("Based on historical context, is this anomalous? What action is recommended?");
    prompt
}

/// Prompt for an operator question.
pub fn chat_prompt(question: &str, current: Option<&SensorReading>, context: &HistoryContext) -> String {
    let sensor_block = match current {
        Some(r) => format!(
            "- Temperature: {}C\n- Humidity: {}%\n- eCO2: {} ppm\n- TVOC: {} ppb\n- AQI: {}/5",
            show(r.temperature),
            show(r.humidity),
            show(r.eco2),
            show(r.tvoc),
            show(r.aqi)
        ),
        None => "- No live sensor data available".to_string(),
    };
    format!(
        "You are an assistant for an environmental monitoring system with an ENS160+AHT21 \
         sensor module.\n\nCurrent sensor data:\n{}\n\nHistorical statistics ({} readings):\n{}\n\
         User question: {}\n\nProvide a concise, factual answer based on the sensor data above.",
        sensor_block,
        context.total_readings,
        context.stats_block(),
        question
    )
}

/// Answer without a model: flag fields more than two standard deviations out.
///
/// Returns the answer and its confidence.
pub fn statistical_fallback(current: &SensorReading, context: &HistoryContext) -> (String, f64) {
    let deviations: Vec<String> = context
        .fields
        .iter()
        .filter_map(|(field, summary)| {
            let value = current.value(*field)?;
            let z = summary.stats.z_score(value)?;
            (z > 2.0).then(|| {
                format!(
                    "{}={} is {:.1} std devs from mean {:.2}",
                    field, value, z, summary.stats.mean
                )
            })
        })
        .collect();

    if deviations.is_empty() {
        (
            "Readings are within normal statistical range based on historical data.".to_string(),
            0.7,
        )
    } else {
        (
            format!("Statistical anomalies detected: {}", deviations.join("; ")),
            0.6,
        )
    }
}

/// Keyword answer from the latest reading, then historical means.
pub fn data_answer(
    question: &str,
    current: Option<&SensorReading>,
    context: &HistoryContext,
    place: &str,
) -> String {
    let q = question.to_lowercase();

    if let Some(r) = current {
        if q.contains("humid") {
            return format!("Current humidity at {} is {}%.", place, show(r.humidity));
        }
        if q.contains("temp") {
            return format!("Current temperature at {} is {}C.", place, show(r.temperature));
        }
        if q.contains("co2") || q.contains("carbon") {
            return format!("Current eCO2 at {} is {} ppm.", place, show(r.eco2));
        }
        if q.contains("voc") {
            return format!("Current TVOC at {} is {} ppb.", place, show(r.tvoc));
        }
        if q.contains("aqi") || q.contains("air quality") || q.contains("airquality") {
            return format!("Current AQI at {} is {}/5.", place, show(r.aqi));
        }
        return format!(
            "{} sensor readings: temperature {}C, humidity {}%, eCO2 {} ppm, TVOC {} ppb, AQI {}/5.",
            place,
            show(r.temperature),
            show(r.humidity),
            show(r.eco2),
            show(r.tvoc),
            show(r.aqi)
        );
    }

    if !context.is_empty() {
        let parts: Vec<String> = context
            .fields
            .iter()
            .map(|(f, s)| format!("{}: mean={:.2}", f, s.stats.mean))
            .collect();
        return format!("No live data available. Historical averages: {}.", parts.join(", "));
    }

    "No sensor data is available at this time.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> SensorReading {
        SensorReading {
            temperature: Some(24.5),
            humidity: Some(65.2),
            eco2: Some(1200),
            tvoc: Some(120),
            aqi: Some(1),
        }
    }

    fn context(values: &[(SensorField, &[f64])]) -> HistoryContext {
        HistoryContext {
            fields: values
                .iter()
                .map(|(f, v)| {
                    (
                        *f,
                        FieldSummary {
                            stats: Statistics::from_values(v),
                            trend: trend(v),
                        },
                    )
                })
                .collect(),
            total_readings: values.first().map(|(_, v)| v.len()).unwrap_or(0),
        }
    }

    #[test]
    fn test_trend() {
        assert_eq!(trend(&[1.0, 2.0, 3.0]), Trend::Insufficient);
        assert_eq!(trend(&[400.0, 410.0, 800.0, 900.0]), Trend::Rising);
        assert_eq!(trend(&[30.0, 29.0, 20.0, 19.0]), Trend::Falling);
        assert_eq!(trend(&[22.0, 22.1, 22.0, 22.1]), Trend::Stable);
        assert_eq!(trend(&[5.0, 5.0, 5.0, 5.0]), Trend::Stable);
    }

    #[test]
    fn test_cross_parameter_framing() {
        let ctx = context(&[
            (SensorField::Temperature, &[22.0, 22.1, 22.0, 22.1]),
            (SensorField::Humidity, &[50.0, 50.0, 50.0, 50.0]),
            (SensorField::Eco2, &[400.0, 410.0, 800.0, 900.0]),
        ]);
        assert_eq!(
            cross_parameter(&ctx.trends()).as_deref(),
            Some("eCO2 rising while temperature, humidity stable")
        );
        assert_eq!(cross_parameter(&BTreeMap::new()), None);
    }

    #[test]
    fn test_analysis_prompt_has_context() {
        let ctx = context(&[(SensorField::Eco2, &[400.0, 410.0, 800.0, 900.0])]);
        let prompt = analysis_prompt(
            &reading(),
            &["eCO2 1200ppm exceeds 1000ppm threshold".to_string()],
            &ctx,
            Some("ventilation failure likely"),
        );
        assert!(prompt.contains("eCO2=1200ppm"));
        assert!(prompt.contains("Historical statistics (4 readings)"));
        assert!(prompt.contains("Cross-parameter pattern: eCO2 rising."));
        assert!(prompt.contains("ventilation failure likely"));
    }

    #[test]
    fn test_statistical_fallback() {
        let normal = context(&[(SensorField::Eco2, &[1100.0, 1200.0, 1300.0, 1200.0])]);
        let (answer, confidence) = statistical_fallback(&reading(), &normal);
        assert_eq!(confidence, 0.7);
        assert!(answer.contains("within normal"));

        let low = context(&[(SensorField::Eco2, &[400.0, 410.0, 390.0, 400.0])]);
        let (answer, confidence) = statistical_fallback(&reading(), &low);
        assert_eq!(confidence, 0.6);
        assert!(answer.starts_with("Statistical anomalies detected: eco2=1200"));
    }

    #[test]
    fn test_data_answer_keywords() {
        let ctx = HistoryContext::default();
        let r = reading();
        assert_eq!(
            data_answer("How humid is it?", Some(&r), &ctx, "Site A"),
            "Current humidity at Site A is 65.2%."
        );
        assert_eq!(
            data_answer("What's the CO2 level", Some(&r), &ctx, "Site A"),
            "Current eCO2 at Site A is 1200 ppm."
        );
        assert_eq!(
            data_answer("air quality?", Some(&r), &ctx, "Site A"),
            "Current AQI at Site A is 1/5."
        );
        assert!(data_answer("status", Some(&r), &ctx, "Site A").starts_with("Site A sensor readings"));
        assert_eq!(
            data_answer("status", None, &ctx, "Site A"),
            "No sensor data is available at this time."
        );
    }
}
