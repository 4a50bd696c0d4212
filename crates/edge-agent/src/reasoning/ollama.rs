//! Ollama `/api/generate` client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{Capability, Inference, InferenceError, MODEL_CONFIDENCE, ReasoningEngine};
use crate::config::ReasoningConfig;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// One NDJSON line of a streaming generate response.
#[derive(Debug, Default, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OllamaEngine {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OllamaEngine {
    pub fn new(config: &ReasoningConfig) -> Result<Self, InferenceError> {
        // No overall timeout: responses stream and the gate bounds the call.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| InferenceError::Unreachable(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Probe Ollama once and decide whether reasoning is available.
    pub async fn detect(config: &ReasoningConfig) -> Capability<Arc<dyn ReasoningEngine>> {
        if !config.enabled {
            return Capability::Unavailable("disabled in configuration".to_string());
        }
        let engine = match Self::new(config) {
            Ok(engine) => engine,
            Err(e) => return Capability::Unavailable(e.to_string()),
        };
        match engine.probe().await {
            Ok(models) => {
                if has_model(&models, &engine.model) {
                    info!("Reasoning model {} available at {}", engine.model, engine.base_url);
                } else {
                    warn!(
                        "Model {} not found in Ollama (available: {}); run `ollama pull {}`",
                        engine.model,
                        models.join(", "),
                        engine.model
                    );
                }
                let engine: Arc<dyn ReasoningEngine> = Arc::new(engine);
                Capability::Available(engine)
            }
            Err(e) => {
                warn!("Cannot reach Ollama at {}: {}", engine.base_url, e);
                Capability::Unavailable(e.to_string())
            }
        }
    }

    /// Installed model names.
    pub async fn probe(&self) -> Result<Vec<String>, InferenceError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| InferenceError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::Stream(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

/// Ollama may report `model:tag` for `model`.
fn has_model(models: &[String], model: &str) -> bool {
    models
        .iter()
        .any(|m| m == model || m.starts_with(&format!("{model}:")))
}

#[async_trait]
impl ReasoningEngine for OllamaEngine {
    fn model(&self) -> &str {
        &self.model
    }

    async fn infer(
        &self,
        prompt: &str,
        tokens: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Inference, InferenceError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true,
            "options": {
                "temperature": 0.7,
                "top_p": 0.9,
                "num_predict": self.max_tokens,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let mut acc = Accumulator::new(tokens);
        let mut buf: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| InferenceError::Stream(e.to_string()))?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if acc.push_line(&line)? {
                    break 'read;
                }
            }
        }
        if !acc.done && !buf.is_empty() {
            acc.push_line(&buf)?;
        }
        acc.finish()
    }
}

/// Collects streamed text and forwards tokens.
struct Accumulator {
    response: String,
    thinking: String,
    done: bool,
    tokens: Option<mpsc::UnboundedSender<String>>,
}

impl Accumulator {
    fn new(tokens: Option<mpsc::UnboundedSender<String>>) -> Self {
        Self {
            response: String::new(),
            thinking: String::new(),
            done: false,
            tokens,
        }
    }

    /// Returns true once the stream reports completion.
    fn push_line(&mut self, line: &[u8]) -> Result<bool, InferenceError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }
        let chunk: GenerateChunk =
            serde_json::from_str(line).map_err(|e| InferenceError::Stream(format!("bad chunk: {e}")))?;
        if let Some(error) = chunk.error {
            return Err(InferenceError::Stream(error));
        }
        if let Some(thinking) = chunk.thinking {
            self.thinking.push_str(&thinking);
        }
        if !chunk.response.is_empty() {
            if let Some(tx) = &self.tokens {
                let _ = tx.send(chunk.response.clone());
            }
            self.response.push_str(&chunk.response);
        }
        self.done = chunk.done;
        Ok(chunk.done)
    }

    fn finish(self) -> Result<Inference, InferenceError> {
        let (inline_thinking, conclusion) = split_thinking(&self.response);
        let thinking = [self.thinking.trim(), inline_thinking.as_deref().unwrap_or("")]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let conclusion = if conclusion.is_empty() {
            // Some thinking models spend the whole budget thinking.
            thinking.clone()
        } else {
            conclusion
        };
        if conclusion.is_empty() {
            return Err(InferenceError::Empty);
        }
        Ok(Inference {
            conclusion,
            thinking: (!thinking.is_empty()).then_some(thinking),
            confidence: MODEL_CONFIDENCE,
        })
    }
}

/// Split `<think>...</think>` from the answer. An unclosed block is all thinking.
pub fn split_thinking(text: &str) -> (Option<String>, String) {
    let Some(start) = text.find(THINK_OPEN) else {
        return (None, text.trim().to_string());
    };
    let before = &text[..start];
    let rest = &text[start + THINK_OPEN.len()..];
    match rest.find(THINK_CLOSE) {
        Some(end) => {
            let thinking = rest[..end].trim().to_string();
            let after = &rest[end + THINK_CLOSE.len()..];
            let conclusion = format!("{}{}", before, after).trim().to_string();
            ((!thinking.is_empty()).then_some(thinking), conclusion)
        }
        None => {
            let thinking = rest.trim().to_string();
            ((!thinking.is_empty()).then_some(thinking), before.trim().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_thinking() {
        assert_eq!(
            split_thinking("<think>eco2 high, temp flat</think>\nVentilation issue."),
            (
                Some("eco2 high, temp flat".to_string()),
                "Ventilation issue.".to_string()
            )
        );
        assert_eq!(split_thinking("Plain answer"), (None, "Plain answer".to_string()));
        assert_eq!(
            split_thinking("<think>still going"),
            (Some("still going".to_string()), String::new())
        );
    }

    #[test]
    fn test_accumulator_streams_tokens() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut acc = Accumulator::new(Some(tx));
        assert!(!acc.push_line(br#"{"response":"<think>hm</think>Open ","done":false}"#).unwrap());
        assert!(!acc.push_line(b"\n").unwrap());
        assert!(acc.push_line(br#"{"response":"a window.","done":true}"#).unwrap());

        assert_eq!(rx.try_recv().unwrap(), "<think>hm</think>Open ");
        assert_eq!(rx.try_recv().unwrap(), "a window.");

        let inference = acc.finish().unwrap();
        assert_eq!(inference.conclusion, "Open a window.");
        assert_eq!(inference.thinking.as_deref(), Some("hm"));
        assert_eq!(inference.confidence, MODEL_CONFIDENCE);
    }

    #[test]
    fn test_thinking_field_and_errors() {
        let mut acc = Accumulator::new(None);
        acc.push_line(br#"{"thinking":"co2 climbing","response":"","done":false}"#)
            .unwrap();
        acc.push_line(br#"{"response":"Check HVAC.","done":true}"#).unwrap();
        let inference = acc.finish().unwrap();
        assert_eq!(inference.thinking.as_deref(), Some("co2 climbing"));
        assert_eq!(inference.conclusion, "Check HVAC.");

        let mut failing = Accumulator::new(None);
        assert!(matches!(
            failing.push_line(br#"{"error":"model not found"}"#),
            Err(InferenceError::Stream(_))
        ));
        assert!(matches!(Accumulator::new(None).finish(), Err(InferenceError::Empty)));
    }

    #[test]
    fn test_model_matching() {
        let models = vec!["lfm2.5-thinking:latest".to_string(), "llama3".to_string()];
        assert!(has_model(&models, "lfm2.5-thinking"));
        assert!(has_model(&models, "llama3"));
        assert!(!has_model(&models, "lfm2"));
    }

    #[tokio::test]
    async fn test_disabled_is_unavailable() {
        let config = ReasoningConfig {
            enabled: false,
            ..ReasoningConfig::default()
        };
        assert!(!OllamaEngine::detect(&config).await.is_available());
    }
}
