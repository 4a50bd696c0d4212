//! Access to the reasoning engine.
//!
//! The engine is a shared, serially used resource: [`ReasoningGate`] admits one
//! inference at a time and bounds each call, queue wait included, by the
//! configured timeout. Callers fall back to a data answer on any error.

mod ollama;

pub use ollama::{OllamaEngine, split_thinking};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};

/// Confidence reported for a model answer.
pub const MODEL_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inference {
    pub conclusion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("reasoning engine unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning engine unreachable: {0}")]
    Unreachable(String),

    #[error("reasoning engine returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("reasoning stream failed: {0}")]
    Stream(String),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("reasoning engine returned no text")]
    Empty,

    #[error("reasoning gate closed")]
    Closed,
}

/// A model that turns a prompt into a conclusion.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn model(&self) -> &str;

    /// Run one prompt. When `tokens` is set, response tokens are forwarded as
    /// they arrive.
    async fn infer(
        &self,
        prompt: &str,
        tokens: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Inference, InferenceError>;
}

/// Optional collaborator, decided once at startup.
#[derive(Clone)]
pub enum Capability<T> {
    Available(T),
    Unavailable(String),
}

impl<T> Capability<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            Capability::Available(t) => Some(t),
            Capability::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }

    /// Human-readable state for the status surface.
    pub fn describe(&self) -> String {
        match self {
            Capability::Available(_) => "available".to_string(),
            Capability::Unavailable(reason) => format!("unavailable: {reason}"),
        }
    }
}

impl<T> std::fmt::Debug for Capability<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Serializes and bounds access to the engine.
pub struct ReasoningGate {
    engine: Capability<Arc<dyn ReasoningEngine>>,
    permit: Semaphore,
    timeout: Duration,
}

impl ReasoningGate {
    pub fn new(engine: Capability<Arc<dyn ReasoningEngine>>, timeout: Duration) -> Self {
        Self {
            engine,
            permit: Semaphore::new(1),
            timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_available()
    }

    pub fn describe(&self) -> String {
        match self.engine.available() {
            Some(engine) => format!("available ({})", engine.model()),
            None => self.engine.describe(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.permit.available_permits() == 0
    }

    pub async fn infer(
        &self,
        prompt: &str,
        tokens: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Inference, InferenceError> {
        let engine = match &self.engine {
            Capability::Available(engine) => engine.clone(),
            Capability::Unavailable(reason) => return Err(InferenceError::Unavailable(reason.clone())),
        };

        let run = async {
            let _permit = self
                .permit
                .acquire()
                .await
                .map_err(|_| InferenceError::Closed)?;
            debug!("Running inference on {} ({} chars)", engine.model(), prompt.len());
            engine.infer(prompt, tokens).await
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Inference on {} timed out after {:?}", engine.model(), self.timeout);
                Err(InferenceError::Timeout(self.timeout))
            }
        }
    }

    /// Wait up to `grace` for an in-flight inference, then refuse new ones.
    ///
    /// Returns false if the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = match tokio::time::timeout(grace, self.permit.acquire()).await {
            Ok(Ok(_permit)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!("Abandoning in-flight inference after {:?}", grace);
                false
            }
        };
        self.permit.close();
        drained
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers after `delay` with a fixed conclusion.
    pub(crate) struct FixedEngine {
        pub delay: Duration,
        pub conclusion: String,
        pub calls: AtomicUsize,
        pub running: AtomicUsize,
        pub max_running: AtomicUsize,
    }

    impl FixedEngine {
        pub(crate) fn new(delay: Duration, conclusion: &str) -> Self {
            Self {
                delay,
                conclusion: conclusion.to_string(),
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ReasoningEngine for FixedEngine {
        fn model(&self) -> &str {
            "fixed"
        }

        async fn infer(
            &self,
            _prompt: &str,
            tokens: Option<mpsc::UnboundedSender<String>>,
        ) -> Result<Inference, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(tx) = tokens {
                let _ = tx.send(self.conclusion.clone());
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Inference {
                conclusion: self.conclusion.clone(),
                thinking: Some("checked ventilation".to_string()),
                confidence: MODEL_CONFIDENCE,
            })
        }
    }

    fn gate(delay: Duration, timeout: Duration) -> (ReasoningGate, Arc<FixedEngine>) {
        let engine = Arc::new(FixedEngine::new(delay, "ventilation failure"));
        let shared: Arc<dyn ReasoningEngine> = engine.clone();
        let gate = ReasoningGate::new(Capability::Available(shared), timeout);
        (gate, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_inference_at_a_time() {
        let (gate, engine) = gate(Duration::from_secs(2), Duration::from_secs(20));
        let gate = Arc::new(gate);
        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.infer("a", None).await }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.infer("b", None).await }
        });
        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_yields_error() {
        let (gate, _) = gate(Duration::from_secs(30), Duration::from_secs(5));
        let err = gate.infer("slow", None).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(_)));
        assert!(!gate.is_busy());
    }

    #[tokio::test]
    async fn test_unavailable_engine() {
        let gate = ReasoningGate::new(Capability::Unavailable("disabled".into()), Duration::from_secs(5));
        assert!(!gate.is_available());
        assert_eq!(gate.describe(), "unavailable: disabled");
        assert!(matches!(
            gate.infer("x", None).await,
            Err(InferenceError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_refuses_new_work() {
        let (gate, _) = gate(Duration::from_secs(1), Duration::from_secs(20));
        assert!(gate.drain(Duration::from_secs(1)).await);
        assert!(matches!(gate.infer("late", None).await, Err(InferenceError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_forwarded() {
        let (gate, _) = gate(Duration::from_millis(10), Duration::from_secs(20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inference = gate.infer("x", Some(tx)).await.unwrap();
        assert_eq!(inference.conclusion, "ventilation failure");
        assert_eq!(rx.recv().await.as_deref(), Some("ventilation failure"));
    }
}
