//! In-memory sink for tests and embedding.

use parking_lot::Mutex;
use serde_json::Value;

use super::RecordSink;
use crate::events::AgentEvent;

/// Keeps every appended event as JSON.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().clone()
    }

    /// Events whose `type` equals `type_name`.
    pub fn of_type(&self, type_name: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e["type"] == type_name)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl RecordSink for MemorySink {
    fn append(&self, event: &AgentEvent) {
        match serde_json::to_value(event) {
            Ok(value) => self.events.lock().push(value),
            Err(e) => log::error!("Failed to serialize {} event: {}", event.type_name(), e),
        }
    }
}
