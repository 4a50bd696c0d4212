//! Append-only record sink.
//!
//! Every sent and received message and every delivery outcome is appended here.
//! The log is consumed by out-of-process tooling and never read back at runtime.

mod jsonl;
mod memory;

pub use jsonl::JsonlSink;
pub use memory::MemorySink;

use crate::events::AgentEvent;

/// Errors opening a sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to open record file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Destination for recorded events.
///
/// `append` must not block: implementations buffer and write in the background.
pub trait RecordSink: Send + Sync {
    fn append(&self, event: &AgentEvent);
}
