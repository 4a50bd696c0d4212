//! Real-time event stream.
//!
//! ```text
//! ┌──────────────┐   publish()   ┌───────────────────┐   /stream (WebSocket)
//! │ Agent tasks  │ ────────────▶ │ StreamBroadcaster │ ──▶ subscriber 1
//! │ router, etc. │   never blocks│  bounded ring per │ ──▶ subscriber 2
//! └──────────────┘               │  subscriber       │ ──▶ ...
//!                                └───────────────────┘
//! ```
//!
//! Subscribers see events from their connect time forward. A subscriber that
//! falls more than the buffer behind loses the oldest events, never blocks
//! publishers.

mod handler;
mod hub;

pub use handler::stream_handler;
pub use hub::{StreamBroadcaster, StreamSubscription};
