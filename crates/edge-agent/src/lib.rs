//! Agent Edge collaboration core.
//!
//! One process runs one agent (site or control). Agents exchange typed
//! messages over `POST /a2a/message`, detect anomalies in sensor readings,
//! ask each other for analysis, and fan every event out to `/stream`.
//!
//! ```text
//!            ┌──────────── Agent ─────────────┐
//! sensor ──▶ │ detector ─▶ pending ─▶ decision │
//!            │ history  ◀─ router ◀── HTTP ◀──┼── peer
//!            │ dispatcher ──────────── HTTP ──┼─▶ peer
//!            │ outlets ─▶ JSONL sink, /stream │
//!            └────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod delivery;
pub mod detector;
pub mod events;
pub mod history;
pub mod liveness;
pub mod reasoning;
pub mod router;
pub mod sensor;
pub mod sink;
pub mod ws;

pub use agent::{Agent, AgentDeps};
pub use config::AgentConfig;
