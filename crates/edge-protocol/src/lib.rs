//! Wire protocol types for Agent Edge collaboration.
//!
//! This crate defines the messages exchanged between the two agents of an
//! Agent Edge deployment:
//!
//! ```text
//! Site agent <--[POST /a2a/message: Envelope]--> Control agent
//!     |                                               |
//!  /stream (WebSocket fan-out)                 /stream (WebSocket fan-out)
//! ```
//!
//! ## Design Principles
//!
//! 1. **One envelope, one discriminator.** Every message carries `message_id`,
//!    `timestamp`, `from`, optional `to`, and a `type` tag selecting the payload.
//! 2. **Identity is set once.** `message_id` and `timestamp` are assigned when a
//!    message is created and preserved through transport.
//! 3. **Validation is part of the protocol.** Field ranges live next to the types
//!    so both agents reject the same malformed input.

pub mod card;
pub mod messages;
pub mod sensor;
pub mod validation;

pub use card::{AgentCard, AgentRole, AgentStatus, Endpoints};
pub use messages::{
    Ack, AckStatus, AnalysisRequest, AnalysisResponse, CONSENSUS_COLLABORATIVE, CONSENSUS_DEGRADED,
    DEFAULT_SENSOR, Decision, Envelope, Heartbeat, MessageBody, MessageFactory, MessageKind, Query,
    QueryResponse, Rejection, SensorObservation,
};
pub use sensor::{SensorField, SensorReading};
pub use validation::{DecodeError, ValidationError, decode};
