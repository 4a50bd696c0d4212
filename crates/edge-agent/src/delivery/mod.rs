//! Outbound delivery to peers.
//!
//! ```text
//! submit() ──▶ lane(dest) ──▶ attempt 1 ─fail─▶ sleep(base) ─▶ attempt 2 ─fail─▶ sleep(2·base) ─▶ attempt 3
//!                 │                                                                      │ fail
//!                 │◀──────────────── pending queue (bounded, oldest dropped) ◀──────────┘
//!                 └──▶ redelivery tick / liveness kick: drain FIFO while the peer is active
//! ```
//!
//! One lane task per destination owns that destination's queue, so per-peer
//! order is preserved and no lock is held across a network call.

mod dispatcher;
mod error;
mod policy;
mod transport;

pub use dispatcher::{DeliveryDispatcher, DeliveryResult, QueueDepth};
pub use error::{DeliveryError, TransportError};
pub use policy::RetryPolicy;
pub use transport::{Destination, HttpTransport, Transport};
