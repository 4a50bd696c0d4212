//! Application state shared across handlers.

use crate::agent::Agent;

/// Handlers reach every component through the agent handle.
#[derive(Clone)]
pub struct AppState {
    pub agent: Agent,
}

impl AppState {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }
}
