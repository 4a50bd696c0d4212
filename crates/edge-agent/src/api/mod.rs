//! HTTP API: the A2A message endpoint, discovery, and the read API for dashboards.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
