//! HTTP API server for external control
//!
//! This module exposes the method-call surface and session queries:
//! - POST /methods - Dispatch a `{method, arguments}` call
//! - GET /cameras - List available cameras
//! - GET /sessions/:id/status - Session snapshot and statistics
//! - GET /sessions/:id/events - Session events as server-sent events
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::SessionStatus;
pub use routes::create_router;
pub use state::AppState;
