use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        .route("/cameras", get(handlers::available_cameras))
        // Method-call surface
        .route("/methods", post(handlers::call_method))
        // Session queries
        .route("/sessions/:texture_id/status", get(handlers::session_status))
        .route("/sessions/:texture_id/events", get(handlers::session_events))
        // Add tracing middleware for request logging
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
