use super::handlers::{self, AppState};
use axum::{Router, routing::get};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the Axum router with all endpoints
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // HA status
        .route("/ha/status", get(handlers::ha_status))
        // Queue endpoints
        .route("/queue/list", get(handlers::queue_list))
        .route("/queue/{name}/stats", get(handlers::queue_stats))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
