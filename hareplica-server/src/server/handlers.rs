use crate::core::{BrokerError, QueueManager};
use crate::replication::Primary;
use axum::{
    Json,
    extract::{Path, State},
};
use std::sync::Arc;
use tracing::debug;

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub queue_manager: Arc<QueueManager>,
    /// Set when HA is enabled
    pub primary: Option<Arc<Primary>>,
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "hareplica",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// HA role, expected backups and replica registry
pub async fn ha_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    debug!("REST HA STATUS");

    let Some(primary) = state.primary.as_ref() else {
        return Ok(Json(serde_json::json!({ "status": "standalone" })));
    };
    Ok(Json(serde_json::to_value(primary.status())?))
}

pub async fn queue_stats(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    debug!("REST QUEUE STATS: {}", queue_name);

    let stats = state.queue_manager.stats(&queue_name).await?;
    Ok(Json(serde_json::to_value(stats)?))
}

pub async fn queue_list(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    let queues = state.queue_manager.list_queues().await?;
    Ok(Json(serde_json::json!({ "queues": queues })))
}
