use crate::replication::ReplicationError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Queue deleted: {0}")]
    QueueDeleted(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BrokerError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QueueNotFound(_) | Self::MessageNotFound(_) => StatusCode::NOT_FOUND,
            Self::QueueDeleted(_) => StatusCode::GONE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Replication(e) => match e {
                ReplicationError::InvalidArgument(_) | ReplicationError::InvalidIdSet(_) => {
                    StatusCode::BAD_REQUEST
                }
                ReplicationError::ResourceDeleted(_) => StatusCode::GONE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::SerializationError(e.to_string())
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
