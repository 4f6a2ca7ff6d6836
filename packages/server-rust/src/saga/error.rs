//! Saga error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::store::StoreError;
use crate::bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("invalid request: {0}")]
    Validation(String),

    /// A dependent service failed or answered with an unusable body; the
    /// local write was rolled back.
    #[error("{service} unavailable: {reason}")]
    DependencyUnavailable { service: String, reason: String },

    /// The creation event could not be published; the local write was
    /// rolled back.
    #[error("failed to publish {kind}: {source}")]
    Publish {
        kind: String,
        #[source]
        source: BusError,
    },

    /// Rolling back a local write failed, leaving the system inconsistent.
    #[error("compensation for {entity} {id} failed: {reason}")]
    Compensation {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SagaError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::DependencyUnavailable { .. } | Self::Publish { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Compensation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
            Self::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for SagaError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::DependencyUnavailable { service, .. } => json!({
                "error": "Service Unavailable",
                "service": service,
                "message": self.to_string(),
            }),
            Self::Compensation { .. } => json!({
                "error": "Internal Server Error",
                "message": "operation failed and could not be rolled back",
            }),
            _ => json!({
                "error": status.canonical_reason().unwrap_or("Error"),
                "message": self.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}
