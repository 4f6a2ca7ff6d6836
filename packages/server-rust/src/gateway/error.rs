//! Gateway error type and its HTTP mapping.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::proxy::ProxyError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no healthy instances of {service}")]
    Unavailable { service: String },

    #[error("rate limit of {limit} requests exceeded")]
    RateLimited { limit: u32, retry_after: Duration },

    #[error("proxy error for {service}: {source}")]
    Proxy {
        service: String,
        #[source]
        source: ProxyError,
    },

    #[error("route {path} not found")]
    NotFound { path: String, available: Vec<String> },

    #[error("gateway is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unavailable { .. } | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Proxy { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
        }
    }

    /// Label used for the `outcome` dimension of request metrics.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Proxy { .. } => "proxy_error",
            Self::NotFound { .. } => "not_found",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Unavailable { service } => json!({
                "error": "Service Unavailable",
                "message": self.to_string(),
                "service": service,
            }),
            Self::RateLimited { .. } => json!({
                "error": "Too Many Requests",
                "message": "Too many requests, please try again later.",
            }),
            Self::Proxy { service, source } => json!({
                "error": "Proxy Error",
                "service": service,
                "message": source.to_string(),
            }),
            Self::NotFound { path, available } => json!({
                "error": "Not Found",
                "message": format!("Route {path} not found"),
                "availableRoutes": available,
            }),
            Self::ShuttingDown => json!({
                "error": "Service Unavailable",
                "message": self.to_string(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { limit, retry_after } = &self {
            let headers = response.headers_mut();
            let secs = retry_after.as_secs().max(1);
            headers.insert("retry-after", HeaderValue::from(secs));
            headers.insert("ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("ratelimit-remaining", HeaderValue::from_static("0"));
            headers.insert("ratelimit-reset", HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unavailable_is_503_with_service() {
        let response = GatewayError::Unavailable {
            service: "product-service".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["service"], "product-service");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = GatewayError::RateLimited {
            limit: 100,
            retry_after: Duration::from_secs(42),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["ratelimit-limit"], "100");
    }

    #[tokio::test]
    async fn not_found_lists_routes() {
        let response = GatewayError::NotFound {
            path: "/nope".into(),
            available: vec!["/api/products".into(), "/api/cart".into()],
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["availableRoutes"][1], "/api/cart");
        assert_eq!(body["message"], "Route /nope not found");
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(GatewayError::ShuttingDown.outcome(), "shutting_down");
        assert_eq!(GatewayError::ShuttingDown.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
