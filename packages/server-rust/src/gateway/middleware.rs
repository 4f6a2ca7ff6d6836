//! HTTP middleware stack for the gateway.
//!
//! Layers are listed outermost first: the first one sees the request first on
//! the way in and the response last on the way out.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::layer::util::Identity;
use tower::util::MapRequestLayer;
use tower::ServiceBuilder;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::GatewayConfig;
use super::error::GatewayError;
use super::proxy::REQUEST_ID_HEADER;
use super::shutdown::ShutdownController;

type Stack<Inner, Outer> = tower::layer::util::Stack<Inner, Outer>;

type HttpLayers = Stack<
    PropagateRequestIdLayer,
    Stack<
        TimeoutLayer,
        Stack<
            CorsLayer,
            Stack<
                RequestBodyLimitLayer,
                Stack<
                    TraceLayer<SharedClassifier<ServerErrorsAsFailures>>,
                    Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        Stack<MapRequestLayer<fn(Request) -> Request>, Identity>,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the transport-level middleware stack.
///
/// 1. `StripRequestId`: drops any client-supplied `X-Gateway-Request-ID`
/// 2. `SetRequestId`: stamps a fresh UUID v4 `X-Gateway-Request-ID`
/// 3. `Tracing`: request/response spans
/// 4. `RequestBodyLimit`: 413 above `max_body_bytes`
/// 5. `CORS`: configured origins
/// 6. `Timeout`: 504 when the whole exchange exceeds `request_timeout`
/// 7. `PropagateRequestId`: copies the id onto the response
///
/// `Timeout` and `CORS` need a response body with `Default`, which the
/// limit layer's body lacks, so the limit sits outside both.
#[must_use]
pub fn build_http_layers(config: &GatewayConfig) -> HttpLayers {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    ServiceBuilder::new()
        .layer(MapRequestLayer::new(
            strip_inbound_request_id as fn(Request) -> Request,
        ))
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(request_id))
        .into_inner()
}

/// The request id is always gateway-generated.
fn strip_inbound_request_id(mut req: Request) -> Request {
    req.headers_mut().remove(REQUEST_ID_HEADER);
    req
}

/// A wildcard `"*"` allows any origin; otherwise only the parsed list.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

/// Counts in-flight requests and turns new traffic away once draining.
/// Health endpoints stay reachable so probes can observe the drain.
pub async fn track_in_flight(
    State(shutdown): State<Arc<ShutdownController>>,
    req: Request,
    next: Next,
) -> Response {
    if shutdown.is_shutting_down() && !req.uri().path().starts_with("/health") {
        return GatewayError::ShuttingDown.into_response();
    }
    let _guard = shutdown.in_flight_guard();
    next.run(req).await
}
