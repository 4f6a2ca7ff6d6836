//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::shutdown::HealthState;
use super::state::GatewayState;

/// Gateway status, uptime in seconds, and the current instance count of
/// every tracked service.
///
/// Always 200; `status` tells draining apart from healthy.
pub async fn health_handler(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "status": state.shutdown.health_state().as_str(),
        "uptime": state.start_time.elapsed().as_secs_f64(),
        "timestamp": state.clock.now(),
        "services": state.registry.instance_counts(),
        "inFlight": state.shutdown.in_flight_count(),
    }))
}

/// Liveness only says the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 when ready, 503 while starting, draining, or stopped.
pub async fn readiness_handler(State(state): State<GatewayState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
