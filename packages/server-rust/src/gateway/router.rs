//! Route table and axum router assembly.
//!
//! Each configured prefix runs the same chain: availability check, per-client
//! rate limit, round-robin selection, then forwarding through the cached
//! handler for the selected instance.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Uri};
use axum::response::Response;
use axum::routing::{any, get};
use axum::Router;
use tracing::warn;

use super::config::{GatewayConfig, RouteConfig};
use super::error::GatewayError;
use super::health::{health_handler, liveness_handler, readiness_handler};
use super::middleware::{build_http_layers, track_in_flight};
use super::rate_limit::{client_key, FixedWindowLimiter};
use super::state::GatewayState;

/// Configured routes, each with its own limiter.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<(Arc<RouteConfig>, Arc<FixedWindowLimiter>)>,
}

impl RouteTable {
    /// Builds the table; a prefix configured twice keeps its first route.
    #[must_use]
    pub fn new(config: &GatewayConfig) -> Self {
        let mut entries: Vec<(Arc<RouteConfig>, Arc<FixedWindowLimiter>)> = Vec::new();
        for route in &config.routes {
            if entries.iter().any(|(r, _)| r.path_prefix == route.path_prefix) {
                warn!(prefix = %route.path_prefix, service = %route.service_name, "duplicate route prefix ignored");
                continue;
            }
            entries.push((
                Arc::new(route.clone()),
                Arc::new(FixedWindowLimiter::new(config.rate_limit)),
            ));
        }
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Arc<RouteConfig>, Arc<FixedWindowLimiter>)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        self.entries.iter().map(|(r, _)| r.path_prefix.clone()).collect()
    }

    /// Drops elapsed rate-limit windows on every route.
    pub fn purge_expired(&self) -> usize {
        self.entries.iter().map(|(_, l)| l.purge_expired()).sum()
    }
}

#[derive(Clone)]
struct RouteState {
    gateway: GatewayState,
    route: Arc<RouteConfig>,
    limiter: Arc<FixedWindowLimiter>,
}

/// Assembles health endpoints, one proxy route pair per prefix, the 404
/// fallback, and the middleware stack.
pub fn build_router(state: GatewayState, routes: &RouteTable) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .fallback(not_found)
        .with_state(state.clone());

    for (route, limiter) in routes.iter() {
        let route_state = RouteState {
            gateway: state.clone(),
            route: Arc::clone(route),
            limiter: Arc::clone(limiter),
        };
        let prefix = route.path_prefix.as_str();
        let proxied = Router::new()
            .route(prefix, any(proxy_request))
            .route(&format!("{prefix}/{{*rest}}"), any(proxy_request))
            .with_state(route_state);
        router = router.merge(proxied);
    }

    router
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.shutdown),
            track_in_flight,
        ))
        .layer(build_http_layers(&state.config))
}

async fn proxy_request(
    State(rs): State<RouteState>,
    req: Request,
) -> Result<Response, GatewayError> {
    let result = forward(&rs, req).await;
    let outcome = match &result {
        Ok(_) => "forwarded",
        Err(e) => e.outcome(),
    };
    metrics::counter!(
        "gateway_requests_total",
        "service" => rs.route.service_name.clone(),
        "outcome" => outcome
    )
    .increment(1);
    result
}

async fn forward(rs: &RouteState, req: Request) -> Result<Response, GatewayError> {
    let gateway = &rs.gateway;
    let service = rs.route.service_name.as_str();
    let unavailable = || GatewayError::Unavailable {
        service: service.to_string(),
    };

    if !gateway.registry.has_instances(service) {
        return Err(unavailable());
    }

    let decision = rs.limiter.check(&client_key(&req));
    if !decision.allowed {
        return Err(GatewayError::RateLimited {
            limit: decision.limit,
            retry_after: decision.reset_after,
        });
    }

    // The list can empty between the availability check and selection.
    let target = gateway.registry.select(service).ok_or_else(unavailable)?;

    gateway.proxies.prune(&gateway.registry);
    let handler = gateway
        .proxies
        .get_or_create(service, &target)
        .map_err(|source| GatewayError::Proxy {
            service: service.to_string(),
            source,
        })?;

    let mut response = handler.forward(req, &rs.route).await.map_err(|source| {
        warn!(service, target = %target, error = %source, "proxy error");
        GatewayError::Proxy {
            service: service.to_string(),
            source,
        }
    })?;

    let headers = response.headers_mut();
    headers.insert("ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("ratelimit-reset", HeaderValue::from(decision.reset_after.as_secs()));
    Ok(response)
}

async fn not_found(State(state): State<GatewayState>, uri: Uri) -> GatewayError {
    metrics::counter!("gateway_requests_total", "service" => "", "outcome" => "not_found")
        .increment(1);
    GatewayError::NotFound {
        path: uri.path().to_string(),
        available: state.config.public_prefixes(),
    }
}
