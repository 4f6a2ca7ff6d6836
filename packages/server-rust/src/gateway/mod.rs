//! Reverse-proxy gateway.
//!
//! Routes public path prefixes to discovered service instances with per-client
//! rate limiting, round-robin selection, and per-target handler reuse.

pub mod config;
pub mod error;
pub mod health;
pub mod middleware;
pub mod module;
pub mod proxy;
pub mod proxy_cache;
pub mod rate_limit;
pub mod router;
pub mod shutdown;
pub mod state;

pub use config::{GatewayConfig, RateLimitConfig, RouteConfig};
pub use error::GatewayError;
pub use module::{GatewayMaintenance, GatewayModule, MaintenanceService};
pub use proxy::{ProxyError, ProxyHandler, ProxyOptions, REQUEST_ID_HEADER};
pub use proxy_cache::ProxyCache;
pub use rate_limit::{FixedWindowLimiter, RateDecision};
pub use router::{build_router, RouteTable};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController, ShutdownOutcome};
pub use state::GatewayState;
