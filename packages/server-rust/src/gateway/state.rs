use std::sync::Arc;
use std::time::Instant;

use shopmesh_core::ClockSource;

use super::config::GatewayConfig;
use super::proxy_cache::ProxyCache;
use super::shutdown::ShutdownController;
use crate::discovery::InstanceRegistry;

/// Shared state carried through axum extractors. Cloning is cheap.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<InstanceRegistry>,
    pub proxies: Arc<ProxyCache>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<GatewayConfig>,
    /// Wall clock for the health timestamp.
    pub clock: Arc<dyn ClockSource>,
    pub start_time: Instant,
}
