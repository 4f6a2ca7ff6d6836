//! ShopMesh gateway binary.
//!
//! Binds the reverse-proxy gateway, then brings up its lifecycle components
//! (discovery maintenance, self-registration) and serves until Ctrl-C. The
//! components are released in reverse order on every exit path. Exits with 0
//! when in-flight requests drained within the grace period and 1 otherwise.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use shopmesh_server::config::GatewayArgs;
use shopmesh_server::discovery::{ConsulDiscovery, DiscoveryBackend, SelfRegistration};
use shopmesh_server::service::{LifecycleContext, LifecycleRegistry};
use shopmesh_server::telemetry;
use shopmesh_server::{GatewayModule, InstanceRegistry};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GatewayArgs::parse();
    telemetry::init_tracing(args.log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        discovery = %args.discovery_url,
        "starting shopmesh-gateway"
    );

    if let Some(addr) = args.metrics_addr() {
        telemetry::install_metrics_exporter(addr)?;
    }

    let backend: Arc<dyn DiscoveryBackend> = Arc::new(
        ConsulDiscovery::new(&args.discovery_url, args.discovery_token.clone())
            .context("invalid discovery configuration")?,
    );
    let registry = Arc::new(InstanceRegistry::new());
    let mut gateway = GatewayModule::new(args.gateway_config(), registry);
    let bound = gateway.start().await?;

    // Registration comes last so it is withdrawn before maintenance stops.
    let lifecycle = LifecycleRegistry::new();
    lifecycle.register(gateway.maintenance_service(Arc::clone(&backend)));
    if let Some(registration) = args.registration(bound) {
        lifecycle.register(SelfRegistration::new(backend, registration));
    }

    let ctx = LifecycleContext::new(args.service_name.clone());
    lifecycle.init_all(&ctx).await?;

    let served = gateway.serve(shutdown_signal()).await;

    ctx.shutdown.cancel();
    if let Err(error) = lifecycle.shutdown_all().await {
        warn!(%error, "component shutdown incomplete");
    }
    let outcome = served?;
    info!(?outcome, "shopmesh-gateway stopped");

    std::process::exit(outcome.exit_code());
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c, shutting down");
    }
}
