//! Gateway module with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener, and `serve()`
//! accepts connections until shutdown, then drains within the grace period.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::Router;
use parking_lot::Mutex;
use shopmesh_core::{ClockSource, SystemClock};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::GatewayConfig;
use super::proxy::ProxyOptions;
use super::proxy_cache::ProxyCache;
use super::router::{build_router, RouteTable};
use super::shutdown::{ShutdownController, ShutdownOutcome};
use super::state::GatewayState;
use crate::discovery::{DiscoveryBackend, DiscoveryRefresher, InstanceRegistry, RefreshTask};
use crate::service::{BackgroundRunnable, BackgroundWorker, LifecycleContext, ManagedService};

const MAINTENANCE_WORKER: &str = "gateway-maintenance";

/// Owns the gateway's listener, registry view, proxy cache, and shutdown
/// controller.
pub struct GatewayModule {
    config: Arc<GatewayConfig>,
    listener: Option<TcpListener>,
    registry: Arc<InstanceRegistry>,
    proxies: Arc<ProxyCache>,
    routes: RouteTable,
    shutdown: Arc<ShutdownController>,
    clock: Arc<dyn ClockSource>,
}

impl GatewayModule {
    /// Creates the module without binding a port. Every routed service is
    /// tracked in `registry` so the refresher picks it up.
    #[must_use]
    pub fn new(config: GatewayConfig, registry: Arc<InstanceRegistry>) -> Self {
        for name in config.service_names() {
            registry.track(&name);
        }
        let proxies = Arc::new(ProxyCache::new(
            config.proxy_cache_capacity,
            ProxyOptions {
                request_timeout: config.request_timeout,
                max_body_bytes: config.max_body_bytes,
                cookie_domain: config.cookie_domain.clone(),
            },
        ));
        let routes = RouteTable::new(&config);
        Self {
            config: Arc::new(config),
            listener: None,
            registry,
            proxies,
            routes,
            shutdown: Arc::new(ShutdownController::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the wall clock used for health timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn registry(&self) -> Arc<InstanceRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    #[must_use]
    pub fn proxy_cache(&self) -> Arc<ProxyCache> {
        Arc::clone(&self.proxies)
    }

    fn state(&self) -> GatewayState {
        GatewayState {
            registry: Arc::clone(&self.registry),
            proxies: Arc::clone(&self.proxies),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
            start_time: Instant::now(),
        }
    }

    pub fn build_router(&self) -> Router {
        build_router(self.state(), &self.routes)
    }

    fn maintenance(&self, backend: Arc<dyn DiscoveryBackend>) -> GatewayMaintenance {
        GatewayMaintenance {
            refresher: DiscoveryRefresher::new(Arc::clone(&self.registry), backend),
            routes: self.routes.clone(),
            proxies: Arc::clone(&self.proxies),
        }
    }

    /// Starts the periodic maintenance worker (discovery refresh, rate-limit
    /// window purge, proxy cache pruning) as a child of `parent`.
    pub fn start_maintenance(
        &self,
        backend: Arc<dyn DiscoveryBackend>,
        parent: &CancellationToken,
    ) -> BackgroundWorker<GatewayMaintenance> {
        BackgroundWorker::start(
            MAINTENANCE_WORKER,
            self.maintenance(backend),
            self.config.refresh_interval,
            parent,
        )
    }

    /// Maintenance as a lifecycle component: the worker starts on `init`
    /// with an immediate full refresh and stops on `shutdown`.
    #[must_use]
    pub fn maintenance_service(&self, backend: Arc<dyn DiscoveryBackend>) -> MaintenanceService {
        MaintenanceService {
            idle: Mutex::new(Some(self.maintenance(backend))),
            interval: self.config.refresh_interval,
            worker: Mutex::new(None),
        }
    }

    /// Binds the listener. Returns the bound address, which carries the
    /// OS-assigned port when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind gateway listener on {addr}"))?;
        let local = listener.local_addr()?;
        info!(address = %local, routes = ?self.routes.prefixes(), "gateway listener bound");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Serves until `shutdown` resolves, then stops accepting connections and
    /// waits up to the grace period for in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the server fails with
    /// an I/O error before shutdown.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<ShutdownOutcome> {
        let listener = self
            .listener
            .take()
            .context("start() must be called before serve()")?;
        let router = self.build_router();
        let controller = Arc::clone(&self.shutdown);
        let grace = self.config.shutdown_grace;

        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(controller.token().cancelled_owned());
        let mut server = tokio::spawn(async move { server.await });

        controller.set_ready();
        info!("gateway ready");

        tokio::select! {
            joined = &mut server => {
                joined.context("gateway server task failed")??;
                controller.mark_stopped();
                return Ok(ShutdownOutcome::Drained);
            }
            () = shutdown => {}
        }

        info!(?grace, "shutdown signalled, draining gateway");
        controller.trigger_shutdown();

        match tokio::time::timeout(grace, &mut server).await {
            Ok(joined) => {
                joined.context("gateway server task failed")??;
                let outcome = controller.wait_for_drain(grace).await;
                info!(?outcome, "gateway drained");
                Ok(outcome)
            }
            Err(_elapsed) => {
                server.abort();
                let in_flight = controller.in_flight_count();
                warn!(in_flight, "drain grace period expired, forcing shutdown");
                Ok(ShutdownOutcome::TimedOut { in_flight })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayMaintenance
// ---------------------------------------------------------------------------

/// Periodic gateway housekeeping, run by a [`BackgroundWorker`].
pub struct GatewayMaintenance {
    refresher: DiscoveryRefresher,
    routes: RouteTable,
    proxies: Arc<ProxyCache>,
}

impl GatewayMaintenance {
    async fn sweep(&self) {
        self.refresher.refresh_all().await;
        let purged = self.routes.purge_expired();
        let pruned = self.proxies.prune(self.refresher.registry());
        debug!(purged, pruned, "gateway maintenance pass");
    }
}

#[async_trait]
impl BackgroundRunnable for GatewayMaintenance {
    type Task = RefreshTask;

    async fn run(&mut self, task: RefreshTask) {
        match task {
            RefreshTask::All => self.sweep().await,
            RefreshTask::Service(name) => {
                self.refresher.refresh(&name).await;
                self.proxies.prune(self.refresher.registry());
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }
}

/// [`GatewayMaintenance`] owned by a `LifecycleRegistry`.
pub struct MaintenanceService {
    idle: Mutex<Option<GatewayMaintenance>>,
    interval: Duration,
    worker: Mutex<Option<BackgroundWorker<GatewayMaintenance>>>,
}

impl MaintenanceService {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }
}

#[async_trait]
impl ManagedService for MaintenanceService {
    fn name(&self) -> &'static str {
        MAINTENANCE_WORKER
    }

    async fn init(&self, ctx: &LifecycleContext) -> anyhow::Result<()> {
        let maintenance = self
            .idle
            .lock()
            .take()
            .context("gateway maintenance was already started")?;
        let worker = BackgroundWorker::start(MAINTENANCE_WORKER, maintenance, self.interval, &ctx.shutdown);
        if let Err(error) = worker.submit(RefreshTask::All).await {
            warn!(%error, "initial discovery refresh was not scheduled");
        }
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        Ok(())
    }
}
