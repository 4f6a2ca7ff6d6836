//! Ordered acquisition and guaranteed release of process-wide components.

use std::any::{Any, TypeId};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// LifecycleContext
// ---------------------------------------------------------------------------

/// Context handed to every component during initialization.
#[derive(Debug, Clone)]
pub struct LifecycleContext {
    /// Name of the owning process (e.g. `"api-gateway"`), used in logs and
    /// as the publisher of bus envelopes.
    pub process_name: String,
    /// Root cancellation token; background tasks derive child tokens.
    pub shutdown: CancellationToken,
}

impl LifecycleContext {
    #[must_use]
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            shutdown: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// A long-lived component owned by the composition root: a bus connection,
/// a discovery registration, a background worker.
#[async_trait]
pub trait ManagedService: Send + Sync + Any {
    /// Unique component name (e.g. `"message-bus"`).
    fn name(&self) -> &'static str;

    /// Acquire resources (connect, register, start workers).
    async fn init(&self, ctx: &LifecycleContext) -> anyhow::Result<()>;

    /// Release resources. Must be idempotent.
    async fn shutdown(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// LifecycleRegistry
// ---------------------------------------------------------------------------

/// Initializes components in registration order and releases them in
/// reverse.
///
/// A failed `init_all` releases the components that already started before
/// returning, so a half-started process never leaks a connection or a
/// discovery entry. Components stay reachable by concrete type through
/// [`get`](Self::get).
pub struct LifecycleRegistry {
    components: Mutex<Vec<Arc<dyn ManagedService>>>,
    by_type: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    started: Mutex<Vec<Arc<dyn ManagedService>>>,
}

impl LifecycleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            by_type: DashMap::new(),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Adds a component; it starts after every component registered before it.
    pub fn register<T: ManagedService>(&self, service: T) {
        let service = Arc::new(service);
        self.by_type
            .insert(TypeId::of::<T>(), Arc::clone(&service) as Arc<dyn Any + Send + Sync>);
        self.components.lock().push(service);
    }

    /// The registered component of type `T`, if any.
    #[must_use]
    pub fn get<T: ManagedService>(&self) -> Option<Arc<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    /// Names in start order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.components.lock().iter().map(|c| c.name()).collect()
    }

    /// Initializes every component not yet started, in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first `init()` failure, after shutting down the components
    /// started so far.
    pub async fn init_all(&self, ctx: &LifecycleContext) -> anyhow::Result<()> {
        let pending: Vec<_> = {
            let started = self.started.lock();
            self.components
                .lock()
                .iter()
                .filter(|c| !started.iter().any(|s| Arc::ptr_eq(s, *c)))
                .cloned()
                .collect()
        };

        for component in pending {
            info!(component = component.name(), process = %ctx.process_name, "initializing");
            if let Err(e) = component.init(ctx).await {
                error!(component = component.name(), error = %e, "initialization failed, releasing started components");
                if let Err(release) = self.shutdown_all().await {
                    warn!(error = %release, "release after failed initialization was incomplete");
                }
                return Err(e.context(format!("failed to initialize {}", component.name())));
            }
            self.started.lock().push(component);
        }
        Ok(())
    }

    /// Shuts down started components in reverse start order.
    ///
    /// Every component gets its shutdown call even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first `shutdown()` failure.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let started = std::mem::take(&mut *self.started.lock());
        let mut first_err = None;
        for component in started.iter().rev() {
            info!(component = component.name(), "shutting down");
            if let Err(e) = component.shutdown().await {
                error!(component = component.name(), error = %e, "shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Default for LifecycleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Component {
        name: &'static str,
        fail_init: bool,
        fail_shutdown: bool,
        log: Log,
    }

    impl Component {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                fail_init: false,
                fail_shutdown: false,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl ManagedService for Component {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
            self.log.lock().push(format!("init:{}", self.name));
            if self.fail_init {
                anyhow::bail!("{} could not connect", self.name);
            }
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    struct Marker;

    #[async_trait]
    impl ManagedService for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }
        async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn lookup_by_type() {
        let log = Log::default();
        let registry = LifecycleRegistry::new();
        registry.register(Component::new("bus", &log));
        registry.register(Marker);

        assert_eq!(registry.get::<Marker>().unwrap().name(), "marker");
        assert_eq!(registry.get::<Component>().unwrap().name(), "bus");
        assert_eq!(registry.names(), ["bus", "marker"]);
    }

    #[tokio::test]
    async fn init_in_order_and_shutdown_in_reverse() {
        let log = Log::default();
        let registry = LifecycleRegistry::new();
        registry.register(Component::new("first", &log));
        registry.register(Marker);
        registry.register(Component::new("second", &log));

        registry.init_all(&LifecycleContext::new("test")).await.unwrap();
        registry.shutdown_all().await.unwrap();
        // Nothing left to release.
        registry.shutdown_all().await.unwrap();

        assert_eq!(
            log.lock().clone(),
            ["init:first", "init:second", "shutdown:second", "shutdown:first"]
        );
    }

    #[tokio::test]
    async fn failed_init_releases_started_components() {
        let log = Log::default();
        let registry = LifecycleRegistry::new();
        registry.register(Component::new("bus", &log));
        registry.register(Component {
            fail_init: true,
            ..Component::new("registration", &log)
        });
        registry.register(Marker);

        let err = registry
            .init_all(&LifecycleContext::new("test"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("registration could not connect"));
        assert_eq!(
            log.lock().clone(),
            ["init:bus", "init:registration", "shutdown:bus"]
        );
    }

    #[tokio::test]
    async fn shutdown_continues_past_failures() {
        let log = Log::default();
        let registry = LifecycleRegistry::new();
        registry.register(Component::new("first", &log));
        registry.register(Component {
            fail_shutdown: true,
            ..Component::new("second", &log)
        });
        registry.init_all(&LifecycleContext::new("test")).await.unwrap();

        let err = registry.shutdown_all().await.unwrap_err();
        assert!(err.to_string().contains("second"));
        assert_eq!(
            log.lock().clone(),
            ["init:first", "init:second", "shutdown:second", "shutdown:first"]
        );
    }
}
