//! Cache of proxy handlers keyed by `(service, instance)`.
//!
//! Handlers are created lazily on first use; concurrent first requests for the
//! same target share a single creation. The cache is bounded, and whenever the
//! registry epoch moves, handlers whose target has left the registry are
//! evicted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quick_cache::sync::Cache;
use shopmesh_core::ServiceInstance;
use tracing::debug;

use super::proxy::{ProxyError, ProxyHandler, ProxyOptions};
use crate::discovery::InstanceRegistry;

type CacheKey = (String, String);

pub struct ProxyCache {
    handlers: Cache<CacheKey, Arc<ProxyHandler>>,
    keys: Mutex<HashSet<CacheKey>>,
    options: ProxyOptions,
    seen_epoch: AtomicU64,
    created: AtomicU64,
}

impl ProxyCache {
    #[must_use]
    pub fn new(capacity: usize, options: ProxyOptions) -> Self {
        Self {
            handlers: Cache::new(capacity.max(1)),
            keys: Mutex::new(HashSet::new()),
            options,
            seen_epoch: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    /// Returns the handler for `target`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] if a new handler's HTTP client cannot be built.
    pub fn get_or_create(
        &self,
        service: &str,
        target: &ServiceInstance,
    ) -> Result<Arc<ProxyHandler>, ProxyError> {
        let key = (service.to_string(), target.authority());
        self.handlers.get_or_insert_with(&key, || {
            let handler = ProxyHandler::new(service, target.clone(), &self.options)?;
            self.created.fetch_add(1, Ordering::Relaxed);
            self.keys.lock().insert(key.clone());
            debug!(service, target = %target, "created proxy handler");
            Ok(Arc::new(handler))
        })
    }

    /// Evicts handlers whose target is no longer registered. A no-op unless the
    /// registry epoch changed since the last prune. Returns the eviction count.
    pub fn prune(&self, registry: &InstanceRegistry) -> usize {
        let epoch = registry.epoch();
        if self.seen_epoch.swap(epoch, Ordering::AcqRel) == epoch {
            return 0;
        }

        let mut keys = self.keys.lock();
        let stale: Vec<CacheKey> = keys
            .iter()
            .filter(|(service, authority)| {
                !registry
                    .instances(service)
                    .iter()
                    .any(|i| &i.authority() == authority)
            })
            .cloned()
            .collect();
        for key in &stale {
            keys.remove(key);
            self.handlers.remove(key);
        }
        if !stale.is_empty() {
            debug!(evicted = stale.len(), epoch, "pruned proxy handlers");
        }
        stale.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.len() == 0
    }

    /// Total handlers ever created.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}
