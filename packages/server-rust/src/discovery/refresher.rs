//! Periodic discovery refresh.
//!
//! Every statically known service is refreshed in parallel and independently:
//! one service's discovery failure never affects another's entry. On error the
//! last known-good list is kept (fail-open); an explicit empty result clears the
//! entry so stale instances are not served forever.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{info, warn};

use super::backend::DiscoveryBackend;
use super::registry::{InstanceRegistry, ReplaceOutcome};
use crate::service::BackgroundRunnable;

/// What a single refresh did to a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Updated { count: usize },
    Cleared,
    /// Discovery failed; the entry was left untouched.
    Failed { error: String },
}

/// On-demand tasks accepted by the refresher worker.
#[derive(Debug)]
pub enum RefreshTask {
    /// Refresh every service now, outside the regular schedule.
    All,
    /// Refresh one service now.
    Service(String),
}

/// Pulls instance lists from a [`DiscoveryBackend`] into an [`InstanceRegistry`].
pub struct DiscoveryRefresher {
    registry: Arc<InstanceRegistry>,
    backend: Arc<dyn DiscoveryBackend>,
}

impl DiscoveryRefresher {
    #[must_use]
    pub fn new(registry: Arc<InstanceRegistry>, backend: Arc<dyn DiscoveryBackend>) -> Self {
        Self { registry, backend }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Refreshes a single service.
    pub async fn refresh(&self, name: &str) -> RefreshOutcome {
        let instances = match self.backend.get_instances(name).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = name, error = %e, "discovery refresh failed, keeping last known instances");
                metrics::counter!("discovery_errors_total", "service" => name.to_string()).increment(1);
                return RefreshOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        match self.registry.replace(name, instances) {
            ReplaceOutcome::Unchanged => RefreshOutcome::Unchanged,
            ReplaceOutcome::Replaced { previous, current } => {
                info!(service = name, previous, current, "service instances updated");
                RefreshOutcome::Updated { count: current }
            }
            ReplaceOutcome::Cleared { previous } => {
                warn!(service = name, previous, "no healthy instances left for service");
                RefreshOutcome::Cleared
            }
        }
    }

    /// Refreshes every known service concurrently.
    pub async fn refresh_all(&self) -> Vec<(String, RefreshOutcome)> {
        let names = self.registry.service_names();
        let outcomes = join_all(names.iter().map(|name| self.refresh(name))).await;
        names.into_iter().zip(outcomes).collect()
    }
}

#[async_trait]
impl BackgroundRunnable for DiscoveryRefresher {
    type Task = RefreshTask;

    async fn run(&mut self, task: RefreshTask) {
        match task {
            RefreshTask::All => {
                self.refresh_all().await;
            }
            RefreshTask::Service(name) => {
                self.refresh(&name).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.refresh_all().await;
    }
}
