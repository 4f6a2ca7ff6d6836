//! Discovery backend contract.
//!
//! The discovery store is an unreliable black box: every call may fail or come
//! back empty, and callers must tolerate both.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use shopmesh_core::{ServiceInstance, ServiceRegistration};

/// Errors reported by a discovery backend. All of them are treated as transient.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("discovery backend returned {status} for {path}")]
    Status { status: u16, path: String },
    #[error("discovery backend unavailable: {0}")]
    Unavailable(String),
}

/// Narrow client contract to the external service catalog.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Names of every service known to the catalog.
    async fn list_services(&self) -> Result<Vec<String>, DiscoveryError>;

    /// Healthy instances of `name`, possibly empty.
    async fn get_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// Announce an instance of the calling service.
    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError>;

    /// Withdraw a previously announced instance by id.
    async fn deregister(&self, id: &str) -> Result<(), DiscoveryError>;
}

/// In-process catalog backed by a map.
///
/// Used for statically configured deployments and in tests, where
/// [`set_unavailable`](Self::set_unavailable) simulates an outage.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    services: RwLock<BTreeMap<String, Vec<ServiceRegistration>>>,
    outage: RwLock<Option<String>>,
}

impl StaticDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the instance list of `name` with plain instances.
    pub fn set_instances(&self, name: &str, instances: &[ServiceInstance]) {
        let regs = instances
            .iter()
            .map(|i| ServiceRegistration::new(name, i.address.clone(), i.port))
            .collect();
        self.services.write().insert(name.to_string(), regs);
    }

    /// Makes every call fail with `reason` until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.outage.write() = reason.map(str::to_string);
    }

    fn check_outage(&self) -> Result<(), DiscoveryError> {
        match self.outage.read().as_ref() {
            Some(reason) => Err(DiscoveryError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn list_services(&self) -> Result<Vec<String>, DiscoveryError> {
        self.check_outage()?;
        Ok(self.services.read().keys().cloned().collect())
    }

    async fn get_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.check_outage()?;
        Ok(self
            .services
            .read()
            .get(name)
            .map(|regs| regs.iter().map(ServiceRegistration::instance).collect())
            .unwrap_or_default())
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        self.check_outage()?;
        let mut services = self.services.write();
        let regs = services.entry(registration.name.clone()).or_default();
        regs.retain(|r| r.id != registration.id);
        regs.push(registration.clone());
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), DiscoveryError> {
        self.check_outage()?;
        for regs in self.services.write().values_mut() {
            regs.retain(|r| r.id != id);
        }
        Ok(())
    }
}
