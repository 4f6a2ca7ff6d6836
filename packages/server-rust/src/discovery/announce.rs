//! Announces the running process in discovery for as long as it is up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use shopmesh_core::ServiceRegistration;
use tracing::{info, warn};

use super::backend::DiscoveryBackend;
use crate::service::{LifecycleContext, ManagedService};

/// Registers on `init` and deregisters on `shutdown`.
///
/// The catalog is unreliable, so a failed registration is logged and the
/// process keeps serving; only a registration that went through is
/// withdrawn later.
pub struct SelfRegistration {
    backend: Arc<dyn DiscoveryBackend>,
    registration: ServiceRegistration,
    registered: AtomicBool,
}

impl SelfRegistration {
    #[must_use]
    pub fn new(backend: Arc<dyn DiscoveryBackend>, registration: ServiceRegistration) -> Self {
        Self {
            backend,
            registration,
            registered: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ManagedService for SelfRegistration {
    fn name(&self) -> &'static str {
        "discovery-registration"
    }

    async fn init(&self, _ctx: &LifecycleContext) -> anyhow::Result<()> {
        let reg = &self.registration;
        match self.backend.register(reg).await {
            Ok(()) => {
                self.registered.store(true, Ordering::Release);
                info!(id = %reg.id, service = %reg.name, address = %reg.address, port = reg.port, "registered in discovery");
            }
            Err(error) => {
                warn!(id = %reg.id, service = %reg.name, %error, "discovery registration failed, serving unregistered");
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let id = &self.registration.id;
        self.backend
            .deregister(id)
            .await
            .with_context(|| format!("failed to deregister {id}"))?;
        info!(%id, "deregistered from discovery");
        Ok(())
    }
}
