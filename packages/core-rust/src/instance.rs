//! Service instance and self-registration records.
//!
//! A [`ServiceInstance`] is an `(address, port)` pair returned by the discovery
//! backend. Instance lists are replaced wholesale on each refresh and never
//! mutated in place.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single reachable instance of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Host name or IP address.
    pub address: String,
    /// TCP port.
    pub port: u16,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// `address:port`, used as the proxy-cache key for this target.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Plain HTTP base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Registration a service publishes about itself to the discovery backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    /// Unique instance id, typically `"{name}-{address}-{port}"`.
    pub id: String,
    /// Logical service name (e.g. `"product-service"`).
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    /// HTTP endpoint polled by the discovery backend for health.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub health_check_url: Option<String>,
}

impl ServiceRegistration {
    /// Builds a registration with the conventional id and `/health` check.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let address = address.into();
        Self {
            id: format!("{name}-{address}-{port}"),
            health_check_url: Some(format!("http://{address}:{port}/health")),
            name,
            address,
            port,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn instance(&self) -> ServiceInstance {
        ServiceInstance::new(self.address.clone(), self.port)
    }
}
