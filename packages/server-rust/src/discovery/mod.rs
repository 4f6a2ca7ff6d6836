//! Service discovery and the in-memory instance registry.
//!
//! - [`announce`]: lifecycle component that registers the running process
//! - [`backend`]: the narrow discovery-store contract plus an in-process catalog
//! - [`consul`]: HTTP client for a Consul agent
//! - [`registry`]: per-service instance lists with round-robin selection
//! - [`refresher`]: periodic, parallel refresh of every known service

pub mod announce;
pub mod backend;
pub mod consul;
pub mod registry;
pub mod refresher;

pub use announce::SelfRegistration;
pub use backend::{DiscoveryBackend, DiscoveryError, StaticDiscovery};
pub use consul::ConsulDiscovery;
pub use refresher::{DiscoveryRefresher, RefreshOutcome, RefreshTask};
pub use registry::{InstanceRegistry, ReplaceOutcome};
