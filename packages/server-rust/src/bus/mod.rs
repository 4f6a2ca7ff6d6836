//! Message bus: broker contract and the reconnecting publish/subscribe and
//! request/reply client built on top of it.
//!
//! [`MemoryBroker`] is a test double, compiled for unit tests and behind the
//! `memory-broker` feature for integration tests.

pub mod backoff;
pub mod client;
pub mod config;
pub mod handler;
#[cfg(any(test, feature = "memory-broker"))]
pub mod memory;
pub mod pending;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{
    BusError, ConnectionState, EventPublisher, MessageBusClient, PublishOptions, RequestOptions,
    WILDCARD,
};
pub use config::BusConfig;
pub use handler::{MessageHandler, RequestHandler, RequestMeta};
#[cfg(any(test, feature = "memory-broker"))]
pub use memory::MemoryBroker;
pub use pending::PendingRequests;
pub use transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Consumer, Delivery,
    ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};
