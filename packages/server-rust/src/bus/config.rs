//! Message bus client configuration.

use std::time::Duration;

use super::backoff::BackoffConfig;
use super::transport::ExchangeKind;

/// Settings for one [`super::MessageBusClient`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker URI handed to the connector.
    pub uri: String,
    /// Exchange every notification and request is published to.
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Publishing service name; also prefixes the notification queue.
    pub service_name: String,
    /// Maximum unacknowledged deliveries per consuming channel.
    pub prefetch: u16,
    /// Default timeout for `request` when none is given.
    pub reply_timeout: Duration,
    /// How long `connect` waits for the first connection.
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            uri: "amqp://localhost:5672".to_string(),
            exchange: "ecommerce_events".to_string(),
            exchange_kind: ExchangeKind::Topic,
            service_name: "service".to_string(),
            prefetch: 10,
            reply_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Durable queue this service's notification handlers consume from.
    #[must_use]
    pub fn notification_queue(&self) -> String {
        format!("{}.notifications", self.service_name)
    }

    /// Durable queue serving requests of `kind`.
    #[must_use]
    pub fn request_queue(kind: &str) -> String {
        format!("rpc.{kind}")
    }
}
