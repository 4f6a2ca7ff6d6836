//! Command-line and environment configuration for the gateway binary.
//!
//! Library code never reads the environment; it takes the plain config structs
//! ([`GatewayConfig`], [`BreakerConfig`], [`BusConfig`]) that [`GatewayArgs`]
//! converts into.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use shopmesh_core::ServiceRegistration;

use crate::breaker::BreakerConfig;
use crate::bus::{BackoffConfig, BusConfig, ExchangeKind};
use crate::gateway::config::{GatewayConfig, RateLimitConfig, RouteConfig};

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Fmt,
    /// One JSON object per event.
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "shopmesh-gateway", version, about = "ShopMesh reverse-proxy gateway")]
pub struct GatewayArgs {
    /// Address to bind the gateway listener on.
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on. 0 picks a free port.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Base URL of the Consul agent used for discovery.
    #[arg(long, env = "CONSUL_URL", default_value = "http://localhost:8500")]
    pub discovery_url: String,

    /// ACL token sent to Consul.
    #[arg(long, env = "CONSUL_TOKEN")]
    pub discovery_token: Option<String>,

    /// Name the gateway registers itself under in discovery.
    #[arg(long, env = "GATEWAY_SERVICE_NAME", default_value = "api-gateway")]
    pub service_name: String,

    /// Address announced to discovery. Defaults to the bind host, or
    /// 127.0.0.1 when bound to every interface.
    #[arg(long, env = "GATEWAY_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    /// Do not register the gateway itself in discovery.
    #[arg(long, env = "GATEWAY_SKIP_REGISTRATION")]
    pub skip_registration: bool,

    /// Route in the form `service=/public` or `service=/public:/internal`.
    /// Repeatable; the environment variable takes a comma-separated list.
    #[arg(
        long = "route",
        env = "GATEWAY_ROUTES",
        value_delimiter = ',',
        default_values_t = default_routes()
    )]
    pub routes: Vec<RouteConfig>,

    /// Domain written into cookies returned by backend services.
    #[arg(long, env = "GATEWAY_COOKIE_DOMAIN")]
    pub cookie_domain: Option<String>,

    /// Rate-limit window in seconds.
    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 900)]
    pub rate_limit_window_secs: u64,

    /// Requests allowed per client within one window.
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 100)]
    pub rate_limit_max: u32,

    /// Seconds between discovery refreshes.
    #[arg(long, env = "DISCOVERY_REFRESH_SECS", default_value_t = 30)]
    pub refresh_interval_secs: u64,

    /// Budget for one proxied request in milliseconds.
    #[arg(long, env = "GATEWAY_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Allowed CORS origins; `*` allows any.
    #[arg(long = "cors-origin", env = "GATEWAY_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,

    /// Seconds in-flight requests may drain after a shutdown signal.
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Breaker operation timeout in milliseconds.
    #[arg(long, env = "BREAKER_TIMEOUT_MS", default_value_t = 3_000)]
    pub breaker_timeout_ms: u64,

    /// Failure percentage at which a breaker opens.
    #[arg(long, env = "BREAKER_ERROR_THRESHOLD", default_value_t = 50,
          value_parser = clap::value_parser!(u32).range(1..=100))]
    pub breaker_error_threshold: u32,

    /// Minimum calls in the rolling window before a breaker may open.
    #[arg(long, env = "BREAKER_VOLUME_THRESHOLD", default_value_t = 10)]
    pub breaker_volume_threshold: u32,

    /// Milliseconds an open breaker waits before probing.
    #[arg(long, env = "BREAKER_RESET_TIMEOUT_MS", default_value_t = 30_000)]
    pub breaker_reset_timeout_ms: u64,

    /// Broker connection URI.
    #[arg(long, env = "RABBITMQ_URL", default_value = "amqp://localhost:5672")]
    pub broker_uri: String,

    /// Exchange notifications and requests are published to.
    #[arg(long, env = "BROKER_EXCHANGE", default_value = "ecommerce_events")]
    pub broker_exchange: String,

    /// Exchange type: direct, topic or fanout.
    #[arg(long, env = "BROKER_EXCHANGE_KIND", default_value = "topic")]
    pub broker_exchange_kind: ExchangeKind,

    /// First reconnect delay in milliseconds.
    #[arg(long, env = "RECONNECT_BASE_MS", default_value_t = 1_000)]
    pub reconnect_base_ms: u64,

    /// Largest reconnect delay in milliseconds.
    #[arg(long, env = "RECONNECT_MAX_MS", default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    /// Default request/reply timeout in milliseconds.
    #[arg(long, env = "REPLY_TIMEOUT_MS", default_value_t = 30_000)]
    pub reply_timeout_ms: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Fmt)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this port. Disabled when absent.
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

fn default_routes() -> Vec<RouteConfig> {
    [
        ("customer-service", "/api/customers"),
        ("product-service", "/api/products"),
        ("cart-service", "/api/carts"),
        ("order-service", "/api/orders"),
        ("payment-service", "/api/payments"),
    ]
    .into_iter()
    .map(|(service, prefix)| RouteConfig::new(service, prefix))
    .collect()
}

impl GatewayArgs {
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            cookie_domain: self.cookie_domain.clone(),
            routes: self.routes.clone(),
            rate_limit: RateLimitConfig {
                window: Duration::from_secs(self.rate_limit_window_secs),
                max_requests: self.rate_limit_max,
            },
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            cors_origins: self.cors_origins.clone(),
            ..GatewayConfig::default()
        }
    }

    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_millis(self.breaker_timeout_ms),
            error_threshold_percent: self.breaker_error_threshold,
            volume_threshold: self.breaker_volume_threshold,
            reset_timeout: Duration::from_millis(self.breaker_reset_timeout_ms),
            ..BreakerConfig::default()
        }
    }

    /// Bus settings for a component publishing as `service_name`.
    #[must_use]
    pub fn bus_config(&self, service_name: &str) -> BusConfig {
        BusConfig {
            uri: self.broker_uri.clone(),
            exchange: self.broker_exchange.clone(),
            exchange_kind: self.broker_exchange_kind,
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            backoff: BackoffConfig {
                base: Duration::from_millis(self.reconnect_base_ms),
                max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
                ..BackoffConfig::default()
            },
            ..BusConfig::for_service(service_name)
        }
    }

    /// How the gateway announces itself once bound to `bound`, or `None`
    /// when self-registration is disabled.
    #[must_use]
    pub fn registration(&self, bound: SocketAddr) -> Option<ServiceRegistration> {
        if self.skip_registration {
            return None;
        }
        let address = self.advertise_address.clone().unwrap_or_else(|| {
            match self.host.parse::<IpAddr>() {
                Ok(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
                _ => self.host.clone(),
            }
        });
        let mut registration = ServiceRegistration::new(&self.service_name, address, bound.port());
        registration.tags.push("gateway".to_string());
        Some(registration)
    }

    /// Address of the Prometheus scrape endpoint, if enabled.
    #[must_use]
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port
            .map(|port| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }
}
