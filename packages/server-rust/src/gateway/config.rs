//! Gateway configuration types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A public path prefix served by one backend service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// Service name as known to discovery and the registry.
    pub service_name: String,
    /// Public prefix the gateway matches, e.g. `/api/products`.
    pub path_prefix: String,
    /// Prefix substituted for `path_prefix` on the forwarded request.
    pub target_prefix: String,
}

impl RouteConfig {
    /// Route whose public and internal prefixes are identical.
    #[must_use]
    pub fn new(service_name: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        let path_prefix = normalize_prefix(&path_prefix.into());
        Self {
            service_name: service_name.into(),
            target_prefix: path_prefix.clone(),
            path_prefix,
        }
    }

    #[must_use]
    pub fn with_target_prefix(mut self, target_prefix: impl Into<String>) -> Self {
        self.target_prefix = normalize_prefix(&target_prefix.into());
        self
    }
}

/// Parses `service=/public` or `service=/public:/internal`.
impl FromStr for RouteConfig {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (service, paths) = s
            .split_once('=')
            .ok_or_else(|| format!("route `{s}` must look like service=/prefix"))?;
        let service = service.trim();
        if service.is_empty() {
            return Err(format!("route `{s}` has an empty service name"));
        }
        let (public, internal) = match paths.split_once(':') {
            Some((public, internal)) => (public.trim(), Some(internal.trim())),
            None => (paths.trim(), None),
        };
        if !public.starts_with('/') || public.len() < 2 {
            return Err(format!("route `{s}` needs a non-root prefix starting with '/'"));
        }
        let route = Self::new(service, public);
        Ok(match internal {
            Some(internal) if internal.starts_with('/') => route.with_target_prefix(internal),
            Some(_) => return Err(format!("route `{s}` internal prefix must start with '/'")),
            None => route,
        })
    }
}

impl fmt::Display for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path_prefix == self.target_prefix {
            write!(f, "{}={}", self.service_name, self.path_prefix)
        } else {
            write!(
                f,
                "{}={}:{}",
                self.service_name, self.path_prefix, self.target_prefix
            )
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Fixed-window rate limit applied per client key on each route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_requests: 100,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Domain written into `Set-Cookie` headers coming back from services.
    /// `None` leaves cookies untouched.
    pub cookie_domain: Option<String>,
    pub routes: Vec<RouteConfig>,
    pub rate_limit: RateLimitConfig,
    /// Interval between discovery refreshes, independent of traffic.
    pub refresh_interval: Duration,
    /// Overall budget for one proxied request, including the upstream call.
    pub request_timeout: Duration,
    /// Upper bound on cached proxy handlers.
    pub proxy_cache_capacity: usize,
    /// Largest request body forwarded upstream.
    pub max_body_bytes: usize,
    /// How long in-flight requests may drain after shutdown is signalled.
    pub shutdown_grace: Duration,
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cookie_domain: None,
            routes: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            refresh_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            proxy_cache_capacity: 256,
            max_body_bytes: 10 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(30),
            cors_origins: vec!["*".to_string()],
        }
    }
}

impl GatewayConfig {
    /// Distinct service names referenced by the route table, in route order.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            if !names.contains(&route.service_name) {
                names.push(route.service_name.clone());
            }
        }
        names
    }

    /// Public prefixes, used in the 404 body.
    #[must_use]
    pub fn public_prefixes(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.path_prefix.clone()).collect()
    }
}
