//! Breaker-guarded JSON client for calling another service through the
//! instance registry.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::breaker::{BreakerConfig, BreakerError, BreakerSet, GuardedComponent};
use crate::discovery::InstanceRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ServiceCallError {
    #[error("no healthy instances of {service}")]
    Unavailable { service: String },

    #[error("request to {service} failed: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} responded with {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} returned malformed JSON: {source}")]
    Decode {
        service: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Calls one downstream service, round-robin across its registered
/// instances, with one circuit breaker per declared operation.
///
/// The service name and operation list come from a [`GuardedComponent`].
#[derive(Debug, Clone)]
pub struct ServiceClient {
    service: &'static str,
    registry: Arc<InstanceRegistry>,
    http: reqwest::Client,
    breakers: BreakerSet,
}

impl ServiceClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built (TLS backend
    /// initialisation failure).
    pub fn new<C: GuardedComponent>(
        registry: Arc<InstanceRegistry>,
        breaker: &BreakerConfig,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        registry.track(C::COMPONENT);
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            service: C::COMPONENT,
            registry,
            http,
            breakers: BreakerSet::for_component::<C>(breaker),
        })
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.service
    }

    #[must_use]
    pub fn breakers(&self) -> &BreakerSet {
        &self.breakers
    }

    /// Issues `method path` with an optional JSON body under the breaker for
    /// `operation`. A 204 or empty body yields `Value::Null`.
    ///
    /// # Errors
    ///
    /// Breaker rejections and timeouts, or the [`ServiceCallError`] of the
    /// attempted call.
    pub async fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BreakerError<ServiceCallError>> {
        self.breakers
            .guard(operation, || self.send(method, path, body))
            .await
    }

    /// `POST` shorthand for [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn post_json(
        &self,
        operation: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, BreakerError<ServiceCallError>> {
        self.call(operation, Method::POST, path, Some(body)).await
    }

    /// `GET` shorthand for [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn get_json(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<Value, BreakerError<ServiceCallError>> {
        self.call(operation, Method::GET, path, None).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ServiceCallError> {
        let instance = self
            .registry
            .select(self.service)
            .ok_or_else(|| ServiceCallError::Unavailable {
                service: self.service.to_string(),
            })?;
        let url = format!("{}{path}", instance.base_url());
        debug!(service = self.service, %method, url = %url, "calling service");

        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let transport = |source| ServiceCallError::Transport {
            service: self.service.to_string(),
            source,
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport)?;

        if !status.is_success() {
            return Err(ServiceCallError::Status {
                service: self.service.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|source| ServiceCallError::Decode {
            service: self.service.to_string(),
            source,
        })
    }
}
