//! Consul agent HTTP client implementing [`DiscoveryBackend`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shopmesh_core::{ServiceInstance, ServiceRegistration};
use tracing::debug;

use super::backend::{DiscoveryBackend, DiscoveryError};

/// Talks to a Consul agent over its HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulDiscovery {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck<'a> {
    #[serde(rename = "HTTP")]
    http: &'a str,
    interval: &'static str,
    timeout: &'static str,
    deregister_critical_service_after: &'static str,
}

impl ConsulDiscovery {
    /// Creates a client for the agent at `base_url` (e.g. `http://consul:8500`).
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        let mut base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            base_url = format!("http://{base_url}");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}/v1{path}", self.base_url));
        if let Some(token) = &self.token {
            req = req.header("X-Consul-Token", token);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response, DiscoveryError> {
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(DiscoveryError::Status {
                status: resp.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl DiscoveryBackend for ConsulDiscovery {
    async fn list_services(&self) -> Result<Vec<String>, DiscoveryError> {
        let path = "/catalog/services";
        let resp = self.send(self.request(reqwest::Method::GET, path), path).await?;
        let services: BTreeMap<String, serde_json::Value> = resp.json().await?;
        Ok(services.into_keys().filter(|name| name != "consul").collect())
    }

    async fn get_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let path = format!("/health/service/{name}");
        let req = self
            .request(reqwest::Method::GET, &path)
            .query(&[("passing", "true")]);
        let entries: Vec<HealthEntry> = self.send(req, &path).await?.json().await?;
        let instances: Vec<ServiceInstance> = entries
            .into_iter()
            .map(|e| {
                // Services registered without an address inherit the node's.
                let address = if e.service.address.is_empty() {
                    e.node.address
                } else {
                    e.service.address
                };
                ServiceInstance::new(address, e.service.port)
            })
            .collect();
        debug!(service = name, count = instances.len(), "consul instances");
        Ok(instances)
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        let path = "/agent/service/register";
        let body = AgentRegistration {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            check: registration.health_check_url.as_deref().map(|url| AgentCheck {
                http: url,
                interval: "10s",
                timeout: "5s",
                deregister_critical_service_after: "1m",
            }),
        };
        let req = self.request(reqwest::Method::PUT, path).json(&body);
        self.send(req, path).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), DiscoveryError> {
        let path = format!("/agent/service/deregister/{id}");
        self.send(self.request(reqwest::Method::PUT, &path), &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;

    type Calls = Arc<Mutex<Vec<Value>>>;

    async fn fake_agent() -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/v1/catalog/services",
                get(|| async { Json(json!({"consul": [], "product-service": ["v1"]})) }),
            )
            .route(
                "/v1/health/service/{name}",
                get(|Path(name): Path<String>| async move {
                    if name == "product-service" {
                        Json(json!([
                            {"Node": {"Address": "10.0.0.1"}, "Service": {"Address": "", "Port": 3001}},
                            {"Node": {"Address": "10.0.0.2"}, "Service": {"Address": "172.16.0.9", "Port": 3002}}
                        ]))
                    } else {
                        Json(json!([]))
                    }
                }),
            )
            .route(
                "/v1/agent/service/register",
                put(|State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    calls.lock().push(body);
                    StatusCode::OK
                }),
            )
            .route(
                "/v1/agent/service/deregister/{id}",
                put(|Path(id): Path<String>| async move {
                    if id == "missing" {
                        StatusCode::NOT_FOUND
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    #[tokio::test]
    async fn lists_services_without_consul_itself() {
        let (url, _) = fake_agent().await;
        let consul = ConsulDiscovery::new(url, None).unwrap();
        assert_eq!(consul.list_services().await.unwrap(), vec!["product-service"]);
    }

    #[tokio::test]
    async fn instances_fall_back_to_node_address() {
        let (url, _) = fake_agent().await;
        let consul = ConsulDiscovery::new(url, None).unwrap();
        let instances = consul.get_instances("product-service").await.unwrap();
        assert_eq!(
            instances,
            vec![
                ServiceInstance::new("10.0.0.1", 3001),
                ServiceInstance::new("172.16.0.9", 3002),
            ]
        );
        assert!(consul.get_instances("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_sends_agent_payload() {
        let (url, calls) = fake_agent().await;
        let consul = ConsulDiscovery::new(url, Some("secret".to_string())).unwrap();
        consul
            .register(&ServiceRegistration::new("cart-service", "10.1.1.1", 3004))
            .await
            .unwrap();

        let body = calls.lock()[0].clone();
        assert_eq!(body["ID"], "cart-service-10.1.1.1-3004");
        assert_eq!(body["Port"], 3004);
        assert_eq!(body["Check"]["HTTP"], "http://10.1.1.1:3004/health");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (url, _) = fake_agent().await;
        let consul = ConsulDiscovery::new(url, None).unwrap();
        let err = consul.deregister("missing").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn unreachable_agent_is_transport_error() {
        let consul = ConsulDiscovery::new("127.0.0.1:1", None).unwrap();
        assert!(matches!(
            consul.list_services().await.unwrap_err(),
            DiscoveryError::Transport(_)
        ));
    }
}
