//! Customer registration: create locally, verify with the cart service,
//! roll back on failure.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shopmesh_core::{ClockSource, SystemClock};
use tracing::{error, info, warn};

use super::client::ServiceClient;
use super::error::SagaError;
use super::store::{DocumentStore, StoreError};
use crate::breaker::GuardedComponent;

/// Cart service operations called during registration.
pub struct CartService;

impl GuardedComponent for CartService {
    const COMPONENT: &'static str = "cart-service";
    const GUARDED_OPERATIONS: &'static [&'static str] =
        &["create_cart", "delete_cart", "get_cart", "health"];
    const EXCLUDED_OPERATIONS: &'static [&'static str] = &["health"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cart_id: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCustomer {
    pub email: String,
    pub name: String,
}

/// Create-then-verify-then-compensate flow for new customers.
pub struct CustomerRegistration {
    store: Arc<dyn DocumentStore<Customer>>,
    carts: ServiceClient,
    clock: Arc<dyn ClockSource>,
}

impl CustomerRegistration {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore<Customer>>, carts: ServiceClient) -> Self {
        Self {
            store,
            carts,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Stores the customer, then asks the cart service for a cart.
    ///
    /// If the cart call fails, is rejected by its breaker, or answers without
    /// a cart id, the stored customer is deleted again. If the cart exists
    /// but cannot be recorded on the customer, the cart is released before
    /// the customer is deleted.
    ///
    /// # Errors
    ///
    /// [`SagaError::DependencyUnavailable`] after a rollback caused by the
    /// cart service, [`SagaError::Store`] after a rollback caused by the
    /// store, [`SagaError::Compensation`] if deleting the customer failed.
    pub async fn register(&self, input: NewCustomer) -> Result<Customer, SagaError> {
        let email = input.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(SagaError::Validation("a valid email is required".to_string()));
        }

        let mut customer = Customer {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            name: input.name.trim().to_string(),
            cart_id: None,
            created_at: self.clock.now(),
        };
        self.store.insert(&customer.id, customer.clone()).await?;

        let created = self
            .carts
            .post_json(
                "create_cart",
                "/api/carts",
                &json!({ "customerId": customer.id }),
            )
            .await;
        let cart_id = match created {
            Ok(body) => body
                .get("id")
                .or_else(|| body.get("cartId"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            Err(e) => {
                return Err(self.compensate(&customer.id, cart_unavailable(e.to_string())).await);
            }
        };
        let Some(cart_id) = cart_id else {
            return Err(self
                .compensate(
                    &customer.id,
                    cart_unavailable("cart service returned no cart id".to_string()),
                )
                .await);
        };

        customer.cart_id = Some(cart_id.clone());
        if let Err(e) = self.store.update(&customer.id, customer.clone()).await {
            warn!(customer = %customer.id, cart = %cart_id, error = %e, "failed to record cart on customer, releasing cart");
            self.release_cart(&customer.id, &cart_id).await;
            return Err(self.compensate(&customer.id, SagaError::Store(e)).await);
        }
        info!(customer = %customer.id, "customer registered");
        Ok(customer)
    }

    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn get(&self, id: &str) -> Result<Customer, SagaError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SagaError::Store(StoreError::NotFound(id.to_string())))
    }

    /// Deletes a cart created for a registration that is being rolled back.
    /// Failure leaves an orphaned cart, which is logged but does not change
    /// the outcome of the rollback.
    async fn release_cart(&self, customer: &str, cart_id: &str) {
        let path = format!("/api/carts/{cart_id}");
        match self.carts.call("delete_cart", Method::DELETE, &path, None).await {
            Ok(_) => info!(customer, cart = cart_id, "cart released"),
            Err(e) => {
                error!(
                    category = "compensation",
                    customer,
                    cart = cart_id,
                    error = %e,
                    "failed to release cart, cart is orphaned"
                );
                metrics::counter!("saga_compensations_total", "saga" => "customer_registration", "outcome" => "cart_orphaned")
                    .increment(1);
            }
        }
    }

    /// Deletes the stored customer. Returns `failure` once rolled back, or a
    /// [`SagaError::Compensation`] if the delete itself failed.
    async fn compensate(&self, id: &str, failure: SagaError) -> SagaError {
        match self.store.delete(id).await {
            Ok(_) => {
                warn!(customer = id, reason = %failure, "registration failed, customer rolled back");
                metrics::counter!("saga_compensations_total", "saga" => "customer_registration", "outcome" => "compensated")
                    .increment(1);
                failure
            }
            Err(e) => {
                error!(
                    category = "compensation",
                    customer = id,
                    reason = %failure,
                    error = %e,
                    "failed to roll back customer"
                );
                metrics::counter!("saga_compensations_total", "saga" => "customer_registration", "outcome" => "failed")
                    .increment(1);
                SagaError::Compensation {
                    entity: "customer",
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// `POST /api/customers` and `GET /api/customers/{id}`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/customers", post(register_customer))
            .route("/api/customers/{id}", get(get_customer))
            .with_state(self)
    }
}

fn cart_unavailable(reason: String) -> SagaError {
    SagaError::DependencyUnavailable {
        service: CartService::COMPONENT.to_string(),
        reason,
    }
}

async fn register_customer(
    State(flow): State<Arc<CustomerRegistration>>,
    Json(input): Json<NewCustomer>,
) -> Result<(StatusCode, Json<Customer>), SagaError> {
    let customer = flow.register(input).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

async fn get_customer(
    State(flow): State<Arc<CustomerRegistration>>,
    Path(id): Path<String>,
) -> Result<Json<Customer>, SagaError> {
    flow.get(&id).await.map(Json)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use shopmesh_core::{ManualClock, ServiceInstance};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::discovery::InstanceRegistry;
    use crate::saga::store::MemoryStore;

    async fn cart_service(status: StatusCode, body: Value) -> ServiceInstance {
        let app = Router::new().route(
            "/api/carts",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        ServiceInstance::new("127.0.0.1", port)
    }

    fn flow(
        registry: &Arc<InstanceRegistry>,
        store: &Arc<MemoryStore<Customer>>,
    ) -> CustomerRegistration {
        let carts = ServiceClient::new::<CartService>(
            Arc::clone(registry),
            &BreakerConfig::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        CustomerRegistration::new(Arc::clone(store) as Arc<dyn DocumentStore<Customer>>, carts)
            .with_clock(Arc::new(ManualClock::new(42)))
    }

    fn alice() -> NewCustomer {
        NewCustomer {
            email: "Alice@Example.com ".into(),
            name: "Alice".into(),
        }
    }

    #[tokio::test]
    async fn registers_when_cart_is_created() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace(
            "cart-service",
            vec![cart_service(StatusCode::CREATED, json!({"id": "cart-7"})).await],
        );
        let store = Arc::new(MemoryStore::new());
        let customer = flow(&registry, &store).register(alice()).await.unwrap();

        assert_eq!(customer.email, "alice@example.com");
        assert_eq!(customer.cart_id.as_deref(), Some("cart-7"));
        assert_eq!(customer.created_at, 42);
        assert_eq!(store.get(&customer.id).await.unwrap(), Some(customer));
    }

    #[tokio::test]
    async fn cart_failure_rolls_back_customer() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace(
            "cart-service",
            vec![cart_service(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "db"})).await],
        );
        let store = Arc::new(MemoryStore::new());
        let err = flow(&registry, &store).register(alice()).await.unwrap_err();

        assert!(matches!(err, SagaError::DependencyUnavailable { .. }));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalid_cart_response_rolls_back_customer() {
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace(
            "cart-service",
            vec![cart_service(StatusCode::OK, json!({"unexpected": true})).await],
        );
        let store = Arc::new(MemoryStore::new());
        let err = flow(&registry, &store).register(alice()).await.unwrap_err();
        assert!(matches!(err, SagaError::DependencyUnavailable { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn no_cart_instances_rolls_back_customer() {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let err = flow(&registry, &store).register(alice()).await.unwrap_err();
        assert!(matches!(err, SagaError::DependencyUnavailable { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_is_a_compensation_error() {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(MemoryStore::new());
        store.fail_deletes(true);
        let err = flow(&registry, &store).register(alice()).await.unwrap_err();
        assert!(matches!(err, SagaError::Compensation { entity: "customer", .. }));
        assert_eq!(store.len(), 1);
    }

    /// Cart service that creates `cart-7` and records deleted cart ids.
    async fn releasable_cart_service(deleted: Arc<parking_lot::Mutex<Vec<String>>>) -> ServiceInstance {
        let app = Router::new()
            .route(
                "/api/carts",
                post(|| async { (StatusCode::CREATED, Json(json!({"id": "cart-7"}))) }),
            )
            .route(
                "/api/carts/{id}",
                axum::routing::delete(move |Path(id): Path<String>| {
                    let deleted = Arc::clone(&deleted);
                    async move {
                        deleted.lock().push(id);
                        StatusCode::NO_CONTENT
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        ServiceInstance::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn failed_cart_link_releases_cart_and_customer() {
        let deleted = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = Arc::new(InstanceRegistry::new());
        registry.replace(
            "cart-service",
            vec![releasable_cart_service(Arc::clone(&deleted)).await],
        );
        let store = Arc::new(MemoryStore::new());
        store.fail_updates(true);

        let err = flow(&registry, &store).register(alice()).await.unwrap_err();
        assert!(matches!(err, SagaError::Store(StoreError::Unavailable(_))));
        assert!(store.is_empty());
        assert_eq!(deleted.lock().clone(), ["cart-7"]);
    }

    #[tokio::test]
    async fn rejects_invalid_email_without_writing() {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let err = flow(&registry, &store)
            .register(NewCustomer {
                email: "nope".into(),
                name: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Validation(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn http_route_returns_503_on_cart_failure() {
        let registry = Arc::new(InstanceRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let app = Arc::new(flow(&registry, &store)).router();

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/customers")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"a@b.c","name":"A"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["service"], "cart-service");
        assert!(store.is_empty());
    }
}
