//! Product creation with event fan-out and compensation.
//!
//! Other services keep denormalized product copies fed by `product.created`.
//! When the event cannot be published the product is deleted again and a
//! `product.created.FAILED` event tells any partial consumer to drop it.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shopmesh_core::{ClockSource, SystemClock};
use tracing::{error, info, warn};

use super::error::SagaError;
use super::store::DocumentStore;
use crate::bus::EventPublisher;

pub const PRODUCT_CREATED: &str = "product.created";

/// Event type announcing that `kind` was rolled back.
#[must_use]
pub fn failed_kind(kind: &str) -> String {
    format!("{kind}.FAILED")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Price in minor currency units.
    pub price: u64,
    pub stock: u32,
    pub created_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProduct {
    pub name: String,
    pub price: u64,
    #[serde(default)]
    pub stock: u32,
}

pub struct ProductCatalog {
    store: Arc<dyn DocumentStore<Product>>,
    events: Arc<dyn EventPublisher>,
    clock: Arc<dyn ClockSource>,
}

impl ProductCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore<Product>>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            events,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Stores the product and publishes `product.created`.
    ///
    /// # Errors
    ///
    /// [`SagaError::Publish`] when the event could not be published and the
    /// product was deleted again; [`SagaError::Compensation`] when that
    /// delete failed too.
    pub async fn create(&self, input: NewProduct) -> Result<Product, SagaError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(SagaError::Validation("product name is required".to_string()));
        }
        let product = Product {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            price: input.price,
            stock: input.stock,
            created_at: self.clock.now(),
        };
        self.store.insert(&product.id, product.clone()).await?;

        let payload = json!({
            "id": product.id,
            "name": product.name,
            "price": product.price,
            "stock": product.stock,
        });
        match self.events.publish_event(PRODUCT_CREATED, payload).await {
            Ok(event_id) => {
                info!(product = %product.id, event = %event_id, "product created");
                Ok(product)
            }
            Err(source) => Err(self.compensate(&product.id, source).await),
        }
    }

    async fn compensate(&self, id: &str, source: crate::bus::BusError) -> SagaError {
        let failed = failed_kind(PRODUCT_CREATED);
        let deleted = self.store.delete(id).await;

        let notice = json!({ "id": id, "reason": source.to_string() });
        if let Err(e) = self.events.publish_event(&failed, notice).await {
            warn!(product = id, kind = %failed, error = %e, "could not announce rolled back product");
        }

        match deleted {
            Ok(_) => {
                warn!(product = id, error = %source, "event publish failed, product rolled back");
                metrics::counter!("saga_compensations_total", "saga" => "product_creation", "outcome" => "compensated")
                    .increment(1);
                SagaError::Publish {
                    kind: PRODUCT_CREATED.to_string(),
                    source,
                }
            }
            Err(e) => {
                error!(
                    category = "compensation",
                    product = id,
                    error = %e,
                    publish_error = %source,
                    "failed to roll back product after publish failure"
                );
                metrics::counter!("saga_compensations_total", "saga" => "product_creation", "outcome" => "failed")
                    .increment(1);
                SagaError::Compensation {
                    entity: "product",
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// `POST /api/products`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/products", post(create_product))
            .with_state(self)
    }
}

async fn create_product(
    State(catalog): State<Arc<ProductCatalog>>,
    Json(input): Json<NewProduct>,
) -> Result<(StatusCode, Json<Product>), SagaError> {
    let product = catalog.create(input).await?;
    Ok((StatusCode::CREATED, Json(product)))
}
