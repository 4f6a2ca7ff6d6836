//! Saga and compensation flows built on the registry, breakers, and bus.
//!
//! - [`customer`]: create, verify with the cart service, roll back on failure
//! - [`product`]: create, publish, roll back and announce `.FAILED` on failure
//! - [`inventory`]: idempotent consumer of product and reconciliation events
//! - [`reconciliation`]: isolated periodic sweep of stuck payment transactions

pub mod client;
pub mod customer;
pub mod error;
pub mod inventory;
pub mod product;
pub mod reconciliation;
pub mod store;

pub use client::{ServiceCallError, ServiceClient};
pub use customer::{CartService, Customer, CustomerRegistration, NewCustomer};
pub use error::SagaError;
pub use inventory::InventoryLedger;
pub use product::{failed_kind, NewProduct, Product, ProductCatalog, PRODUCT_CREATED};
pub use reconciliation::{
    confirm_inventory, BusPublisherFactory, PaymentProcessor, PublisherFactory, ReconciliationConfig,
    ReconciliationScheduler, ReconciliationSweep, SweepError, SweepNow, SweepReport,
    INVENTORY_RECONCILE,
};
pub use store::{DocumentStore, MemoryStore, StoreError};
