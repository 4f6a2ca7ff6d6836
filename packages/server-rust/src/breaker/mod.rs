//! Circuit breaker guard for outbound calls and controller actions.
//!
//! - [`circuit`]: the `CLOSED -> OPEN -> HALF_OPEN` state machine
//! - [`layer`]: Tower layer so any `tower::Service` can be guarded
//! - [`set`]: one breaker per statically declared operation of a component

pub mod circuit;
pub mod config;
pub mod layer;
pub mod set;

pub use circuit::{BreakerError, BreakerStats, CircuitBreaker, CircuitState};
pub use config::BreakerConfig;
pub use layer::{CircuitBreakerLayer, CircuitBreakerService};
pub use set::{BreakerSet, GuardedComponent};
