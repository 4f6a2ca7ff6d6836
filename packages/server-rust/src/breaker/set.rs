//! One breaker per statically declared operation of a component.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use super::circuit::{BreakerError, BreakerStats, CircuitBreaker};
use super::config::BreakerConfig;

/// A component whose public operations are guarded by circuit breakers.
///
/// The operation list is declared up front; anything in
/// `EXCLUDED_OPERATIONS` is left unguarded even if it is also listed.
pub trait GuardedComponent {
    const COMPONENT: &'static str;
    const GUARDED_OPERATIONS: &'static [&'static str];
    const EXCLUDED_OPERATIONS: &'static [&'static str] = &[];
}

/// Breakers for a single component, keyed by operation name.
#[derive(Debug, Clone)]
pub struct BreakerSet {
    component: &'static str,
    breakers: BTreeMap<&'static str, Arc<CircuitBreaker>>,
}

impl BreakerSet {
    /// Builds one breaker per guarded operation, named `"{component}.{op}"`.
    #[must_use]
    pub fn for_component<C: GuardedComponent>(config: &BreakerConfig) -> Self {
        let breakers = C::GUARDED_OPERATIONS
            .iter()
            .filter(|op| !C::EXCLUDED_OPERATIONS.contains(op))
            .map(|op| {
                let name = format!("{}.{op}", C::COMPONENT);
                (*op, Arc::new(CircuitBreaker::new(name, config.clone())))
            })
            .collect();
        Self {
            component: C::COMPONENT,
            breakers,
        }
    }

    #[must_use]
    pub fn component(&self) -> &'static str {
        self.component
    }

    #[must_use]
    pub fn get(&self, operation: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(operation)
    }

    #[must_use]
    pub fn is_guarded(&self, operation: &str) -> bool {
        self.breakers.contains_key(operation)
    }

    /// Runs `op` under the breaker for `operation`, or directly when the
    /// operation is not guarded.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::call`].
    pub async fn guard<F, Fut, T, E>(&self, operation: &str, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.breakers.get(operation) {
            Some(breaker) => breaker.call(op).await,
            None => op().await.map_err(BreakerError::Inner),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Vec<BreakerStats> {
        self.breakers.values().map(|b| b.stats()).collect()
    }
}
