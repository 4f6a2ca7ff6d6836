//! Circuit breaker state machine.
//!
//! ```text
//!            failure ratio >= threshold
//!            (with >= volume samples)
//!   CLOSED ------------------------------> OPEN
//!     ^                                     |  ^
//!     | probe succeeds        reset timeout |  | probe fails
//!     |                                     v  |
//!     +------------------------------- HALF_OPEN
//! ```
//!
//! `OPEN -> HALF_OPEN` is applied lazily on the next call or state read once
//! the reset timeout has elapsed. In `HALF_OPEN` exactly one probe call is let
//! through; everything else is rejected until the probe settles.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::BreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Error returned by a guarded call.
///
/// `Open` is the fast-fail rejection: the wrapped operation was never invoked.
/// It carries only a shared name so constructing it is cheap.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit {name} is open")]
    Open { name: Arc<str> },
    #[error("{name} timed out after {timeout_ms}ms")]
    Timeout { name: Arc<str>, timeout_ms: u64 },
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without being attempted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn map_inner<F, E2>(self, f: F) -> BreakerError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            Self::Open { name } => BreakerError::Open { name },
            Self::Timeout { name, timeout_ms } => BreakerError::Timeout { name, timeout_ms },
            Self::Inner(e) => BreakerError::Inner(f(e)),
        }
    }
}

/// Point-in-time counters for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    pub opens: u64,
    pub window_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug)]
struct Sample {
    at: Instant,
    outcome: Outcome,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: VecDeque<Sample>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Default)]
struct Counters {
    fires: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejects: AtomicU64,
    fallbacks: AtomicU64,
    opens: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Guards an asynchronous operation with a failure-rate circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    counters: Counters,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, applying a due `OPEN -> HALF_OPEN` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    /// Runs `op` under the breaker.
    ///
    /// # Errors
    ///
    /// - [`BreakerError::Open`] without invoking `op` while the circuit is open
    ///   (or a half-open probe is already in flight)
    /// - [`BreakerError::Timeout`] if `op` does not settle within the timeout;
    ///   the future is dropped and the call counts as a failure
    /// - [`BreakerError::Inner`] with the operation's own error
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            return Err(BreakerError::Open {
                name: Arc::clone(&self.name),
            });
        };
        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };
        self.counters.fires.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.timeout, op()).await {
            Ok(Ok(value)) => {
                guard.settle(Outcome::Success);
                Ok(value)
            }
            Ok(Err(e)) => {
                guard.settle(Outcome::Failure);
                Err(BreakerError::Inner(e))
            }
            Err(_elapsed) => {
                guard.settle(Outcome::Timeout);
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.config.timeout.as_millis() as u64;
                Err(BreakerError::Timeout {
                    name: Arc::clone(&self.name),
                    timeout_ms,
                })
            }
        }
    }

    /// Like [`call`](Self::call) but substitutes `fallback` for any error.
    pub async fn call_with_fallback<F, Fut, T, E, FB>(&self, op: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> T,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(e) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                fallback(e)
            }
        }
    }

    /// Forces the circuit closed and clears the window.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.window.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed);
    }

    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        let window_size = self.inner.lock().window.len();
        let c = &self.counters;
        BreakerStats {
            name: self.name.to_string(),
            state,
            fires: c.fires.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            rejects: c.rejects.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            opens: c.opens.load(Ordering::Relaxed),
            window_size,
        }
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        let admission = match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        };
        drop(inner);

        if admission.is_none() {
            self.counters.rejects.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("breaker_rejections_total", "breaker" => self.name.to_string()).increment(1);
            debug!(breaker = %self.name, "call rejected by open circuit");
        }
        admission
    }

    fn record(&self, admission: Admission, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.counters.successes,
            Outcome::Failure => &self.counters.failures,
            Outcome::Timeout => &self.counters.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut inner = self.inner.lock();
        match admission {
            Admission::Probe => {
                inner.probe_in_flight = false;
                if outcome == Outcome::Success {
                    inner.window.clear();
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                } else {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Admission::Normal => {
                // The circuit moved while this call was in flight; its sample
                // belongs to a window that no longer exists.
                if inner.state != CircuitState::Closed {
                    return;
                }
                inner.window.push_back(Sample { at: now, outcome });
                self.trim(&mut inner, now);
                if self.should_trip(&inner) {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
        }
    }

    fn trim(&self, inner: &mut Inner, now: Instant) {
        while inner
            .window
            .front()
            .is_some_and(|s| now.duration_since(s.at) > self.config.rolling_window)
        {
            inner.window.pop_front();
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        let total = inner.window.len() as u64;
        if total == 0 || total < u64::from(self.config.volume_threshold) {
            return false;
        }
        let failed = inner
            .window
            .iter()
            .filter(|s| s.outcome != Outcome::Success)
            .count() as u64;
        failed * 100 >= u64::from(self.config.error_threshold_percent) * total
    }

    fn maybe_half_open(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_none_or(|at| now.duration_since(at) >= self.config.reset_timeout);
        if due {
            inner.probe_in_flight = false;
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if to == CircuitState::Open {
            self.counters.opens.fetch_add(1, Ordering::Relaxed);
            warn!(breaker = %self.name, from = from.as_str(), to = to.as_str(), "circuit breaker state change");
        } else {
            info!(breaker = %self.name, from = from.as_str(), to = to.as_str(), "circuit breaker state change");
        }
        metrics::counter!(
            "breaker_transitions_total",
            "breaker" => self.name.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// Records an outcome exactly once, even if the call future is dropped.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.admission, outcome);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        // An abandoned probe must not hold the half-open slot forever.
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.record(Admission::Probe, Outcome::Failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "cart.create",
            BreakerConfig {
                timeout: Duration::from_millis(500),
                error_threshold_percent: 50,
                volume_threshold: 10,
                reset_timeout: Duration::from_secs(30),
                rolling_window: Duration::from_secs(10),
            },
        ))
    }

    async fn ok(b: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(1) }).await
    }

    async fn fail(b: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        b.call(|| async { Err::<u32, _>("boom") }).await
    }

    async fn trip(b: &CircuitBreaker) {
        for _ in 0..5 {
            let _ = fail(b).await;
        }
        for _ in 0..5 {
            let _ = ok(b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_rejects_without_invoking() {
        let b = breaker();
        trip(&b).await;

        let invoked = AtomicU32::new(0);
        let err = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().rejects, 1);
        assert_eq!(b.stats().opens, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_volume_threshold() {
        let b = breaker();
        for _ in 0..9 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner("boom"))));
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_error_percentage() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        for _ in 0..6 {
            let _ = ok(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_samples_leave_the_window() {
        let b = breaker();
        for _ in 0..9 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().window_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_probe() {
        let b = breaker();
        trip(&b).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        let probe_breaker = Arc::clone(&b);
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, &'static str>(7)
                })
                .await
        });
        tokio::task::yield_now().await;

        assert!(ok(&b).await.unwrap_err().is_open());
        assert_eq!(probe.await.unwrap().unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(ok(&b).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_and_restarts_timer() {
        let b = breaker();
        trip(&b).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(b.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_as_failure() {
        let b = breaker();
        let err = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Timeout { timeout_ms: 500, .. }));
        assert_eq!(b.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_probe_releases_slot() {
        let b = breaker();
        trip(&b).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let probe_breaker = Arc::clone(&b);
        let probe = tokio::spawn(async move {
            probe_breaker
                .call(|| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok::<_, &'static str>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        probe.abort();
        let _ = probe.await;

        // The abandoned probe counted as a failure and reopened the circuit.
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_replaces_errors() {
        let b = breaker();
        let value = b
            .call_with_fallback(|| async { Err::<u32, _>("down") }, |_| 99)
            .await;
        assert_eq!(value, 99);
        assert_eq!(b.stats().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_circuit() {
        let b = breaker();
        trip(&b).await;
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(ok(&b).await.unwrap(), 1);
    }
}
