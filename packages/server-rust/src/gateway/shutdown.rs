//! Graceful shutdown controller with in-flight request tracking.
//!
//! Health state lives in an `ArcSwap` so probes read it without locking;
//! in-flight requests are counted with RAII guards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;

/// Gateway health, driven by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ok",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// How a drain ended. Maps onto the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Drained,
    /// The grace period expired with requests still in flight.
    TimedOut { in_flight: u64 },
}

impl ShutdownOutcome {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Drained => 0,
            Self::TimedOut { .. } => 1,
        }
    }
}

/// Coordinates gateway shutdown.
///
/// 1. Probes read `health_state()`
/// 2. The in-flight middleware holds an [`InFlightGuard`] per request and
///    rejects new ones once draining
/// 3. `trigger_shutdown()` moves to Draining and cancels `token()`
/// 4. `wait_for_drain()` waits for in-flight requests, bounded by a grace period
#[derive(Debug)]
pub struct ShutdownController {
    token: CancellationToken,
    in_flight: Arc<AtomicU64>,
    health_state: ArcSwap<HealthState>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Controller whose token is a child of `parent`, so process-wide
    /// cancellation also starts a drain.
    #[must_use]
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self::with_token(parent.child_token())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            in_flight: Arc::new(AtomicU64::new(0)),
            health_state: ArcSwap::from_pointee(HealthState::Starting),
        }
    }

    pub fn set_ready(&self) {
        self.health_state.store(Arc::new(HealthState::Ready));
    }

    /// Token cancelled when shutdown is triggered.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger_shutdown(&self) {
        if self.health_state() != HealthState::Stopped {
            self.health_state.store(Arc::new(HealthState::Draining));
        }
        self.token.cancel();
    }

    /// True once shutdown has been triggered, by this controller or a parent.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn mark_stopped(&self) {
        self.health_state.store(Arc::new(HealthState::Stopped));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        let state = **self.health_state.load();
        if state == HealthState::Ready && self.token.is_cancelled() {
            HealthState::Draining
        } else {
            state
        }
    }

    /// The in-flight counter is incremented now and decremented when the guard
    /// drops, including on panic unwinds.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight requests to finish, up to `grace`.
    pub async fn wait_for_drain(&self, grace: Duration) -> ShutdownOutcome {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let in_flight = self.in_flight_count();
            if in_flight == 0 {
                self.mark_stopped();
                return ShutdownOutcome::Drained;
            }
            if tokio::time::Instant::now() >= deadline {
                return ShutdownOutcome::TimedOut { in_flight };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
