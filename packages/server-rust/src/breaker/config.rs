use std::time::Duration;

/// Thresholds for a [`CircuitBreaker`](super::CircuitBreaker).
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Time allowed for the wrapped operation to settle before it counts as a
    /// timeout failure.
    pub timeout: Duration,
    /// Failure percentage (0-100) at or above which the circuit opens.
    pub error_threshold_percent: u32,
    /// Minimum number of samples in the rolling window before the failure
    /// percentage is evaluated.
    pub volume_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub reset_timeout: Duration,
    /// Samples older than this fall out of the window.
    pub rolling_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            error_threshold_percent: 50,
            volume_threshold: 10,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
        }
    }
}
