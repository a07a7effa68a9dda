//! Circuit breaker for the networked cache tier
//!
//! Opens after `threshold` consecutive failures. While open, calls are
//! skipped until `cooldown` has passed since the last failure; the next call
//! is then let through as a trial. A successful trial closes the breaker and
//! resets the counter, a failed one restarts the cooldown.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Consecutive-failure circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True once the failure count has reached the threshold
    pub fn is_open(&self) -> bool {
        self.lock().failures >= self.threshold
    }

    /// Whether a call to the guarded tier should be attempted now
    ///
    /// # Returns
    ///
    /// * `true` - The breaker is closed, or open with its cooldown elapsed
    /// * `false` - The breaker is open and cooling down
    pub fn allow_request(&self) -> bool {
        let state = self.lock();
        if state.failures < self.threshold {
            return true;
        }
        state
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.cooldown)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.failures >= self.threshold {
            tracing::info!("Circuit breaker closed after successful trial call");
        }
        state.failures = 0;
        state.last_failure = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        if state.failures == self.threshold {
            tracing::warn!(
                "Circuit breaker opened after {} consecutive failures, cooling down for {:?}",
                state.failures,
                self.cooldown
            );
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.failure_count(), 3);
    }

    #[test]
    fn test_success_before_threshold_resets_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_closes_after_cooldown_and_success() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(50));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        sleep(Duration::from_millis(80));
        assert!(breaker.allow_request());
        // Still open until the trial call succeeds
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_failed_trial_restarts_cooldown() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        breaker.record_failure();
        breaker.record_failure();

        sleep(Duration::from_millis(80));
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert!(breaker.is_open());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_zero_threshold_is_raised_to_one() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(1));
        assert_eq!(breaker.threshold(), 1);
        assert!(!breaker.is_open());
    }
}
