//! Per-plugin circuit breaker.
//!
//! Counts consecutive failures of lifecycle operations. Once the count hits
//! the threshold the breaker opens and calls fail fast until the recovery
//! timeout has passed; the next call is then let through as a probe.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::info::duration_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// Successes needed in half-open before closing again.
    pub success_threshold: u32,
    #[serde(with = "duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state. An open breaker whose recovery timeout has elapsed
    /// reports (and becomes) half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn allow_request(&self) -> bool {
        !matches!(self.state(), CircuitState::Open)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    tracing::info!(plugin = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.opened_at = Some(Instant::now());
        tracing::warn!(
            plugin = %self.name,
            failures = inner.failure_count,
            "circuit breaker opened"
        );
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
        if elapsed >= self.config.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            tracing::info!(plugin = %self.name, "circuit breaker half-open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "radio",
            CircuitConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::new("radio", CircuitConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_only_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
        assert_eq!(cb.failure_count(), 3);
    }

    #[test]
    fn test_success_resets_failures_when_closed() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_half_open_success_closes() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(2, Duration::from_millis(20));
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_reset() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure();
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
