//! Circuit breaker for the aggregate fallback operation.
//!
//! One breaker instance guards "try the chain" as a whole, not one per
//! backend: if every backend is failing, the chain walk itself is what
//! needs to be disabled while the storage layer recovers.
//!
//! States:
//!
//! - **Closed**: normal operation. Failures increment a counter; hitting
//!   the threshold opens the circuit.
//! - **Open**: calls are rejected until the recovery timeout elapses. The
//!   first call after the timeout is admitted as a trial and moves the
//!   breaker to half-open.
//! - **HalfOpen**: a bounded number of trial calls are admitted. Enough
//!   successes close the circuit; any failure reopens it.
//!
//! All counters live under one mutex. The lock is only held for counter
//! and state updates, never across backend I/O.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, StratumError};

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in the closed state before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds to wait in the open state before admitting a trial call.
    pub recovery_timeout_secs: u64,
    /// Trial calls admitted while half-open.
    pub test_requests: u32,
    /// Successful trials needed to close the circuit again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            test_requests: 3,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls.
    Open,
    /// Trial recovery.
    HalfOpen,
}

/// Monotonic counters exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub circuit_opens: u64,
    /// Calls rejected because the circuit was open.
    pub fallback_triggers: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    test_request_count: u32,
    last_failure_at: Option<Instant>,
    metrics: BreakerMetrics,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            test_request_count: 0,
            last_failure_at: None,
            metrics: BreakerMetrics::default(),
        }
    }
}

/// Read-only snapshot of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub test_request_count: u32,
    /// Seconds since the failure that last moved the breaker, if any.
    pub seconds_since_last_failure: Option<f64>,
    pub metrics: BreakerMetrics,
    pub config: CircuitBreakerConfig,
}

/// Circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker with the given tuning.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Run an operation under the breaker.
    ///
    /// The outcome is recorded exactly once per invocation, on both the
    /// success and the error path. Rejections surface as `CircuitOpen`
    /// without invoking the operation at all.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Admit or reject a call, performing any due state transition.
    fn admit(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.metrics.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout() {
                    // This call is the first trial of the recovery attempt.
                    inner.state = CircuitState::HalfOpen;
                    inner.test_request_count = 1;
                    inner.success_count = 0;
                    info!("circuit breaker half-open, admitting trial call");
                    Ok(())
                } else {
                    inner.metrics.fallback_triggers += 1;
                    let remaining = self
                        .config
                        .recovery_timeout()
                        .saturating_sub(elapsed)
                        .as_secs();
                    Err(StratumError::circuit_open(remaining))
                }
            }
            CircuitState::HalfOpen => {
                if inner.test_request_count < self.config.test_requests {
                    inner.test_request_count += 1;
                    Ok(())
                } else {
                    // Trial budget spent; hold further calls until the
                    // pending trials settle the verdict.
                    inner.metrics.fallback_triggers += 1;
                    Err(StratumError::circuit_open(0))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.metrics.successful_requests += 1;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.test_request_count = 0;
                    info!("circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.metrics.failed_requests += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.failure_count = 0;
                    inner.metrics.circuit_opens += 1;
                    warn!(
                        "circuit breaker opened after {} consecutive failures",
                        self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                // One failed trial is enough to reopen.
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.test_request_count = 0;
                inner.metrics.circuit_opens += 1;
                warn!("circuit breaker reopened after failed trial call");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state and counters.
    pub fn state(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            test_request_count: inner.test_request_count,
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs_f64()),
            metrics: inner.metrics,
            config: self.config,
        }
    }

    /// Manually close the circuit and zero the working counters. Metrics
    /// are monotonic and survive resets.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.test_request_count = 0;
        info!("circuit breaker manually reset");
    }

    /// Manually open the circuit, starting a fresh cooldown.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.last_failure_at = Some(Instant::now());
        inner.metrics.circuit_opens += 1;
        warn!("circuit breaker manually forced open");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
