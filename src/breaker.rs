//! Circuit breaker for containing cascading failures
//!
//! The OPEN -> HALF_OPEN transition is polled lazily on the next call or
//! recorded result rather than by a background timer. This is deliberate:
//! the breaker is shared by an unbounded number of concurrent callers, and
//! a timer would be one more actor mutating its state.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, rejecting calls
    Open,
    /// Trialing recovery
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before the circuit closes
    pub success_threshold: u32,
    /// Time the circuit stays open before trialing recovery
    pub timeout: Duration,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Clone)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not invoked. Carries the message
    /// of the failure that tripped the circuit, when known.
    Open { last_error: Option<String> },
    /// The operation ran and failed
    OperationFailed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { last_error: Some(err) } => {
                write!(f, "Circuit breaker is open (last error: {})", err)
            }
            Self::Open { last_error: None } => write!(f, "Circuit breaker is open"),
            Self::OperationFailed(e) => write!(f, "Operation failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub times_opened: u64,
    pub times_closed: u64,
    pub rejected_calls: u64,
    pub last_error: Option<String>,
}

const STATE_CLOSED: u32 = 0;
const STATE_OPEN: u32 = 1;
const STATE_HALF_OPEN: u32 = 2;

/// Shared guard that fails fast once failures exceed a threshold, trialing
/// recovery after a cooldown. Safe for unlimited concurrent callers; all
/// counters are atomic.
pub struct CircuitBreaker {
    state: AtomicU32,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    config: CircuitBreakerConfig,
    /// Reference point for the millisecond clocks below
    epoch: Instant,
    /// Milliseconds since `epoch` when the circuit opened; 0 = never
    open_since_ms: AtomicU64,
    /// Milliseconds since `epoch` of the last failure; 0 = none
    last_failure_ms: AtomicU64,
    last_error: RwLock<Option<String>>,
    times_opened: AtomicU64,
    times_closed: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU32::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            config,
            epoch: Instant::now(),
            open_since_ms: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_error: RwLock::new(None),
            times_opened: AtomicU64::new(0),
            times_closed: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Current circuit state, without applying the lazy open-timeout check.
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn success_count(&self) -> u32 {
        self.success_count.load(Ordering::Relaxed)
    }

    /// Whether an open circuit has cooled down long enough to trial recovery.
    pub fn should_attempt_reset(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }
        let opened = self.open_since_ms.load(Ordering::Acquire);
        if opened == 0 {
            return false;
        }
        self.now_ms().saturating_sub(opened) >= self.config.timeout.as_millis() as u64
    }

    /// Execute an operation under circuit protection.
    ///
    /// While the circuit is open and the timeout has not elapsed, the
    /// operation is not invoked and `CircuitBreakerError::Open` is returned
    /// carrying the last recorded failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self.state() {
            CircuitState::Open => {
                if self.should_attempt_reset() {
                    self.transition_to(CircuitState::HalfOpen);
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    warn!("circuit open, rejecting call");
                    return Err(CircuitBreakerError::Open {
                        last_error: self.last_error_message(),
                    });
                }
            }
            CircuitState::HalfOpen => {
                let trials = self.success_count.load(Ordering::Relaxed)
                    + self.failure_count.load(Ordering::Relaxed);
                if trials >= self.config.half_open_max_calls {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    warn!("half-open trial budget exhausted, rejecting call");
                    return Err(CircuitBreakerError::Open {
                        last_error: self.last_error_message(),
                    });
                }
            }
            CircuitState::Closed => {}
        }

        match operation().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                self.on_failure(&e.to_string());
                Err(CircuitBreakerError::OperationFailed(e))
            }
        }
    }

    /// Apply the success/failure transition logic without executing work,
    /// for callers that already ran the operation themselves.
    pub fn record_result(&self, successful: bool) {
        if self.state() == CircuitState::Open && self.should_attempt_reset() {
            self.transition_to(CircuitState::HalfOpen);
        }

        if successful {
            self.on_success();
        } else {
            self.on_failure("operation failed");
        }
    }

    /// Operator override: force the circuit open.
    pub fn open(&self, reason: &str) {
        info!(reason = %reason, "circuit forced open");
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(reason.to_string());
        }
        self.transition_to(CircuitState::Open);
    }

    /// Operator override: close the circuit and clear all state.
    pub fn reset(&self) {
        self.transition_to(CircuitState::Closed);
        self.last_failure_ms.store(0, Ordering::Release);
        if let Ok(mut last) = self.last_error.write() {
            *last = None;
        }
    }

    pub fn statistics(&self) -> CircuitBreakerStatistics {
        CircuitBreakerStatistics {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            times_closed: self.times_closed.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            last_error: self.last_error_message(),
        }
    }

    fn on_success(&self) {
        let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(success_count = successes, "operation succeeded");

        if self.state() == CircuitState::HalfOpen {
            if successes >= self.config.success_threshold {
                info!("closing circuit after successful trial");
                self.transition_to(CircuitState::Closed);
            }
        } else {
            // Failure streak broken
            self.failure_count.store(0, Ordering::SeqCst);
        }
    }

    fn on_failure(&self, message: &str) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_failure_ms.store(self.now_ms(), Ordering::Release);
        if let Ok(mut last) = self.last_error.write() {
            *last = Some(message.to_string());
        }

        warn!(failure_count = failures, error = %message, "operation failed");

        if self.state() == CircuitState::HalfOpen {
            info!("failure during trial, reopening circuit");
            self.transition_to(CircuitState::Open);
        } else if failures >= self.config.failure_threshold {
            info!(threshold = self.config.failure_threshold, "failure threshold reached, opening circuit");
            self.transition_to(CircuitState::Open);
        }
    }

    fn transition_to(&self, new_state: CircuitState) {
        let state_num = match new_state {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        };

        let old = self.state.swap(state_num, Ordering::SeqCst);
        // Counters always restart with the new state; in particular the
        // failure count is zero whenever the circuit is closed.
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);

        match new_state {
            CircuitState::Open => {
                self.open_since_ms.store(self.now_ms().max(1), Ordering::Release);
                self.times_opened.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed => {
                self.open_since_ms.store(0, Ordering::Release);
                if old != STATE_CLOSED {
                    self.times_closed.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::HalfOpen => {}
        }

        debug!(from = old, to = state_num, "circuit state changed");
    }

    fn last_error_message(&self) -> Option<String> {
        self.last_error.read().ok().and_then(|g| g.clone())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
