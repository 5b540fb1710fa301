//! Automatic failure recovery
//!
//! Tracks recovery state per failure fingerprint, enforces retry budgets,
//! and dispatches pluggable recovery strategies. Strategy failures are
//! always converted into failed results here; recovery machinery must
//! never surface a secondary failure to its caller.

use crate::breaker::CircuitBreaker;
use crate::classify::{ErrorClassification, ErrorType, Recoverability};
use crate::errors::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ============================================================================
// Results
// ============================================================================

/// Outcome of one recovery attempt. Immutable once constructed; appended to
/// the owning attempt's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub successful: bool,
    /// True when recovery was refused rather than tried
    pub skipped: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub attempt_count: u32,
    pub strategy_used: Option<String>,
    /// Display form of a strategy error, when one occurred
    pub error: Option<String>,
}

impl RecoveryResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            successful: true,
            skipped: false,
            message: message.into(),
            timestamp: Utc::now(),
            duration: None,
            attempt_count: 0,
            strategy_used: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            successful: false,
            skipped: false,
            message: message.into(),
            timestamp: Utc::now(),
            duration: None,
            attempt_count: 0,
            strategy_used: None,
            error: None,
        }
    }

    pub fn failed_with(message: impl Into<String>, error: impl std::fmt::Display) -> Self {
        let mut result = Self::failed(message);
        result.error = Some(error.to_string());
        result
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            successful: false,
            skipped: true,
            message: format!("Recovery skipped: {}", reason.into()),
            timestamp: Utc::now(),
            duration: None,
            attempt_count: 0,
            strategy_used: None,
            error: None,
        }
    }
}

// ============================================================================
// Attempt tracking
// ============================================================================

/// Mutable recovery state for one failure fingerprint.
///
/// Created on first encounter, updated on every attempt, deactivated on
/// success or when the attempt/time budget is exhausted. Owned exclusively
/// by the manager's tracking map.
#[derive(Debug, Clone)]
pub struct RecoveryAttempt {
    classification: ErrorClassification,
    retry_policy: RetryPolicy,
    first_attempt_time: Instant,
    attempt_count: u32,
    last_attempt_time: Option<Instant>,
    history: Vec<RecoveryResult>,
    total_recovery_time: Duration,
    active: bool,
}

impl RecoveryAttempt {
    pub fn new(classification: ErrorClassification, retry_policy: RetryPolicy) -> Self {
        Self {
            classification,
            retry_policy,
            first_attempt_time: Instant::now(),
            attempt_count: 0,
            last_attempt_time: None,
            history: Vec::new(),
            total_recovery_time: Duration::ZERO,
            active: true,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempt_count += 1;
        self.last_attempt_time = Some(Instant::now());
    }

    /// Results are appended in the order attempts complete.
    pub fn record_result(&mut self, result: RecoveryResult) {
        if let Some(duration) = result.duration {
            self.total_recovery_time += duration;
        }
        if result.successful {
            self.active = false;
        }
        self.history.push(result);
    }

    /// Whether another attempt is allowed right now: the attempt is still
    /// active, the attempt cap and total-time budget are not exhausted, and
    /// the inter-attempt wait since the last attempt has elapsed.
    pub fn can_attempt_recovery(&self) -> bool {
        if !self.active {
            return false;
        }
        if self.attempt_count >= self.retry_policy.max_attempts {
            return false;
        }
        if self.first_attempt_time.elapsed() > self.retry_policy.max_total_time {
            return false;
        }
        if let Some(last) = self.last_attempt_time {
            let required = self.retry_policy.wait_time(self.attempt_count + 1);
            if last.elapsed() < required {
                return false;
            }
        }
        true
    }

    /// Zero when an attempt is allowed immediately.
    pub fn time_until_next_attempt(&self) -> Duration {
        if !self.active || self.attempt_count >= self.retry_policy.max_attempts {
            // Effectively never
            return Duration::from_secs(u64::MAX);
        }
        let Some(last) = self.last_attempt_time else {
            return Duration::ZERO;
        };
        let required = self.retry_policy.wait_time(self.attempt_count + 1);
        required.saturating_sub(last.elapsed())
    }

    pub fn classification(&self) -> &ErrorClassification {
        &self.classification
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn history(&self) -> &[RecoveryResult] {
        &self.history
    }

    pub fn total_recovery_time(&self) -> Duration {
        self.total_recovery_time
    }

    pub fn total_elapsed(&self) -> Duration {
        self.first_attempt_time.elapsed()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn success_rate(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let successes = self.history.iter().filter(|r| r.successful).count();
        successes as f64 / self.history.len() as f64
    }

    pub fn last_result(&self) -> Option<&RecoveryResult> {
        self.history.last()
    }

    fn budget_exhausted_reason(&self) -> &'static str {
        if !self.active {
            "recovery already concluded for this failure"
        } else if self.attempt_count >= self.retry_policy.max_attempts {
            "maximum recovery attempts exceeded"
        } else if self.first_attempt_time.elapsed() > self.retry_policy.max_total_time {
            "recovery time budget exceeded"
        } else {
            "required inter-attempt wait has not elapsed"
        }
    }
}

// ============================================================================
// Strategies
// ============================================================================

/// A pluggable recovery behavior. Implementations are registered per error
/// type; the manager falls back to recoverability-based defaults.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, _classification: &ErrorClassification) -> bool {
        true
    }

    /// Attempt to recover. `attempt` is a snapshot of the tracking state
    /// taken after this attempt was recorded. Errors returned here are
    /// downgraded to failed results by the manager.
    async fn recover(
        &self,
        classification: &ErrorClassification,
        attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult>;
}

/// Probe used by [`NetworkRecoveryStrategy`] to verify connectivity before
/// declaring a network failure recovered.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Hook invoked by memory recovery and the memory optimizer to release
/// application-held memory (caches, pools, buffers).
pub trait ReclaimHook: Send + Sync {
    fn name(&self) -> &str;
    fn reclaim(&self);
}

/// Longest a strategy will sleep inside one recovery attempt; longer waits
/// are carried by the attempt's inter-attempt gate instead.
const SETTLE_CAP: Duration = Duration::from_secs(5);

fn settle_delay(policy: &RetryPolicy, attempt_count: u32) -> Duration {
    policy.wait_time(attempt_count).min(SETTLE_CAP)
}

/// Default strategy for transient failures: let the backoff window pass,
/// then clear the operation for retry.
pub struct SimpleRetryStrategy {
    policy: RetryPolicy,
}

impl SimpleRetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl RecoveryStrategy for SimpleRetryStrategy {
    fn name(&self) -> &str {
        "simple-retry"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        let delay = settle_delay(&self.policy, attempt.attempt_count());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(RecoveryResult::success(
            "backoff complete; operation cleared for retry",
        ))
    }
}

/// Default strategy for failures of unknown recoverability: backs off a
/// full step further than the simple strategy before clearing the retry.
pub struct CautiousRetryStrategy {
    policy: RetryPolicy,
}

impl CautiousRetryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl RecoveryStrategy for CautiousRetryStrategy {
    fn name(&self) -> &str {
        "cautious-retry"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        let delay = settle_delay(&self.policy, attempt.attempt_count() + 1);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(RecoveryResult::success(
            "extended backoff complete; operation cleared for cautious retry",
        ))
    }
}

/// Default strategy for permanent failures: refuses to do anything.
pub struct NoRecoveryStrategy;

#[async_trait]
impl RecoveryStrategy for NoRecoveryStrategy {
    fn name(&self) -> &str {
        "no-recovery"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        _attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        Ok(RecoveryResult::skipped(
            "permanent failures are not recovered",
        ))
    }
}

/// Network failures: back off, then verify connectivity when a probe is
/// registered.
pub struct NetworkRecoveryStrategy {
    policy: RetryPolicy,
    probe: Option<Arc<dyn ConnectivityProbe>>,
}

impl NetworkRecoveryStrategy {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

#[async_trait]
impl RecoveryStrategy for NetworkRecoveryStrategy {
    fn name(&self) -> &str {
        "network-recovery"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        let delay = settle_delay(&self.policy, attempt.attempt_count());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match &self.probe {
            Some(probe) => {
                if probe.is_reachable().await {
                    Ok(RecoveryResult::success("connectivity restored"))
                } else {
                    Ok(RecoveryResult::failed("network still unreachable"))
                }
            }
            None => Ok(RecoveryResult::success(
                "backoff complete; connection may be retried",
            )),
        }
    }
}

/// Timeout failures: escalate the suggested timeout for the retried
/// operation, doubling up to a ceiling.
pub struct TimeoutRecoveryStrategy {
    base_timeout: Duration,
    max_timeout: Duration,
    current_ms: AtomicU64,
}

impl TimeoutRecoveryStrategy {
    pub fn new(base_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            base_timeout,
            max_timeout,
            current_ms: AtomicU64::new(base_timeout.as_millis() as u64),
        }
    }

    /// Timeout the caller should apply to the retried operation.
    pub fn suggested_timeout(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.current_ms
            .store(self.base_timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Default for TimeoutRecoveryStrategy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(120))
    }
}

#[async_trait]
impl RecoveryStrategy for TimeoutRecoveryStrategy {
    fn name(&self) -> &str {
        "timeout-escalation"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        _attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        let max = self.max_timeout.as_millis() as u64;
        let mut current = self.current_ms.load(Ordering::Relaxed);
        loop {
            let next = (current * 2).min(max);
            match self.current_ms.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Ok(RecoveryResult::success(format!(
                        "timeout raised to {}ms for retry",
                        next
                    )));
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// I/O failures: verify the file system has headroom before clearing the
/// operation for retry.
pub struct IoRecoveryStrategy {
    path: std::path::PathBuf,
    min_free_bytes: u64,
}

impl IoRecoveryStrategy {
    pub fn new(path: impl Into<std::path::PathBuf>, min_free_bytes: u64) -> Self {
        Self {
            path: path.into(),
            min_free_bytes,
        }
    }
}

impl Default for IoRecoveryStrategy {
    fn default() -> Self {
        Self::new("/", 64 * 1024 * 1024)
    }
}

#[async_trait]
impl RecoveryStrategy for IoRecoveryStrategy {
    fn name(&self) -> &str {
        "io-recovery"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        _attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        use sysinfo::Disks;

        let disks = Disks::new_with_refreshed_list();
        let mut best_match: Option<(usize, u64)> = None;
        for disk in disks.list() {
            let mount = disk.mount_point();
            if self.path.starts_with(mount) {
                let depth = mount.components().count();
                if best_match.map_or(true, |(d, _)| depth >= d) {
                    best_match = Some((depth, disk.available_space()));
                }
            }
        }

        match best_match {
            Some((_, available)) if available < self.min_free_bytes => {
                Ok(RecoveryResult::failed(format!(
                    "only {} bytes free at {}, below the {} byte floor",
                    available,
                    self.path.display(),
                    self.min_free_bytes
                )))
            }
            Some(_) => Ok(RecoveryResult::success(
                "file system has headroom; operation cleared for retry",
            )),
            None => Ok(RecoveryResult::success(format!(
                "no mount found for {}; clearing retry without inspection",
                self.path.display()
            ))),
        }
    }
}

/// Memory failures: run registered reclaim hooks, then re-sample pressure.
pub struct MemoryRecoveryStrategy {
    hooks: Vec<Arc<dyn ReclaimHook>>,
}

impl MemoryRecoveryStrategy {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ReclaimHook>) -> Self {
        self.hooks.push(hook);
        self
    }
}

impl Default for MemoryRecoveryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecoveryStrategy for MemoryRecoveryStrategy {
    fn name(&self) -> &str {
        "memory-reclaim"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        _attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        use sysinfo::System;

        for hook in &self.hooks {
            debug!(hook = hook.name(), "running reclaim hook");
            hook.reclaim();
        }

        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        let used = system.used_memory();
        if total > 0 && used as f64 / total as f64 > 0.99 {
            return Ok(RecoveryResult::failed(format!(
                "memory still exhausted after {} reclaim hooks",
                self.hooks.len()
            )));
        }

        Ok(RecoveryResult::success(format!(
            "ran {} reclaim hooks; memory pressure acceptable",
            self.hooks.len()
        )))
    }
}

/// External dependency failures: consult the dependency's own circuit
/// breaker before clearing a retry against it.
pub struct DependencyRecoveryStrategy {
    breaker: Arc<CircuitBreaker>,
}

impl DependencyRecoveryStrategy {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl RecoveryStrategy for DependencyRecoveryStrategy {
    fn name(&self) -> &str {
        "dependency-recovery"
    }

    async fn recover(
        &self,
        _classification: &ErrorClassification,
        _attempt: &RecoveryAttempt,
    ) -> Result<RecoveryResult> {
        use crate::breaker::CircuitState;

        if self.breaker.state() == CircuitState::Open && !self.breaker.should_attempt_reset() {
            return Ok(RecoveryResult::failed(
                "dependency circuit is open; not clearing retry",
            ));
        }
        Ok(RecoveryResult::success(
            "dependency circuit permits traffic; operation cleared for retry",
        ))
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Recovery manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Ceiling on concurrently tracked failure fingerprints
    pub max_concurrent_recoveries: usize,
    /// Join timeout for a single strategy invocation
    pub strategy_timeout: Duration,
    /// Policy seeded into newly created attempts
    pub default_retry_policy: RetryPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_secs(30),
            default_retry_policy: RetryPolicy::default_policy(),
        }
    }
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub skipped_attempts: u64,
    pub active_recoveries: usize,
}

/// Orchestrates recovery: fingerprint tracking, strategy selection, budget
/// enforcement, and eviction of resolved failures.
pub struct RecoveryManager {
    strategies: DashMap<ErrorType, Arc<dyn RecoveryStrategy>>,
    attempts: DashMap<String, RecoveryAttempt>,
    config: RecoveryConfig,
    default_simple: Arc<SimpleRetryStrategy>,
    default_cautious: Arc<CautiousRetryStrategy>,
    default_noop: Arc<NoRecoveryStrategy>,
    total_attempts: AtomicU64,
    successful_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    skipped_attempts: AtomicU64,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        let policy = config.default_retry_policy.clone();
        let manager = Self {
            strategies: DashMap::new(),
            attempts: DashMap::new(),
            default_simple: Arc::new(SimpleRetryStrategy::new(policy.clone())),
            default_cautious: Arc::new(CautiousRetryStrategy::new(policy.clone())),
            default_noop: Arc::new(NoRecoveryStrategy),
            config,
            total_attempts: AtomicU64::new(0),
            successful_attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            skipped_attempts: AtomicU64::new(0),
        };
        manager.register_default_strategies(policy);
        manager
    }

    fn register_default_strategies(&self, policy: RetryPolicy) {
        self.register_strategy(
            ErrorType::Network,
            Arc::new(NetworkRecoveryStrategy::new(policy.clone())),
        );
        self.register_strategy(ErrorType::Timeout, Arc::new(TimeoutRecoveryStrategy::default()));
        self.register_strategy(ErrorType::Io, Arc::new(IoRecoveryStrategy::default()));
        self.register_strategy(ErrorType::Memory, Arc::new(MemoryRecoveryStrategy::default()));
        self.register_strategy(
            ErrorType::ExternalDependency,
            Arc::new(DependencyRecoveryStrategy::new(Arc::new(
                CircuitBreaker::default(),
            ))),
        );
    }

    /// Replace or add the strategy for an error type. Hot-registration is
    /// safe while recoveries are in flight.
    pub fn register_strategy(&self, error_type: ErrorType, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.insert(error_type, strategy);
    }

    /// Attempt recovery for a classified failure.
    ///
    /// Refuses (with a skipped result) when the failure is permanent or the
    /// tracking ceiling is reached; fails without invoking a strategy when
    /// the fingerprint's budget or inter-attempt wait forbids it. A strategy
    /// error or timeout becomes a failed result.
    pub async fn attempt_recovery(&self, classification: &ErrorClassification) -> RecoveryResult {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);

        if classification.recoverability == Recoverability::Permanent {
            self.skipped_attempts.fetch_add(1, Ordering::Relaxed);
            return RecoveryResult::skipped("failure is permanent");
        }

        let fingerprint = classification.fingerprint();

        if !self.attempts.contains_key(&fingerprint)
            && self.attempts.len() >= self.config.max_concurrent_recoveries
        {
            warn!(
                active = self.attempts.len(),
                "concurrent recovery ceiling reached"
            );
            self.skipped_attempts.fetch_add(1, Ordering::Relaxed);
            return RecoveryResult::skipped("concurrent recovery limit reached");
        }

        // Bookkeeping happens inside a short-lived map guard; the guard is
        // dropped before the strategy runs.
        let snapshot = {
            let mut entry = self
                .attempts
                .entry(fingerprint.clone())
                .or_insert_with(|| {
                    RecoveryAttempt::new(
                        classification.clone(),
                        self.config.default_retry_policy.clone(),
                    )
                });

            if !entry.can_attempt_recovery() {
                let reason = entry.budget_exhausted_reason();
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                let mut result = RecoveryResult::failed(reason);
                result.attempt_count = entry.attempt_count();
                return result;
            }

            entry.record_attempt();
            entry.clone()
        };

        let strategy = self.select_strategy(classification);
        debug!(
            fingerprint = %fingerprint,
            strategy = strategy.name(),
            attempt = snapshot.attempt_count(),
            "attempting recovery"
        );

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.strategy_timeout, strategy.recover(classification, &snapshot))
                .await;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(strategy = strategy.name(), error = %e, "recovery strategy failed");
                RecoveryResult::failed_with("recovery strategy failed", e)
            }
            Err(_) => {
                warn!(
                    strategy = strategy.name(),
                    timeout_ms = self.config.strategy_timeout.as_millis() as u64,
                    "recovery strategy timed out"
                );
                RecoveryResult::failed("recovery strategy timed out")
            }
        };
        result.duration = Some(started.elapsed());
        result.attempt_count = snapshot.attempt_count();
        if result.strategy_used.is_none() {
            result.strategy_used = Some(strategy.name().to_string());
        }

        if let Some(mut entry) = self.attempts.get_mut(&fingerprint) {
            entry.record_result(result.clone());
        }
        if result.successful {
            // Resolved failures leave the tracking map to bound its size
            self.attempts.remove(&fingerprint);
            self.successful_attempts.fetch_add(1, Ordering::Relaxed);
            info!(fingerprint = %fingerprint, "recovery succeeded");
        } else {
            self.failed_attempts.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    fn select_strategy(&self, classification: &ErrorClassification) -> Arc<dyn RecoveryStrategy> {
        if let Some(strategy) = self.strategies.get(&classification.error_type) {
            if strategy.can_handle(classification) {
                return Arc::clone(strategy.value());
            }
        }

        match classification.recoverability {
            Recoverability::Transient => Arc::clone(&self.default_simple) as Arc<dyn RecoveryStrategy>,
            Recoverability::Unknown => Arc::clone(&self.default_cautious) as Arc<dyn RecoveryStrategy>,
            Recoverability::Permanent => Arc::clone(&self.default_noop) as Arc<dyn RecoveryStrategy>,
        }
    }

    /// Number of fingerprints currently tracked.
    pub fn active_recoveries(&self) -> usize {
        self.attempts.len()
    }

    /// Snapshot of the tracking state for one fingerprint, if present.
    pub fn attempt_for(&self, fingerprint: &str) -> Option<RecoveryAttempt> {
        self.attempts.get(fingerprint).map(|a| a.clone())
    }

    pub fn statistics(&self) -> RecoveryStatistics {
        RecoveryStatistics {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_attempts: self.successful_attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            skipped_attempts: self.skipped_attempts.load(Ordering::Relaxed),
            active_recoveries: self.attempts.len(),
        }
    }
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorSeverity;

    fn classification(
        error_type: ErrorType,
        recoverability: Recoverability,
        message: &str,
    ) -> ErrorClassification {
        ErrorClassification {
            error_type,
            severity: ErrorSeverity::Medium,
            recoverability,
            requires_incident_report: false,
            suppressed: false,
            failure_class: "test".to_string(),
            message: message.to_string(),
            previous_retries: 0,
            error: Arc::new(anyhow::anyhow!("{}", message)),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
            max_total_time: Duration::from_secs(10),
            ..RetryPolicy::default_policy()
        }
    }

    fn fast_manager(max_attempts: u32) -> RecoveryManager {
        RecoveryManager::new(RecoveryConfig {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_secs(1),
            default_retry_policy: fast_policy(max_attempts),
        })
    }

    struct AlwaysFails;

    #[async_trait]
    impl RecoveryStrategy for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn recover(
            &self,
            _classification: &ErrorClassification,
            _attempt: &RecoveryAttempt,
        ) -> Result<RecoveryResult> {
            Ok(RecoveryResult::failed("still broken"))
        }
    }

    struct AlwaysErrors;

    #[async_trait]
    impl RecoveryStrategy for AlwaysErrors {
        fn name(&self) -> &str {
            "always-errors"
        }

        async fn recover(
            &self,
            _classification: &ErrorClassification,
            _attempt: &RecoveryAttempt,
        ) -> Result<RecoveryResult> {
            Err(crate::errors::EngineError::Internal("strategy blew up".to_string()))
        }
    }

    struct NeverReturns;

    #[async_trait]
    impl RecoveryStrategy for NeverReturns {
        fn name(&self) -> &str {
            "never-returns"
        }

        async fn recover(
            &self,
            _classification: &ErrorClassification,
            _attempt: &RecoveryAttempt,
        ) -> Result<RecoveryResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(RecoveryResult::success("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_permanent_failures_are_skipped() {
        let manager = fast_manager(3);
        let classification =
            classification(ErrorType::Io, Recoverability::Permanent, "corrupt file");

        let result = manager.attempt_recovery(&classification).await;
        assert!(result.skipped);
        assert!(!result.successful);
        assert_eq!(manager.active_recoveries(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_ceiling_skips_new_fingerprints() {
        let manager = RecoveryManager::new(RecoveryConfig {
            max_concurrent_recoveries: 2,
            strategy_timeout: Duration::from_secs(1),
            default_retry_policy: fast_policy(3),
        });
        manager.register_strategy(ErrorType::Unknown, Arc::new(AlwaysFails));

        // Two distinct failing fingerprints fill the map
        for msg in ["first", "second"] {
            let c = classification(ErrorType::Unknown, Recoverability::Transient, msg);
            let result = manager.attempt_recovery(&c).await;
            assert!(!result.successful);
        }
        assert_eq!(manager.active_recoveries(), 2);

        let third = classification(ErrorType::Unknown, Recoverability::Transient, "third");
        let result = manager.attempt_recovery(&third).await;
        assert!(result.skipped);
        assert!(result.message.contains("concurrent recovery limit"));
    }

    #[tokio::test]
    async fn test_attempt_count_never_exceeds_policy_max() {
        let manager = fast_manager(2);
        manager.register_strategy(ErrorType::Unknown, Arc::new(AlwaysFails));
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "stuck");

        for _ in 0..5 {
            let _ = manager.attempt_recovery(&c).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let attempt = manager.attempt_for(&c.fingerprint()).unwrap();
        assert!(attempt.attempt_count() <= 2);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_failed_not_skipped() {
        let manager = fast_manager(1);
        manager.register_strategy(ErrorType::Unknown, Arc::new(AlwaysFails));
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "stuck");

        let first = manager.attempt_recovery(&c).await;
        assert!(!first.successful);
        assert!(!first.skipped);

        let second = manager.attempt_recovery(&c).await;
        assert!(!second.successful);
        assert!(!second.skipped);
        assert!(second.message.contains("maximum recovery attempts"));
    }

    #[tokio::test]
    async fn test_successful_recovery_evicts_fingerprint() {
        let manager = fast_manager(3);
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "blip");

        let result = manager.attempt_recovery(&c).await;
        assert!(result.successful);
        assert_eq!(manager.active_recoveries(), 0);
        assert_eq!(manager.statistics().successful_attempts, 1);
    }

    #[tokio::test]
    async fn test_strategy_error_becomes_failed_result() {
        let manager = fast_manager(3);
        manager.register_strategy(ErrorType::Unknown, Arc::new(AlwaysErrors));
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "boom");

        let result = manager.attempt_recovery(&c).await;
        assert!(!result.successful);
        assert!(result.error.as_deref().unwrap_or("").contains("strategy blew up"));
    }

    #[tokio::test]
    async fn test_strategy_timeout_becomes_failed_result() {
        let manager = RecoveryManager::new(RecoveryConfig {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_millis(20),
            default_retry_policy: fast_policy(3),
        });
        manager.register_strategy(ErrorType::Unknown, Arc::new(NeverReturns));
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "hang");

        let result = manager.attempt_recovery(&c).await;
        assert!(!result.successful);
        assert!(result.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_registered_strategy_selected_by_error_type() {
        let manager = fast_manager(3);
        let c = classification(ErrorType::Timeout, Recoverability::Transient, "slow call");

        let result = manager.attempt_recovery(&c).await;
        assert!(result.successful);
        assert_eq!(result.strategy_used.as_deref(), Some("timeout-escalation"));
    }

    #[tokio::test]
    async fn test_unknown_recoverability_uses_cautious_default() {
        let manager = fast_manager(3);
        let c = classification(ErrorType::Unknown, Recoverability::Unknown, "odd");

        let result = manager.attempt_recovery(&c).await;
        assert!(result.successful);
        assert_eq!(result.strategy_used.as_deref(), Some("cautious-retry"));
    }

    #[tokio::test]
    async fn test_wait_gate_blocks_rapid_reattempts() {
        let manager = RecoveryManager::new(RecoveryConfig {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_secs(1),
            default_retry_policy: RetryPolicy {
                max_attempts: 5,
                initial_wait: Duration::from_millis(100),
                max_wait: Duration::from_millis(100),
                max_total_time: Duration::from_secs(10),
                backoff: crate::retry::BackoffStrategy::Fixed,
                jitter_enabled: false,
                jitter_factor: 0.0,
            },
        });
        manager.register_strategy(ErrorType::Unknown, Arc::new(AlwaysFails));
        let c = classification(ErrorType::Unknown, Recoverability::Transient, "flappy");

        let first = manager.attempt_recovery(&c).await;
        assert!(first.strategy_used.is_some());

        // Immediately again: the 100ms inter-attempt wait has not elapsed
        let second = manager.attempt_recovery(&c).await;
        assert!(second.message.contains("wait has not elapsed"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        let third = manager.attempt_recovery(&c).await;
        assert!(third.strategy_used.is_some());
    }

    #[tokio::test]
    async fn test_statistics_reflect_outcomes() {
        let manager = fast_manager(3);
        let ok = classification(ErrorType::Unknown, Recoverability::Transient, "ok");
        let never = classification(ErrorType::Io, Recoverability::Permanent, "perm");

        let _ = manager.attempt_recovery(&ok).await;
        let _ = manager.attempt_recovery(&never).await;

        let stats = manager.statistics();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(stats.skipped_attempts, 1);
        assert_eq!(stats.active_recoveries, 0);
    }

    #[test]
    fn test_attempt_history_preserves_order() {
        let mut attempt = RecoveryAttempt::new(
            classification(ErrorType::Unknown, Recoverability::Transient, "x"),
            fast_policy(5),
        );
        attempt.record_result(RecoveryResult::failed("first"));
        attempt.record_result(RecoveryResult::failed("second"));
        attempt.record_result(RecoveryResult::success("third"));

        let messages: Vec<_> = attempt.history().iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert!(!attempt.is_active());
        assert!((attempt.success_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_attempt_deactivation_blocks_attempts() {
        let mut attempt = RecoveryAttempt::new(
            classification(ErrorType::Unknown, Recoverability::Transient, "x"),
            fast_policy(5),
        );
        assert!(attempt.can_attempt_recovery());
        attempt.deactivate();
        assert!(!attempt.can_attempt_recovery());
        assert_eq!(
            attempt.time_until_next_attempt(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_timeout_strategy_escalates_suggestion() {
        let strategy =
            TimeoutRecoveryStrategy::new(Duration::from_millis(100), Duration::from_millis(300));
        let c = classification(ErrorType::Timeout, Recoverability::Transient, "slow");
        let attempt = RecoveryAttempt::new(c.clone(), fast_policy(5));

        let _ = strategy.recover(&c, &attempt).await.unwrap();
        assert_eq!(strategy.suggested_timeout(), Duration::from_millis(200));
        let _ = strategy.recover(&c, &attempt).await.unwrap();
        assert_eq!(strategy.suggested_timeout(), Duration::from_millis(300));
        // Capped at the ceiling
        let _ = strategy.recover(&c, &attempt).await.unwrap();
        assert_eq!(strategy.suggested_timeout(), Duration::from_millis(300));

        strategy.reset();
        assert_eq!(strategy.suggested_timeout(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_dependency_strategy_fails_while_circuit_open() {
        let breaker = Arc::new(CircuitBreaker::new(crate::breaker::CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(60),
            ..Default::default()
        }));
        breaker.record_result(false);

        let strategy = DependencyRecoveryStrategy::new(Arc::clone(&breaker));
        let c = classification(ErrorType::ExternalDependency, Recoverability::Transient, "down");
        let attempt = RecoveryAttempt::new(c.clone(), fast_policy(5));

        let result = strategy.recover(&c, &attempt).await.unwrap();
        assert!(!result.successful);

        breaker.reset();
        let result = strategy.recover(&c, &attempt).await.unwrap();
        assert!(result.successful);
    }

    #[tokio::test]
    async fn test_memory_strategy_runs_hooks() {
        use std::sync::atomic::AtomicU32;

        struct CountingHook(AtomicU32);
        impl ReclaimHook for CountingHook {
            fn name(&self) -> &str {
                "counting"
            }
            fn reclaim(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hook = Arc::new(CountingHook(AtomicU32::new(0)));
        let strategy = MemoryRecoveryStrategy::new().with_hook(Arc::clone(&hook) as _);
        let c = classification(ErrorType::Memory, Recoverability::Transient, "oom");
        let attempt = RecoveryAttempt::new(c.clone(), fast_policy(5));

        let _ = strategy.recover(&c, &attempt).await.unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_strategy_uses_probe_verdict() {
        struct DownProbe;
        #[async_trait]
        impl ConnectivityProbe for DownProbe {
            async fn is_reachable(&self) -> bool {
                false
            }
        }

        let strategy =
            NetworkRecoveryStrategy::new(fast_policy(5)).with_probe(Arc::new(DownProbe));
        let c = classification(ErrorType::Network, Recoverability::Transient, "refused");
        let attempt = RecoveryAttempt::new(c.clone(), fast_policy(5));

        let result = strategy.recover(&c, &attempt).await.unwrap();
        assert!(!result.successful);
        assert!(result.message.contains("unreachable"));
    }

    #[tokio::test]
    async fn test_io_strategy_clears_retry_with_zero_floor() {
        let strategy = IoRecoveryStrategy::new(std::env::temp_dir(), 0);
        let c = classification(ErrorType::Io, Recoverability::Transient, "write failed");
        let attempt = RecoveryAttempt::new(c.clone(), fast_policy(5));

        let result = strategy.recover(&c, &attempt).await.unwrap();
        assert!(result.successful);
    }
}
