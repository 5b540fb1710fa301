//! End-to-end flows through the resilience engine

use async_trait::async_trait;
use redoubt::breaker::CircuitBreakerError;
use redoubt::classify::OperationContext;
use redoubt::degrade::{DegradationLevel, SkipStrategy};
use redoubt::engine::{EngineConfig, ResilienceEngine};
use redoubt::handler::ErrorHandlingOutcome;
use redoubt::health::{HealthCheck, HealthCheckConfig, HealthCheckResult};
use redoubt::recovery::RecoveryConfig;
use redoubt::retry::RetryPolicy;
use redoubt::{breaker::CircuitBreakerConfig, resources::ResourceManagerConfig, Operation};
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> EngineConfig {
    EngineConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            half_open_max_calls: 3,
        },
        recovery: RecoveryConfig {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_secs(1),
            default_retry_policy: RetryPolicy {
                max_attempts: 3,
                initial_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(5),
                max_total_time: Duration::from_secs(10),
                ..RetryPolicy::default_policy()
            },
        },
        health: HealthCheckConfig {
            check_interval: Duration::from_millis(10),
            check_timeout: Duration::from_millis(50),
            max_history: 10,
        },
        resources: ResourceManagerConfig {
            check_interval: Duration::from_millis(10),
            review_interval: Duration::from_millis(20),
            ..ResourceManagerConfig::default()
        },
    }
}

fn permanent_error(label: &str) -> anyhow::Error {
    anyhow::Error::from(io::Error::new(
        io::ErrorKind::PermissionDenied,
        label.to_string(),
    ))
}

struct DownCheck {
    critical: bool,
}

#[async_trait]
impl HealthCheck for DownCheck {
    fn name(&self) -> &str {
        "core"
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> redoubt::Result<HealthCheckResult> {
        Ok(HealthCheckResult::failed("core", "down"))
    }
}

struct ReloadOp;

#[async_trait]
impl Operation for ReloadOp {
    fn operation_type(&self) -> &str {
        "reload"
    }

    async fn execute(&self) -> redoubt::Result<Value> {
        Ok(json!({"reloaded": true}))
    }
}

struct MetricsOp;

#[async_trait]
impl Operation for MetricsOp {
    fn operation_type(&self) -> &str {
        "metrics-flush"
    }

    async fn execute(&self) -> redoubt::Result<Value> {
        Ok(json!({"flushed": true}))
    }
}

#[tokio::test]
async fn repeated_unrecoverable_failures_open_the_breaker() {
    let engine = ResilienceEngine::new(fast_config());
    let context = OperationContext::new("flush").with_retry_count(4);

    for label in ["a", "b", "c"] {
        engine.handle_error(permanent_error(label), &context).await;
    }

    // Breaker is open: a protected call is rejected without running
    let result: Result<i32, CircuitBreakerError<String>> =
        engine.breaker().execute(|| async { Ok(1) }).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert!(engine.handler().is_system_degraded());
}

#[tokio::test]
async fn breaker_recovers_through_trial_after_cooldown() {
    let engine = ResilienceEngine::new(fast_config());
    let context = OperationContext::new("flush").with_retry_count(4);

    for label in ["a", "b", "c"] {
        engine.handle_error(permanent_error(label), &context).await;
    }

    tokio::time::sleep(Duration::from_millis(60)).await;

    // Two successful trials close the circuit again
    for _ in 0..2 {
        let result: Result<i32, CircuitBreakerError<String>> =
            engine.breaker().execute(|| async { Ok(1) }).await;
        assert!(result.is_ok());
    }
    assert!(!engine.handler().is_system_degraded());
    assert_eq!(engine.breaker().failure_count(), 0);
}

#[tokio::test]
async fn transient_failures_recover_and_leave_no_tracking_state() {
    let engine = ResilienceEngine::new(fast_config());

    let error = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
    let result = engine
        .handle_error(error, &OperationContext::new("stream").with_user_impact())
        .await;

    assert_eq!(result.outcome, ErrorHandlingOutcome::Recovered);
    assert_eq!(engine.recovery().active_recoveries(), 0);
}

#[tokio::test]
async fn critical_health_failure_halts_unprotected_operations() {
    let engine = ResilienceEngine::new(fast_config());
    engine
        .health()
        .register_check(Arc::new(DownCheck { critical: true }));
    engine.health().check_now().await;

    assert_eq!(
        engine.degradation().current_level(),
        DegradationLevel::Halted
    );

    let result = engine.execute_with_degradation(&ReloadOp).await;
    assert!(!result.success);
    assert!(result.degraded);
    assert_eq!(result.degradation_level, Some(DegradationLevel::Halted));
}

#[tokio::test]
async fn registered_degradation_strategy_keeps_optional_work_flowing() {
    let engine = ResilienceEngine::new(fast_config());
    engine
        .health()
        .register_check(Arc::new(DownCheck { critical: false }));
    engine.health().check_now().await;

    engine
        .degradation()
        .register_strategy("metrics-flush", Arc::new(SkipStrategy));

    let skipped = engine.execute_with_degradation(&MetricsOp).await;
    assert!(skipped.success);
    assert!(skipped.degraded);

    let refused = engine.execute_with_degradation(&ReloadOp).await;
    assert!(!refused.success);
}

#[tokio::test]
async fn healthy_system_executes_operations_directly() {
    let engine = ResilienceEngine::new(fast_config());
    // No health verdict yet: assumed fully operational
    let result = engine.execute_with_degradation(&ReloadOp).await;
    assert!(result.success);
    assert!(!result.degraded);
    assert_eq!(result.output, Some(json!({"reloaded": true})));
}

#[tokio::test]
async fn scheduled_loops_populate_summary() {
    let engine = ResilienceEngine::new(fast_config());
    engine.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.shutdown(Duration::from_millis(200)).await;

    let summary = engine.summary();
    assert!(summary.health.total_cycles >= 1);
    assert!(summary.resources.history_size >= 1);
    assert!(!summary.health.active);
    assert!(!summary.resources.active);
}

#[tokio::test]
async fn suppressed_noise_does_not_feed_the_breaker() {
    let engine = ResilienceEngine::new(fast_config());

    for _ in 0..5 {
        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        let result = engine
            .handle_error(error, &OperationContext::new("metrics-poll"))
            .await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::Suppressed);
    }

    assert_eq!(engine.breaker().failure_count(), 0);
    assert_eq!(engine.summary().errors.suppressed_errors, 5);
}
