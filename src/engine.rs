//! Engine composition root
//!
//! Constructs one instance of each manager and wires them together. There
//! are no process-wide singletons: tests build a fresh engine per case, and
//! hosts embed as many engines as they need.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatistics};
use crate::classify::{ErrorClassifier, OperationContext};
use crate::degrade::{DegradationStatistics, GracefulDegradationManager, Operation, OperationResult};
use crate::handler::{ErrorHandlingResult, ErrorStatistics, ProductionErrorHandler};
use crate::health::{HealthCheckConfig, HealthCheckManager, HealthCheckStatistics};
use crate::incident::{IncidentReporter, LogIncidentReporter};
use crate::recovery::{RecoveryConfig, RecoveryManager, RecoveryStatistics};
use crate::resources::{ResourceManager, ResourceManagerConfig, ResourceStatistics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub breaker: CircuitBreakerConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthCheckConfig,
    pub resources: ResourceManagerConfig,
}

/// Aggregated statistics across every manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSummary {
    pub errors: ErrorStatistics,
    pub recovery: RecoveryStatistics,
    pub breaker: CircuitBreakerStatistics,
    pub health: HealthCheckStatistics,
    pub resources: ResourceStatistics,
    pub degradation: DegradationStatistics,
}

/// The resilience engine: classification, recovery, circuit breaking,
/// health assessment, resource optimization, and graceful degradation
/// behind one composition root.
pub struct ResilienceEngine {
    breaker: Arc<CircuitBreaker>,
    recovery: Arc<RecoveryManager>,
    health: Arc<HealthCheckManager>,
    resources: Arc<ResourceManager>,
    degradation: Arc<GracefulDegradationManager>,
    handler: ProductionErrorHandler,
}

impl ResilienceEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_reporter(config, Arc::new(LogIncidentReporter::new()))
    }

    /// Build the engine with a host-supplied incident reporter.
    pub fn with_reporter(config: EngineConfig, reporter: Arc<dyn IncidentReporter>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker));
        let recovery = Arc::new(RecoveryManager::new(config.recovery));
        let health = Arc::new(HealthCheckManager::new(config.health));
        let resources = Arc::new(ResourceManager::new(config.resources));
        let degradation = Arc::new(GracefulDegradationManager::new(Arc::clone(&health)));
        let handler = ProductionErrorHandler::new(
            ErrorClassifier::new(),
            Arc::clone(&recovery),
            reporter,
            Arc::clone(&breaker),
        );

        Self {
            breaker,
            recovery,
            health,
            resources,
            degradation,
            handler,
        }
    }

    /// Start the scheduled health and resource loops.
    pub fn start(&self) {
        self.health.start();
        self.resources.start();
        info!("resilience engine started");
    }

    /// Stop scheduling, draining in-flight ticks within the grace period.
    pub async fn shutdown(&self, grace: Duration) {
        self.health.stop(grace).await;
        self.resources.stop(grace).await;
        info!("resilience engine stopped");
    }

    /// Handle one failure through the full pipeline.
    pub async fn handle_error(
        &self,
        error: anyhow::Error,
        context: &OperationContext,
    ) -> ErrorHandlingResult {
        self.handler.handle_error(error, context).await
    }

    /// Execute an operation with degradation awareness.
    pub async fn execute_with_degradation(&self, operation: &dyn Operation) -> OperationResult {
        self.degradation.execute_with_degradation(operation).await
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthCheckManager> {
        &self.health
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn degradation(&self) -> &Arc<GracefulDegradationManager> {
        &self.degradation
    }

    pub fn handler(&self) -> &ProductionErrorHandler {
        &self.handler
    }

    /// One statistics snapshot across every manager.
    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            errors: self.handler.statistics(),
            recovery: self.recovery.statistics(),
            breaker: self.breaker.statistics(),
            health: self.health.statistics(),
            resources: self.resources.statistics(),
            degradation: self.degradation.statistics(),
        }
    }
}

impl Default for ResilienceEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ErrorHandlingOutcome;
    use crate::retry::RetryPolicy;
    use std::io;

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

    #[tokio::test]
    async fn test_engine_handles_error_end_to_end() {
        let engine = ResilienceEngine::new(fast_config());
        let error = anyhow::Error::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));

        let result = engine
            .handle_error(error, &OperationContext::new("fetch").with_user_impact())
            .await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::Recovered);

        let summary = engine.summary();
        assert_eq!(summary.errors.total_errors, 1);
        assert_eq!(summary.recovery.successful_attempts, 1);
    }

    #[tokio::test]
    async fn test_engine_start_and_shutdown() {
        let engine = ResilienceEngine::new(fast_config());
        engine.start();
        assert!(engine.health().is_active());
        assert!(engine.resources().is_active());

        tokio::time::sleep(Duration::from_millis(40)).await;
        engine.shutdown(Duration::from_millis(100)).await;
        assert!(!engine.health().is_active());
        assert!(!engine.resources().is_active());

        // Loops actually ran
        assert!(engine.summary().health.total_cycles >= 1);
    }

    #[tokio::test]
    async fn test_fresh_engines_do_not_share_state() {
        let first = ResilienceEngine::new(fast_config());
        let second = ResilienceEngine::new(fast_config());

        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::ConnectionRefused, "x"));
        first
            .handle_error(error, &OperationContext::new("fetch").with_user_impact())
            .await;

        assert_eq!(first.summary().errors.total_errors, 1);
        assert_eq!(second.summary().errors.total_errors, 0);
    }

    #[test]
    fn test_engine_config_serializes() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.breaker.failure_threshold, 5);
    }
}
