//! Graceful degradation
//!
//! When system health is compromised, operations route through per-type
//! degradation strategies instead of executing normally: skip what is
//! optional, defer what can wait, fail fast on the rest.

use crate::errors::Result;
use crate::health::{HealthCheckManager, OverallHealth};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// How much functionality the system currently offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradationLevel {
    /// Everything runs normally
    Full,
    /// Optional work is shed
    Reduced,
    /// Only essential operations run
    Essential,
    /// Nothing but fail-fast responses
    Halted,
}

impl DegradationLevel {
    pub fn from_health(health: OverallHealth) -> Self {
        match health {
            OverallHealth::Healthy => Self::Full,
            OverallHealth::Warning | OverallHealth::Unknown => Self::Reduced,
            OverallHealth::Unhealthy => Self::Essential,
            OverallHealth::Critical => Self::Halted,
        }
    }
}

/// An operation the caller wants executed under degradation awareness.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Type tag used to look up a degradation strategy
    fn operation_type(&self) -> &str;

    async fn execute(&self) -> Result<Value>;
}

/// Result of an operation routed through the degradation manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub output: Option<Value>,
    pub message: String,
    /// True when a degradation strategy handled the operation
    pub degraded: bool,
    /// Present on degraded paths
    pub degradation_level: Option<DegradationLevel>,
}

impl OperationResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            message: "operation completed".to_string(),
            degraded: false,
            degradation_level: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            message: message.into(),
            degraded: false,
            degradation_level: None,
        }
    }

    pub fn degraded_success(
        output: Option<Value>,
        message: impl Into<String>,
        level: DegradationLevel,
    ) -> Self {
        Self {
            success: true,
            output,
            message: message.into(),
            degraded: true,
            degradation_level: Some(level),
        }
    }

    pub fn degraded_failure(message: impl Into<String>, level: DegradationLevel) -> Self {
        Self {
            success: false,
            output: None,
            message: message.into(),
            degraded: true,
            degradation_level: Some(level),
        }
    }
}

/// A reduced-functionality fallback for a class of operations.
#[async_trait]
pub trait DegradationStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, operation_type: &str) -> bool;

    async fn execute_degraded(
        &self,
        operation: &dyn Operation,
        level: DegradationLevel,
    ) -> OperationResult;
}

/// Skips the operation entirely; appropriate for optional work.
pub struct SkipStrategy;

#[async_trait]
impl DegradationStrategy for SkipStrategy {
    fn name(&self) -> &str {
        "skip"
    }

    fn can_handle(&self, _operation_type: &str) -> bool {
        true
    }

    async fn execute_degraded(
        &self,
        operation: &dyn Operation,
        level: DegradationLevel,
    ) -> OperationResult {
        debug!(
            operation = operation.operation_type(),
            "skipping operation in degraded mode"
        );
        OperationResult::degraded_success(
            None,
            format!("{} skipped while degraded", operation.operation_type()),
            level,
        )
    }
}

/// Queues the operation's type tag for later replay instead of running it.
pub struct DeferStrategy {
    queue: RwLock<VecDeque<String>>,
    max_queued: usize,
}

impl DeferStrategy {
    pub fn new(max_queued: usize) -> Self {
        Self {
            queue: RwLock::new(VecDeque::new()),
            max_queued,
        }
    }

    /// Take everything queued so far, oldest first.
    pub fn drain_deferred(&self) -> Vec<String> {
        self.queue
            .write()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn queued(&self) -> usize {
        self.queue.read().map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for DeferStrategy {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl DegradationStrategy for DeferStrategy {
    fn name(&self) -> &str {
        "defer"
    }

    fn can_handle(&self, _operation_type: &str) -> bool {
        true
    }

    async fn execute_degraded(
        &self,
        operation: &dyn Operation,
        level: DegradationLevel,
    ) -> OperationResult {
        let accepted = self
            .queue
            .write()
            .map(|mut q| {
                if q.len() < self.max_queued {
                    q.push_back(operation.operation_type().to_string());
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);

        if accepted {
            OperationResult::degraded_success(
                None,
                format!("{} deferred for replay", operation.operation_type()),
                level,
            )
        } else {
            OperationResult::degraded_failure("defer queue full", level)
        }
    }
}

/// Default: refuse the operation, surfacing the degradation level.
pub struct FailFastStrategy;

#[async_trait]
impl DegradationStrategy for FailFastStrategy {
    fn name(&self) -> &str {
        "fail-fast"
    }

    fn can_handle(&self, _operation_type: &str) -> bool {
        true
    }

    async fn execute_degraded(
        &self,
        operation: &dyn Operation,
        level: DegradationLevel,
    ) -> OperationResult {
        OperationResult::degraded_failure(
            format!(
                "{} cannot run in the current system state",
                operation.operation_type()
            ),
            level,
        )
    }
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationStatistics {
    pub current_level: DegradationLevel,
    pub normal_operations: u64,
    pub degraded_operations: u64,
    pub degraded_failures: u64,
}

/// Routes operations directly or through degradation strategies based on
/// the health manager's current verdict.
pub struct GracefulDegradationManager {
    strategies: DashMap<String, Arc<dyn DegradationStrategy>>,
    default_strategy: Arc<dyn DegradationStrategy>,
    health: Arc<HealthCheckManager>,
    normal_operations: AtomicU64,
    degraded_operations: AtomicU64,
    degraded_failures: AtomicU64,
}

impl GracefulDegradationManager {
    pub fn new(health: Arc<HealthCheckManager>) -> Self {
        Self {
            strategies: DashMap::new(),
            default_strategy: Arc::new(FailFastStrategy),
            health,
            normal_operations: AtomicU64::new(0),
            degraded_operations: AtomicU64::new(0),
            degraded_failures: AtomicU64::new(0),
        }
    }

    pub fn with_default_strategy(mut self, strategy: Arc<dyn DegradationStrategy>) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Register the strategy used for a given operation type while degraded.
    pub fn register_strategy(
        &self,
        operation_type: impl Into<String>,
        strategy: Arc<dyn DegradationStrategy>,
    ) {
        self.strategies.insert(operation_type.into(), strategy);
    }

    /// Degradation level implied by the latest health verdict. With no
    /// verdict yet the system is assumed fully operational.
    pub fn current_level(&self) -> DegradationLevel {
        self.health
            .current_status()
            .map(|s| DegradationLevel::from_health(s.overall))
            .unwrap_or(DegradationLevel::Full)
    }

    pub fn is_degraded(&self) -> bool {
        self.current_level() != DegradationLevel::Full
    }

    /// Execute an operation, degrading it when the system is unhealthy.
    pub async fn execute_with_degradation(&self, operation: &dyn Operation) -> OperationResult {
        let level = self.current_level();

        if level == DegradationLevel::Full {
            self.normal_operations.fetch_add(1, Ordering::Relaxed);
            return match operation.execute().await {
                Ok(output) => OperationResult::success(output),
                Err(e) => OperationResult::failure(format!("operation failed: {}", e)),
            };
        }

        warn!(
            operation = operation.operation_type(),
            level = ?level,
            "executing in degraded mode"
        );
        self.degraded_operations.fetch_add(1, Ordering::Relaxed);

        let strategy = self
            .strategies
            .get(operation.operation_type())
            .filter(|s| s.can_handle(operation.operation_type()))
            .map(|s| Arc::clone(s.value()))
            .unwrap_or_else(|| Arc::clone(&self.default_strategy));

        let result = strategy.execute_degraded(operation, level).await;
        if !result.success {
            self.degraded_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn statistics(&self) -> DegradationStatistics {
        DegradationStatistics {
            current_level: self.current_level(),
            normal_operations: self.normal_operations.load(Ordering::Relaxed),
            degraded_operations: self.degraded_operations.load(Ordering::Relaxed),
            degraded_failures: self.degraded_failures.load(Ordering::Relaxed),
        }
    }
}
