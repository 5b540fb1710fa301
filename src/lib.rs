//! Redoubt - Production Resilience Engine
//!
//! A last line of defense for long-running services: classify runtime
//! failures, attempt automatic recovery, contain cascades with circuit
//! breaking, and keep a continuous read on system health.
//!
//! - **Classification**: typed patterns + context rules decide severity,
//!   recoverability, and incident reporting for every failure
//! - **Recovery**: pluggable strategies under per-fingerprint retry budgets
//! - **Circuit breaking**: lock-free CLOSED/OPEN/HALF_OPEN containment
//! - **Health**: concurrent probes, bounded history, alert callbacks
//! - **Resources**: pressure-driven optimization with per-optimizer cooldowns
//! - **Degradation**: reduced-functionality fallbacks when health dips
//!
//! # Quick Start
//!
//! ```ignore
//! use redoubt::{EngineConfig, OperationContext, ResilienceEngine};
//!
//! let engine = ResilienceEngine::new(EngineConfig::default());
//! engine.start();
//!
//! let result = engine
//!     .handle_error(err, &OperationContext::new("reload").critical())
//!     .await;
//! if result.is_successful() {
//!     // contained: recovered, degraded, or suppressed
//! }
//! ```

pub mod breaker;
pub mod classify;
pub mod degrade;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod health;
pub mod incident;
pub mod recovery;
pub mod resources;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use classify::{
    ClassificationRule, ErrorClassification, ErrorClassifier, ErrorSeverity, ErrorType,
    OperationContext, Recoverability,
};
pub use degrade::{
    DegradationLevel, DegradationStrategy, GracefulDegradationManager, Operation, OperationResult,
};
pub use engine::{EngineConfig, EngineSummary, ResilienceEngine};
pub use errors::{EngineError, Result};
pub use handler::{ErrorHandlingOutcome, ErrorHandlingResult, ProductionErrorHandler};
pub use health::{
    HealthCheck, HealthCheckConfig, HealthCheckManager, HealthCheckResult, OverallHealth,
    SystemHealthStatus,
};
pub use incident::{IncidentReport, IncidentReporter, LogIncidentReporter};
pub use recovery::{
    RecoveryAttempt, RecoveryConfig, RecoveryManager, RecoveryResult, RecoveryStrategy,
};
pub use resources::{ResourceManager, ResourceManagerConfig, ResourceSnapshot};
pub use retry::{BackoffStrategy, RetryPolicy};
