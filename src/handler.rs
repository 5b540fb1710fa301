//! Top-level error handling façade
//!
//! Composes the classifier, recovery manager, incident reporter, and
//! circuit breaker into one `handle_error` call. The caller always gets a
//! value back: strategy failures become failed recovery results, incident
//! forwarding is best-effort, and a failure inside handling itself is
//! captured on the result rather than thrown.

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::classify::{ErrorClassification, ErrorClassifier, OperationContext};
use crate::incident::IncidentReporter;
use crate::recovery::{RecoveryManager, RecoveryResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What handling one failure amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorHandlingOutcome {
    /// Recovery succeeded
    Recovered,
    /// A degradation fallback handled the operation
    GracefullyDegraded,
    /// The circuit breaker is containing the failure
    CircuitBreakerTriggered,
    /// Recovery failed; an incident was filed for investigation
    IncidentReported,
    /// Recovery failed and nothing else applied
    Failed,
    /// Classified but recovery was not attempted
    ClassifiedOnly,
    /// Suppressed as noise by classification rules
    Suppressed,
}

impl ErrorHandlingOutcome {
    /// Whether the failure is contained from the caller's perspective.
    pub fn is_successful(&self) -> bool {
        matches!(
            self,
            Self::Recovered
                | Self::GracefullyDegraded
                | Self::CircuitBreakerTriggered
                | Self::Suppressed
        )
    }

    /// Whether a human should look at this.
    pub fn requires_follow_up(&self) -> bool {
        matches!(
            self,
            Self::IncidentReported | Self::Failed | Self::CircuitBreakerTriggered
        )
    }
}

/// Everything the handler concluded about one failure.
#[derive(Debug, Clone)]
pub struct ErrorHandlingResult {
    pub outcome: ErrorHandlingOutcome,
    pub classification: ErrorClassification,
    pub recovery: Option<RecoveryResult>,
    pub incident_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub handling_duration: Duration,
    pub message: String,
    /// Failure inside the handling machinery itself, when one occurred
    pub handling_error: Option<String>,
}

impl ErrorHandlingResult {
    pub fn is_successful(&self) -> bool {
        self.outcome.is_successful()
    }
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub total_errors: u64,
    pub recovered_errors: u64,
    pub incidents_reported: u64,
    pub suppressed_errors: u64,
    pub circuit_state: CircuitState,
    pub last_error_time: Option<DateTime<Utc>>,
}

/// The production error handling façade.
pub struct ProductionErrorHandler {
    classifier: ErrorClassifier,
    recovery: Arc<RecoveryManager>,
    reporter: Arc<dyn IncidentReporter>,
    breaker: Arc<CircuitBreaker>,
    total_errors: AtomicU64,
    recovered_errors: AtomicU64,
    incidents_reported: AtomicU64,
    suppressed_errors: AtomicU64,
    last_error_time: RwLock<Option<DateTime<Utc>>>,
}

impl ProductionErrorHandler {
    pub fn new(
        classifier: ErrorClassifier,
        recovery: Arc<RecoveryManager>,
        reporter: Arc<dyn IncidentReporter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            classifier,
            recovery,
            reporter,
            breaker,
            total_errors: AtomicU64::new(0),
            recovered_errors: AtomicU64::new(0),
            incidents_reported: AtomicU64::new(0),
            suppressed_errors: AtomicU64::new(0),
            last_error_time: RwLock::new(None),
        }
    }

    /// Handle one failure: classify, attempt recovery, report the incident
    /// when required, feed the circuit breaker. Never panics and never
    /// returns an error of its own.
    pub async fn handle_error(
        &self,
        error: anyhow::Error,
        context: &OperationContext,
    ) -> ErrorHandlingResult {
        let started = Instant::now();
        let timestamp = Utc::now();
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error_time.write() {
            *last = Some(timestamp);
        }

        let error = Arc::new(error);
        let classification = self.classifier.classify(&error, context);
        debug!(
            error_type = %classification.error_type,
            severity = ?classification.severity,
            operation = %context.operation_type,
            "failure classified"
        );

        if classification.suppressed {
            self.suppressed_errors.fetch_add(1, Ordering::Relaxed);
            return ErrorHandlingResult {
                outcome: ErrorHandlingOutcome::Suppressed,
                message: format!("{} failure suppressed as noise", classification.error_type),
                classification,
                recovery: None,
                incident_id: None,
                timestamp,
                handling_duration: started.elapsed(),
                handling_error: None,
            };
        }

        let recovery = self.recovery.attempt_recovery(&classification).await;

        let mut incident_id = None;
        let mut handling_error = None;
        let must_report = classification.requires_incident_report
            || classification.severity == crate::classify::ErrorSeverity::Critical;
        if must_report {
            match self
                .reporter
                .report_incident(&error, context, &recovery)
                .await
            {
                Ok(id) => {
                    self.incidents_reported.fetch_add(1, Ordering::Relaxed);
                    incident_id = Some(id);
                }
                Err(e) => {
                    // Best-effort: a reporting failure must not change the
                    // handling outcome
                    warn!(error = %e, "incident reporting failed");
                    handling_error = Some(e.to_string());
                }
            }
        }

        self.breaker.record_result(recovery.successful);

        let outcome = if recovery.successful {
            self.recovered_errors.fetch_add(1, Ordering::Relaxed);
            ErrorHandlingOutcome::Recovered
        } else if self.breaker.state() == CircuitState::Open {
            ErrorHandlingOutcome::CircuitBreakerTriggered
        } else if incident_id.is_some() {
            ErrorHandlingOutcome::IncidentReported
        } else if recovery.skipped {
            ErrorHandlingOutcome::ClassifiedOnly
        } else {
            ErrorHandlingOutcome::Failed
        };

        ErrorHandlingResult {
            outcome,
            message: format!(
                "{} failure handled: {}",
                classification.error_type, recovery.message
            ),
            classification,
            recovery: Some(recovery),
            incident_id,
            timestamp,
            handling_duration: started.elapsed(),
            handling_error,
        }
    }

    /// Whether the breaker currently restricts traffic.
    pub fn is_system_degraded(&self) -> bool {
        self.breaker.state() != CircuitState::Closed
    }

    pub fn statistics(&self) -> ErrorStatistics {
        ErrorStatistics {
            total_errors: self.total_errors.load(Ordering::Relaxed),
            recovered_errors: self.recovered_errors.load(Ordering::Relaxed),
            incidents_reported: self.incidents_reported.load(Ordering::Relaxed),
            suppressed_errors: self.suppressed_errors.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
            last_error_time: self.last_error_time.read().ok().and_then(|g| *g),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::incident::LogIncidentReporter;
    use crate::recovery::RecoveryConfig;
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;
    use std::io;

    fn fast_handler() -> (
        ProductionErrorHandler,
        Arc<CircuitBreaker>,
        Arc<LogIncidentReporter>,
    ) {
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
            half_open_max_calls: 3,
        }));
        let reporter = Arc::new(LogIncidentReporter::new());
        let recovery = Arc::new(RecoveryManager::new(RecoveryConfig {
            max_concurrent_recoveries: 10,
            strategy_timeout: Duration::from_secs(1),
            default_retry_policy: RetryPolicy {
                max_attempts: 3,
                initial_wait: Duration::from_millis(1),
                max_wait: Duration::from_millis(5),
                max_total_time: Duration::from_secs(10),
                ..RetryPolicy::default_policy()
            },
        }));
        let handler = ProductionErrorHandler::new(
            ErrorClassifier::new(),
            recovery,
            Arc::clone(&reporter) as _,
            Arc::clone(&breaker),
        );
        (handler, breaker, reporter)
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let (handler, _, _) = fast_handler();
        let error = anyhow::Error::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));

        let result = handler
            .handle_error(error, &OperationContext::new("fetch").with_user_impact())
            .await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::Recovered);
        assert!(result.is_successful());
        assert!(result.recovery.unwrap().successful);
        assert_eq!(handler.statistics().recovered_errors, 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_classified_only() {
        let (handler, _, _) = fast_handler();
        // Four prior retries force the classification to permanent; without
        // user impact or high severity no incident is required for io
        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let context = OperationContext::new("flush").with_retry_count(4);

        let result = handler.handle_error(error, &context).await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::ClassifiedOnly);
        assert!(result.recovery.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_incident_reported_when_required() {
        let (handler, _, reporter) = fast_handler();
        // Permanent + user impact: recovery skipped, incident required
        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let context = OperationContext::new("flush")
            .with_retry_count(4)
            .with_user_impact();

        let result = handler.handle_error(error, &context).await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::IncidentReported);
        assert!(result.incident_id.is_some());
        assert_eq!(reporter.statistics().total_reported, 1);
    }

    #[tokio::test]
    async fn test_suppressed_noise_skips_recovery_and_breaker() {
        let (handler, breaker, _) = fast_handler();
        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));

        let result = handler
            .handle_error(error, &OperationContext::new("metrics-poll"))
            .await;
        assert_eq!(result.outcome, ErrorHandlingOutcome::Suppressed);
        assert!(result.recovery.is_none());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(handler.statistics().suppressed_errors, 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_trip_breaker() {
        let (handler, breaker, _) = fast_handler();

        // Permanent failures: recovery is skipped (unsuccessful), so each
        // handled error feeds a failure signal into the breaker
        for attempt in 0..3 {
            let error = anyhow::Error::from(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("denied {}", attempt),
            ));
            let context = OperationContext::new("flush").with_retry_count(4);
            let result = handler.handle_error(error, &context).await;
            if attempt < 2 {
                assert_eq!(result.outcome, ErrorHandlingOutcome::ClassifiedOnly);
            } else {
                assert_eq!(result.outcome, ErrorHandlingOutcome::CircuitBreakerTriggered);
            }
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(handler.is_system_degraded());
    }

    #[tokio::test]
    async fn test_reporter_failure_is_swallowed() {
        struct BrokenReporter;

        #[async_trait]
        impl IncidentReporter for BrokenReporter {
            async fn report_incident(
                &self,
                _error: &anyhow::Error,
                _context: &OperationContext,
                _recovery: &RecoveryResult,
            ) -> crate::errors::Result<String> {
                Err(crate::errors::EngineError::Internal(
                    "pager service down".to_string(),
                ))
            }
        }

        let breaker = Arc::new(CircuitBreaker::default());
        let handler = ProductionErrorHandler::new(
            ErrorClassifier::new(),
            Arc::new(RecoveryManager::default()),
            Arc::new(BrokenReporter),
            Arc::clone(&breaker),
        );

        let error = anyhow::Error::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        let context = OperationContext::new("flush")
            .with_retry_count(4)
            .with_user_impact();

        let result = handler.handle_error(error, &context).await;
        // The caller still gets a value; the reporting failure is recorded
        assert_eq!(result.outcome, ErrorHandlingOutcome::ClassifiedOnly);
        assert!(result
            .handling_error
            .as_deref()
            .unwrap_or("")
            .contains("pager service down"));
    }

    #[tokio::test]
    async fn test_statistics_track_totals() {
        let (handler, _, _) = fast_handler();
        assert!(handler.statistics().last_error_time.is_none());

        let error = anyhow::Error::from(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        handler
            .handle_error(error, &OperationContext::new("fetch").with_user_impact())
            .await;

        let stats = handler.statistics();
        assert_eq!(stats.total_errors, 1);
        assert!(stats.last_error_time.is_some());
        assert_eq!(stats.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn test_outcome_predicates() {
        assert!(ErrorHandlingOutcome::Recovered.is_successful());
        assert!(ErrorHandlingOutcome::Suppressed.is_successful());
        assert!(!ErrorHandlingOutcome::Failed.is_successful());
        assert!(ErrorHandlingOutcome::Failed.requires_follow_up());
        assert!(ErrorHandlingOutcome::CircuitBreakerTriggered.requires_follow_up());
        assert!(!ErrorHandlingOutcome::Recovered.requires_follow_up());
    }
}
