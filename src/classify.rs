//! Failure classification
//!
//! Maps a raised failure plus its operation context onto an immutable
//! [`ErrorClassification`]: what kind of failure it is, how severe, whether
//! retrying can help, and whether an incident must be reported. Matching is
//! two-stage, the same shape the rest of this codebase uses for error
//! dispatch: typed downcasts over the error chain first, message heuristics
//! as the fallback.

use crate::errors::{DependencyError, EngineError, ResourceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Taxonomy
// ============================================================================

/// Broad category of a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    Network,
    Timeout,
    Io,
    Memory,
    ExternalDependency,
    Configuration,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Io => "io",
            Self::Memory => "memory",
            Self::ExternalDependency => "external-dependency",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// How badly a failure affects the system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Whether retrying a failure is expected to eventually succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recoverability {
    Transient,
    Permanent,
    Unknown,
}

// ============================================================================
// Operation context
// ============================================================================

/// Caller-supplied context about the operation that failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationContext {
    /// What kind of operation failed (e.g. "reload", "startup", "flush")
    pub operation_type: String,
    /// Critical operations escalate severity by one step
    pub critical: bool,
    /// How many times the caller has already retried this operation
    pub retry_count: u32,
    /// Whether the failure is visible to end users
    pub user_impact: bool,
}

impl OperationContext {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            critical: false,
            retry_count: 0,
            user_impact: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_user_impact(mut self) -> Self {
        self.user_impact = true;
        self
    }
}

// ============================================================================
// Classification value
// ============================================================================

/// Immutable description of one classified failure.
///
/// Produced once per handled failure; refinement steps copy the value with
/// individual fields replaced rather than mutating it.
#[derive(Debug, Clone)]
pub struct ErrorClassification {
    pub error_type: ErrorType,
    pub severity: ErrorSeverity,
    pub recoverability: Recoverability,
    pub requires_incident_report: bool,
    /// Set by suppression rules; suppressed failures skip recovery entirely
    pub suppressed: bool,
    /// Which pattern matched ("io", "network", ...); part of the fingerprint
    pub failure_class: String,
    /// Root-cause message; part of the fingerprint
    pub message: String,
    pub previous_retries: u32,
    /// The originating failure, shared with the caller
    pub error: Arc<anyhow::Error>,
}

impl ErrorClassification {
    /// Default classification for failures no pattern recognizes.
    pub fn unknown(error: Arc<anyhow::Error>) -> Self {
        let message = error.root_cause().to_string();
        Self {
            error_type: ErrorType::Unknown,
            severity: ErrorSeverity::Medium,
            recoverability: Recoverability::Unknown,
            requires_incident_report: true,
            suppressed: false,
            failure_class: "unclassified".to_string(),
            message,
            previous_retries: 0,
            error,
        }
    }

    /// Derived key identifying "the same" recurring failure for attempt
    /// tracking: error type + failure class + root message.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.error_type, self.failure_class, self.message)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_recoverability(mut self, recoverability: Recoverability) -> Self {
        self.recoverability = recoverability;
        self
    }

    pub fn with_incident_report(mut self, required: bool) -> Self {
        self.requires_incident_report = required;
        self
    }

    pub fn with_previous_retries(mut self, retries: u32) -> Self {
        self.previous_retries = retries;
        self
    }

    pub fn suppressed(mut self) -> Self {
        self.suppressed = true;
        self
    }
}

// ============================================================================
// Patterns
// ============================================================================

type Matcher = Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// One recognizable failure shape and the classification it produces.
pub struct ErrorPattern {
    failure_class: &'static str,
    matcher: Matcher,
    error_type: ErrorType,
    severity: ErrorSeverity,
    recoverability: Recoverability,
    requires_incident_report: bool,
}

impl ErrorPattern {
    pub fn new(
        failure_class: &'static str,
        matcher: Matcher,
        error_type: ErrorType,
        severity: ErrorSeverity,
        recoverability: Recoverability,
        requires_incident_report: bool,
    ) -> Self {
        Self {
            failure_class,
            matcher,
            error_type,
            severity,
            recoverability,
            requires_incident_report,
        }
    }

    fn matches(&self, error: &anyhow::Error) -> bool {
        (self.matcher)(error)
    }

    fn classification(&self, error: Arc<anyhow::Error>) -> ErrorClassification {
        let message = error.root_cause().to_string();
        ErrorClassification {
            error_type: self.error_type,
            severity: self.severity,
            recoverability: self.recoverability,
            requires_incident_report: self.requires_incident_report,
            suppressed: false,
            failure_class: self.failure_class.to_string(),
            message,
            previous_retries: 0,
            error,
        }
    }
}

fn io_error_kind(error: &anyhow::Error) -> Option<std::io::ErrorKind> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .map(|io| io.kind())
}

fn chain_has<T: std::error::Error + Send + Sync + 'static>(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.downcast_ref::<T>().is_some())
}

fn chain_ref<T: std::error::Error + Send + Sync + 'static>(error: &anyhow::Error) -> Option<&T> {
    error.chain().find_map(|cause| cause.downcast_ref::<T>())
}

fn message_contains(error: &anyhow::Error, needles: &[&str]) -> bool {
    let msg = error.to_string().to_lowercase();
    needles.iter().any(|needle| msg.contains(needle))
}

/// Default pattern table, most specific first. Typed downcasts over the
/// error chain come before the message-substring fallbacks, so an
/// `io::Error` with "connection" in its text still classifies by its kind.
fn default_patterns() -> Vec<ErrorPattern> {
    use std::io::ErrorKind;

    const NETWORK_KINDS: [ErrorKind; 6] = [
        ErrorKind::ConnectionRefused,
        ErrorKind::ConnectionReset,
        ErrorKind::ConnectionAborted,
        ErrorKind::NotConnected,
        ErrorKind::AddrNotAvailable,
        ErrorKind::BrokenPipe,
    ];

    vec![
        ErrorPattern::new(
            "timeout",
            Box::new(|e| {
                chain_has::<tokio::time::error::Elapsed>(e)
                    || io_error_kind(e) == Some(ErrorKind::TimedOut)
            }),
            ErrorType::Timeout,
            ErrorSeverity::Low,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "network",
            Box::new(|e| {
                io_error_kind(e).is_some_and(|kind| NETWORK_KINDS.contains(&kind))
                    || matches!(
                        chain_ref::<DependencyError>(e),
                        Some(DependencyError::Unreachable { .. })
                    )
            }),
            ErrorType::Network,
            ErrorSeverity::Medium,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "memory",
            Box::new(|e| {
                chain_has::<std::collections::TryReserveError>(e)
                    || matches!(
                        chain_ref::<ResourceError>(e),
                        Some(ResourceError::MemoryExhausted(_))
                    )
            }),
            ErrorType::Memory,
            ErrorSeverity::High,
            Recoverability::Transient,
            true,
        ),
        ErrorPattern::new(
            "io",
            Box::new(chain_has::<std::io::Error>),
            ErrorType::Io,
            ErrorSeverity::Medium,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "external-dependency",
            Box::new(chain_has::<DependencyError>),
            ErrorType::ExternalDependency,
            ErrorSeverity::Medium,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "configuration",
            Box::new(|e| matches!(chain_ref::<EngineError>(e), Some(EngineError::Config(_)))),
            ErrorType::Configuration,
            ErrorSeverity::High,
            Recoverability::Permanent,
            true,
        ),
        // Message heuristics: the nearest-match fallback for foreign error
        // types that carry no recognizable concrete type.
        ErrorPattern::new(
            "timeout-heuristic",
            Box::new(|e| message_contains(e, &["timed out", "timeout", "deadline exceeded"])),
            ErrorType::Timeout,
            ErrorSeverity::Low,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "network-heuristic",
            Box::new(|e| message_contains(e, &["connection", "network", "unreachable", "dns"])),
            ErrorType::Network,
            ErrorSeverity::Medium,
            Recoverability::Transient,
            false,
        ),
        ErrorPattern::new(
            "memory-heuristic",
            Box::new(|e| message_contains(e, &["out of memory", "allocation failed", "oom"])),
            ErrorType::Memory,
            ErrorSeverity::High,
            Recoverability::Transient,
            true,
        ),
        ErrorPattern::new(
            "dependency-heuristic",
            Box::new(|e| message_contains(e, &["upstream", "dependency", "service unavailable"])),
            ErrorType::ExternalDependency,
            ErrorSeverity::Medium,
            Recoverability::Transient,
            false,
        ),
    ]
}

// ============================================================================
// Rules
// ============================================================================

/// A pluggable refinement applied after pattern matching and context
/// refinement. Rules run in registration order; each may override any field
/// set by earlier stages.
pub trait ClassificationRule: Send + Sync {
    fn name(&self) -> &str;

    fn applies(&self, error: &anyhow::Error, context: &OperationContext) -> bool;

    fn apply(
        &self,
        classification: ErrorClassification,
        error: &anyhow::Error,
        context: &OperationContext,
    ) -> ErrorClassification;
}

/// Failures during startup leave the system in an undefined state.
struct StartupEscalationRule;

impl ClassificationRule for StartupEscalationRule {
    fn name(&self) -> &str {
        "startup-escalation"
    }

    fn applies(&self, _error: &anyhow::Error, context: &OperationContext) -> bool {
        context.operation_type == "startup" || context.operation_type.starts_with("startup.")
    }

    fn apply(
        &self,
        classification: ErrorClassification,
        _error: &anyhow::Error,
        _context: &OperationContext,
    ) -> ErrorClassification {
        classification
            .with_severity(ErrorSeverity::Critical)
            .with_incident_report(true)
    }
}

/// Memory exhaustion needs attention even when the failed operation itself
/// was unimportant.
struct ResourceExhaustionRule;

impl ClassificationRule for ResourceExhaustionRule {
    fn name(&self) -> &str {
        "resource-exhaustion"
    }

    fn applies(&self, error: &anyhow::Error, _context: &OperationContext) -> bool {
        chain_has::<std::collections::TryReserveError>(error)
            || matches!(
                chain_ref::<ResourceError>(error),
                Some(ResourceError::MemoryExhausted(_) | ResourceError::DiskExhausted { .. })
            )
    }

    fn apply(
        &self,
        classification: ErrorClassification,
        _error: &anyhow::Error,
        _context: &OperationContext,
    ) -> ErrorClassification {
        let severity = classification.severity.max(ErrorSeverity::High);
        classification
            .with_severity(severity)
            .with_incident_report(true)
    }
}

/// Low-stakes transient noise: no recovery, no incident.
struct NoiseSuppressionRule;

impl ClassificationRule for NoiseSuppressionRule {
    fn name(&self) -> &str {
        "noise-suppression"
    }

    fn applies(&self, _error: &anyhow::Error, context: &OperationContext) -> bool {
        !context.critical && !context.user_impact && context.retry_count == 0
    }

    fn apply(
        &self,
        classification: ErrorClassification,
        _error: &anyhow::Error,
        _context: &OperationContext,
    ) -> ErrorClassification {
        if classification.severity == ErrorSeverity::Low
            && classification.recoverability == Recoverability::Transient
        {
            classification.with_incident_report(false).suppressed()
        } else {
            classification
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Classifies failures into [`ErrorClassification`] values.
///
/// Pure: same failure shape and context always yield the same base
/// classification. No side effects, no shared mutable state.
pub struct ErrorClassifier {
    patterns: Vec<ErrorPattern>,
    rules: Vec<Box<dyn ClassificationRule>>,
}

impl ErrorClassifier {
    /// Classifier with the default pattern table and rule set.
    pub fn new() -> Self {
        Self {
            patterns: default_patterns(),
            rules: vec![
                Box::new(StartupEscalationRule),
                Box::new(ResourceExhaustionRule),
                Box::new(NoiseSuppressionRule),
            ],
        }
    }

    /// Classifier with no built-in rules; patterns only.
    pub fn without_rules() -> Self {
        Self {
            patterns: default_patterns(),
            rules: Vec::new(),
        }
    }

    /// Register an additional pattern, tried before the message heuristics
    /// would otherwise swallow the failure. Patterns are evaluated in order.
    pub fn register_pattern(&mut self, pattern: ErrorPattern) {
        self.patterns.insert(0, pattern);
    }

    /// Append a classification rule. Rules run after context refinement, in
    /// registration order.
    pub fn register_rule(&mut self, rule: Box<dyn ClassificationRule>) {
        self.rules.push(rule);
    }

    /// Classify a failure given its operation context.
    pub fn classify(
        &self,
        error: &Arc<anyhow::Error>,
        context: &OperationContext,
    ) -> ErrorClassification {
        let base = self.classify_by_pattern(error);
        let refined = Self::refine_with_context(base, context);
        self.apply_rules(refined, error, context)
    }

    fn classify_by_pattern(&self, error: &Arc<anyhow::Error>) -> ErrorClassification {
        for pattern in &self.patterns {
            if pattern.matches(error) {
                return pattern.classification(Arc::clone(error));
            }
        }
        ErrorClassification::unknown(Arc::clone(error))
    }

    fn refine_with_context(
        classification: ErrorClassification,
        context: &OperationContext,
    ) -> ErrorClassification {
        let mut refined = classification;

        // Critical operations move severity up one step
        if context.critical {
            refined.severity = match refined.severity {
                ErrorSeverity::Low => ErrorSeverity::Medium,
                ErrorSeverity::Medium => ErrorSeverity::High,
                other => other,
            };
        }

        if context.retry_count > 0 {
            refined.previous_retries = context.retry_count;
            // Repeated failure of the same operation is not transient
            if context.retry_count >= 3 {
                refined.recoverability = Recoverability::Permanent;
            }
        }

        if context.user_impact {
            refined.requires_incident_report = true;
        }

        refined
    }

    fn apply_rules(
        &self,
        classification: ErrorClassification,
        error: &anyhow::Error,
        context: &OperationContext,
    ) -> ErrorClassification {
        let mut result = classification;
        for rule in &self.rules {
            if rule.applies(error, context) {
                result = rule.apply(result, error, context);
            }
        }
        result
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
