//! Incident reporting collaborator seam
//!
//! The engine decides *when* an incident must be reported; delivery is the
//! host's concern. [`LogIncidentReporter`] is the built-in implementation:
//! it assigns ids, keeps the active set, and emits structured logs.

use crate::classify::{ErrorSeverity, OperationContext};
use crate::errors::Result;
use crate::recovery::RecoveryResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    Resolved,
}

/// One reported incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: ErrorSeverity,
    pub operation_type: String,
    pub error_message: String,
    pub recovery_message: String,
    pub recovery_successful: bool,
    pub status: IncidentStatus,
}

/// Read-only snapshot for monitoring front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentStatistics {
    pub active_incidents: usize,
    pub total_reported: u64,
    pub total_resolved: u64,
}

/// Receives (failure, context, recovery outcome) triples for failures whose
/// classification requires an incident report. Reporting is best-effort:
/// the caller swallows errors from this trait.
#[async_trait]
pub trait IncidentReporter: Send + Sync {
    /// Report an incident, returning its id.
    async fn report_incident(
        &self,
        error: &anyhow::Error,
        context: &OperationContext,
        recovery: &RecoveryResult,
    ) -> Result<String>;
}

/// Tracing-backed reporter with an in-memory active set.
pub struct LogIncidentReporter {
    active: DashMap<String, IncidentReport>,
    total_reported: AtomicU64,
    total_resolved: AtomicU64,
}

impl LogIncidentReporter {
    pub fn new() -> Self {
        Self {
            active: DashMap::new(),
            total_reported: AtomicU64::new(0),
            total_resolved: AtomicU64::new(0),
        }
    }

    fn determine_severity(error: &anyhow::Error, context: &OperationContext) -> ErrorSeverity {
        if context.critical {
            return ErrorSeverity::High;
        }
        let message = error.to_string().to_lowercase();
        if message.contains("memory") || message.contains("oom") {
            return ErrorSeverity::High;
        }
        ErrorSeverity::Medium
    }

    pub fn active_incidents(&self) -> Vec<IncidentReport> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    /// Mark an incident resolved and drop it from the active set.
    pub fn resolve_incident(&self, id: &str) -> Option<IncidentReport> {
        let (_, mut report) = self.active.remove(id)?;
        report.status = IncidentStatus::Resolved;
        self.total_resolved.fetch_add(1, Ordering::Relaxed);
        Some(report)
    }

    pub fn statistics(&self) -> IncidentStatistics {
        IncidentStatistics {
            active_incidents: self.active.len(),
            total_reported: self.total_reported.load(Ordering::Relaxed),
            total_resolved: self.total_resolved.load(Ordering::Relaxed),
        }
    }
}

impl Default for LogIncidentReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncidentReporter for LogIncidentReporter {
    async fn report_incident(
        &self,
        error: &anyhow::Error,
        context: &OperationContext,
        recovery: &RecoveryResult,
    ) -> Result<String> {
        let report = IncidentReport {
            id: format!("INC-{}", Uuid::new_v4()),
            timestamp: Utc::now(),
            severity: Self::determine_severity(error, context),
            operation_type: context.operation_type.clone(),
            error_message: error.to_string(),
            recovery_message: recovery.message.clone(),
            recovery_successful: recovery.successful,
            status: IncidentStatus::Open,
        };

        error!(
            incident = %report.id,
            severity = ?report.severity,
            operation = %report.operation_type,
            recovered = report.recovery_successful,
            error = %report.error_message,
            "incident reported"
        );

        self.total_reported.fetch_add(1, Ordering::Relaxed);
        let id = report.id.clone();
        self.active.insert(id.clone(), report);
        Ok(id)
    }
}
