use std::path::PathBuf;
use thiserror::Error;

/// The central error type for the resilience engine.
///
/// This hierarchy enables programmatic classification and unified error
/// handling across the recovery, health, and resource layers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Health error: {0}")]
    Health(#[from] HealthError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Recovery attempt budget exhausted after {attempts} attempts")]
    BudgetExhausted { attempts: u32 },

    #[error("Recovery strategy '{strategy}' timed out after {seconds} seconds")]
    StrategyTimeout { strategy: String, seconds: u64 },

    #[error("Recovery strategy '{strategy}' failed: {message}")]
    StrategyFailed { strategy: String, message: String },

    #[error("Too many concurrent recoveries in flight ({active})")]
    TooManyConcurrent { active: usize },
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Health check '{name}' timed out")]
    CheckTimeout { name: String },

    #[error("Health check '{name}' failed: {message}")]
    CheckFailed { name: String, message: String },

    #[error("Health check '{name}' is not registered")]
    NotRegistered { name: String },
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Memory exhausted: {0}")]
    MemoryExhausted(String),

    #[error("Disk exhausted at {path}: {message}")]
    DiskExhausted { path: PathBuf, message: String },

    #[error("Resource quota exceeded for {resource}: used {used}, limit {limit}")]
    QuotaExceeded {
        resource: String,
        used: u64,
        limit: u64,
    },

    #[error("Resource unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("Dependency '{name}' is unreachable: {message}")]
    Unreachable { name: String, message: String },

    #[error("Dependency '{name}' rejected the request: {message}")]
    Rejected { name: String, message: String },

    #[error("Dependency '{name}' circuit is open")]
    CircuitOpen { name: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::Config("missing threshold".to_string());
        assert_eq!(format!("{}", err), "Configuration error: missing threshold");
    }

    #[test]
    fn test_sub_error_wraps_into_engine_error() {
        let err: EngineError = RecoveryError::BudgetExhausted { attempts: 3 }.into();
        assert!(matches!(err, EngineError::Recovery(_)));
        assert!(format!("{}", err).contains("3 attempts"));
    }

    #[test]
    fn test_resource_error_quota_display() {
        let err = ResourceError::QuotaExceeded {
            resource: "memory".to_string(),
            used: 900,
            limit: 800,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("memory"));
        assert!(msg.contains("900"));
        assert!(msg.contains("800"));
    }

    #[test]
    fn test_anyhow_error_is_transparent() {
        let err: EngineError = anyhow::anyhow!("wrapped").into();
        assert_eq!(format!("{}", err), "wrapped");
    }

    #[test]
    fn test_dependency_error_downcast_from_anyhow() {
        let err: anyhow::Error = DependencyError::CircuitOpen {
            name: "payments".to_string(),
        }
        .into();
        assert!(err.downcast_ref::<DependencyError>().is_some());
    }
}
