use thiserror::Error;

pub type MediationResult<T> = Result<T, MediationError>;

/// Failure taxonomy for the mediation engine.
///
/// `Configuration` and `AuditWriteFailure` indicate the engine can no longer
/// guarantee its own invariants and should halt request processing; every
/// other variant is a typed rejection the caller may recover from without
/// any engine state having been corrupted.
#[derive(Debug, Error)]
pub enum MediationError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no policy registered for data category {0:?}")]
    PolicyNotFound(String),

    #[error("technique {technique} is not permitted for data category {data_category:?}")]
    PolicyMismatch {
        data_category: String,
        technique: &'static str,
    },

    #[error("insufficient privacy budget: requested epsilon {requested}, remaining {remaining}")]
    InsufficientBudget { requested: f64, remaining: f64 },

    #[error("suppression rate {rate} exceeds threshold {threshold}")]
    SuppressionThresholdExceeded { rate: f64, threshold: f64 },

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("encryption scheme not registered: {0}")]
    SchemeUnavailable(String),

    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),
}

impl MediationError {
    /// True for the two classes that must halt request processing rather
    /// than surface as a per-request rejection.
    pub fn is_halting(&self) -> bool {
        matches!(
            self,
            MediationError::Configuration(_) | MediationError::AuditWriteFailure(_)
        )
    }
}
