use thiserror::Error;

/// Errors surfaced by the re-encryption subsystem, ordered roughly by
/// severity. `Canceled` and the transient variants are control flow for the
/// coordinator, not failures.
#[derive(Error, Debug)]
pub enum ReencryptError {
    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("retry later: {0}")]
    RetryLater(String),

    #[error("namespace is in safe mode")]
    SafeMode,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("KMS error: {0}")]
    Kms(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReencryptError {
    /// Transient conditions requeue the zone instead of failing it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReencryptError::RetryLater(_) | ReencryptError::SafeMode
        )
    }
}

pub type Result<T> = std::result::Result<T, ReencryptError>;
