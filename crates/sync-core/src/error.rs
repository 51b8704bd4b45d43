use thiserror::Error;

/// Errors surfaced across detector, engine, and store boundaries.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("source configuration error: {0}")]
    Configuration(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Permanent source-configuration errors degrade a worker to
    /// `sync_status = error`; transient ones are logged and retried on
    /// the next periodic refresh.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::Configuration(_) | SyncError::InvalidArgument(_))
    }
}
