//! Error types for docconv.

use thiserror::Error;

/// Result type alias using docconv's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for docconv operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad request shape or options. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No converter is registered for the requested conversion type.
    #[error("Unsupported conversion type: {0}")]
    UnsupportedType(String),

    /// A converter reported a business failure. Retryable.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A converter exceeded the job timeout. Retryable.
    #[error("Conversion timed out after {0}s")]
    Timeout(u64),

    /// A converter call was interrupted by a cancellation request.
    #[error("Conversion interrupted: {0}")]
    Interrupted(String),

    /// Job not found
    #[error("Job not found: {0}")]
    NotFound(uuid::Uuid),

    /// Operation is illegal for the job's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Concurrent modification lost (stale lease, double terminal write, owned input).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Queue store or transport unreachable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Store/transport failures. These never consume a job attempt.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Database(_))
    }

    /// Failures the worker recovers from by advancing the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conversion(_) | Error::Timeout(_))
    }

    /// Stable taxonomy name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::UnsupportedType(_) => "unsupported_type",
            Error::Conversion(_) => "conversion_error",
            Error::Timeout(_) => "timeout_error",
            Error::Interrupted(_) => "interrupted",
            Error::NotFound(_) => "job_not_found",
            Error::InvalidState(_) => "invalid_state",
            Error::Conflict(_) => "conflict",
            Error::Unavailable(_) | Error::Database(_) => "service_unavailable",
            Error::Serialization(_) => "serialization_error",
            Error::Config(_) => "config_error",
            Error::Internal(_) | Error::Io(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
