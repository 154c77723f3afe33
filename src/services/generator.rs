use std::time::Duration;

use async_trait::async_trait;

use crate::models::annotation::AnnotationSet;

/// The external annotation provider. Opaque to the batch core apart from
/// how its errors are classified.
#[async_trait]
pub trait AnnotationGenerator: Send + Sync {
    async fn generate(&self, item_id: &str) -> Result<AnnotationSet, GenerateError>;
}

/// Whether an item failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerateError {
    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("provider unreachable: {0}")]
    Unavailable(String),

    #[error("provider error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("provider rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request rejected with {status}: {message}")]
    Client { status: u16, message: String },

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("malformed provider response: {0}")]
    InvalidResponse(String),
}

impl GenerateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GenerateError::Timeout(_)
            | GenerateError::Unavailable(_)
            | GenerateError::Server { .. }
            | GenerateError::RateLimited { .. } => ErrorClass::Transient,
            GenerateError::Client { .. }
            | GenerateError::Unsupported(_)
            | GenerateError::InvalidResponse(_) => ErrorClass::Permanent,
        }
    }

    /// Kind of transport failure (timeout, unreachable, 5xx status), ignoring
    /// any response body. A run of equal signatures across consecutive items
    /// is what aborts a whole job. `None` for other errors.
    pub fn transport_signature(&self) -> Option<String> {
        match self {
            GenerateError::Timeout(_) => Some("timeout".to_string()),
            GenerateError::Unavailable(_) => Some("unavailable".to_string()),
            GenerateError::Server { status, .. } => Some(format!("server {status}")),
            _ => None,
        }
    }

    /// Provider-requested pause, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GenerateError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
