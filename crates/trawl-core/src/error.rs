use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Source;

/// How a failure should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Network trouble, timeouts, HTTP 429/5xx, throttling. Worth retrying.
    Transient,
    /// Target not found, private or blocked, invalid input. Never retried.
    Permanent,
    /// Unexpected response shape. Retried under a tighter cap.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application-wide error types for Trawl.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed with a status worth retrying (5xx) or at transport level.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Source answered 429.
    #[error("Rate limited by {platform}{}", retry_after_suffix(.retry_after))]
    RateLimited {
        platform: Source,
        retry_after: Option<Duration>,
    },

    /// The local rate limiter would have made the caller wait too long.
    #[error("Throttled: {platform} bucket needs {}ms, max queue time is {}ms", .waited.as_millis(), .max_wait.as_millis())]
    Throttled {
        platform: Source,
        waited: Duration,
        max_wait: Duration,
    },

    /// Request timed out.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target does not exist on the source.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Target is private or the source refused access.
    #[error("Blocked: {0}")]
    Blocked(String),

    /// Caller supplied something unusable.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Response did not have the expected shape.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Engine configuration is unusable.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No run is registered under the given handle.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

impl AppError {
    /// Classifies the error for the retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::HttpError(_)
            | AppError::RateLimited { .. }
            | AppError::Throttled { .. }
            | AppError::Timeout(_)
            | AppError::NetworkError(_) => ErrorKind::Transient,
            AppError::NotFound(_)
            | AppError::Blocked(_)
            | AppError::InvalidInput(_)
            | AppError::ConfigError(_)
            | AppError::RunNotFound(_) => ErrorKind::Permanent,
            AppError::ParseError(_) | AppError::SerializationError(_) | AppError::Generic(_) => {
                ErrorKind::Unknown
            }
        }
    }
}
