use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// Every failure a request handler, worker, or background task can observe
/// maps onto one of these variants. The serving plane owns the mapping to
/// HTTP statuses; workers decide retryability from [`Error::is_transient`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("authentication rejected")]
    AuthInvalid,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for API payloads and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::AuthRequired => "auth_required",
            Error::AuthInvalid => "auth_invalid",
            Error::RateLimited { .. } => "rate_limited",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Upstream(_) => "upstream",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Timeout(_) => "timeout",
            Error::Store(_) => "store",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether a crawl worker should retry the job with backoff.
    ///
    /// Hard upstream rejections (not-found targets, auth) are terminal; the
    /// rest of the upstream family is assumed recoverable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_)
                | Error::CircuitOpen { .. }
                | Error::RateLimited { .. }
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(0)
        } else {
            Error::Upstream(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {err}"))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("blocking task failed: {err}"))
    }
}
