use std::time::Duration;

use thiserror::Error;

/// Failure of an outbound fetch, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// HTTP 400 equivalent.
    #[error("validation failed: {0}")]
    Validation(String),
    /// HTTP 401 equivalent.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// HTTP 403 equivalent.
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    /// The caller (or the owning component) cancelled the request.
    #[error("request aborted")]
    Aborted,
}

impl FetchError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::Validation(message),
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            _ => Self::Status { status, message },
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// The HTTP-equivalent status code, if the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Validation(_) => Some(400),
            Self::Unauthorized(_) => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::Status { status, .. } => Some(*status),
            Self::Timeout(_) | Self::Network(_) | Self::Aborted => None,
        }
    }

    /// Validation, auth and permission failures are terminal, and so is a cancellation. Everything else, timeouts
    /// included, may succeed on another attempt.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Self::Validation(_) | Self::Unauthorized(_) | Self::Forbidden(_) | Self::Aborted
        )
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Crate-wide error.
///
/// The type is `Clone` because a single settled fetch is handed out to every caller that joined it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source:   FetchError,
    },

    #[error("persistent storage failure: {0}")]
    Storage(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("broadcast transport unavailable: {0}")]
    BroadcastUnavailable(String),

    #[error("subscription is closed")]
    SubscriptionClosed,

    #[error("{0} has been shut down")]
    Closed(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Cancellations are not failures from the UI point of view and should be dropped silently.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Aborted))
    }

    /// The fetch failure behind this error, if any.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) | Self::RetriesExhausted { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// How many times the failing operation was attempted. Only known for exhausted retries.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::Config(report.to_string())
    }
}

impl From<fieldx::error::FieldXError> for Error {
    fn from(err: fieldx::error::FieldXError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(!FetchError::from_status(400, "bad").is_retriable());
        assert!(!FetchError::from_status(401, "who").is_retriable());
        assert!(!FetchError::from_status(403, "nope").is_retriable());
        assert!(FetchError::from_status(500, "boom").is_retriable());
        assert!(FetchError::from_status(404, "gone").is_retriable());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!FetchError::Aborted.is_retriable());
        assert_eq!(FetchError::from_status(403, "nope").status(), Some(403));
        assert_eq!(FetchError::network("reset").status(), None);
    }

    #[test]
    fn exhausted_error_reports_cause() {
        let err = Error::RetriesExhausted {
            attempts: 4,
            source:   FetchError::network("connection reset"),
        };
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.fetch_error(), Some(&FetchError::network("connection reset")));
        assert_eq!(
            err.to_string(),
            "giving up after 4 attempts: network failure: connection reset"
        );
        assert!(Error::Fetch(FetchError::Aborted).is_aborted());
    }
}
