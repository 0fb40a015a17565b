//! Error types for stormgmt.

use std::io;

use thiserror::Error;
use tonic::{Code, Status};

pub type Result<T> = std::result::Result<T, Error>;

/// Categorized error returned by every pool, client and lifecycle operation.
///
/// Variants map one-to-one onto gRPC status codes so that a caller can decide
/// whether and when to retry. The type is `Clone` because a single dial
/// failure is handed to every caller waiting on that dial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// The gRPC status code corresponding to this error's category.
    pub fn code(&self) -> Code {
        match self {
            Error::InvalidArgument(_) | Error::InvalidEndpoint { .. } => Code::InvalidArgument,
            Error::Canceled(_) => Code::Cancelled,
            Error::DeadlineExceeded(_) => Code::DeadlineExceeded,
            Error::Unavailable(_) => Code::Unavailable,
            Error::NotFound(_) => Code::NotFound,
            Error::AlreadyExists(_) => Code::AlreadyExists,
            Error::FailedPrecondition(_) => Code::FailedPrecondition,
            Error::Aborted(_) => Code::Aborted,
            Error::Unimplemented(_) => Code::Unimplemented,
            Error::Internal(_) => Code::Internal,
            Error::Unknown(_) => Code::Unknown,
        }
    }

    /// Whether a higher layer may retry the whole operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::InvalidArgument | Code::OutOfRange => Error::InvalidArgument(msg),
            Code::Cancelled => Error::Canceled(msg),
            Code::DeadlineExceeded => Error::DeadlineExceeded(msg),
            Code::Unavailable | Code::ResourceExhausted => Error::Unavailable(msg),
            Code::NotFound => Error::NotFound(msg),
            Code::AlreadyExists => Error::AlreadyExists(msg),
            Code::FailedPrecondition => Error::FailedPrecondition(msg),
            Code::Aborted => Error::Aborted(msg),
            Code::Unimplemented => Error::Unimplemented(msg),
            Code::Internal | Code::DataLoss => Error::Internal(msg),
            Code::Ok | Code::Unknown | Code::PermissionDenied | Code::Unauthenticated => {
                Error::Unknown(format!("{}: {}", status.code(), msg))
            }
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip_keeps_category() {
        let err = Error::from(Status::failed_precondition("etag mismatch"));
        assert_eq!(err, Error::FailedPrecondition("etag mismatch".to_string()));
        assert_eq!(Status::from(err).code(), Code::FailedPrecondition);
    }

    #[test]
    fn canceled_and_deadline_are_distinct() {
        let canceled = Error::from(Status::cancelled("caller gave up"));
        let expired = Error::from(Status::deadline_exceeded("took too long"));
        assert_eq!(canceled.code(), Code::Cancelled);
        assert_eq!(expired.code(), Code::DeadlineExceeded);
        assert_ne!(canceled.code(), expired.code());
    }

    #[test]
    fn unclassified_status_becomes_unknown() {
        let err = Error::from(Status::permission_denied("bad token"));
        assert!(matches!(err, Error::Unknown(_)));
        assert!(err.to_string().contains("bad token"));
    }

    #[test]
    fn endpoint_errors_are_invalid_argument() {
        let err = Error::InvalidEndpoint {
            endpoint: "x".to_string(),
            reason: "missing port".to_string(),
        };
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("missing port"));
    }
}
