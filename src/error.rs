//! Error taxonomy shared by every layer.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which naming rule a rejected name was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// A bucket name.
    Bucket,
    /// An object key.
    Object,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameKind::Bucket => f.write_str("bucket"),
            NameKind::Object => f.write_str("object"),
        }
    }
}

/// An error document returned by the storage service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    /// HTTP status of the response.
    pub status: u16,
    /// Service error code, e.g. `NoSuchKey`. Derived from the status when the body had none.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Resource the error refers to, if reported.
    pub resource: Option<String>,
    /// Request id assigned by the service, if reported.
    pub request_id: Option<String>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.code)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum Failure {
    /// The attempt could not get a connection, or made no progress, within the
    /// per-attempt timeout.
    #[error("attempt timed out")]
    Timeout,
    /// Connection-level failure (reset, refused, broken pipe, ...).
    #[error("network error: {0}")]
    Network(#[source] io::Error),
    /// The service answered with an error status.
    #[error("service error: {0}")]
    Service(ServiceError),
    /// The response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Failure {
    /// The service error, when the failure came from an error response.
    pub fn service(&self) -> Option<&ServiceError> {
        match self {
            Failure::Service(err) => Some(err),
            _ => None,
        }
    }

    /// Short label used in logs and retry bookkeeping.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::Timeout => "timeout",
            Failure::Network(_) => "network",
            Failure::Service(_) => "service",
            Failure::Malformed(_) => "malformed",
        }
    }
}

/// The error type of every fallible operation in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A bucket name or object key broke the naming rules. Never sent over the wire.
    #[error("invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        /// Bucket or object.
        kind: NameKind,
        /// The rejected name.
        name: String,
        /// Which rule was broken.
        reason: &'static str,
    },
    /// An argument other than a name was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A transient failure; another attempt may succeed.
    #[error("retryable failure: {0}")]
    Retryable(Failure),
    /// A failure that another attempt would not fix.
    #[error("terminal failure: {0}")]
    Terminal(Failure),
    /// The caller cancelled the operation or its deadline passed.
    #[error("operation cancelled")]
    Cancelled,
    /// The retry budget was consumed; wraps the last retryable failure.
    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        /// Number of physical attempts made.
        attempts: u32,
        /// The failure of the final attempt.
        last: Failure,
    },
    /// Reading a body source or writing a body sink failed locally.
    #[error("local i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable(_))
    }

    /// The service error carried by this error, if any.
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Error::Retryable(f) | Error::Terminal(f) => f.service(),
            Error::ExhaustedRetries { last, .. } => last.service(),
            _ => None,
        }
    }

    /// The bucket already exists and belongs to the caller.
    pub fn is_already_owned(&self) -> bool {
        matches!(self, Error::Terminal(Failure::Service(e)) if e.code == "BucketAlreadyOwnedByYou")
    }

    /// The addressed bucket or object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Terminal(Failure::Service(e)) => {
                e.status == 404
                    || matches!(e.code.as_str(), "NoSuchKey" | "NoSuchBucket" | "NotFound")
            }
            _ => false,
        }
    }

    /// Classifies a connection-level error from the network collaborator.
    pub(crate) fn from_transport(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            TimedOut => Error::Retryable(Failure::Timeout),
            InvalidData => Error::Terminal(Failure::Malformed(err.to_string())),
            InvalidInput | Unsupported => Error::Terminal(Failure::Network(err)),
            _ => Error::Retryable(Failure::Network(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: u16, code: &str) -> ServiceError {
        ServiceError {
            status,
            code: code.to_string(),
            message: String::new(),
            resource: None,
            request_id: None,
        }
    }

    #[test]
    fn already_owned_is_distinct_from_other_terminal_errors() {
        let owned = Error::Terminal(Failure::Service(service(409, "BucketAlreadyOwnedByYou")));
        let taken = Error::Terminal(Failure::Service(service(409, "BucketAlreadyExists")));
        assert!(owned.is_already_owned());
        assert!(!taken.is_already_owned());
        assert!(!owned.is_retryable());
    }

    #[test]
    fn transport_errors_are_classified() {
        let reset = Error::from_transport(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_retryable());

        let timeout = Error::from_transport(io::Error::from(io::ErrorKind::TimedOut));
        assert!(matches!(timeout, Error::Retryable(Failure::Timeout)));

        let garbage = Error::from_transport(io::Error::new(io::ErrorKind::InvalidData, "bad head"));
        assert!(matches!(garbage, Error::Terminal(Failure::Malformed(_))));

        let misconfigured = Error::from_transport(io::Error::new(
            io::ErrorKind::InvalidInput,
            "endpoint requires TLS but the connector has none",
        ));
        assert!(matches!(misconfigured, Error::Terminal(Failure::Network(_))));
    }

    #[test]
    fn not_found_covers_head_requests_without_body() {
        let err = Error::Terminal(Failure::Service(service(404, "NotFound")));
        assert!(err.is_not_found());
        assert_eq!(err.service_error().map(|e| e.status), Some(404));
    }
}
