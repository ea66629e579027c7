//! Crate-wide error taxonomy.
//!
//! Muster classifies failures into five kinds rather than one flat enum of
//! causes: callers (the state machine, the reconciler) match on `kind()`
//! rather than on error variants, since the response to a failure — retry,
//! surface to status, deregister, teardown — depends on the kind and not on
//! which subsystem produced it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The five error kinds from the error handling design. `Error::kind()`
/// is the thing state machines and reconcilers actually match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed definition, cycle in deps, name collision. Do not retry
    /// until the spec changes.
    Validation,
    /// Transport I/O, connect failures, timeouts, lagged event streams.
    /// Retry with backoff.
    Transient,
    /// Protocol mismatch, schema incompatibility. After max attempts, mark
    /// `Failed` terminal.
    Permanent,
    /// Not an error. Causes orderly teardown of the scope.
    Cancellation,
    /// Registry/orchestrator internal inconsistency. Log loudly, attempt
    /// to deregister the affected instance, never panic the process.
    InvariantViolation,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("cycle detected among: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("has dependents: {0}")]
    HasDependents(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::CycleDetected(_)
            | Error::AlreadyExists(_)
            | Error::HasDependents(_) => ErrorKind::Validation,

            Error::NotFound(_) => ErrorKind::Validation,

            Error::Transient(_)
            | Error::Transport(_)
            | Error::Timeout(_)
            | Error::Unavailable(_)
            | Error::Io(_)
            | Error::Http(_) => ErrorKind::Transient,

            Error::ProtocolMismatch(_) | Error::Permanent(_) => ErrorKind::Permanent,

            Error::Cancelled => ErrorKind::Cancellation,

            Error::InvariantViolation(_) => ErrorKind::InvariantViolation,

            Error::Serialization(_) | Error::Yaml(_) | Error::Config(_) => ErrorKind::Validation,

            Error::Kube(_) => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        let err = Error::Transient("connect refused".into());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::CycleDetected(vec!["a".into(), "b".into()]);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }
}
