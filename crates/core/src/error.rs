//! Error taxonomy shared by every Apiary crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Context attached to a failed management-plane call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Remote call name, e.g. `create` or `delete_metadata`.
    pub call: String,
    /// What the call was about (kind + remote id, or the local identity).
    pub target: String,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(call: impl Into<String>, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self { call: call.into(), target: target.into(), message: message.into() }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.call, self.target, self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiaryError {
    /// Template or reference resolution failed; admission is rejected.
    #[error("validation: {0}")]
    Validation(String),
    /// Declarative store version token mismatch.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Timeout or 5xx-equivalent; the caller's cadence retries it.
    #[error("transient: {0}")]
    Transient(RemoteFailure),
    /// Authentication, authorization or malformed payload; not retried.
    #[error("fatal: {0}")]
    Fatal(RemoteFailure),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiaryResult<T> = Result<T, ApiaryError>;

impl ApiaryError {
    /// Classify an HTTP-like status code returned by the management plane.
    pub fn from_status(status: u16, call: &str, target: &str, message: impl Into<String>) -> Self {
        let failure = RemoteFailure::new(call, target, message);
        match status {
            404 => Self::NotFound(failure.to_string()),
            408 | 429 | 500..=599 => Self::Transient(failure),
            _ => Self::Fatal(failure),
        }
    }

    pub fn timeout(call: &str, target: &str, after_ms: u128) -> Self {
        Self::Transient(RemoteFailure::new(call, target, format!("timed out after {}ms", after_ms)))
    }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict(_)) }
    pub fn is_validation(&self) -> bool { matches!(self, Self::Validation(_)) }

    /// Whether re-running the same attempt later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_) | Self::Internal(_))
    }

    /// Prefix the error with the local identity it happened for.
    pub fn scoped(self, scope: &str) -> Self {
        match self {
            Self::Validation(m) => Self::Validation(format!("{}: {}", scope, m)),
            Self::Conflict(m) => Self::Conflict(format!("{}: {}", scope, m)),
            Self::NotFound(m) => Self::NotFound(format!("{}: {}", scope, m)),
            Self::Internal(m) => Self::Internal(format!("{}: {}", scope, m)),
            Self::Transient(f) => Self::Transient(RemoteFailure { target: format!("{} ({})", f.target, scope), ..f }),
            Self::Fatal(f) => Self::Fatal(RemoteFailure { target: format!("{} ({})", f.target, scope), ..f }),
        }
    }
}

pub trait ResultExt<T> {
    /// Turn a not-found error into `Ok(None)`; used by idempotent delete paths.
    fn ignore_not_found(self) -> ApiaryResult<Option<T>>;
}

impl<T> ResultExt<T> for ApiaryResult<T> {
    fn ignore_not_found(self) -> ApiaryResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
