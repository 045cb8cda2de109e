//! Provider error classification.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::gateway::ProviderOp;

/// Result type alias for provider calls.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Closed classification of provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderErrorKind {
    /// Throttling, 5xx, connection resets. Safe to retry.
    Transient,
    /// The call did not answer in time; the outcome is unknown.
    Timeout,
    /// Credentials expired or were revoked. Never a domain failure.
    AuthExpired,
    /// The provider does not know the cluster or step.
    NotFound,
    /// The provider rejected the request; retrying will not help.
    Fatal,
}

impl ProviderErrorKind {
    /// Whether the guarded gateway retries this kind with backoff.
    pub fn is_retriable(self) -> bool {
        matches!(self, ProviderErrorKind::Transient | ProviderErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::AuthExpired => "auth_expired",
            ProviderErrorKind::NotFound => "not_found",
            ProviderErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed provider call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{op} failed ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub op: ProviderOp,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, op: ProviderOp, message: impl Into<String>) -> Self {
        Self {
            kind,
            op,
            message: message.into(),
        }
    }

    pub fn transient(op: ProviderOp, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, op, message)
    }

    pub fn timeout(op: ProviderOp, after: Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            op,
            format!("no answer after {}ms", after.as_millis()),
        )
    }

    pub fn auth_expired(op: ProviderOp, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::AuthExpired, op, message)
    }

    pub fn not_found(op: ProviderOp, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, op, message)
    }

    pub fn fatal(op: ProviderOp, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, op, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    pub fn is_auth_expired(&self) -> bool {
        self.kind == ProviderErrorKind::AuthExpired
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ProviderErrorKind::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_retry() {
        assert!(ProviderErrorKind::Transient.is_retriable());
        assert!(ProviderErrorKind::Timeout.is_retriable());
        assert!(!ProviderErrorKind::AuthExpired.is_retriable());
        assert!(!ProviderErrorKind::NotFound.is_retriable());
        assert!(!ProviderErrorKind::Fatal.is_retriable());
    }

    #[test]
    fn display_names_operation_and_kind() {
        let err = ProviderError::fatal(ProviderOp::CreateCluster, "bad instance type");
        assert_eq!(
            err.to_string(),
            "create_cluster failed (fatal): bad instance type"
        );
        let err = ProviderError::timeout(ProviderOp::GetStatus, Duration::from_millis(1500));
        assert!(err.to_string().contains("1500ms"));
    }
}
