//! Error taxonomy shared by every crate.

use serde::{Deserialize, Serialize};

/// Errors surfaced by the store, the cluster registry and the managers.
///
/// `NotFound` and `AlreadyExists` are expected outcomes that callers branch on;
/// `Invalid` is rejected without side effects; `Upstream` and `Internal` are
/// propagated after any compensating action has been attempted.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Error::AlreadyExists(what.to_string())
    }

    pub fn invalid(what: impl std::fmt::Display) -> Self {
        Error::Invalid(what.to_string())
    }

    pub fn upstream(what: impl std::fmt::Display) -> Self {
        Error::Upstream(what.to_string())
    }

    pub fn internal(what: impl std::fmt::Display) -> Self {
        Error::Internal(what.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True for outcomes the API layer reports as a client error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::AlreadyExists(_) | Error::Invalid(_))
    }
}

/// Swallow the idempotent outcomes (`AlreadyExists`, `NotFound`) of a store call.
pub fn ignore_idempotent(res: Result<()>) -> Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(e) if e.is_already_exists() || e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(Error::not_found("x").is_client_error());
        assert!(Error::invalid("x").is_client_error());
        assert!(!Error::upstream("x").is_client_error());
        assert!(!Error::internal("x").is_client_error());
    }

    #[test]
    fn idempotent_outcomes_are_swallowed() {
        assert_eq!(ignore_idempotent(Ok(())), Ok(true));
        assert_eq!(ignore_idempotent(Err(Error::already_exists("g"))), Ok(false));
        assert_eq!(ignore_idempotent(Err(Error::not_found("g"))), Ok(false));
        assert!(ignore_idempotent(Err(Error::upstream("boom"))).is_err());
    }
}
