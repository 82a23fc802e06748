use serde::{Deserialize, Serialize};
use ufleet_core::Error;

/// Errors as reported to API clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("upstream: {0}")]
    Upstream(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// HTTP status the outer layer answers with.
    pub fn status(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::Validation(_) => 400,
            ApiError::Upstream(_) => 502,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status() < 500
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(m) => ApiError::NotFound(m),
            Error::AlreadyExists(m) => ApiError::Conflict(m),
            Error::Invalid(m) => ApiError::Validation(m),
            Error::Upstream(m) => ApiError::Upstream(m),
            Error::Internal(m) => ApiError::Internal(m),
        }
    }
}
