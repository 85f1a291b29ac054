use thiserror::Error;

use crate::calc::CalcError;

/// Service-level failures surfaced through the IPC error envelope.
///
/// Partial failures from bulk operations are not errors; they are reported
/// in the operation's result payload so callers can retry selectively.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Store(#[from] rusqlite::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "bad_params",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::Store(_) => "store_unavailable",
        }
    }
}

impl From<CalcError> for ServiceError {
    fn from(e: CalcError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}
