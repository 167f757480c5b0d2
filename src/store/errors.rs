//! State store error types.

use thiserror::Error;

use crate::errors::ErrorKind;

/// Errors raised by a [`StateStore`](super::StateStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not read or write.
    #[error("state store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A stored record could not be encoded or decoded.
    #[error("state store serialization error: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StoreUnavailable
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<chrono::ParseError> for StoreError {
    fn from(e: chrono::ParseError) -> Self {
        StoreError::Serialization {
            reason: format!("bad timestamp: {e}"),
        }
    }
}
