//! Capability aggregator error types.

use thiserror::Error;

use super::types::CapabilityKind;
use crate::errors::ErrorKind;
use crate::upstream::UpstreamError;

#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// The endpoint was never added to the aggregator.
    #[error("endpoint '{name}' is not part of the catalog")]
    UnknownEndpoint { name: String },

    /// Fetching a listing failed.
    #[error("listing {kind}s from '{endpoint}' failed: {source}")]
    Listing {
        endpoint: String,
        kind: CapabilityKind,
        #[source]
        source: UpstreamError,
    },

    /// The listing came back in an unexpected shape.
    #[error("invalid {kind} listing from '{endpoint}': {reason}")]
    InvalidListing {
        endpoint: String,
        kind: CapabilityKind,
        reason: String,
    },
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::UnknownEndpoint { .. } => ErrorKind::NotFound,
            CatalogError::Listing { source, .. } => source.kind(),
            CatalogError::InvalidListing { .. } => ErrorKind::SchemaViolation,
        }
    }
}
