//! Error types for the proxier.

use thiserror::Error;

use crate::backend::BackendError;

/// Errors from a sync pass.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Services or endpoint slices have not finished their initial listing.
    #[error("proxier not initialized: waiting for services and endpoint slices")]
    NotInitialized,

    /// The backend rejected the rule transaction.
    #[error("rule transaction failed: {0}")]
    Backend(#[from] BackendError),
}
