//! # Fan-out Errors
//!
//! Only genuine failures live here. A subscription that vanished between two
//! reads, or a record missing its query text, is an expected race and is
//! reported as absence, never as an error.

use thiserror::Error;

use crate::connections::store::StoreError;

/// Errors surfaced by the registry, the fan-out engine and the sweeper.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Registration lacked required attribution (e.g. no channel id).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A code path that this layer deliberately does not support was called.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The subscription id kept colliding with an existing record.
    #[error("Subscription '{0}' already exists")]
    DuplicateSubscription(String),

    /// The store could not be reached or rejected a command.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A JSON field could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The pluggable evaluator failed for one subscription.
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// A configuration file could not be read or parsed.
    #[error("Failed to load config: {0}")]
    Config(String),
}

/// Convenience alias used across the crate.
pub type FanoutResult<T> = Result<T, FanoutError>;
