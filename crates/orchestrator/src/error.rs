//! Orchestrator error types.

use common::CorrelationKey;
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur while orchestrating sagas.
///
/// Business failures never appear here; they are failure transitions.
/// These errors mean the inbound message was not acknowledged and must be
/// redelivered.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The commit kept losing the optimistic concurrency race.
    #[error("Gave up on saga {correlation_key} after {attempts} concurrency conflicts")]
    ConflictRetriesExhausted {
        correlation_key: CorrelationKey,
        attempts: u32,
    },

    /// A stored record could not be interpreted as an order saga.
    #[error("Invalid saga record {correlation_key}: {reason}")]
    InvalidRecord {
        correlation_key: CorrelationKey,
        reason: String,
    },
}

/// Convenience type alias for orchestrator results.
pub type Result<T> = std::result::Result<T, EngineError>;
