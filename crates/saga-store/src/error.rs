use thiserror::Error;

use crate::{CorrelationKey, MessageId, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// A concurrency conflict occurred when committing a saga.
    /// The expected version did not match the stored version.
    #[error(
        "Concurrency conflict for saga {correlation_key}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_key: CorrelationKey,
        expected: Version,
        actual: Version,
    },

    /// The inbound message was already recorded in the inbox.
    #[error("Message already processed: {0}")]
    DuplicateMessage(MessageId),

    /// A request slot already has an unresolved pending request.
    #[error("Pending request already exists for saga {correlation_key} in slot '{slot}'")]
    DuplicatePendingRequest {
        correlation_key: CorrelationKey,
        slot: String,
    },

    /// No outbox entry exists with the given message id.
    #[error("Outbox entry not found: {0}")]
    OutboxEntryNotFound(MessageId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if this error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
