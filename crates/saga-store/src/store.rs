use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    CorrelationKey, MessageId, OutboxEntry, PendingRequest, Result, SagaCommit, SagaRecord,
    Version,
};

/// Counts of rows removed by [`SagaStore::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub outbox: u64,
    pub inbox: u64,
}

/// Core trait for saga store implementations.
///
/// The store is the only shared mutable resource of the orchestrator. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the committed record for a saga.
    ///
    /// Returns None if no saga exists for the key.
    async fn load(&self, correlation_key: CorrelationKey) -> Result<Option<SagaRecord>>;

    /// Applies a commit atomically.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version differs from
    /// `commit.expected_version`, and with `DuplicateMessage` if the
    /// inbound message is already in the inbox. Nothing is written on
    /// failure.
    ///
    /// Returns the new version of the saga.
    async fn commit(&self, commit: SagaCommit) -> Result<Version>;

    /// Checks whether an inbound message has already been processed.
    async fn is_processed(&self, message_id: MessageId) -> Result<bool>;

    /// Gets the unresolved pending request for a saga and slot.
    async fn pending_request(
        &self,
        correlation_key: CorrelationKey,
        slot: &str,
    ) -> Result<Option<PendingRequest>>;

    /// Lists all unresolved pending requests, earliest deadline first.
    async fn pending_requests(&self) -> Result<Vec<PendingRequest>>;

    /// Lists undispatched, non dead-lettered outbox entries, oldest first.
    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks an outbox entry as handed off to the transport.
    async fn mark_dispatched(&self, message_id: MessageId, attempts: u32) -> Result<()>;

    /// Records a failed handoff. With `dead_letter` set the entry is
    /// withdrawn from relaying and kept for reconciliation.
    async fn record_failure(
        &self,
        message_id: MessageId,
        attempts: u32,
        error: &str,
        dead_letter: bool,
    ) -> Result<()>;

    /// Lists dead-lettered outbox entries.
    async fn dead_letters(&self) -> Result<Vec<OutboxEntry>>;

    /// Lists all outbox entries of a saga in creation order.
    async fn outbox_for(&self, correlation_key: CorrelationKey) -> Result<Vec<OutboxEntry>>;

    /// Removes dispatched outbox entries older than `dispatched_before` and
    /// inbox entries older than `processed_before`.
    async fn purge(
        &self,
        dispatched_before: DateTime<Utc>,
        processed_before: DateTime<Utc>,
    ) -> Result<PurgeStats>;
}
