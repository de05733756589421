use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    CorrelationKey, MessageId, OutboxEntry, PendingRequest, Result, SagaCommit, SagaRecord,
    SagaStoreError, Version,
    store::{PurgeStats, SagaStore},
};

#[derive(Debug, Default)]
struct State {
    sagas: HashMap<CorrelationKey, SagaRecord>,
    pending: HashMap<Uuid, PendingRequest>,
    outbox: Vec<OutboxEntry>,
    inbox: HashMap<MessageId, DateTime<Utc>>,
}

impl State {
    fn outbox_entry_mut(&mut self, message_id: MessageId) -> Result<&mut OutboxEntry> {
        self.outbox
            .iter_mut()
            .find(|e| e.message_id == message_id)
            .ok_or(SagaStoreError::OutboxEntryNotFound(message_id))
    }
}

/// In-memory saga store implementation for testing and single-process use.
///
/// All tables live behind one lock so a commit is applied atomically, with
/// the same conflict semantics as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<State>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }

    /// Returns the number of outbox entries, dispatched or not.
    pub async fn outbox_count(&self) -> usize {
        self.state.read().await.outbox.len()
    }

    /// Returns the number of inbox entries.
    pub async fn inbox_count(&self) -> usize {
        self.state.read().await.inbox.len()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = State::default();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, correlation_key: CorrelationKey) -> Result<Option<SagaRecord>> {
        Ok(self.state.read().await.sagas.get(&correlation_key).cloned())
    }

    async fn commit(&self, commit: SagaCommit) -> Result<Version> {
        let mut state = self.state.write().await;
        let correlation_key = commit.record.correlation_key;

        // Validate everything before touching any table
        let actual = state
            .sagas
            .get(&correlation_key)
            .map(|r| r.version)
            .unwrap_or(Version::initial());
        if actual != commit.expected_version {
            return Err(SagaStoreError::ConcurrencyConflict {
                correlation_key,
                expected: commit.expected_version,
                actual,
            });
        }

        if let Some(message_id) = commit.processed
            && state.inbox.contains_key(&message_id)
        {
            return Err(SagaStoreError::DuplicateMessage(message_id));
        }

        for request in &commit.issued {
            let occupied = state.pending.values().any(|p| {
                p.correlation_key == request.correlation_key
                    && p.slot == request.slot
                    && !commit.resolved.contains(&p.request_id)
            });
            if occupied {
                return Err(SagaStoreError::DuplicatePendingRequest {
                    correlation_key: request.correlation_key,
                    slot: request.slot.clone(),
                });
            }
        }

        let now = Utc::now();
        let version = commit.next_version();
        let mut record = commit.record;
        record.version = version;
        record.updated_at = now;
        if let Some(existing) = state.sagas.get(&correlation_key) {
            record.created_at = existing.created_at;
        }
        state.sagas.insert(correlation_key, record);

        for request_id in &commit.resolved {
            state.pending.remove(request_id);
        }
        for request in commit.issued {
            state.pending.insert(request.request_id, request);
        }
        state.outbox.extend(commit.outbox);
        if let Some(message_id) = commit.processed {
            state.inbox.insert(message_id, now);
        }

        Ok(version)
    }

    async fn is_processed(&self, message_id: MessageId) -> Result<bool> {
        Ok(self.state.read().await.inbox.contains_key(&message_id))
    }

    async fn pending_request(
        &self,
        correlation_key: CorrelationKey,
        slot: &str,
    ) -> Result<Option<PendingRequest>> {
        let state = self.state.read().await;
        Ok(state
            .pending
            .values()
            .find(|p| p.correlation_key == correlation_key && p.slot == slot)
            .cloned())
    }

    async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        let state = self.state.read().await;
        let mut requests: Vec<_> = state.pending.values().cloned().collect();
        requests.sort_by_key(|p| p.deadline);
        Ok(requests)
    }

    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, message_id: MessageId, attempts: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.outbox_entry_mut(message_id)?;
        entry.dispatched_at = Some(Utc::now());
        entry.attempts = attempts;
        Ok(())
    }

    async fn record_failure(
        &self,
        message_id: MessageId,
        attempts: u32,
        error: &str,
        dead_letter: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state.outbox_entry_mut(message_id)?;
        entry.attempts = attempts;
        entry.last_error = Some(error.to_string());
        if dead_letter {
            entry.dead_lettered_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.is_dead_lettered())
            .cloned()
            .collect())
    }

    async fn outbox_for(&self, correlation_key: CorrelationKey) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.correlation_key == correlation_key)
            .cloned()
            .collect())
    }

    async fn purge(
        &self,
        dispatched_before: DateTime<Utc>,
        processed_before: DateTime<Utc>,
    ) -> Result<PurgeStats> {
        let mut state = self.state.write().await;

        let outbox_before = state.outbox.len();
        state
            .outbox
            .retain(|e| !matches!(e.dispatched_at, Some(at) if at < dispatched_before));
        let inbox_before = state.inbox.len();
        state.inbox.retain(|_, at| *at >= processed_before);

        Ok(PurgeStats {
            outbox: (outbox_before - state.outbox.len()) as u64,
            inbox: (inbox_before - state.inbox.len()) as u64,
        })
    }
}
