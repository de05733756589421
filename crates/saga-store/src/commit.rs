use uuid::Uuid;

use crate::{MessageId, OutboxEntry, PendingRequest, SagaRecord, Version};

/// One atomic unit of change for a saga.
///
/// Everything in a commit is applied together or not at all. The commit
/// fails with a concurrency conflict if the stored version differs from
/// `expected_version`.
#[derive(Debug, Clone)]
pub struct SagaCommit {
    /// The new record. Its version is assigned by the store.
    pub record: SagaRecord,
    /// Version the record was loaded at; `Version::initial()` for a new saga.
    pub expected_version: Version,
    pub outbox: Vec<OutboxEntry>,
    pub issued: Vec<PendingRequest>,
    /// Request ids of pending records resolved by this transition.
    pub resolved: Vec<Uuid>,
    /// Inbound message recorded in the inbox.
    pub processed: Option<MessageId>,
}

impl SagaCommit {
    pub fn new(record: SagaRecord, expected_version: Version) -> Self {
        Self {
            record,
            expected_version,
            outbox: Vec::new(),
            issued: Vec::new(),
            resolved: Vec::new(),
            processed: None,
        }
    }

    pub fn with_outbox(mut self, entries: impl IntoIterator<Item = OutboxEntry>) -> Self {
        self.outbox.extend(entries);
        self
    }

    pub fn issue(mut self, request: PendingRequest) -> Self {
        self.issued.push(request);
        self
    }

    pub fn resolve(mut self, request_id: Uuid) -> Self {
        self.resolved.push(request_id);
        self
    }

    pub fn processed(mut self, message_id: MessageId) -> Self {
        self.processed = Some(message_id);
        self
    }

    /// The version the record will have once committed.
    pub fn next_version(&self) -> Version {
        self.expected_version.next()
    }
}
