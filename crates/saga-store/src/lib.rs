//! Durable storage for saga instances.
//!
//! The store keeps one [`SagaRecord`] per correlation key and applies every
//! change through a single atomic [`SagaCommit`] that carries:
//! - the new record version, checked against the expected version
//! - outbound messages staged in the outbox
//! - pending request records issued or resolved by the transition
//! - the inbound message id recorded in the inbox for deduplication
//!
//! Two backends are provided: [`InMemorySagaStore`] and [`PostgresSagaStore`].

pub mod commit;
pub mod error;
pub mod memory;
pub mod outbox;
pub mod pending;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{CorrelationKey, MessageId};
pub use commit::SagaCommit;
pub use error::{Result, SagaStoreError};
pub use memory::InMemorySagaStore;
pub use outbox::{Backoff, Destination, OutboxEntry, RetryPolicy};
pub use pending::PendingRequest;
pub use postgres::PostgresSagaStore;
pub use record::{SagaRecord, Version};
pub use store::{PurgeStats, SagaStore};
