//! Outbox relay: hands committed outbound messages to the transport.
//!
//! The relay wakes up when the engine signals a commit, or at the poll
//! interval, and dispatches every undispatched outbox entry. Entries with a
//! retry policy are retried with backoff; once the policy is exhausted the
//! entry is dead-lettered. Each entry is claimed by message id while in
//! flight, so a backing-off entry never delays the entries of other sagas. An exhausted forward command is fed back into the
//! saga as a `RetriesExhausted` event so the saga can fail and compensate.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::MessageId;
use contracts::{Message, MessageEnvelope, RetriesExhausted as RetriesExhaustedEvent};
use saga_store::{Destination, OutboxEntry, PurgeStats, SagaStore};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinSet;

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::host::Delivery;
use crate::machine::reports_exhaustion;
use crate::retry::RetryExecutor;
use crate::transport::{Transport, TransportError};

/// Relay tunables.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub outbox_retention: Duration,
    pub dedup_window: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            poll_interval: config.relay_poll_interval,
            batch_size: config.relay_batch_size,
            outbox_retention: config.outbox_retention,
            dedup_window: config.dedup_window,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Counts from one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub dispatched: usize,
    /// Handoffs that failed and stay pending for the next pass.
    pub deferred: usize,
    pub dead_lettered: usize,
}

enum Handoff {
    Dispatched,
    Deferred,
    DeadLettered,
}

/// Dispatches outbox entries to a [`Transport`].
pub struct OutboxRelay<S, T> {
    store: S,
    transport: Arc<T>,
    inbound: mpsc::Sender<Delivery>,
    signal: Arc<Notify>,
    /// Entries currently being handed off, by message id.
    claims: Arc<Mutex<HashSet<MessageId>>>,
    settings: RelaySettings,
}

impl<S: Clone, T> Clone for OutboxRelay<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: Arc::clone(&self.transport),
            inbound: self.inbound.clone(),
            signal: Arc::clone(&self.signal),
            claims: Arc::clone(&self.claims),
            settings: self.settings.clone(),
        }
    }
}

impl<S, T> OutboxRelay<S, T>
where
    S: SagaStore + Clone + 'static,
    T: Transport + 'static,
{
    /// Creates a relay. Exhausted forward commands are fed into `inbound`.
    pub fn new(
        store: S,
        transport: T,
        inbound: mpsc::Sender<Delivery>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            store,
            transport: Arc::new(transport),
            inbound,
            signal: Arc::new(Notify::new()),
            claims: Arc::new(Mutex::new(HashSet::new())),
            settings,
        }
    }

    /// Handle used to wake the relay after a commit.
    pub fn signal(&self) -> Arc<Notify> {
        Arc::clone(&self.signal)
    }

    /// Dispatches one batch of undispatched entries.
    ///
    /// Entries already claimed by a concurrent pass are skipped. The rest are
    /// handed off concurrently; the pass returns once each of them is
    /// dispatched, deferred or dead-lettered.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayStats> {
        let entries = self.claim().await?;
        let mut stats = RelayStats::default();
        if entries.is_empty() {
            return Ok(stats);
        }

        let mut tasks = JoinSet::new();
        for entry in entries {
            let relay = self.clone();
            tasks.spawn(async move {
                let message_id = entry.message_id;
                let handoff = relay.dispatch(entry).await;
                relay.claims.lock().await.remove(&message_id);
                handoff
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Handoff::Dispatched)) => stats.dispatched += 1,
                Ok(Ok(Handoff::Deferred)) => stats.deferred += 1,
                Ok(Ok(Handoff::DeadLettered)) => stats.dead_lettered += 1,
                Ok(Err(e)) => {
                    stats.deferred += 1;
                    tracing::error!(error = %e, "failed to record outbox handoff");
                }
                Err(e) => tracing::error!(error = %e, "outbox dispatch task panicked"),
            }
        }

        tracing::debug!(?stats, "relay pass finished");
        Ok(stats)
    }

    /// Removes dispatched outbox entries past retention and inbox entries
    /// past the deduplication window.
    pub async fn purge(&self) -> Result<PurgeStats> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.settings.outbox_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let dedup = chrono::Duration::from_std(self.settings.dedup_window)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        let stats = self.store.purge(now - retention, now - dedup).await?;
        if stats.outbox > 0 || stats.inbox > 0 {
            tracing::info!(outbox = stats.outbox, inbox = stats.inbox, "purged expired entries");
        }
        Ok(stats)
    }

    /// Runs until the shutdown flag flips, starting a pass on every signal
    /// and poll tick. Passes run in the background and may overlap. Expired
    /// entries are purged on poll ticks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.signal.notified() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.purge().await {
                        tracing::warn!(error = %e, "outbox purge failed");
                    }
                }
            }

            let relay = self.clone();
            tokio::spawn(async move {
                if let Err(e) = relay.run_once().await {
                    tracing::error!(error = %e, "relay pass failed");
                }
            });
        }
        tracing::info!("outbox relay stopped");
    }

    /// Reads a batch and claims the entries no other pass is handing off.
    ///
    /// The claim set stays locked across the read so an entry released by a
    /// finished pass is only seen again if it is still undispatched.
    async fn claim(&self) -> Result<Vec<OutboxEntry>> {
        let mut claims = self.claims.lock().await;
        let entries = self.store.undispatched(self.settings.batch_size).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| claims.insert(entry.message_id))
            .collect())
    }

    async fn dispatch(&self, entry: OutboxEntry) -> Result<Handoff> {
        let envelope: MessageEnvelope = match serde_json::from_value(entry.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(message_id = %entry.message_id, error = %e, "undecodable outbox payload");
                self.store
                    .record_failure(entry.message_id, entry.attempts, &e.to_string(), true)
                    .await?;
                metrics::counter!("outbox_dead_lettered_total").increment(1);
                return Ok(Handoff::DeadLettered);
            }
        };

        let executor = entry
            .retry_policy
            .clone()
            .map(RetryExecutor::new)
            .unwrap_or_else(RetryExecutor::once);

        let transport = &*self.transport;
        let destination = &entry.destination;
        let message = &envelope;
        let result = executor
            .run(move |_| hand_off(transport, destination, message))
            .await;

        match result {
            Ok(((), attempts)) => {
                self.store
                    .mark_dispatched(entry.message_id, entry.attempts + attempts)
                    .await?;
                metrics::counter!("outbox_dispatched_total").increment(1);
                tracing::debug!(
                    message_id = %entry.message_id,
                    message_type = %entry.message_type,
                    destination = %entry.destination,
                    "outbox entry dispatched"
                );
                Ok(Handoff::Dispatched)
            }
            Err(exhausted) if entry.retry_policy.is_none() => {
                self.store
                    .record_failure(
                        entry.message_id,
                        entry.attempts + exhausted.attempts,
                        &exhausted.last_error.to_string(),
                        false,
                    )
                    .await?;
                metrics::counter!("outbox_handoff_failures_total").increment(1);
                tracing::warn!(
                    message_id = %entry.message_id,
                    error = %exhausted.last_error,
                    "outbox handoff failed, will retry"
                );
                Ok(Handoff::Deferred)
            }
            Err(exhausted) => {
                let attempts = entry.attempts + exhausted.attempts;
                let reason = exhausted.last_error.to_string();

                if reports_exhaustion(envelope.payload.kind()) {
                    self.report_exhaustion(&entry, attempts, &reason).await;
                } else {
                    tracing::error!(
                        correlation_key = %entry.correlation_key,
                        message_type = %entry.message_type,
                        attempts,
                        error = %reason,
                        "message dead-lettered, manual reconciliation required"
                    );
                }

                self.store
                    .record_failure(entry.message_id, attempts, &reason, true)
                    .await?;
                metrics::counter!("outbox_dead_lettered_total").increment(1);
                Ok(Handoff::DeadLettered)
            }
        }
    }

    /// Feeds a `RetriesExhausted` event for the saga that issued the entry.
    ///
    /// The event reuses the entry's message id, so reporting the same
    /// exhaustion twice is deduplicated by the inbox.
    async fn report_exhaustion(&self, entry: &OutboxEntry, attempts: u32, reason: &str) {
        let event = Message::RetriesExhausted(RetriesExhaustedEvent {
            correlation_key: entry.correlation_key,
            message_type: entry.message_type.clone(),
            attempts,
            reason: reason.to_string(),
        });
        let envelope = MessageEnvelope::builder(event)
            .message_id(entry.message_id)
            .header("source", "relay")
            .build();

        tracing::warn!(
            correlation_key = %entry.correlation_key,
            message_type = %entry.message_type,
            attempts,
            "command retries exhausted"
        );
        if self.inbound.send(Delivery::new(envelope)).await.is_err() {
            tracing::error!(
                correlation_key = %entry.correlation_key,
                "inbound closed, retries exhausted event dropped"
            );
        }
    }
}

async fn hand_off<T: Transport + ?Sized>(
    transport: &T,
    destination: &Destination,
    envelope: &MessageEnvelope,
) -> std::result::Result<(), TransportError> {
    match destination {
        Destination::Publish => transport.publish(envelope).await,
        Destination::Send { address } => transport.send(address, envelope).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationKey, MessageId};
    use contracts::MessageKind;
    use saga_store::{InMemorySagaStore, RetryPolicy, SagaCommit, SagaRecord, Version};

    use crate::transport::InMemoryBus;

    fn entry_for(message: Message, destination: Destination) -> OutboxEntry {
        let envelope = MessageEnvelope::new(message);
        OutboxEntry::new(
            envelope.message_id,
            envelope.correlation_key,
            envelope.message_type.clone(),
            destination,
            serde_json::to_value(&envelope).unwrap(),
        )
    }

    async fn stage(store: &InMemorySagaStore, key: CorrelationKey, entries: Vec<OutboxEntry>) {
        let record = SagaRecord::new(key, "PaymentProcessing", serde_json::json!({}));
        store
            .commit(SagaCommit::new(record, Version::initial()).with_outbox(entries))
            .await
            .unwrap();
    }

    fn relay_for(
        store: &InMemorySagaStore,
        bus: &InMemoryBus,
    ) -> (
        OutboxRelay<InMemorySagaStore, InMemoryBus>,
        mpsc::Receiver<Delivery>,
    ) {
        let (tx, rx) = mpsc::channel(8);
        let relay = OutboxRelay::new(store.clone(), bus.clone(), tx, RelaySettings::default());
        (relay, rx)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_dispatches_pending_entries() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let _payments = bus.queue("payment_queue");
        let key = CorrelationKey::new();

        stage(
            &store,
            key,
            vec![
                entry_for(Message::transaction_confirmed(key), Destination::Publish),
                entry_for(
                    Message::transaction_failed(key, "x"),
                    Destination::send("payment_queue"),
                ),
            ],
        )
        .await;

        let (relay, _rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();

        assert_eq!(stats.dispatched, 2);
        assert_eq!(bus.delivered().len(), 2);
        assert!(store.undispatched(10).await.unwrap().is_empty());

        // Nothing left for a second pass
        assert_eq!(relay.run_once().await.unwrap(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_from_transient_failure() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let _payments = bus.queue("payment_queue");
        let key = CorrelationKey::new();
        let entry = entry_for(
            Message::transaction_confirmed(key),
            Destination::send("payment_queue"),
        )
        .with_retry_policy(fast_retry());
        let id = entry.message_id;
        stage(&store, key, vec![entry]).await;

        bus.fail_next(2);
        let (relay, _rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();

        assert_eq!(stats.dispatched, 1);
        let stored = store.outbox_for(key).await.unwrap();
        assert_eq!(stored[0].message_id, id);
        assert_eq!(stored[0].attempts, 3);
        assert!(stored[0].is_dispatched());
    }

    #[tokio::test]
    async fn test_entry_without_policy_is_deferred() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        stage(
            &store,
            key,
            vec![entry_for(
                Message::transaction_confirmed(key),
                Destination::Publish,
            )],
        )
        .await;

        bus.fail_next(1);
        let (relay, _rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();
        assert_eq!(stats.deferred, 1);
        assert_eq!(store.undispatched(10).await.unwrap()[0].attempts, 1);

        let stats = relay.run_once().await.unwrap();
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_exhausted_forward_command_reports_to_saga() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        let command = Message::ProcessPayment(contracts::ProcessPayment {
            correlation_key: key,
            amount: common::Money::from_dollars(200),
        });
        // No consumer declared for the queue, so every handoff fails
        let entry =
            entry_for(command, Destination::send("payment_queue")).with_retry_policy(fast_retry());
        let id = entry.message_id;
        stage(&store, key, vec![entry]).await;

        let (relay, mut rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.message_id, id);
        match delivery.envelope.payload {
            Message::RetriesExhausted(event) => {
                assert_eq!(event.correlation_key, key);
                assert_eq!(event.message_type, "ProcessPayment");
                assert_eq!(event.attempts, 3);
                assert!(event.reason.contains("payment_queue"));
            }
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }

        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert!(store.undispatched(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_compensation_is_only_dead_lettered() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        let refund = Message::RefundPayment(contracts::RefundPayment {
            correlation_key: key,
            amount: common::Money::from_dollars(200),
        });
        stage(
            &store,
            key,
            vec![
                entry_for(refund, Destination::send("payment_refund_queue"))
                    .with_retry_policy(fast_retry()),
            ],
        )
        .await;

        let (relay, mut rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();

        assert_eq!(stats.dead_lettered, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            store.dead_letters().await.unwrap()[0].message_type,
            MessageKind::RefundPayment.as_str()
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        let entry = OutboxEntry::new(
            MessageId::new(),
            key,
            "ProcessPayment",
            Destination::Publish,
            serde_json::json!({"garbage": true}),
        );
        stage(&store, key, vec![entry]).await;

        let (relay, _rx) = relay_for(&store, &bus);
        let stats = relay.run_once().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert!(bus.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_backing_off_entry_does_not_delay_other_sagas() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let (tx, _rx) = mpsc::channel(8);
        let settings = RelaySettings {
            poll_interval: Duration::from_secs(3600),
            ..RelaySettings::default()
        };
        let relay = OutboxRelay::new(store.clone(), bus.clone(), tx, settings);
        let signal = relay.signal();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(shutdown_rx));

        // No consumer for the payment queue: every handoff fails and backs off
        let stuck = CorrelationKey::new();
        let command = Message::ProcessPayment(contracts::ProcessPayment {
            correlation_key: stuck,
            amount: common::Money::from_dollars(200),
        });
        stage(
            &store,
            stuck,
            vec![
                entry_for(command, Destination::send("payment_queue"))
                    .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(500))),
            ],
        )
        .await;
        signal.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let other = CorrelationKey::new();
        stage(
            &store,
            other,
            vec![entry_for(
                Message::transaction_confirmed(other),
                Destination::Publish,
            )],
        )
        .await;
        let started = std::time::Instant::now();
        signal.notify_one();

        let mut published = false;
        for _ in 0..100 {
            if bus
                .published()
                .iter()
                .any(|envelope| envelope.correlation_key == other)
            {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(published);
        assert!(started.elapsed() < Duration::from_millis(400));
        // The stuck command is still backing off
        assert!(store.dead_letters().await.unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_passes_hand_off_once() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        stage(
            &store,
            key,
            vec![entry_for(
                Message::transaction_confirmed(key),
                Destination::Publish,
            )],
        )
        .await;

        let (relay, _rx) = relay_for(&store, &bus);
        let (first, second) = tokio::join!(relay.run_once(), relay.run_once());

        assert_eq!(first.unwrap().dispatched + second.unwrap().dispatched, 1);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_on_signal() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        let key = CorrelationKey::new();
        let (tx, _rx) = mpsc::channel(8);
        let settings = RelaySettings {
            poll_interval: Duration::from_secs(3600),
            ..RelaySettings::default()
        };
        let relay = OutboxRelay::new(store.clone(), bus.clone(), tx, settings);
        let signal = relay.signal();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(shutdown_rx));

        stage(
            &store,
            key,
            vec![entry_for(
                Message::transaction_confirmed(key),
                Destination::Publish,
            )],
        )
        .await;
        signal.notify_one();

        let mut published = false;
        for _ in 0..100 {
            if !bus.published().is_empty() {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(published);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
