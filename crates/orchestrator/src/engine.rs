//! Saga engine: dispatches inbound messages to saga instances.
//!
//! Handling one message is a load, evaluate, commit cycle. The commit
//! carries the new saga version, the outbound messages, the pending request
//! changes and the inbound message id, so a message either takes full effect
//! once or none at all. A concurrent writer on the same saga makes the
//! commit fail with a version conflict; the engine then reloads and
//! re-evaluates.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::CorrelationKey;
use contracts::{Message, MessageEnvelope, MessageKind};
use saga_store::{
    Destination, OutboxEntry, PendingRequest, RetryPolicy, SagaCommit, SagaStore, SagaStoreError,
    Version,
};
use tokio::sync::Notify;

use crate::config::OrchestratorConfig;
use crate::error::{EngineError, Result};
use crate::instance::OrderSaga;
use crate::machine::{Effect, StateMachine};
use crate::notification::{Notification, Notifier};
use crate::request::{self, RequestCoordinator, Resolution};
use crate::state::OrderState;

/// Why a message was acknowledged without changing the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No saga exists for the key and the message does not create one.
    UnknownInstance,
    /// The saga already reached a terminal state.
    Terminal(OrderState),
    /// A response whose request is no longer pending (late or stale).
    UnmatchedResponse,
    /// The transition table has no applicable entry.
    NoTransition,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A transition fired and was committed.
    Applied {
        from: OrderState,
        to: OrderState,
        version: Version,
    },
    /// The message id was already processed.
    Duplicate,
    /// The message was acknowledged as a no-op.
    Ignored(IgnoreReason),
}

/// Dispatches inbound messages to order sagas.
pub struct Engine<S> {
    store: S,
    machine: Arc<StateMachine>,
    coordinator: RequestCoordinator<S>,
    notifier: Arc<dyn Notifier>,
    relay_signal: Arc<Notify>,
    max_conflict_retries: u32,
}

impl<S: Clone> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            machine: Arc::clone(&self.machine),
            coordinator: self.coordinator.clone(),
            notifier: Arc::clone(&self.notifier),
            relay_signal: Arc::clone(&self.relay_signal),
            max_conflict_retries: self.max_conflict_retries,
        }
    }
}

impl<S> Engine<S>
where
    S: SagaStore + Clone + 'static,
{
    /// Creates an engine.
    ///
    /// `relay_signal` is notified after every commit that staged outbound
    /// messages.
    pub fn new(
        store: S,
        config: &OrchestratorConfig,
        coordinator: RequestCoordinator<S>,
        notifier: Arc<dyn Notifier>,
        relay_signal: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            machine: Arc::new(StateMachine::from_config(config)),
            coordinator,
            notifier,
            relay_signal,
            max_conflict_retries: config.max_conflict_retries.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Loads the current state of a saga.
    pub async fn load(&self, correlation_key: CorrelationKey) -> Result<Option<OrderSaga>> {
        match self.store.load(correlation_key).await? {
            Some(record) => Ok(Some(OrderSaga::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Handles one inbound message.
    ///
    /// Version conflicts are retried up to the configured bound by
    /// reloading the saga and re-evaluating the message.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            correlation_key = %envelope.correlation_key,
            message_type = %envelope.message_type,
            message_id = %envelope.message_id
        )
    )]
    pub async fn handle(&self, envelope: &MessageEnvelope) -> Result<Outcome> {
        let start = Instant::now();
        metrics::counter!("saga_messages_total", "message_type" => envelope.message_type.clone())
            .increment(1);

        if self.store.is_processed(envelope.message_id).await? {
            metrics::counter!("saga_duplicates_total").increment(1);
            tracing::debug!("message already processed");
            return Ok(Outcome::Duplicate);
        }

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.try_handle(envelope).await {
                Ok(outcome) => break outcome,
                Err(EngineError::Store(SagaStoreError::DuplicateMessage(_))) => {
                    metrics::counter!("saga_duplicates_total").increment(1);
                    break Outcome::Duplicate;
                }
                Err(EngineError::Store(e)) if e.is_conflict() => {
                    metrics::counter!("saga_concurrency_conflicts_total").increment(1);
                    if attempt >= self.max_conflict_retries {
                        return Err(EngineError::ConflictRetriesExhausted {
                            correlation_key: envelope.correlation_key,
                            attempts: attempt,
                        });
                    }
                    tracing::debug!(attempt, error = %e, "version conflict, reloading");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        };

        metrics::histogram!("saga_dispatch_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        if let Outcome::Ignored(reason) = outcome {
            metrics::counter!("saga_ignored_total").increment(1);
            tracing::debug!(?reason, "message ignored");
        }
        Ok(outcome)
    }

    async fn try_handle(&self, envelope: &MessageEnvelope) -> Result<Outcome> {
        let key = envelope.correlation_key;
        let saga = match self.store.load(key).await? {
            Some(record) => OrderSaga::from_record(&record)?,
            None if envelope.payload.kind() == MessageKind::Initiate => OrderSaga::new(key),
            None => return Ok(Outcome::Ignored(IgnoreReason::UnknownInstance)),
        };

        if saga.state.is_terminal() {
            return Ok(Outcome::Ignored(IgnoreReason::Terminal(saga.state)));
        }

        let matched = match self.coordinator.resolve(envelope).await? {
            Resolution::NotAResponse => None,
            Resolution::Matched(pending) => Some(pending),
            Resolution::Unmatched => return Ok(Outcome::Ignored(IgnoreReason::UnmatchedResponse)),
        };

        let Some(step) = self.machine.evaluate(&saga, &envelope.payload) else {
            return Ok(Outcome::Ignored(IgnoreReason::NoTransition));
        };

        let mut next = step.saga;
        next.updated_at = Utc::now();

        let mut commit =
            SagaCommit::new(next.to_record()?, saga.version).processed(envelope.message_id);
        if let Some(pending) = &matched {
            commit = commit.resolve(pending.request_id);
        }

        let mut outbox = Vec::new();
        let mut issued: Vec<PendingRequest> = Vec::new();
        let mut notifications: Vec<Notification> = Vec::new();
        for effect in step.effects {
            match effect {
                Effect::Publish(message) => {
                    outbox.push(stage(message, Destination::Publish, None, envelope)?);
                }
                Effect::Send {
                    address,
                    message,
                    retry,
                } => {
                    outbox.push(stage(message, Destination::send(address), retry, envelope)?);
                }
                Effect::Request {
                    slot,
                    address,
                    message,
                    timeout,
                } => {
                    let (pending, request) =
                        request::issue(slot, &address, message, timeout, envelope.message_id);
                    outbox.push(outbox_entry(&request, Destination::send(address), None)?);
                    issued.push(pending);
                }
                Effect::Notify(notification) => notifications.push(notification),
            }
        }

        let staged = !outbox.is_empty();
        commit = commit.with_outbox(outbox);
        for pending in &issued {
            commit = commit.issue(pending.clone());
        }

        let version = self.store.commit(commit).await?;

        for pending in issued {
            self.coordinator.arm(pending);
        }
        if staged {
            self.relay_signal.notify_one();
        }
        for notification in notifications {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(notification).await {
                    tracing::warn!(error = %e, "notification failed");
                }
            });
        }

        metrics::counter!(
            "saga_transitions_total",
            "from" => step.from.as_str(),
            "to" => step.to.as_str()
        )
        .increment(1);
        match step.to {
            OrderState::Completed => metrics::counter!("saga_completed_total").increment(1),
            OrderState::Failed => metrics::counter!("saga_failed_total").increment(1),
            _ => {}
        }
        tracing::info!(
            from = %step.from,
            to = %step.to,
            transition = step.transition,
            %version,
            "saga transitioned"
        );

        Ok(Outcome::Applied {
            from: step.from,
            to: step.to,
            version,
        })
    }
}

/// Wraps a message produced by a transition in an envelope caused by the
/// inbound message and turns it into an outbox entry.
fn stage(
    message: Message,
    destination: Destination,
    retry: Option<RetryPolicy>,
    cause: &MessageEnvelope,
) -> Result<OutboxEntry> {
    let envelope = MessageEnvelope::builder(message)
        .header("causation_id", cause.message_id.to_string())
        .build();
    outbox_entry(&envelope, destination, retry)
}

fn outbox_entry(
    envelope: &MessageEnvelope,
    destination: Destination,
    retry: Option<RetryPolicy>,
) -> Result<OutboxEntry> {
    let entry = OutboxEntry::new(
        envelope.message_id,
        envelope.correlation_key,
        envelope.message_type.clone(),
        destination,
        serde_json::to_value(envelope)?,
    );
    Ok(match retry {
        Some(policy) => entry.with_retry_policy(policy),
        None => entry,
    })
}
