//! Runtime host: inbound queue, worker pool, relay loop and timers.

use std::sync::Arc;
use std::time::Duration;

use contracts::MessageEnvelope;
use contracts::addresses::SAGA_QUEUE;
use futures_util::future::join_all;
use saga_store::SagaStore;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::engine::Engine;
use crate::error::Result;
use crate::notification::Notifier;
use crate::relay::{OutboxRelay, RelaySettings};
use crate::request::RequestCoordinator;
use crate::transport::{InMemoryBus, Transport, TransportError};

/// An inbound message together with its delivery attempt number.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: MessageEnvelope,
    /// 1 for the first delivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn new(envelope: MessageEnvelope) -> Self {
        Self {
            envelope,
            attempt: 1,
        }
    }

    /// The same message, delivered again.
    pub fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Redelivery {
    limit: u32,
    delay: Duration,
}

/// Hosts the engine on an [`InMemoryBus`].
///
/// Messages published to the saga's subscriptions or sent to
/// [`SAGA_QUEUE`] are pumped into a bounded inbound channel shared by a pool
/// of workers. A delivery whose handling fails is redelivered after a delay
/// until the redelivery limit is reached.
pub struct SagaHost<S> {
    engine: Engine<S>,
    relay: OutboxRelay<S, InMemoryBus>,
    bus: InMemoryBus,
    inbound: mpsc::Sender<Delivery>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> SagaHost<S>
where
    S: SagaStore + Clone + 'static,
{
    /// Wires the engine, relay and workers and starts them.
    ///
    /// Deadline timers of requests still pending in the store are re-armed
    /// before this returns.
    pub async fn start(
        store: S,
        bus: InMemoryBus,
        config: OrchestratorConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let relay = OutboxRelay::new(
            store.clone(),
            bus.clone(),
            inbound_tx.clone(),
            RelaySettings::from_config(&config),
        );
        let coordinator = RequestCoordinator::new(store.clone(), inbound_tx.clone());
        let engine = Engine::new(
            store,
            &config,
            coordinator.clone(),
            notifier,
            relay.signal(),
        );

        let saga_queue = bus.queue(SAGA_QUEUE);
        bus.subscribe(SAGA_QUEUE, &engine.machine().inbound_kinds());

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pump(
            saga_queue,
            inbound_tx.clone(),
            shutdown_rx.clone(),
        )));

        let receiver = Arc::new(Mutex::new(inbound_rx));
        let redelivery = Redelivery {
            limit: config.redelivery_limit.max(1),
            delay: config.redelivery_delay,
        };
        for worker in 0..config.workers.max(1) {
            tasks.push(tokio::spawn(work(
                worker,
                engine.clone(),
                Arc::clone(&receiver),
                inbound_tx.clone(),
                redelivery,
                shutdown_rx.clone(),
            )));
        }

        tasks.push(tokio::spawn(relay.clone().run(shutdown_rx)));

        coordinator.recover().await?;
        relay.signal().notify_one();

        tracing::info!(workers = config.workers.max(1), "saga host started");
        Ok(Self {
            engine,
            relay,
            bus,
            inbound: inbound_tx,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub fn relay(&self) -> &OutboxRelay<S, InMemoryBus> {
        &self.relay
    }

    pub fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    /// Sends a message to the saga's inbound queue.
    pub async fn submit(
        &self,
        envelope: &MessageEnvelope,
    ) -> std::result::Result<(), TransportError> {
        self.bus.send(SAGA_QUEUE, envelope).await
    }

    /// Delivers a message straight to the workers, bypassing the bus.
    pub async fn deliver(&self, envelope: MessageEnvelope) -> bool {
        self.inbound.send(Delivery::new(envelope)).await.is_ok()
    }

    /// Stops the pump, workers and relay and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "host task failed");
            }
        }
        tracing::info!("saga host stopped");
    }
}

async fn pump(
    mut queue: mpsc::UnboundedReceiver<MessageEnvelope>,
    inbound: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = queue.recv() => match received {
                Some(envelope) => {
                    if inbound.send(Delivery::new(envelope)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn work<S>(
    worker: usize,
    engine: Engine<S>,
    receiver: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    redeliver: mpsc::Sender<Delivery>,
    redelivery: Redelivery,
    mut shutdown: watch::Receiver<bool>,
) where
    S: SagaStore + Clone + 'static,
{
    loop {
        let delivery = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = shutdown.changed() => break,
                received = receiver.recv() => match received {
                    Some(delivery) => delivery,
                    None => break,
                },
            }
        };

        match engine.handle(&delivery.envelope).await {
            Ok(outcome) => tracing::debug!(worker, ?outcome, "delivery handled"),
            Err(e) if delivery.attempt < redelivery.limit => {
                tracing::warn!(
                    worker,
                    attempt = delivery.attempt,
                    message_id = %delivery.envelope.message_id,
                    error = %e,
                    "delivery failed, scheduling redelivery"
                );
                let sender = redeliver.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(redelivery.delay).await;
                    let _ = sender.send(delivery.next_attempt()).await;
                });
            }
            Err(e) => {
                metrics::counter!("saga_poisoned_messages_total").increment(1);
                tracing::error!(
                    worker,
                    attempts = delivery.attempt,
                    message_id = %delivery.envelope.message_id,
                    message_type = %delivery.envelope.message_type,
                    error = %e,
                    "delivery poisoned, dropping"
                );
            }
        }
    }
    tracing::debug!(worker, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationKey, CustomerId, Money};
    use contracts::{Initiate, Message};
    use saga_store::InMemorySagaStore;

    use crate::notification::InMemoryNotifier;
    use crate::state::OrderState;

    #[test]
    fn test_next_attempt_keeps_envelope() {
        let envelope = MessageEnvelope::new(Message::transaction_confirmed(CorrelationKey::new()));
        let delivery = Delivery::new(envelope.clone()).next_attempt();
        assert_eq!(delivery.attempt, 2);
        assert_eq!(delivery.envelope, envelope);
    }

    #[tokio::test]
    async fn test_submitted_message_reaches_engine() {
        let store = InMemorySagaStore::new();
        let bus = InMemoryBus::new();
        // Consumer for the credit check so the relay can hand the request off
        let _credit = bus.queue(contracts::addresses::CREDIT_CHECK_QUEUE);
        let host = SagaHost::start(
            store.clone(),
            bus.clone(),
            OrchestratorConfig::default(),
            Arc::new(InMemoryNotifier::new()),
        )
        .await
        .unwrap();

        let key = CorrelationKey::new();
        let initiate = MessageEnvelope::new(Message::Initiate(Initiate::new(
            key,
            CustomerId::new(),
            Money::from_dollars(200),
            false,
        )));
        host.submit(&initiate).await.unwrap();

        let mut state = None;
        for _ in 0..100 {
            state = host.engine().load(key).await.unwrap().map(|s| s.state);
            if state.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, Some(OrderState::CreditChecking));

        host.shutdown().await;
    }
}
