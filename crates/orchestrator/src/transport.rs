//! Message transport abstraction and an in-process bus.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use contracts::{MessageEnvelope, MessageKind};
use saga_store::Destination;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur when handing a message to the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("Queue closed: {0}")]
    Closed(String),
}

/// Trait for message transports.
///
/// Delivery is at-least-once: a message handed off successfully may still be
/// delivered more than once, and consumers deduplicate by message id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes an event to every subscriber of its message type.
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), TransportError>;

    /// Sends a message to a single named queue.
    async fn send(&self, address: &str, envelope: &MessageEnvelope) -> Result<(), TransportError>;
}

/// Handoffs kept for inspection by [`InMemoryBus::new`].
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug)]
struct BusState {
    queues: HashMap<String, mpsc::UnboundedSender<MessageEnvelope>>,
    subscriptions: HashMap<MessageKind, Vec<String>>,
    delivered: VecDeque<(Destination, MessageEnvelope)>,
    history_limit: usize,
    fail_next: u32,
}

impl BusState {
    fn record(&mut self, destination: Destination, envelope: &MessageEnvelope) {
        if self.history_limit == 0 {
            return;
        }
        if self.delivered.len() == self.history_limit {
            self.delivered.pop_front();
        }
        self.delivered.push_back((destination, envelope.clone()));
    }
}

/// In-process bus with named queues and type-based subscriptions.
///
/// The most recent handoffs are kept for inspection, up to the history
/// limit. Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl InMemoryBus {
    /// Creates a new empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus that remembers at most `limit` handoffs. A limit of
    /// zero disables the history.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                queues: HashMap::new(),
                subscriptions: HashMap::new(),
                delivered: VecDeque::new(),
                history_limit: limit,
                fail_next: 0,
            })),
        }
    }

    /// Declares a queue and returns its consumer end.
    ///
    /// Declaring an existing address replaces the previous consumer.
    pub fn queue(&self, address: &str) -> mpsc::UnboundedReceiver<MessageEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().queues.insert(address.to_string(), tx);
        rx
    }

    /// Routes published messages of the given kinds to a queue.
    pub fn subscribe(&self, address: &str, kinds: &[MessageKind]) {
        let mut state = self.lock();
        for kind in kinds {
            let subscribers = state.subscriptions.entry(*kind).or_default();
            if !subscribers.iter().any(|a| a == address) {
                subscribers.push(address.to_string());
            }
        }
    }

    /// Makes the next `n` handoffs fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Returns the recorded handoffs, oldest first.
    pub fn delivered(&self) -> Vec<(Destination, MessageEnvelope)> {
        self.lock().delivered.iter().cloned().collect()
    }

    /// Returns the messages published so far.
    pub fn published(&self) -> Vec<MessageEnvelope> {
        self.lock()
            .delivered
            .iter()
            .filter(|(destination, _)| *destination == Destination::Publish)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Returns the messages sent to an address so far.
    pub fn sent_to(&self, address: &str) -> Vec<MessageEnvelope> {
        self.lock()
            .delivered
            .iter()
            .filter(|(destination, _)| {
                matches!(destination, Destination::Send { address: a } if a == address)
            })
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(state: &mut BusState) -> Result<(), TransportError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;

        let kind = envelope.payload.kind();
        let subscribers = state.subscriptions.get(&kind).cloned().unwrap_or_default();
        for address in subscribers {
            match state.queues.get(&address) {
                Some(queue) if queue.send(envelope.clone()).is_ok() => {}
                _ => tracing::debug!(%address, %kind, "subscriber queue unavailable"),
            }
        }

        state.record(Destination::Publish, envelope);
        Ok(())
    }

    async fn send(&self, address: &str, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;

        let queue = state
            .queues
            .get(address)
            .ok_or_else(|| TransportError::UnknownAddress(address.to_string()))?;
        queue
            .send(envelope.clone())
            .map_err(|_| TransportError::Closed(address.to_string()))?;

        state.record(Destination::send(address), envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationKey;
    use contracts::Message;

    fn confirmed() -> MessageEnvelope {
        MessageEnvelope::new(Message::transaction_confirmed(CorrelationKey::new()))
    }

    #[tokio::test]
    async fn test_send_delivers_to_queue() {
        let bus = InMemoryBus::new();
        let mut rx = bus.queue("payment_queue");
        let envelope = confirmed();

        bus.send("payment_queue", &envelope).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), envelope);
        assert_eq!(bus.sent_to("payment_queue"), vec![envelope]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_address_fails() {
        let bus = InMemoryBus::new();
        let result = bus.send("nowhere", &confirmed()).await;
        assert!(matches!(result, Err(TransportError::UnknownAddress(a)) if a == "nowhere"));
        assert!(bus.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let bus = InMemoryBus::new();
        let mut audit = bus.queue("audit");
        let mut billing = bus.queue("billing");
        bus.subscribe("audit", &[MessageKind::TransactionConfirmed]);
        bus.subscribe("billing", &[MessageKind::TransactionConfirmed]);

        let envelope = confirmed();
        bus.publish(&envelope).await.unwrap();

        assert_eq!(audit.recv().await.unwrap(), envelope);
        assert_eq!(billing.recv().await.unwrap(), envelope);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryBus::new();
        bus.publish(&confirmed()).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let bus = InMemoryBus::new();
        let _rx = bus.queue("q");
        bus.fail_next(2);

        assert!(matches!(
            bus.send("q", &confirmed()).await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(bus.publish(&confirmed()).await.is_err());
        assert!(bus.send("q", &confirmed()).await.is_ok());
        assert_eq!(bus.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_most_recent_handoffs() {
        let bus = InMemoryBus::with_history_limit(2);
        let first = confirmed();
        let second = confirmed();
        let third = confirmed();
        for envelope in [&first, &second, &third] {
            bus.publish(envelope).await.unwrap();
        }

        assert_eq!(bus.published(), vec![second, third]);
    }

    #[tokio::test]
    async fn test_history_disabled() {
        let bus = InMemoryBus::with_history_limit(0);
        let mut rx = bus.queue("q");
        let envelope = confirmed();

        bus.send("q", &envelope).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), envelope);
        assert!(bus.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let bus = InMemoryBus::new();
        drop(bus.queue("q"));
        assert!(matches!(
            bus.send("q", &confirmed()).await,
            Err(TransportError::Closed(_))
        ));
    }
}
