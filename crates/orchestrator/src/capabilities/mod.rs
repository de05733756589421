//! Simulated capabilities the saga coordinates, for tests and local runs.
//!
//! Each simulator consumes its queues on an [`InMemoryBus`] and publishes
//! a reply for every command it handles. Replies echo the request id of the
//! command they answer.

pub mod credit;
pub mod inventory;
pub mod payment;
pub mod shipping;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::MessageId;
use contracts::{Message, MessageEnvelope};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::{InMemoryBus, Transport};

pub use credit::{CreditBehavior, SimulatedCreditCheck};
pub use inventory::SimulatedInventory;
pub use payment::SimulatedPayment;
pub use shipping::SimulatedShipping;

/// A remote capability reachable over the bus.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Queues the capability consumes.
    fn queues(&self) -> Vec<&'static str>;

    /// Handles one command. Returns the reply to publish, if any.
    async fn handle(&self, envelope: &MessageEnvelope) -> Option<Message>;
}

/// How long a capability remembers the commands it handled.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Message ids seen within a sliding window.
#[derive(Debug)]
pub struct RecentIds {
    window: Duration,
    order: VecDeque<(Instant, MessageId)>,
    ids: HashSet<MessageId>,
}

impl RecentIds {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Records an id. Returns false if it was already seen within the window.
    pub fn insert(&mut self, id: MessageId) -> bool {
        let now = Instant::now();
        while let Some((seen_at, expired)) = self.order.front().copied() {
            if now.duration_since(seen_at) < self.window {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&expired);
        }

        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back((now, id));
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Consumes the capability's queues and publishes its replies.
///
/// Redelivered commands (same message id) are handled once within
/// [`DEFAULT_DEDUP_WINDOW`].
pub fn serve<C>(capability: C, bus: &InMemoryBus) -> Vec<JoinHandle<()>>
where
    C: Capability + 'static,
{
    serve_with_window(capability, bus, DEFAULT_DEDUP_WINDOW)
}

/// Like [`serve`], with an explicit deduplication window.
pub fn serve_with_window<C>(
    capability: C,
    bus: &InMemoryBus,
    dedup_window: Duration,
) -> Vec<JoinHandle<()>>
where
    C: Capability + 'static,
{
    let capability = Arc::new(capability);
    capability
        .queues()
        .into_iter()
        .map(|address| {
            let mut queue = bus.queue(address);
            let bus = bus.clone();
            let capability = Arc::clone(&capability);
            tokio::spawn(async move {
                let mut seen = RecentIds::new(dedup_window);
                while let Some(envelope) = queue.recv().await {
                    if !seen.insert(envelope.message_id) {
                        tracing::debug!(%address, message_id = %envelope.message_id, "duplicate command skipped");
                        continue;
                    }
                    let Some(reply) = capability.handle(&envelope).await else {
                        continue;
                    };
                    if let Err(e) = bus.publish(&envelope.reply(reply)).await {
                        tracing::warn!(%address, error = %e, "failed to publish reply");
                    }
                }
            })
        })
        .collect()
}

/// Starts the four simulated capabilities and returns their handles.
pub fn serve_all(
    credit: SimulatedCreditCheck,
    payment: SimulatedPayment,
    inventory: SimulatedInventory,
    shipping: SimulatedShipping,
    bus: &InMemoryBus,
) -> Vec<JoinHandle<()>> {
    let mut handles = serve(credit, bus);
    handles.extend(serve(payment, bus));
    handles.extend(serve(inventory, bus));
    handles.extend(serve(shipping, bus));
    handles
}
