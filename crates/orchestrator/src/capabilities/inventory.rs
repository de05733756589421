//! Simulated inventory capability.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use contracts::addresses::{INVENTORY_QUEUE, INVENTORY_RELEASE_QUEUE};
use contracts::{
    InventoryReleased, InventoryReservationFailed, InventoryReserved, Message, MessageEnvelope,
};

use super::Capability;

#[derive(Debug, Default)]
struct InventoryState {
    reservations: usize,
    releases: usize,
    fail_on_reserve: bool,
}

/// In-memory inventory capability for testing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedInventory {
    state: Arc<RwLock<InventoryState>>,
}

impl SimulatedInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the capability to reject every reservation.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_reserve = fail;
    }

    pub fn reservation_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reservations
    }

    pub fn release_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .releases
    }
}

#[async_trait]
impl Capability for SimulatedInventory {
    fn queues(&self) -> Vec<&'static str> {
        vec![INVENTORY_QUEUE, INVENTORY_RELEASE_QUEUE]
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Option<Message> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &envelope.payload {
            Message::ReserveInventory(cmd) if state.fail_on_reserve => Some(
                Message::InventoryReservationFailed(InventoryReservationFailed {
                    correlation_key: cmd.correlation_key,
                    reason: "Insufficient stock".to_string(),
                }),
            ),
            Message::ReserveInventory(cmd) => {
                state.reservations += 1;
                Some(Message::InventoryReserved(InventoryReserved {
                    correlation_key: cmd.correlation_key,
                }))
            }
            Message::ReleaseInventory(cmd) => {
                state.releases += 1;
                Some(Message::InventoryReleased(InventoryReleased {
                    correlation_key: cmd.correlation_key,
                }))
            }
            _ => None,
        }
    }
}
