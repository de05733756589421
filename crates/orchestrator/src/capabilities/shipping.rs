//! Simulated shipping capability.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use contracts::addresses::SHIPPING_QUEUE;
use contracts::{Message, MessageEnvelope, ShippingCompleted};

use super::Capability;

#[derive(Debug, Default)]
struct ShippingState {
    shipments: usize,
    silent: bool,
}

/// In-memory shipping capability for testing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedShipping {
    state: Arc<RwLock<ShippingState>>,
}

impl SimulatedShipping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept shipping commands without ever reporting completion.
    pub fn set_silent(&self, silent: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .silent = silent;
    }

    pub fn shipment_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .shipments
    }
}

#[async_trait]
impl Capability for SimulatedShipping {
    fn queues(&self) -> Vec<&'static str> {
        vec![SHIPPING_QUEUE]
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Option<Message> {
        let Message::InitiateShipping(cmd) = &envelope.payload else {
            return None;
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.shipments += 1;
        if state.silent {
            return None;
        }
        Some(Message::ShippingCompleted(ShippingCompleted {
            correlation_key: cmd.correlation_key,
        }))
    }
}
