//! Simulated payment capability.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::{CorrelationKey, Money};
use contracts::addresses::{PAYMENT_QUEUE, PAYMENT_REFUND_QUEUE};
use contracts::{Message, MessageEnvelope, PaymentFailed, PaymentProcessed, PaymentRefunded};

use super::Capability;

#[derive(Debug, Default)]
struct PaymentState {
    payments: HashMap<String, (CorrelationKey, Money)>,
    next_id: u32,
    refunds: usize,
    fail_on_charge: bool,
}

/// In-memory payment capability for testing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedPayment {
    state: Arc<RwLock<PaymentState>>,
}

impl SimulatedPayment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the capability to decline every charge.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_charge = fail;
    }

    /// Returns the number of charges made, refunded or not.
    pub fn payment_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .payments
            .len()
    }

    pub fn refund_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refunds
    }
}

#[async_trait]
impl Capability for SimulatedPayment {
    fn queues(&self) -> Vec<&'static str> {
        vec![PAYMENT_QUEUE, PAYMENT_REFUND_QUEUE]
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Option<Message> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &envelope.payload {
            Message::ProcessPayment(cmd) if state.fail_on_charge => {
                Some(Message::PaymentFailed(PaymentFailed {
                    correlation_key: cmd.correlation_key,
                    reason: "Payment declined".to_string(),
                }))
            }
            Message::ProcessPayment(cmd) => {
                state.next_id += 1;
                let reference = format!("PAY-{:04}", state.next_id);
                state
                    .payments
                    .insert(reference.clone(), (cmd.correlation_key, cmd.amount));
                Some(Message::PaymentProcessed(PaymentProcessed {
                    correlation_key: cmd.correlation_key,
                    reference,
                }))
            }
            Message::RefundPayment(cmd) => {
                state.refunds += 1;
                Some(Message::PaymentRefunded(PaymentRefunded {
                    correlation_key: cmd.correlation_key,
                }))
            }
            _ => None,
        }
    }
}
