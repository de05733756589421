//! Compensation controller: reverse actions for forward steps that took effect.

use contracts::addresses::{INVENTORY_RELEASE_QUEUE, PAYMENT_REFUND_QUEUE};
use contracts::{Message, RefundPayment, ReleaseInventory};
use saga_store::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::instance::OrderSaga;
use crate::machine::Effect;

/// A forward step whose effect can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForwardStep {
    /// Payment was taken (reference recorded).
    Payment,
    /// Inventory was reserved.
    Inventory,
}

impl ForwardStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardStep::Payment => "payment",
            ForwardStep::Inventory => "inventory",
        }
    }
}

impl std::fmt::Display for ForwardStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered reverse action.
#[derive(Debug, Clone)]
struct ReverseAction {
    step: ForwardStep,
    address: &'static str,
    build: fn(&OrderSaga) -> Message,
}

fn refund_payment(saga: &OrderSaga) -> Message {
    Message::RefundPayment(RefundPayment {
        correlation_key: saga.correlation_key,
        amount: saga.amount,
    })
}

fn release_inventory(saga: &OrderSaga) -> Message {
    Message::ReleaseInventory(ReleaseInventory {
        correlation_key: saga.correlation_key,
        item_ids: saga.item_ids.clone(),
    })
}

/// Registry of reverse actions, keyed by forward step.
///
/// Compensations are sent point-to-point with the forward retry policy. If
/// their delivery is exhausted the outbox entry is dead-lettered for
/// reconciliation; the saga still ends in `Failed`.
#[derive(Debug, Clone)]
pub struct CompensationController {
    actions: Vec<ReverseAction>,
    retry_policy: RetryPolicy,
}

impl CompensationController {
    /// Creates a controller with the order fulfillment reverse actions.
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            actions: vec![
                ReverseAction {
                    step: ForwardStep::Payment,
                    address: PAYMENT_REFUND_QUEUE,
                    build: refund_payment,
                },
                ReverseAction {
                    step: ForwardStep::Inventory,
                    address: INVENTORY_RELEASE_QUEUE,
                    build: release_inventory,
                },
            ],
            retry_policy,
        }
    }

    /// Plans compensation for every completed forward step, in reverse order
    /// of completion, and records each one as issued on the saga.
    ///
    /// Steps already compensated are skipped, so planning twice never issues
    /// a second reverse action.
    pub fn plan(&self, saga: &mut OrderSaga) -> Vec<Effect> {
        let steps: Vec<ForwardStep> = saga.completed_steps.iter().rev().copied().collect();
        let mut effects = Vec::new();

        for step in steps {
            if saga.compensations.contains(&step) {
                continue;
            }
            let Some(action) = self.actions.iter().find(|a| a.step == step) else {
                tracing::warn!(%step, "no reverse action registered");
                continue;
            };

            tracing::info!(
                correlation_key = %saga.correlation_key,
                %step,
                "compensation issued"
            );
            effects.push(Effect::Send {
                address: action.address.to_string(),
                message: (action.build)(saga),
                retry: Some(self.retry_policy.clone()),
            });
            saga.compensations.push(step);
        }

        effects
    }
}

impl Default for CompensationController {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
