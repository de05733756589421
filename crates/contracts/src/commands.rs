//! Commands: messages that ask a capability (or the orchestrator) to act.

use common::{CorrelationKey, CustomerId, Money};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Initiating command that creates a new saga instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiate {
    /// The transaction being started.
    pub correlation_key: CorrelationKey,
    /// The customer placing the order.
    pub customer_id: CustomerId,
    /// Total order amount.
    pub amount: Money,
    /// Digital-only orders skip the shipping step.
    pub digital_only: bool,
    /// Items to reserve once payment succeeds.
    #[serde(default)]
    pub item_ids: Vec<Uuid>,
}

impl Initiate {
    /// Creates an Initiate command with no item list.
    pub fn new(
        correlation_key: CorrelationKey,
        customer_id: CustomerId,
        amount: Money,
        digital_only: bool,
    ) -> Self {
        Self {
            correlation_key,
            customer_id,
            amount,
            digital_only,
            item_ids: Vec::new(),
        }
    }

    /// Sets the items to reserve.
    pub fn with_items(mut self, item_ids: Vec<Uuid>) -> Self {
        self.item_ids = item_ids;
        self
    }
}

/// Request sent to the credit check capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCheckRequest {
    pub correlation_key: CorrelationKey,
    pub customer_id: CustomerId,
    pub amount: Money,
}

/// Asks the payment capability to charge the order amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessPayment {
    pub correlation_key: CorrelationKey,
    pub amount: Money,
}

/// Compensating command: refunds a previously processed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundPayment {
    pub correlation_key: CorrelationKey,
    pub amount: Money,
}

/// Asks the inventory capability to reserve the order items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveInventory {
    pub correlation_key: CorrelationKey,
    pub item_ids: Vec<Uuid>,
}

/// Compensating command: releases a previous reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInventory {
    pub correlation_key: CorrelationKey,
    pub item_ids: Vec<Uuid>,
}

/// Asks the shipping capability to ship the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiateShipping {
    pub correlation_key: CorrelationKey,
}
