//! Events and responses: facts reported by capabilities or the orchestrator.

use common::CorrelationKey;
use serde::{Deserialize, Serialize};

/// Response to a [`CreditCheckRequest`](crate::CreditCheckRequest).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCheckResult {
    pub correlation_key: CorrelationKey,
    pub approved: bool,
    /// Decline reason, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The credit check capability raised an unexpected error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCheckFault {
    pub correlation_key: CorrelationKey,
    /// Raw fault detail, preserved in the failure reason.
    pub message: String,
}

/// Synthesized when a credit check receives no response before its deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditCheckTimedOut {
    pub correlation_key: CorrelationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProcessed {
    pub correlation_key: CorrelationKey,
    /// Payment transaction reference assigned by the payment capability.
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub correlation_key: CorrelationKey,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRefunded {
    pub correlation_key: CorrelationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReserved {
    pub correlation_key: CorrelationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReservationFailed {
    pub correlation_key: CorrelationKey,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryReleased {
    pub correlation_key: CorrelationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingCompleted {
    pub correlation_key: CorrelationKey,
}

/// Terminal event: the transaction completed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionConfirmed {
    pub correlation_key: CorrelationKey,
}

/// Terminal event: the transaction failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFailed {
    pub correlation_key: CorrelationKey,
    pub reason: String,
}

/// Published for digital-only orders instead of shipping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalDelivery {
    pub correlation_key: CorrelationKey,
}

/// Synthesized when the retried handoff of an outbound command never succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetriesExhausted {
    pub correlation_key: CorrelationKey,
    /// Message type of the command that could not be delivered.
    pub message_type: String,
    pub attempts: u32,
    /// Last delivery error.
    pub reason: String,
}
