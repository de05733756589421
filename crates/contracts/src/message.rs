//! The closed set of messages understood by the orchestrator.

use common::CorrelationKey;
use serde::{Deserialize, Serialize};

use crate::commands::*;
use crate::events::*;

/// Trait for message contracts.
///
/// Messages are immutable facts or requests; every one of them belongs to
/// exactly one transaction.
pub trait Contract: Send + Sync + Clone {
    /// Returns the message type name, used for routing and storage.
    fn message_type(&self) -> &'static str;

    /// Returns the correlation key of the transaction this message belongs to.
    fn correlation_key(&self) -> CorrelationKey;
}

/// Every message exchanged by the saga, as a tagged union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    Initiate(Initiate),
    CreditCheckRequest(CreditCheckRequest),
    CreditCheckResult(CreditCheckResult),
    CreditCheckFault(CreditCheckFault),
    CreditCheckTimedOut(CreditCheckTimedOut),
    ProcessPayment(ProcessPayment),
    PaymentProcessed(PaymentProcessed),
    PaymentFailed(PaymentFailed),
    RefundPayment(RefundPayment),
    PaymentRefunded(PaymentRefunded),
    ReserveInventory(ReserveInventory),
    InventoryReserved(InventoryReserved),
    InventoryReservationFailed(InventoryReservationFailed),
    ReleaseInventory(ReleaseInventory),
    InventoryReleased(InventoryReleased),
    InitiateShipping(InitiateShipping),
    ShippingCompleted(ShippingCompleted),
    TransactionConfirmed(TransactionConfirmed),
    TransactionFailed(TransactionFailed),
    DigitalDelivery(DigitalDelivery),
    RetriesExhausted(RetriesExhausted),
}

/// Payload-free discriminant of [`Message`], used as a lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Initiate,
    CreditCheckRequest,
    CreditCheckResult,
    CreditCheckFault,
    CreditCheckTimedOut,
    ProcessPayment,
    PaymentProcessed,
    PaymentFailed,
    RefundPayment,
    PaymentRefunded,
    ReserveInventory,
    InventoryReserved,
    InventoryReservationFailed,
    ReleaseInventory,
    InventoryReleased,
    InitiateShipping,
    ShippingCompleted,
    TransactionConfirmed,
    TransactionFailed,
    DigitalDelivery,
    RetriesExhausted,
}

impl MessageKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Initiate => "Initiate",
            MessageKind::CreditCheckRequest => "CreditCheckRequest",
            MessageKind::CreditCheckResult => "CreditCheckResult",
            MessageKind::CreditCheckFault => "CreditCheckFault",
            MessageKind::CreditCheckTimedOut => "CreditCheckTimedOut",
            MessageKind::ProcessPayment => "ProcessPayment",
            MessageKind::PaymentProcessed => "PaymentProcessed",
            MessageKind::PaymentFailed => "PaymentFailed",
            MessageKind::RefundPayment => "RefundPayment",
            MessageKind::PaymentRefunded => "PaymentRefunded",
            MessageKind::ReserveInventory => "ReserveInventory",
            MessageKind::InventoryReserved => "InventoryReserved",
            MessageKind::InventoryReservationFailed => "InventoryReservationFailed",
            MessageKind::ReleaseInventory => "ReleaseInventory",
            MessageKind::InventoryReleased => "InventoryReleased",
            MessageKind::InitiateShipping => "InitiateShipping",
            MessageKind::ShippingCompleted => "ShippingCompleted",
            MessageKind::TransactionConfirmed => "TransactionConfirmed",
            MessageKind::TransactionFailed => "TransactionFailed",
            MessageKind::DigitalDelivery => "DigitalDelivery",
            MessageKind::RetriesExhausted => "RetriesExhausted",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Message {
    /// Returns the discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Initiate(_) => MessageKind::Initiate,
            Message::CreditCheckRequest(_) => MessageKind::CreditCheckRequest,
            Message::CreditCheckResult(_) => MessageKind::CreditCheckResult,
            Message::CreditCheckFault(_) => MessageKind::CreditCheckFault,
            Message::CreditCheckTimedOut(_) => MessageKind::CreditCheckTimedOut,
            Message::ProcessPayment(_) => MessageKind::ProcessPayment,
            Message::PaymentProcessed(_) => MessageKind::PaymentProcessed,
            Message::PaymentFailed(_) => MessageKind::PaymentFailed,
            Message::RefundPayment(_) => MessageKind::RefundPayment,
            Message::PaymentRefunded(_) => MessageKind::PaymentRefunded,
            Message::ReserveInventory(_) => MessageKind::ReserveInventory,
            Message::InventoryReserved(_) => MessageKind::InventoryReserved,
            Message::InventoryReservationFailed(_) => MessageKind::InventoryReservationFailed,
            Message::ReleaseInventory(_) => MessageKind::ReleaseInventory,
            Message::InventoryReleased(_) => MessageKind::InventoryReleased,
            Message::InitiateShipping(_) => MessageKind::InitiateShipping,
            Message::ShippingCompleted(_) => MessageKind::ShippingCompleted,
            Message::TransactionConfirmed(_) => MessageKind::TransactionConfirmed,
            Message::TransactionFailed(_) => MessageKind::TransactionFailed,
            Message::DigitalDelivery(_) => MessageKind::DigitalDelivery,
            Message::RetriesExhausted(_) => MessageKind::RetriesExhausted,
        }
    }
}

impl Contract for Message {
    fn message_type(&self) -> &'static str {
        self.kind().as_str()
    }

    fn correlation_key(&self) -> CorrelationKey {
        match self {
            Message::Initiate(m) => m.correlation_key,
            Message::CreditCheckRequest(m) => m.correlation_key,
            Message::CreditCheckResult(m) => m.correlation_key,
            Message::CreditCheckFault(m) => m.correlation_key,
            Message::CreditCheckTimedOut(m) => m.correlation_key,
            Message::ProcessPayment(m) => m.correlation_key,
            Message::PaymentProcessed(m) => m.correlation_key,
            Message::PaymentFailed(m) => m.correlation_key,
            Message::RefundPayment(m) => m.correlation_key,
            Message::PaymentRefunded(m) => m.correlation_key,
            Message::ReserveInventory(m) => m.correlation_key,
            Message::InventoryReserved(m) => m.correlation_key,
            Message::InventoryReservationFailed(m) => m.correlation_key,
            Message::ReleaseInventory(m) => m.correlation_key,
            Message::InventoryReleased(m) => m.correlation_key,
            Message::InitiateShipping(m) => m.correlation_key,
            Message::ShippingCompleted(m) => m.correlation_key,
            Message::TransactionConfirmed(m) => m.correlation_key,
            Message::TransactionFailed(m) => m.correlation_key,
            Message::DigitalDelivery(m) => m.correlation_key,
            Message::RetriesExhausted(m) => m.correlation_key,
        }
    }
}

// Convenience constructors
impl Message {
    /// Creates a TransactionFailed event.
    pub fn transaction_failed(correlation_key: CorrelationKey, reason: impl Into<String>) -> Self {
        Message::TransactionFailed(TransactionFailed {
            correlation_key,
            reason: reason.into(),
        })
    }

    /// Creates a TransactionConfirmed event.
    pub fn transaction_confirmed(correlation_key: CorrelationKey) -> Self {
        Message::TransactionConfirmed(TransactionConfirmed { correlation_key })
    }

    /// Creates a credit check response.
    pub fn credit_check_result(
        correlation_key: CorrelationKey,
        approved: bool,
        reason: Option<String>,
    ) -> Self {
        Message::CreditCheckResult(CreditCheckResult {
            correlation_key,
            approved,
            reason,
        })
    }
}
