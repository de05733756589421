//! Message contracts for the order fulfillment saga.
//!
//! This crate defines the typed, immutable messages exchanged between the
//! orchestrator and the capabilities it coordinates:
//! - Commands sent to capabilities (`ProcessPayment`, `ReserveInventory`, ...)
//! - Events and responses published by capabilities (`PaymentProcessed`, ...)
//! - Terminal observability events published by the orchestrator
//! - [`MessageEnvelope`], the wire envelope carrying identity and correlation
//!
//! Every message carries the [`CorrelationKey`] of the transaction it belongs to.

pub mod addresses;
pub mod commands;
pub mod envelope;
pub mod events;
pub mod message;

pub use common::{CorrelationKey, CustomerId, MessageId, Money};
pub use commands::{
    CreditCheckRequest, Initiate, InitiateShipping, ProcessPayment, RefundPayment,
    ReleaseInventory, ReserveInventory,
};
pub use envelope::{MessageEnvelope, MessageEnvelopeBuilder};
pub use events::{
    CreditCheckFault, CreditCheckResult, CreditCheckTimedOut, DigitalDelivery, InventoryReleased,
    InventoryReservationFailed, InventoryReserved, PaymentFailed, PaymentProcessed,
    PaymentRefunded, RetriesExhausted, ShippingCompleted, TransactionConfirmed, TransactionFailed,
};
pub use message::{Contract, Message, MessageKind};
