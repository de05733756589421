//! Order saga states.

use serde::{Deserialize, Serialize};

/// The state of an order fulfillment saga.
///
/// State transitions:
/// ```text
/// Submitted ──► CreditChecking ──► PaymentProcessing ──► InventoryReservation ─┬─► ShippingProcessing ──► Completed
///                                                                             └─► Completed (digital only)
///
/// CreditChecking | PaymentProcessing | InventoryReservation | ShippingProcessing ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderState {
    /// Created, nothing requested yet.
    #[default]
    Submitted,

    /// Waiting for the credit check response.
    CreditChecking,

    /// Payment command issued.
    PaymentProcessing,

    /// Payment taken, inventory reservation issued.
    InventoryReservation,

    /// Inventory reserved, shipment issued.
    ShippingProcessing,

    /// Order fulfilled (terminal state).
    Completed,

    /// Order failed, compensations issued (terminal state).
    Failed,
}

impl OrderState {
    /// All states, in lifecycle order.
    pub const ALL: [OrderState; 7] = [
        OrderState::Submitted,
        OrderState::CreditChecking,
        OrderState::PaymentProcessing,
        OrderState::InventoryReservation,
        OrderState::ShippingProcessing,
        OrderState::Completed,
        OrderState::Failed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Completed | OrderState::Failed)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Submitted => "Submitted",
            OrderState::CreditChecking => "CreditChecking",
            OrderState::PaymentProcessing => "PaymentProcessing",
            OrderState::InventoryReservation => "InventoryReservation",
            OrderState::ShippingProcessing => "ShippingProcessing",
            OrderState::Completed => "Completed",
            OrderState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown order state: {0}")]
pub struct UnknownState(pub String);

impl std::str::FromStr for OrderState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}
