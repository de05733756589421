//! Queue addresses of the saga and its capabilities.

/// Inbound queue consumed by the orchestrator.
pub const SAGA_QUEUE: &str = "order-saga-queue";

/// Credit check request queue.
pub const CREDIT_CHECK_QUEUE: &str = "credit_check_service_queue";

/// Payment command queue.
pub const PAYMENT_QUEUE: &str = "payment_queue";

/// Payment refund (compensation) queue.
pub const PAYMENT_REFUND_QUEUE: &str = "payment_refund_queue";

/// Inventory reservation queue.
pub const INVENTORY_QUEUE: &str = "inventory_queue";

/// Inventory release (compensation) queue.
pub const INVENTORY_RELEASE_QUEUE: &str = "inventory_release_queue";

/// Shipping command queue.
pub const SHIPPING_QUEUE: &str = "shipping_queue";
