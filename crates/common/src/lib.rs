//! Shared identifiers and value objects.
//!
//! Every message and every persisted record in the workspace is keyed by the
//! types defined here, so they live in a leaf crate with no async or storage
//! dependencies.

mod money;
mod types;

pub use money::Money;
pub use types::{CorrelationKey, CustomerId, MessageId};
