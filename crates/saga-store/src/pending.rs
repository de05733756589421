use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CorrelationKey;

/// An outstanding request awaiting a response, fault, or deadline.
///
/// At most one unresolved record exists per `(correlation_key, slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Request id carried on the request envelope and echoed by the response.
    pub request_id: Uuid,
    pub correlation_key: CorrelationKey,
    /// Logical request slot (e.g., "credit_check").
    pub slot: String,
    /// Address of the capability the request was sent to.
    pub capability: String,
    /// Message type the response is expected to have.
    pub expected_response: String,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl PendingRequest {
    /// Creates a pending request with a deadline `timeout` from now.
    pub fn new(
        correlation_key: CorrelationKey,
        slot: impl Into<String>,
        capability: impl Into<String>,
        expected_response: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let issued_at = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            correlation_key,
            slot: slot.into(),
            capability: capability.into(),
            expected_response: expected_response.into(),
            issued_at,
            deadline: issued_at + timeout,
        }
    }

    /// Returns true if the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Time left until the deadline, zero if already elapsed.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline - now).to_std().unwrap_or_default()
    }
}
