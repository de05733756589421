//! The order saga instance and its storage mapping.

use chrono::{DateTime, Utc};
use common::{CorrelationKey, CustomerId, Money};
use saga_store::{SagaRecord, Version};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compensation::ForwardStep;
use crate::error::{EngineError, Result};
use crate::state::OrderState;

/// One order fulfillment transaction.
///
/// Loaded from a [`SagaRecord`], mutated by exactly one transition, and
/// written back as the next record version.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSaga {
    pub correlation_key: CorrelationKey,
    pub state: OrderState,
    /// Version the saga was loaded at.
    pub version: Version,
    pub customer_id: Option<CustomerId>,
    pub amount: Money,
    pub digital_only: bool,
    pub item_ids: Vec<Uuid>,
    pub payment_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Forward steps that have taken effect, in completion order.
    pub completed_steps: Vec<ForwardStep>,
    /// Forward steps whose compensation has been issued.
    pub compensations: Vec<ForwardStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The business payload persisted as the record's JSON data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct OrderData {
    customer_id: Option<CustomerId>,
    amount: Money,
    digital_only: bool,
    item_ids: Vec<Uuid>,
    payment_reference: Option<String>,
    failure_reason: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    completed_steps: Vec<ForwardStep>,
    compensations: Vec<ForwardStep>,
}

impl OrderSaga {
    /// Creates a saga that has not been committed yet.
    pub fn new(correlation_key: CorrelationKey) -> Self {
        let now = Utc::now();
        Self {
            correlation_key,
            state: OrderState::Submitted,
            version: Version::initial(),
            customer_id: None,
            amount: Money::zero(),
            digital_only: false,
            item_ids: Vec::new(),
            payment_reference: None,
            failure_reason: None,
            submitted_at: None,
            completed_steps: Vec::new(),
            compensations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds a saga from its stored record.
    pub fn from_record(record: &SagaRecord) -> Result<Self> {
        let invalid = |reason: String| EngineError::InvalidRecord {
            correlation_key: record.correlation_key,
            reason,
        };

        let state = record
            .state
            .parse::<OrderState>()
            .map_err(|e| invalid(e.to_string()))?;
        let data: OrderData =
            serde_json::from_value(record.data.clone()).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            correlation_key: record.correlation_key,
            state,
            version: record.version,
            customer_id: data.customer_id,
            amount: data.amount,
            digital_only: data.digital_only,
            item_ids: data.item_ids,
            payment_reference: data.payment_reference,
            failure_reason: data.failure_reason,
            submitted_at: data.submitted_at,
            completed_steps: data.completed_steps,
            compensations: data.compensations,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Converts the saga into a record for committing.
    pub fn to_record(&self) -> Result<SagaRecord> {
        let data = OrderData {
            customer_id: self.customer_id,
            amount: self.amount,
            digital_only: self.digital_only,
            item_ids: self.item_ids.clone(),
            payment_reference: self.payment_reference.clone(),
            failure_reason: self.failure_reason.clone(),
            submitted_at: self.submitted_at,
            completed_steps: self.completed_steps.clone(),
            compensations: self.compensations.clone(),
        };

        Ok(SagaRecord {
            correlation_key: self.correlation_key,
            state: self.state.as_str().to_string(),
            version: self.version,
            data: serde_json::to_value(data)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    /// Returns true once the saga has been committed.
    pub fn exists(&self) -> bool {
        self.version > Version::initial()
    }

    /// Records that a forward step took effect.
    pub fn complete_step(&mut self, step: ForwardStep) {
        if !self.completed_steps.contains(&step) {
            self.completed_steps.push(step);
        }
    }

    /// Returns true if the forward step has taken effect.
    pub fn has_completed(&self, step: ForwardStep) -> bool {
        self.completed_steps.contains(&step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_saga_is_submitted_and_uncommitted() {
        let saga = OrderSaga::new(CorrelationKey::new());
        assert_eq!(saga.state, OrderState::Submitted);
        assert!(!saga.exists());
        assert!(saga.completed_steps.is_empty());
    }

    #[test]
    fn test_record_mapping_preserves_business_fields() {
        let mut saga = OrderSaga::new(CorrelationKey::new());
        saga.state = OrderState::InventoryReservation;
        saga.customer_id = Some(CustomerId::new());
        saga.amount = Money::from_cents(125_050);
        saga.item_ids = vec![Uuid::new_v4()];
        saga.payment_reference = Some("PAY-0001".to_string());
        saga.submitted_at = Some(Utc::now());
        saga.complete_step(ForwardStep::Payment);

        let record = saga.to_record().unwrap();
        assert_eq!(record.state, "InventoryReservation");
        assert_eq!(record.data["amount"], 125_050);

        let restored = OrderSaga::from_record(&record).unwrap();
        assert_eq!(restored, saga);
    }

    #[test]
    fn test_unknown_state_is_invalid_record() {
        let key = CorrelationKey::new();
        let record = SagaRecord::new(key, "Shipped", serde_json::json!({}));

        let result = OrderSaga::from_record(&record);
        assert!(matches!(
            result,
            Err(EngineError::InvalidRecord { correlation_key, .. }) if correlation_key == key
        ));
    }

    #[test]
    fn test_complete_step_is_idempotent() {
        let mut saga = OrderSaga::new(CorrelationKey::new());
        saga.complete_step(ForwardStep::Payment);
        saga.complete_step(ForwardStep::Payment);
        assert_eq!(saga.completed_steps, vec![ForwardStep::Payment]);
        assert!(saga.has_completed(ForwardStep::Payment));
        assert!(!saga.has_completed(ForwardStep::Inventory));
    }
}
