//! Simulated credit check agency.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use contracts::addresses::CREDIT_CHECK_QUEUE;
use contracts::{CreditCheckFault, Message, MessageEnvelope};

use super::Capability;

/// How the simulated agency answers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CreditBehavior {
    #[default]
    Approve,
    Decline(Option<String>),
    /// Replies with a fault instead of a decision.
    Fault(String),
    /// Never replies.
    Silent,
}

#[derive(Debug, Default)]
struct CreditState {
    behavior: CreditBehavior,
    requests: usize,
}

/// In-memory credit check capability for testing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCreditCheck {
    state: Arc<RwLock<CreditState>>,
}

impl SimulatedCreditCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, behavior: CreditBehavior) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .behavior = behavior;
    }

    /// Returns the number of credit check requests received.
    pub fn request_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
    }
}

#[async_trait]
impl Capability for SimulatedCreditCheck {
    fn queues(&self) -> Vec<&'static str> {
        vec![CREDIT_CHECK_QUEUE]
    }

    async fn handle(&self, envelope: &MessageEnvelope) -> Option<Message> {
        let Message::CreditCheckRequest(request) = &envelope.payload else {
            return None;
        };

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.requests += 1;
        let key = request.correlation_key;
        match &state.behavior {
            CreditBehavior::Approve => Some(Message::credit_check_result(key, true, None)),
            CreditBehavior::Decline(reason) => {
                Some(Message::credit_check_result(key, false, reason.clone()))
            }
            CreditBehavior::Fault(message) => Some(Message::CreditCheckFault(CreditCheckFault {
                correlation_key: key,
                message: message.clone(),
            })),
            CreditBehavior::Silent => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CorrelationKey, CustomerId, Money};
    use contracts::{CreditCheckRequest, MessageKind};

    fn request() -> MessageEnvelope {
        MessageEnvelope::new(Message::CreditCheckRequest(CreditCheckRequest {
            correlation_key: CorrelationKey::new(),
            customer_id: CustomerId::new(),
            amount: Money::from_dollars(100),
        }))
    }

    #[tokio::test]
    async fn test_behaviors() {
        let agency = SimulatedCreditCheck::new();

        let reply = agency.handle(&request()).await.unwrap();
        assert!(matches!(reply, Message::CreditCheckResult(r) if r.approved));

        agency.set_behavior(CreditBehavior::Decline(Some("limit".into())));
        let reply = agency.handle(&request()).await.unwrap();
        assert!(matches!(reply, Message::CreditCheckResult(r) if !r.approved));

        agency.set_behavior(CreditBehavior::Fault("boom".into()));
        let reply = agency.handle(&request()).await.unwrap();
        assert_eq!(reply.kind(), MessageKind::CreditCheckFault);

        agency.set_behavior(CreditBehavior::Silent);
        assert!(agency.handle(&request()).await.is_none());

        assert_eq!(agency.request_count(), 4);
    }

    #[tokio::test]
    async fn test_ignores_other_messages() {
        let agency = SimulatedCreditCheck::new();
        let other = MessageEnvelope::new(Message::transaction_confirmed(CorrelationKey::new()));
        assert!(agency.handle(&other).await.is_none());
        assert_eq!(agency.request_count(), 0);
    }
}
