//! Request/reply coordinator: pending request records plus deadline timers.
//!
//! A request is staged in the same commit as the transition that issued it.
//! Exactly one of {response, fault, timeout} resolves the pending record;
//! anything arriving afterwards no longer matches and is discarded.

use std::time::Duration;

use chrono::Utc;
use common::{CorrelationKey, MessageId};
use contracts::{Contract, CreditCheckTimedOut, Message, MessageEnvelope, MessageKind};
use saga_store::{PendingRequest, SagaStore};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::host::Delivery;

/// Logical request slots of a saga. At most one request per slot is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestSlot {
    CreditCheck,
}

impl RequestSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestSlot::CreditCheck => "credit_check",
        }
    }

    pub fn parse(slot: &str) -> Option<Self> {
        match slot {
            "credit_check" => Some(RequestSlot::CreditCheck),
            _ => None,
        }
    }

    /// Returns the slot an inbound message kind answers, if any.
    pub fn for_response(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::CreditCheckResult
            | MessageKind::CreditCheckFault
            | MessageKind::CreditCheckTimedOut => Some(RequestSlot::CreditCheck),
            _ => None,
        }
    }

    /// The response type expected for requests in this slot.
    pub fn expected_response(&self) -> MessageKind {
        match self {
            RequestSlot::CreditCheck => MessageKind::CreditCheckResult,
        }
    }

    /// The event synthesized when the deadline elapses.
    pub fn timeout_message(&self, correlation_key: CorrelationKey) -> Message {
        match self {
            RequestSlot::CreditCheck => {
                Message::CreditCheckTimedOut(CreditCheckTimedOut { correlation_key })
            }
        }
    }
}

impl std::fmt::Display for RequestSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an inbound message relates to the saga's pending requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The message is not a response to any request slot.
    NotAResponse,
    /// The message resolves this pending request.
    Matched(PendingRequest),
    /// The message answers a request that is no longer pending.
    Unmatched,
}

/// Stages a request: the pending record and the request envelope that
/// carries its request id. Both belong in the issuing transition's commit.
pub fn issue(
    slot: RequestSlot,
    address: &str,
    message: Message,
    timeout: Duration,
    causation_id: MessageId,
) -> (PendingRequest, MessageEnvelope) {
    let timeout =
        chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
    let pending = PendingRequest::new(
        message.correlation_key(),
        slot.as_str(),
        address,
        slot.expected_response().as_str(),
        timeout,
    );
    let envelope = MessageEnvelope::builder(message)
        .request_id(pending.request_id)
        .header("causation_id", causation_id.to_string())
        .build();
    (pending, envelope)
}

/// Returns true if the envelope answers this pending request.
///
/// A response without a request id is matched on correlation key and
/// slot alone; one carrying a different request id is stale.
pub fn resolves(pending: &PendingRequest, envelope: &MessageEnvelope) -> bool {
    pending.correlation_key == envelope.correlation_key
        && envelope
            .request_id
            .is_none_or(|request_id| request_id == pending.request_id)
}

/// Builds the synthetic timeout envelope for a pending request.
pub fn timeout_envelope(request: &PendingRequest) -> Option<MessageEnvelope> {
    let slot = RequestSlot::parse(&request.slot)?;
    Some(
        MessageEnvelope::builder(slot.timeout_message(request.correlation_key))
            .message_id(MessageId::from_uuid(request.request_id))
            .request_id(request.request_id)
            .header("source", "deadline")
            .build(),
    )
}

/// Issues requests, matches responses and fires deadline timers.
#[derive(Clone)]
pub struct RequestCoordinator<S> {
    store: S,
    inbound: mpsc::Sender<Delivery>,
}

impl<S> RequestCoordinator<S>
where
    S: SagaStore + Clone + 'static,
{
    /// Creates a coordinator that feeds timeouts into `inbound`.
    pub fn new(store: S, inbound: mpsc::Sender<Delivery>) -> Self {
        Self { store, inbound }
    }

    /// Matches an inbound message against the saga's pending requests.
    pub async fn resolve(&self, envelope: &MessageEnvelope) -> Result<Resolution> {
        let Some(slot) = RequestSlot::for_response(envelope.payload.kind()) else {
            return Ok(Resolution::NotAResponse);
        };

        let pending = self
            .store
            .pending_request(envelope.correlation_key, slot.as_str())
            .await?;

        Ok(match pending {
            Some(pending) if resolves(&pending, envelope) => Resolution::Matched(pending),
            _ => Resolution::Unmatched,
        })
    }

    /// Arms the deadline timer of a committed pending request.
    ///
    /// The timer runs on the runtime independently of delivery workers. When
    /// it fires and the request is still pending, a timeout event is fed
    /// into the inbound path. Its message id is the request id, so a timer
    /// that fires twice is deduplicated by the inbox.
    pub fn arm(&self, request: PendingRequest) {
        let store = self.store.clone();
        let inbound = self.inbound.clone();

        tokio::spawn(async move {
            tokio::time::sleep(request.remaining(Utc::now())).await;

            let still_pending = match store
                .pending_request(request.correlation_key, &request.slot)
                .await
            {
                Ok(Some(current)) => current.request_id == request.request_id,
                Ok(None) => false,
                Err(e) => {
                    // Fire anyway; the engine re-checks the pending record.
                    tracing::warn!(error = %e, request_id = %request.request_id, "pending lookup failed at deadline");
                    true
                }
            };
            if !still_pending {
                tracing::debug!(request_id = %request.request_id, "request resolved before deadline");
                return;
            }

            let Some(envelope) = timeout_envelope(&request) else {
                tracing::error!(slot = %request.slot, "no timeout event for request slot");
                return;
            };

            metrics::counter!("saga_timeouts_total").increment(1);
            tracing::info!(
                correlation_key = %request.correlation_key,
                slot = %request.slot,
                "request deadline elapsed"
            );
            if inbound.send(Delivery::new(envelope)).await.is_err() {
                tracing::debug!(request_id = %request.request_id, "inbound closed, timeout dropped");
            }
        });
    }

    /// Re-arms timers for every pending request found in the store.
    ///
    /// Pending records are durable but timers are not; this runs on start.
    pub async fn recover(&self) -> Result<usize> {
        let pending = self.store.pending_requests().await?;
        let count = pending.len();
        for request in pending {
            self.arm(request);
        }
        if count > 0 {
            tracing::info!(count, "re-armed pending request timers");
        }
        Ok(count)
    }
}
