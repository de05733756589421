use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{CorrelationKey, MessageId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Contract, Message};

/// A message together with its wire metadata.
///
/// The envelope carries the identity used for deduplication (`message_id`),
/// the correlation key used for dispatch, and the request id that ties a
/// response back to the request that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier for this message. Redeliveries keep it.
    pub message_id: MessageId,

    /// The transaction this message belongs to.
    pub correlation_key: CorrelationKey,

    /// The type of the message (e.g., "PaymentProcessed").
    pub message_type: String,

    /// Request id, set on requests and echoed back on their responses.
    pub request_id: Option<Uuid>,

    /// When the message was created.
    pub sent_at: DateTime<Utc>,

    /// Free-form transport headers.
    pub headers: HashMap<String, String>,

    /// The message itself.
    pub payload: Message,
}

impl MessageEnvelope {
    /// Wraps a message in a fresh envelope.
    pub fn new(payload: Message) -> Self {
        Self::builder(payload).build()
    }

    /// Creates an envelope builder for the given message.
    pub fn builder(payload: Message) -> MessageEnvelopeBuilder {
        MessageEnvelopeBuilder {
            message_id: None,
            request_id: None,
            sent_at: None,
            headers: HashMap::new(),
            payload,
        }
    }

    /// Builds a response envelope that echoes this envelope's request id.
    pub fn reply(&self, payload: Message) -> Self {
        let mut builder = Self::builder(payload);
        if let Some(request_id) = self.request_id {
            builder = builder.request_id(request_id);
        }
        builder.build()
    }
}

/// Builder for constructing message envelopes.
#[derive(Debug)]
pub struct MessageEnvelopeBuilder {
    message_id: Option<MessageId>,
    request_id: Option<Uuid>,
    sent_at: Option<DateTime<Utc>>,
    headers: HashMap<String, String>,
    payload: Message,
}

impl MessageEnvelopeBuilder {
    /// Sets the message ID. If not set, a new ID will be generated.
    pub fn message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Sets the request id.
    pub fn request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    /// Adds a header entry.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builds the envelope. Correlation key and type come from the payload.
    pub fn build(self) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.message_id.unwrap_or_default(),
            correlation_key: self.payload.correlation_key(),
            message_type: self.payload.message_type().to_string(),
            request_id: self.request_id,
            sent_at: self.sent_at.unwrap_or_else(Utc::now),
            headers: self.headers,
            payload: self.payload,
        }
    }
}
