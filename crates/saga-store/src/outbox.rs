use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationKey, MessageId};

/// Where an outbox entry is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// Fan-out to every subscriber of the message type.
    Publish,
    /// Point-to-point delivery to a named queue.
    Send { address: String },
}

impl Destination {
    /// Creates a point-to-point destination.
    pub fn send(address: impl Into<String>) -> Self {
        Destination::Send {
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Publish => write!(f, "publish"),
            Destination::Send { address } => write!(f, "send:{address}"),
        }
    }
}

/// Interval between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed { interval: Duration },
    /// Delay grows by `factor` after every attempt, capped at `max`.
    Exponential {
        initial: Duration,
        factor: f64,
        max: Duration,
    },
}

/// Bounded retry policy attached to an outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a policy with a fixed interval.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { interval },
        }
    }

    /// Creates a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                factor,
                max,
            },
        }
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed { interval } => *interval,
            Backoff::Exponential {
                initial,
                factor,
                max,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else if secs <= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

/// An outbound message staged atomically with the transition that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Identity of the outbound message; also the outbox primary key.
    pub message_id: MessageId,

    /// Saga that produced the message.
    pub correlation_key: CorrelationKey,

    /// Message type tag (e.g., "ProcessPayment").
    pub message_type: String,

    pub destination: Destination,

    /// Serialized message envelope.
    pub payload: serde_json::Value,

    /// Retry policy used by the relay, if any.
    pub retry_policy: Option<RetryPolicy>,

    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dead_lettered_at: Option<DateTime<Utc>>,

    /// Number of handoff attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Creates a new undispatched entry.
    pub fn new(
        message_id: MessageId,
        correlation_key: CorrelationKey,
        message_type: impl Into<String>,
        destination: Destination,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id,
            correlation_key,
            message_type: message_type.into(),
            destination,
            payload,
            retry_policy: None,
            created_at: Utc::now(),
            dispatched_at: None,
            dead_lettered_at: None,
            attempts: 0,
            last_error: None,
        }
    }

    /// Attaches a retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    pub fn is_dead_lettered(&self) -> bool {
        self.dead_lettered_at.is_some()
    }

    /// Returns true if the relay still has to hand this entry off.
    pub fn is_pending(&self) -> bool {
        !self.is_dispatched() && !self.is_dead_lettered()
    }
}
