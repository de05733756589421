//! Auxiliary notifications emitted on a side channel.
//!
//! Notifications never block or fail a transition: the engine fires them
//! after the commit and only logs delivery errors.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use common::{CorrelationKey, Money};
use thiserror::Error;

/// A notification produced by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The order amount exceeds the configured high-value threshold.
    HighValueOrder {
        correlation_key: CorrelationKey,
        amount: Money,
        threshold: Money,
    },
}

/// Error delivering a notification.
#[derive(Debug, Error)]
#[error("Notification failed: {0}")]
pub struct NotifyError(pub String);

/// Trait for notification sinks.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Notifier that writes notifications to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        match notification {
            Notification::HighValueOrder {
                correlation_key,
                amount,
                threshold,
            } => {
                tracing::warn!(%correlation_key, %amount, %threshold, "high value order submitted");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<Notification>,
    fail: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<Mutex<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    /// Creates a new in-memory notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the notifier to reject every notification.
    pub fn set_fail(&self, fail: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail = fail;
    }

    /// Returns the notifications accepted so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sent
            .clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail {
            return Err(NotifyError("notifier unavailable".to_string()));
        }
        state.sent.push(notification);
        Ok(())
    }
}
