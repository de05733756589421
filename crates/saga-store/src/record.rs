use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CorrelationKey;

/// Version number of a saga record, used for optimistic concurrency control.
///
/// Version 0 means "no record exists"; the first commit produces version 1
/// and each subsequent commit increments by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of a saga that does not exist yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) of a committed saga.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// The committed state of one saga instance.
///
/// The store treats `state` and `data` as opaque; the orchestrator owns
/// their meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// The transaction this record belongs to.
    pub correlation_key: CorrelationKey,

    /// Current state tag (e.g., "PaymentProcessing").
    pub state: String,

    /// Committed version of this record.
    pub version: Version,

    /// Business payload as JSON.
    pub data: serde_json::Value,

    /// When the record was first committed.
    pub created_at: DateTime<Utc>,

    /// When the record was last committed.
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Creates a record that has not been committed yet.
    pub fn new(
        correlation_key: CorrelationKey,
        state: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            correlation_key,
            state: state.into(),
            version: Version::initial(),
            data,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the record has been committed at least once.
    pub fn exists(&self) -> bool {
        self.version > Version::initial()
    }
}
