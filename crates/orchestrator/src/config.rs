//! Orchestrator configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::Money;
use saga_store::RetryPolicy;

/// Tunables of the engine, relay and worker pool.
///
/// Reads from environment variables, falling back to defaults:
/// - `SAGA_HIGH_VALUE_THRESHOLD_CENTS` (default: `100000`, i.e. $1000.00)
/// - `SAGA_CREDIT_CHECK_TIMEOUT_MS` (default: `30000`)
/// - `SAGA_RETRY_ATTEMPTS` (default: `3`)
/// - `SAGA_RETRY_INTERVAL_MS` (default: `5000`)
/// - `SAGA_WORKERS` (default: `4`)
/// - `SAGA_RELAY_POLL_MS` (default: `10000`)
/// - `SAGA_RELAY_BATCH_SIZE` (default: `100`)
/// - `SAGA_DEDUP_WINDOW_SECS` (default: `60`)
/// - `SAGA_OUTBOX_RETENTION_SECS` (default: `3600`)
/// - `SAGA_MAX_CONFLICT_RETRIES` (default: `16`)
/// - `SAGA_REDELIVERY_LIMIT` (default: `5`)
/// - `SAGA_REDELIVERY_DELAY_MS` (default: `100`)
/// - `SAGA_INBOUND_CAPACITY` (default: `1024`)
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Orders above this amount trigger a high-value notification.
    pub high_value_threshold: Money,
    pub credit_check_timeout: Duration,
    /// Policy attached to forward commands and compensations.
    pub retry_policy: RetryPolicy,
    pub workers: usize,
    pub relay_poll_interval: Duration,
    pub relay_batch_size: usize,
    /// How long processed inbound message ids are remembered.
    pub dedup_window: Duration,
    /// How long dispatched outbox entries are kept.
    pub outbox_retention: Duration,
    pub max_conflict_retries: u32,
    /// Deliveries that keep failing are dropped after this many attempts.
    pub redelivery_limit: u32,
    pub redelivery_delay: Duration,
    pub inbound_capacity: usize,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn read<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|value| value.trim().parse().ok())
        }

        let defaults = Self::default();
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let millis = |name: &str, default: Duration| {
            read::<u64>(lookup, name)
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let secs = |name: &str, default: Duration| {
            read::<u64>(lookup, name)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let retry_policy = RetryPolicy::fixed(
            read(lookup, "SAGA_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry_policy.max_attempts)
                .max(1),
            millis("SAGA_RETRY_INTERVAL_MS", defaults.retry_policy.delay_after(1)),
        );

        Self {
            high_value_threshold: read(lookup, "SAGA_HIGH_VALUE_THRESHOLD_CENTS")
                .map(Money::from_cents)
                .unwrap_or(defaults.high_value_threshold),
            credit_check_timeout: millis(
                "SAGA_CREDIT_CHECK_TIMEOUT_MS",
                defaults.credit_check_timeout,
            ),
            retry_policy,
            workers: read(lookup, "SAGA_WORKERS")
                .unwrap_or(defaults.workers)
                .max(1),
            relay_poll_interval: millis("SAGA_RELAY_POLL_MS", defaults.relay_poll_interval),
            relay_batch_size: read(lookup, "SAGA_RELAY_BATCH_SIZE")
                .unwrap_or(defaults.relay_batch_size)
                .max(1),
            dedup_window: secs("SAGA_DEDUP_WINDOW_SECS", defaults.dedup_window),
            outbox_retention: secs("SAGA_OUTBOX_RETENTION_SECS", defaults.outbox_retention),
            max_conflict_retries: read(lookup, "SAGA_MAX_CONFLICT_RETRIES")
                .unwrap_or(defaults.max_conflict_retries)
                .max(1),
            redelivery_limit: read(lookup, "SAGA_REDELIVERY_LIMIT")
                .unwrap_or(defaults.redelivery_limit),
            redelivery_delay: millis("SAGA_REDELIVERY_DELAY_MS", defaults.redelivery_delay),
            inbound_capacity: read(lookup, "SAGA_INBOUND_CAPACITY")
                .unwrap_or(defaults.inbound_capacity)
                .max(1),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            high_value_threshold: Money::from_dollars(1000),
            credit_check_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            workers: 4,
            relay_poll_interval: Duration::from_secs(10),
            relay_batch_size: 100,
            dedup_window: Duration::from_secs(60),
            outbox_retention: Duration::from_secs(3600),
            max_conflict_retries: 16,
            redelivery_limit: 5,
            redelivery_delay: Duration::from_millis(100),
            inbound_capacity: 1024,
        }
    }
}
