use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    CorrelationKey, Destination, MessageId, OutboxEntry, PendingRequest, Result, RetryPolicy,
    SagaCommit, SagaRecord, SagaStoreError, Version,
    store::{PurgeStats, SagaStore},
};

const OUTBOX_COLUMNS: &str = "message_id, correlation_key, message_type, destination, payload, \
     retry_policy, created_at, dispatched_at, dead_lettered_at, attempts, last_error";

const PENDING_COLUMNS: &str =
    "request_id, correlation_key, slot, capability, expected_response, issued_at, deadline";

/// PostgreSQL-backed saga store implementation.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            correlation_key: CorrelationKey::from_uuid(row.try_get("correlation_key")?),
            state: row.try_get("state")?,
            version: Version::new(row.try_get("version")?),
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_pending(row: PgRow) -> Result<PendingRequest> {
        Ok(PendingRequest {
            request_id: row.try_get("request_id")?,
            correlation_key: CorrelationKey::from_uuid(row.try_get("correlation_key")?),
            slot: row.try_get("slot")?,
            capability: row.try_get("capability")?,
            expected_response: row.try_get("expected_response")?,
            issued_at: row.try_get("issued_at")?,
            deadline: row.try_get("deadline")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
        let destination: Destination = serde_json::from_value(row.try_get("destination")?)?;
        let retry_policy: Option<RetryPolicy> = row
            .try_get::<Option<serde_json::Value>, _>("retry_policy")?
            .map(serde_json::from_value)
            .transpose()?;

        Ok(OutboxEntry {
            message_id: MessageId::from_uuid(row.try_get("message_id")?),
            correlation_key: CorrelationKey::from_uuid(row.try_get("correlation_key")?),
            message_type: row.try_get("message_type")?,
            destination,
            payload: row.try_get("payload")?,
            retry_policy,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
            attempts: row.try_get::<i32, _>("attempts")?.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }

    async fn current_version(
        tx: &mut Transaction<'_, Postgres>,
        correlation_key: CorrelationKey,
    ) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM sagas WHERE correlation_key = $1")
                .bind(correlation_key.as_uuid())
                .fetch_optional(&mut **tx)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }

    async fn write_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &SagaRecord,
        expected: Version,
        version: Version,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO sagas (correlation_key, state, version, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $5)
                ON CONFLICT (correlation_key) DO NOTHING
                "#,
            )
            .bind(record.correlation_key.as_uuid())
            .bind(&record.state)
            .bind(version.as_i64())
            .bind(&record.data)
            .bind(now)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE sagas
                SET state = $2, version = $3, data = $4, updated_at = $5
                WHERE correlation_key = $1 AND version = $6
                "#,
            )
            .bind(record.correlation_key.as_uuid())
            .bind(&record.state)
            .bind(version.as_i64())
            .bind(&record.data)
            .bind(now)
            .bind(expected.as_i64())
            .execute(&mut **tx)
            .await?
        };
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn load(&self, correlation_key: CorrelationKey) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(
            r#"
            SELECT correlation_key, state, version, data, created_at, updated_at
            FROM sagas
            WHERE correlation_key = $1
            "#,
        )
        .bind(correlation_key.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_record).transpose()
    }

    #[tracing::instrument(skip(self, commit), fields(correlation_key = %commit.record.correlation_key))]
    async fn commit(&self, commit: SagaCommit) -> Result<Version> {
        let correlation_key = commit.record.correlation_key;
        let version = commit.next_version();
        let now = Utc::now();

        // Start a transaction; dropping it on any error rolls everything back
        let mut tx = self.pool.begin().await?;

        let written =
            Self::write_record(&mut tx, &commit.record, commit.expected_version, version, now)
                .await?;
        if written == 0 {
            let actual = Self::current_version(&mut tx, correlation_key).await?;
            return Err(SagaStoreError::ConcurrencyConflict {
                correlation_key,
                expected: commit.expected_version,
                actual,
            });
        }

        if let Some(message_id) = commit.processed {
            let inserted = sqlx::query(
                r#"
                INSERT INTO inbox (message_id, correlation_key, processed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message_id.as_uuid())
            .bind(correlation_key.as_uuid())
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 0 {
                return Err(SagaStoreError::DuplicateMessage(message_id));
            }
        }

        if !commit.resolved.is_empty() {
            sqlx::query("DELETE FROM pending_requests WHERE request_id = ANY($1)")
                .bind(&commit.resolved)
                .execute(&mut *tx)
                .await?;
        }

        for request in &commit.issued {
            sqlx::query(
                r#"
                INSERT INTO pending_requests
                    (request_id, correlation_key, slot, capability, expected_response, issued_at, deadline)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(request.request_id)
            .bind(request.correlation_key.as_uuid())
            .bind(&request.slot)
            .bind(&request.capability)
            .bind(&request.expected_response)
            .bind(request.issued_at)
            .bind(request.deadline)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_pending_slot")
                {
                    return SagaStoreError::DuplicatePendingRequest {
                        correlation_key: request.correlation_key,
                        slot: request.slot.clone(),
                    };
                }
                SagaStoreError::Database(e)
            })?;
        }

        for entry in &commit.outbox {
            let retry_policy = entry
                .retry_policy
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT INTO outbox
                    (message_id, correlation_key, message_type, destination, payload, retry_policy, created_at, attempts)
                VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
                "#,
            )
            .bind(entry.message_id.as_uuid())
            .bind(entry.correlation_key.as_uuid())
            .bind(&entry.message_type)
            .bind(serde_json::to_value(&entry.destination)?)
            .bind(&entry.payload)
            .bind(retry_policy)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(version)
    }

    async fn is_processed(&self, message_id: MessageId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM inbox WHERE message_id = $1)")
                .bind(message_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn pending_request(
        &self,
        correlation_key: CorrelationKey,
        slot: &str,
    ) -> Result<Option<PendingRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_requests WHERE correlation_key = $1 AND slot = $2"
        ))
        .bind(correlation_key.as_uuid())
        .bind(slot)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_pending).transpose()
    }

    async fn pending_requests(&self) -> Result<Vec<PendingRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_requests ORDER BY deadline ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_pending).collect()
    }

    async fn undispatched(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox \
             WHERE dispatched_at IS NULL AND dead_lettered_at IS NULL \
             ORDER BY seq ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, message_id: MessageId, attempts: u32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox SET dispatched_at = $2, attempts = $3 WHERE message_id = $1",
        )
        .bind(message_id.as_uuid())
        .bind(Utc::now())
        .bind(attempts as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaStoreError::OutboxEntryNotFound(message_id));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        message_id: MessageId,
        attempts: u32,
        error: &str,
        dead_letter: bool,
    ) -> Result<()> {
        let dead_lettered_at: Option<DateTime<Utc>> = dead_letter.then(Utc::now);
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET attempts = $2, last_error = $3, dead_lettered_at = COALESCE($4, dead_lettered_at)
            WHERE message_id = $1
            "#,
        )
        .bind(message_id.as_uuid())
        .bind(attempts as i32)
        .bind(error)
        .bind(dead_lettered_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SagaStoreError::OutboxEntryNotFound(message_id));
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE dead_lettered_at IS NOT NULL ORDER BY seq ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn outbox_for(&self, correlation_key: CorrelationKey) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE correlation_key = $1 ORDER BY seq ASC"
        ))
        .bind(correlation_key.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn purge(
        &self,
        dispatched_before: DateTime<Utc>,
        processed_before: DateTime<Utc>,
    ) -> Result<PurgeStats> {
        let outbox = sqlx::query("DELETE FROM outbox WHERE dispatched_at < $1")
            .bind(dispatched_before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let inbox = sqlx::query("DELETE FROM inbox WHERE processed_at < $1")
            .bind(processed_before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PurgeStats { outbox, inbox })
    }
}

