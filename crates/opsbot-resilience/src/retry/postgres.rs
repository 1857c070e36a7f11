//! PostgreSQL-backed retry store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` plus a `claimed_until` lease column so
//! workers in different processes never double-process a record. Each claim
//! also writes a fresh `lease_token`; transitions only apply while that token
//! is still current.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use opsbot_core::{LeaseToken, RetryRecordId};

use super::{RetryRecord, RetryStats, RetryStatus, RetryStore};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, sqlx::FromRow)]
struct RetryRow {
    id: Uuid,
    operation_type: String,
    payload: serde_json::Value,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    #[sqlx(default)]
    lease_token: Option<Uuid>,
}

impl From<RetryRow> for RetryRecord {
    fn from(row: RetryRow) -> Self {
        Self {
            id: RetryRecordId::from_uuid(row.id),
            operation_type: row.operation_type,
            payload: row.payload,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            next_retry_at: row.next_retry_at,
            lease: row.lease_token.map(LeaseToken::from_uuid),
        }
    }
}

const RECORD_COLUMNS: &str =
    "id, operation_type, payload, attempts, last_error, created_at, updated_at, next_retry_at";

/// [`RetryStore`] persisted in the `opsbot_retry_records` table.
#[derive(Debug, Clone)]
pub struct PgRetryStore {
    pool: PgPool,
}

impl PgRetryStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS opsbot_retry_records (
                id              UUID PRIMARY KEY,
                operation_type  TEXT NOT NULL,
                payload         JSONB NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                status          TEXT NOT NULL DEFAULT 'pending',
                claimed_until   TIMESTAMPTZ,
                lease_token     UUID,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL,
                next_retry_at   TIMESTAMPTZ
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "ALTER TABLE opsbot_retry_records ADD COLUMN IF NOT EXISTS lease_token UUID",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS opsbot_retry_records_due_idx
                ON opsbot_retry_records (status, next_retry_at)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Error for a fenced transition that matched no row.
    async fn lost_or_missing(&self, id: RetryRecordId) -> StoreError {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM opsbot_retry_records WHERE id = $1)",
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await;

        match exists {
            Ok(true) => StoreError::LeaseLost(id.to_string()),
            Ok(false) => StoreError::NotFound(id.to_string()),
            Err(e) => StoreError::Database(e),
        }
    }
}

#[async_trait]
impl RetryStore for PgRetryStore {
    async fn enqueue(&self, record: RetryRecord) -> StoreResult<RetryRecordId> {
        sqlx::query(
            r"
            INSERT INTO opsbot_retry_records
                (id, operation_type, payload, attempts, last_error, status,
                 created_at, updated_at, next_retry_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(record.id.as_uuid())
        .bind(&record.operation_type)
        .bind(&record.payload)
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
        .bind(&record.last_error)
        .bind(RetryStatus::Pending.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(record.id)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> StoreResult<Vec<RetryRecord>> {
        let sql = format!(
            r"
            WITH due AS (
                SELECT id FROM opsbot_retry_records
                WHERE status = $1
                  AND (next_retry_at IS NULL OR next_retry_at <= now())
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY COALESCE(next_retry_at, created_at), created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE opsbot_retry_records r
            SET claimed_until = now() + make_interval(secs => $3),
                lease_token = gen_random_uuid(),
                attempts = r.attempts + 1,
                updated_at = now()
            FROM due
            WHERE r.id = due.id
            RETURNING {}, r.lease_token
            ",
            RECORD_COLUMNS
                .split(", ")
                .map(|c| format!("r.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let rows: Vec<RetryRow> = sqlx::query_as(&sql)
            .bind(RetryStatus::Pending.as_str())
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;

        let mut records: Vec<RetryRecord> = rows.into_iter().map(RetryRecord::from).collect();
        // RETURNING order is unspecified.
        records.sort_by_key(|r| (r.next_retry_at.unwrap_or(r.created_at), r.created_at));
        Ok(records)
    }

    async fn mark_success(&self, id: RetryRecordId, lease: LeaseToken) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM opsbot_retry_records WHERE id = $1 AND lease_token = $2 AND status = $3",
        )
        .bind(id.as_uuid())
        .bind(lease.as_uuid())
        .bind(RetryStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost_or_missing(id).await);
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE opsbot_retry_records
            SET last_error = $3,
                next_retry_at = $4,
                claimed_until = NULL,
                lease_token = NULL,
                updated_at = now()
            WHERE id = $1 AND lease_token = $2 AND status = $5
            ",
        )
        .bind(id.as_uuid())
        .bind(lease.as_uuid())
        .bind(error)
        .bind(next_retry_at)
        .bind(RetryStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost_or_missing(id).await);
        }
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r"
            UPDATE opsbot_retry_records
            SET status = $3,
                last_error = $4,
                next_retry_at = NULL,
                claimed_until = NULL,
                lease_token = NULL,
                updated_at = now()
            WHERE id = $1 AND lease_token = $2 AND status = $5
            ",
        )
        .bind(id.as_uuid())
        .bind(lease.as_uuid())
        .bind(RetryStatus::DeadLetter.as_str())
        .bind(error)
        .bind(RetryStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost_or_missing(id).await);
        }
        Ok(())
    }

    async fn get(&self, id: RetryRecordId) -> StoreResult<Option<RetryRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM opsbot_retry_records WHERE id = $1");
        let row: Option<RetryRow> = sqlx::query_as(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(RetryRecord::from))
    }

    async fn stats(&self) -> StoreResult<RetryStats> {
        let (pending, claimed, dead_letter): (i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (
                    WHERE status = $1 AND (claimed_until IS NULL OR claimed_until <= now())
                ),
                COUNT(*) FILTER (WHERE status = $1 AND claimed_until > now()),
                COUNT(*) FILTER (WHERE status = $2)
            FROM opsbot_retry_records
            ",
        )
        .bind(RetryStatus::Pending.as_str())
        .bind(RetryStatus::DeadLetter.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(RetryStats {
            pending: pending.max(0) as u64,
            claimed: claimed.max(0) as u64,
            dead_letter: dead_letter.max(0) as u64,
        })
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<RetryRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM opsbot_retry_records \
             WHERE status = $1 ORDER BY updated_at DESC LIMIT $2"
        );
        let rows: Vec<RetryRow> = sqlx::query_as(&sql)
            .bind(RetryStatus::DeadLetter.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RetryRecord::from).collect())
    }
}
