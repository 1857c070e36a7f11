//! PostgreSQL-backed idempotency store shared by all replicas.
//!
//! Reservation is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired`
//! statement, so exactly one replica wins a live key.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{EntryCounts, IdempotencyStore, Reservation};
use crate::error::StoreResult;

const STATUS_PENDING: &str = "pending";
const STATUS_COMPLETE: &str = "complete";

/// [`IdempotencyStore`] persisted in the `opsbot_idempotency` table.
#[derive(Debug, Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS opsbot_idempotency (
                key         TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                response    JSONB,
                expires_at  TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS opsbot_idempotency_expires_at_idx
                ON opsbot_idempotency (expires_at)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete expired rows. Returns the number removed.
    pub async fn purge_expired(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM opsbot_idempotency WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        debug!(
            target: "idempotency",
            purged = result.rows_affected(),
            "Purged expired idempotency entries"
        );
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let row: Option<(Option<serde_json::Value>,)> = sqlx::query_as(
            r"
            SELECT response FROM opsbot_idempotency
            WHERE key = $1 AND status = $2 AND expires_at > now()
            ",
        )
        .bind(key)
        .bind(STATUS_COMPLETE)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(response,)| response))
    }

    async fn set(&self, key: &str, response: serde_json::Value, ttl: Duration) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO opsbot_idempotency (key, status, response, expires_at)
            VALUES ($1, $2, $3, now() + make_interval(secs => $4))
            ON CONFLICT (key) DO UPDATE
            SET status = EXCLUDED.status,
                response = EXCLUDED.response,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(key)
        .bind(STATUS_COMPLETE)
        .bind(response)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn try_reserve(&self, key: &str, lease: Duration) -> StoreResult<Reservation> {
        let acquired: Option<(String,)> = sqlx::query_as(
            r"
            INSERT INTO opsbot_idempotency (key, status, response, expires_at)
            VALUES ($1, $2, NULL, now() + make_interval(secs => $3))
            ON CONFLICT (key) DO UPDATE
            SET status = EXCLUDED.status,
                response = NULL,
                expires_at = EXCLUDED.expires_at
            WHERE opsbot_idempotency.expires_at <= now()
            RETURNING key
            ",
        )
        .bind(key)
        .bind(STATUS_PENDING)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        if acquired.is_some() {
            return Ok(Reservation::Acquired);
        }

        let existing: Option<(String, Option<serde_json::Value>)> = sqlx::query_as(
            r"
            SELECT status, response FROM opsbot_idempotency
            WHERE key = $1 AND expires_at > now()
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match existing {
            Some((status, Some(response))) if status == STATUS_COMPLETE => {
                Reservation::Completed(response)
            }
            // Pending, or released/expired between the two statements. Either
            // way the caller should not execute on this attempt.
            _ => Reservation::InFlight,
        })
    }

    async fn release(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM opsbot_idempotency WHERE key = $1 AND status = $2")
            .bind(key)
            .bind(STATUS_PENDING)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM opsbot_idempotency")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn counts(&self) -> StoreResult<EntryCounts> {
        let (entries, in_flight): (i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*) FILTER (WHERE status = $1),
                COUNT(*) FILTER (WHERE status = $2)
            FROM opsbot_idempotency
            WHERE expires_at > now()
            ",
        )
        .bind(STATUS_COMPLETE)
        .bind(STATUS_PENDING)
        .fetch_one(&self.pool)
        .await?;

        Ok(EntryCounts {
            entries: entries.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }
}
