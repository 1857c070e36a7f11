//! Retry store abstraction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use opsbot_core::{LeaseToken, RetryRecordId};

use super::{RetryRecord, RetryStats};
use crate::error::StoreResult;

/// Durable collection of [`RetryRecord`]s.
///
/// `claim_batch` must be atomic across concurrent workers: a record leased
/// to one claimant is invisible to others until its lease expires or it is
/// transitioned.
///
/// Transitions are fenced by the [`LeaseToken`] handed out with each claimed
/// record. A token superseded by a later claim, or presented for a record
/// already transitioned, yields [`StoreError::LeaseLost`] and leaves the
/// record untouched.
///
/// [`StoreError::LeaseLost`]: crate::error::StoreError::LeaseLost
#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn enqueue(&self, record: RetryRecord) -> StoreResult<RetryRecordId>;

    /// Lease up to `batch_size` due records for `lease`, incrementing each
    /// record's `attempts` and setting a fresh [`RetryRecord::lease`].
    async fn claim_batch(&self, batch_size: usize, lease: Duration)
        -> StoreResult<Vec<RetryRecord>>;

    /// The retried operation succeeded; the record is removed.
    async fn mark_success(&self, id: RetryRecordId, lease: LeaseToken) -> StoreResult<()>;

    /// Release the lease and reschedule.
    async fn mark_retry(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Move the record to the terminal dead-letter state.
    async fn mark_dead_letter(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
    ) -> StoreResult<()>;

    async fn get(&self, id: RetryRecordId) -> StoreResult<Option<RetryRecord>>;

    async fn stats(&self) -> StoreResult<RetryStats>;

    /// Most recently dead-lettered records first.
    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<RetryRecord>>;
}
