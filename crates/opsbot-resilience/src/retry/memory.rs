//! Process-local retry store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use opsbot_core::{LeaseToken, RetryRecordId};

use super::{RetryRecord, RetryStats, RetryStatus, RetryStore};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Slot {
    record: RetryRecord,
    status: RetryStatus,
    claimed_until: Option<DateTime<Utc>>,
    lease: Option<LeaseToken>,
}

impl Slot {
    fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }

    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Pending && !self.is_leased(now) && self.record.is_due(now)
    }

    fn release(&mut self) {
        self.claimed_until = None;
        self.lease = None;
        self.record.updated_at = Utc::now();
    }
}

/// The slot for `id`, provided `lease` is still the current claim on it.
fn fenced<'a>(
    slots: &'a mut HashMap<RetryRecordId, Slot>,
    id: RetryRecordId,
    lease: LeaseToken,
) -> StoreResult<&'a mut Slot> {
    let slot = slots
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if slot.status != RetryStatus::Pending || slot.lease != Some(lease) {
        return Err(StoreError::LeaseLost(id.to_string()));
    }
    Ok(slot)
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(lease).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// In-memory [`RetryStore`]. Records do not survive a restart.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    slots: Mutex<HashMap<RetryRecordId, Slot>>,
}

impl InMemoryRetryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record regardless of state (test inspection).
    pub async fn all(&self) -> Vec<RetryRecord> {
        let slots = self.slots.lock().await;
        let mut records: Vec<RetryRecord> = slots.values().map(|s| s.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Pull every unleased pending record's schedule forward to now.
    pub async fn make_all_due(&self) {
        let now = Utc::now();
        let mut slots = self.slots.lock().await;
        for slot in slots.values_mut() {
            if slot.status == RetryStatus::Pending && !slot.is_leased(now) {
                slot.record.next_retry_at = Some(now);
            }
        }
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn enqueue(&self, record: RetryRecord) -> StoreResult<RetryRecordId> {
        let id = record.id;
        self.slots.lock().await.insert(
            id,
            Slot {
                record,
                status: RetryStatus::Pending,
                claimed_until: None,
                lease: None,
            },
        );
        Ok(id)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> StoreResult<Vec<RetryRecord>> {
        let now = Utc::now();
        let mut slots = self.slots.lock().await;

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, RetryRecordId)> = slots
            .values()
            .filter(|slot| slot.is_claimable(now))
            .map(|slot| {
                let r = &slot.record;
                (r.next_retry_at.unwrap_or(r.created_at), r.created_at, r.id)
            })
            .collect();
        due.sort();

        let until = lease_deadline(now, lease);
        let mut claimed = Vec::new();
        for (_, _, id) in due.into_iter().take(batch_size) {
            if let Some(slot) = slots.get_mut(&id) {
                let token = LeaseToken::new();
                slot.claimed_until = Some(until);
                slot.lease = Some(token);
                slot.record.attempts += 1;
                slot.record.updated_at = now;
                claimed.push(RetryRecord {
                    lease: Some(token),
                    ..slot.record.clone()
                });
            }
        }
        Ok(claimed)
    }

    async fn mark_success(&self, id: RetryRecordId, lease: LeaseToken) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        fenced(&mut slots, id, lease)?;
        slots.remove(&id);
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        let slot = fenced(&mut slots, id, lease)?;

        slot.release();
        slot.record.last_error = Some(error.to_string());
        slot.record.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        id: RetryRecordId,
        lease: LeaseToken,
        error: &str,
    ) -> StoreResult<()> {
        let mut slots = self.slots.lock().await;
        let slot = fenced(&mut slots, id, lease)?;

        slot.release();
        slot.status = RetryStatus::DeadLetter;
        slot.record.last_error = Some(error.to_string());
        slot.record.next_retry_at = None;
        Ok(())
    }

    async fn get(&self, id: RetryRecordId) -> StoreResult<Option<RetryRecord>> {
        Ok(self.slots.lock().await.get(&id).map(|s| s.record.clone()))
    }

    async fn stats(&self) -> StoreResult<RetryStats> {
        let now = Utc::now();
        let slots = self.slots.lock().await;
        let mut stats = RetryStats::default();
        for slot in slots.values() {
            match slot.status {
                RetryStatus::DeadLetter => stats.dead_letter += 1,
                RetryStatus::Pending if slot.is_leased(now) => stats.claimed += 1,
                RetryStatus::Pending => stats.pending += 1,
            }
        }
        Ok(stats)
    }

    async fn list_dead_letters(&self, limit: usize) -> StoreResult<Vec<RetryRecord>> {
        let slots = self.slots.lock().await;
        let mut dead: Vec<RetryRecord> = slots
            .values()
            .filter(|s| s.status == RetryStatus::DeadLetter)
            .map(|s| s.record.clone())
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        dead.truncate(limit);
        Ok(dead)
    }
}
