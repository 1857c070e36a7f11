//! Process-local idempotency store.
//!
//! Linearizable within one process only. Multi-replica deployments should use
//! the PostgreSQL store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{EntryCounts, IdempotencyStore, Reservation};
use crate::error::StoreResult;

#[derive(Debug, Clone)]
enum EntryState {
    Pending,
    Complete(serde_json::Value),
}

#[derive(Debug, Clone)]
struct Entry {
    state: EntryState,
    expires_at: Instant,
}

/// Horizon used when a configured TTL would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory [`IdempotencyStore`] with lazy expiry.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).and_then(|entry| match &entry.state {
            EntryState::Complete(value) => Some(value.clone()),
            EntryState::Pending => None,
        }))
    }

    async fn set(&self, key: &str, response: serde_json::Value, ttl: Duration) -> StoreResult<()> {
        let entry = Entry {
            state: EntryState::Complete(response),
            expires_at: expiry(Instant::now(), ttl),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn try_reserve(&self, key: &str, lease: Duration) -> StoreResult<Reservation> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(key).filter(|e| e.is_live(now)) {
            return Ok(match &entry.state {
                EntryState::Pending => Reservation::InFlight,
                EntryState::Complete(value) => Reservation::Completed(value.clone()),
            });
        }

        entries.insert(
            key.to_string(),
            Entry {
                state: EntryState::Pending,
                expires_at: expiry(now, lease),
            },
        );
        Ok(Reservation::Acquired)
    }

    async fn release(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        if matches!(
            entries.get(key),
            Some(Entry {
                state: EntryState::Pending,
                ..
            })
        ) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn counts(&self) -> StoreResult<EntryCounts> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.is_live(now));

        let mut counts = EntryCounts::default();
        for entry in entries.values() {
            match entry.state {
                EntryState::Pending => counts.in_flight += 1,
                EntryState::Complete(_) => counts.entries += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = InMemoryIdempotencyStore::new();
        store
            .set("k", json!({"ok": true}), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.counts().await.unwrap(), EntryCounts::default());
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates_instead_of_overflowing() {
        let store = InMemoryIdempotencyStore::new();
        store
            .set("done", json!({"ok": true}), Duration::MAX)
            .await
            .unwrap();
        assert_eq!(
            store.try_reserve("pending", Duration::MAX).await.unwrap(),
            Reservation::Acquired
        );

        assert!(store.get("done").await.unwrap().is_some());
        assert_eq!(
            store.try_reserve("pending", Duration::MAX).await.unwrap(),
            Reservation::InFlight
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_reservation_expires() {
        let store = InMemoryIdempotencyStore::new();
        let lease = Duration::from_secs(5);
        assert_eq!(store.try_reserve("k", lease).await.unwrap(), Reservation::Acquired);
        assert_eq!(store.try_reserve("k", lease).await.unwrap(), Reservation::InFlight);

        tokio::time::advance(lease).await;
        assert_eq!(store.try_reserve("k", lease).await.unwrap(), Reservation::Acquired);
    }

    #[tokio::test]
    async fn test_release_keeps_completed_entries() {
        let store = InMemoryIdempotencyStore::new();
        store
            .set("k", json!(1), Duration::from_secs(60))
            .await
            .unwrap();
        store.release("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_pending_entry_is_not_a_hit() {
        let store = InMemoryIdempotencyStore::new();
        store
            .try_reserve("k", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(
            store.counts().await.unwrap(),
            EntryCounts {
                entries: 0,
                in_flight: 1
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_reservations_admit_exactly_one() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.try_reserve("k", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() == Reservation::Acquired {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
