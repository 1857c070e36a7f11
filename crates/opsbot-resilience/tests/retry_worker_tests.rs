//! Integration tests for the retry worker against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use opsbot_resilience::retry::RetryStats;
use opsbot_resilience::{
    InMemoryRetryStore, RetryPolicy, RetryProcessor, RetryRecord, RetryResult, RetryStore,
    RetryWorker, RetryWorkerConfig,
};

const OPERATION: &str = "groups.member.propagation";

// =============================================================================
// Mock processors
// =============================================================================

/// Always asks for another attempt.
#[derive(Default)]
struct AlwaysRetry {
    calls: AtomicUsize,
}

#[async_trait]
impl RetryProcessor for AlwaysRetry {
    fn operation_type(&self) -> &str {
        OPERATION
    }

    async fn process_record(&self, record: &RetryRecord) -> RetryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RetryResult::Retry(format!("timeout on attempt {}", record.attempts))
    }
}

/// Simulates a second replica re-claiming the record mid-flight, as happens
/// when processing outlives the lease.
struct SupersededMidFlight {
    store: Arc<InMemoryRetryStore>,
    calls: AtomicUsize,
}

#[async_trait]
impl RetryProcessor for SupersededMidFlight {
    fn operation_type(&self) -> &str {
        OPERATION
    }

    async fn process_record(&self, _record: &RetryRecord) -> RetryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let taken = self
            .store
            .claim_batch(1, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(taken.len(), 1, "expired lease should be claimable");
        RetryResult::Retry("timeout".to_string())
    }
}

/// Fails `failures` times, then succeeds.
struct EventuallySucceeds {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl RetryProcessor for EventuallySucceeds {
    fn operation_type(&self) -> &str {
        OPERATION
    }

    async fn process_record(&self, _record: &RetryRecord) -> RetryResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            RetryResult::Retry("rate limited".to_string())
        } else {
            RetryResult::Success
        }
    }
}

fn worker(store: Arc<InMemoryRetryStore>, processor: Arc<dyn RetryProcessor>) -> RetryWorker {
    RetryWorker::new(store, RetryPolicy::default(), RetryWorkerConfig::default())
        .with_processor(processor)
}

// =============================================================================
// Exhaustion
// =============================================================================

#[tokio::test]
async fn record_retried_max_attempts_ends_in_dead_letter() {
    let store = Arc::new(InMemoryRetryStore::new());
    let id = store
        .enqueue(RetryRecord::new(OPERATION, json!({"provider": "aws"})))
        .await
        .unwrap();
    let processor = Arc::new(AlwaysRetry::default());
    let worker = worker(Arc::clone(&store), processor.clone());

    for pass in 1..=5 {
        let report = worker.process_batch().await.unwrap();
        assert_eq!(report.claimed, 1, "pass {pass} should claim the record");
        store.make_all_due().await;
    }

    assert_eq!(processor.calls.load(Ordering::SeqCst), 5);

    // No longer claimable.
    let report = worker.process_batch().await.unwrap();
    assert_eq!(report.claimed, 0);

    let stats = store.stats().await.unwrap();
    assert_eq!(
        stats,
        RetryStats {
            pending: 0,
            claimed: 0,
            dead_letter: 1
        }
    );

    let dead = store.get(id).await.unwrap().unwrap();
    assert_eq!(dead.attempts, 5);
    assert!(dead.last_error.unwrap().contains("max attempts (5) exceeded"));
}

#[tokio::test]
async fn backoff_schedule_follows_policy() {
    let store = Arc::new(InMemoryRetryStore::new());
    let id = store
        .enqueue(RetryRecord::new(OPERATION, json!({})))
        .await
        .unwrap();
    let worker = worker(Arc::clone(&store), Arc::new(AlwaysRetry::default()));

    let mut observed = Vec::new();
    for _ in 0..4 {
        let before = Utc::now();
        worker.process_batch().await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        let delay = record.next_retry_at.unwrap() - before;
        observed.push(delay.num_seconds());
        store.make_all_due().await;
    }

    // Allow a second of slack for the wall clock between the two reads.
    for (got, want) in observed.iter().zip([60, 120, 240, 480]) {
        assert!(
            (*got - want).abs() <= 1,
            "expected ~{want}s, got {got}s"
        );
    }
}

#[tokio::test]
async fn eventual_success_removes_record() {
    let store = Arc::new(InMemoryRetryStore::new());
    store
        .enqueue(RetryRecord::new(OPERATION, json!({})))
        .await
        .unwrap();
    let processor = Arc::new(EventuallySucceeds {
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let worker = worker(Arc::clone(&store), processor.clone());

    let mut succeeded = 0;
    for _ in 0..3 {
        succeeded += worker.process_batch().await.unwrap().succeeded;
        store.make_all_due().await;
    }

    assert_eq!(succeeded, 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    assert!(store.all().await.is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_workers_process_each_record_once() {
    let store = Arc::new(InMemoryRetryStore::new());
    for i in 0..30 {
        store
            .enqueue(RetryRecord::new(OPERATION, json!({"n": i})))
            .await
            .unwrap();
    }

    let processor = Arc::new(EventuallySucceeds {
        failures: 0,
        calls: AtomicUsize::new(0),
    });

    let mut handles = Vec::new();
    for _ in 0..3 {
        let worker = RetryWorker::new(
            Arc::clone(&store) as Arc<dyn RetryStore>,
            RetryPolicy::default(),
            RetryWorkerConfig::default().with_batch_size(10),
        )
        .with_processor(processor.clone());
        handles.push(tokio::spawn(async move { worker.process_batch().await }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap().unwrap().succeeded;
    }

    assert_eq!(total, 30);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 30);
    assert!(store.all().await.is_empty());
}

// =============================================================================
// Lease fencing
// =============================================================================

#[tokio::test]
async fn superseded_lease_does_not_release_newer_claim() {
    let store = Arc::new(InMemoryRetryStore::new());
    let id = store
        .enqueue(RetryRecord::new(OPERATION, json!({})))
        .await
        .unwrap();
    let processor = Arc::new(SupersededMidFlight {
        store: Arc::clone(&store),
        calls: AtomicUsize::new(0),
    });

    // Zero-length lease: the record is claimable again while still in flight.
    let slow = RetryWorker::new(
        Arc::clone(&store) as Arc<dyn RetryStore>,
        RetryPolicy::default(),
        RetryWorkerConfig::default().with_lease(0),
    )
    .with_processor(processor.clone());

    let report = slow.process_batch().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.store_errors, 1);

    // The newer claim still holds the record; a third claimant gets nothing.
    assert!(store
        .claim_batch(10, Duration::from_secs(300))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store.stats().await.unwrap(),
        RetryStats {
            pending: 0,
            claimed: 1,
            dead_letter: 0
        }
    );

    let stored = store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 2);
    assert!(stored.last_error.is_none());
}
