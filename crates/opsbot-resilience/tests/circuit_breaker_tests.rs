//! Integration tests for per-provider circuit breaking.
//!
//! Drives breakers through the registry the way the orchestrator does, with
//! tokio's paused clock standing in for the open timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opsbot_core::{codes, OperationResult, OperationStatus};
use opsbot_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

fn registry(threshold: u32, open_secs: u64, trial_calls: u32) -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_open_timeout(open_secs)
            .with_half_open_max_calls(trial_calls),
    )
}

/// Counts how many calls actually reached the "provider".
#[derive(Default)]
struct CountingProvider {
    calls: AtomicUsize,
}

impl CountingProvider {
    async fn timeout(&self) -> OperationResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OperationResult::timeout("directory timed out")
    }

    async fn ok(&self) -> OperationResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        OperationResult::success(())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Full CLOSED -> OPEN -> HALF_OPEN -> CLOSED cycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn breaker_full_recovery_cycle() {
    let registry = registry(3, 60, 2);
    let provider = CountingProvider::default();

    for _ in 0..3 {
        let result = registry.call("aws", || provider.timeout()).await;
        assert_eq!(result.status, OperationStatus::TransientError);
    }
    assert_eq!(provider.calls(), 3);
    assert_eq!(registry.get_open_circuit_breakers().await, vec!["aws"]);

    // Rejected before the timeout without reaching the provider.
    tokio::time::advance(Duration::from_secs(30)).await;
    let rejected = registry.call("aws", || provider.ok()).await;
    assert_eq!(rejected.error_code.as_deref(), Some(codes::CIRCUIT_OPEN));
    assert_eq!(rejected.retry_after, Some(30));
    assert_eq!(provider.calls(), 3);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(registry.call("aws", || provider.ok()).await.is_success());

    let breaker = registry.get_or_create("aws").await;
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    assert!(registry.call("aws", || provider.ok()).await.is_success());
    let stats = breaker.stats().await;
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.failure_count, 0);
    assert_eq!(stats.success_count, 0);
    assert_eq!(provider.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn breaker_reopens_on_trial_failure() {
    let registry = registry(3, 60, 2);
    let provider = CountingProvider::default();

    for _ in 0..3 {
        registry.call("aws", || provider.timeout()).await;
    }
    tokio::time::advance(Duration::from_secs(60)).await;

    let trial = registry.call("aws", || provider.timeout()).await;
    assert_eq!(trial.status, OperationStatus::TransientError);
    assert_ne!(trial.error_code.as_deref(), Some(codes::CIRCUIT_OPEN));

    let breaker = registry.get_or_create("aws").await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    let rejected = registry.call("aws", || provider.ok()).await;
    assert_eq!(rejected.error_code.as_deref(), Some(codes::CIRCUIT_OPEN));
    assert_eq!(provider.calls(), 4);
}

// ---------------------------------------------------------------------------
// Isolation between providers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_provider_does_not_affect_others() {
    let registry = registry(2, 60, 1);
    let aws = CountingProvider::default();
    let google = CountingProvider::default();

    for _ in 0..5 {
        registry.call("aws", || aws.timeout()).await;
    }
    for _ in 0..5 {
        assert!(registry.call("google", || google.ok()).await.is_success());
    }

    assert_eq!(aws.calls(), 2);
    assert_eq!(google.calls(), 5);

    let stats = registry.get_all_circuit_breaker_stats().await;
    assert_eq!(stats["aws"].state, CircuitState::Open);
    assert_eq!(stats["google"].state, CircuitState::Closed);
    assert!(stats["google"].last_failure_time.is_none());
}

#[tokio::test]
async fn non_transient_outcomes_keep_breaker_closed() {
    let registry = registry(2, 60, 1);

    for _ in 0..10 {
        let result: OperationResult<()> = registry
            .call("google", || async { OperationResult::not_found("no such group") })
            .await;
        assert_eq!(result.status, OperationStatus::NotFound);
    }

    assert!(registry.get_open_circuit_breakers().await.is_empty());
}

#[tokio::test]
async fn concurrent_callers_share_one_breaker() {
    let registry = registry(5, 60, 1);
    let provider = Arc::new(CountingProvider::default());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let registry = registry.clone();
        let provider = Arc::clone(&provider);
        handles.push(tokio::spawn(async move {
            registry.call("aws", || provider.timeout()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Calls admitted before the fifth failure may still reach the provider.
    let stats = registry.get_all_circuit_breaker_stats().await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats["aws"].state, CircuitState::Open);
    assert!(provider.calls() >= 5);
}

#[tokio::test]
async fn disabled_registry_reports_enabled_false() {
    let registry =
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default().with_enabled(false));
    let provider = CountingProvider::default();

    for _ in 0..10 {
        registry.call("aws", || provider.timeout()).await;
    }

    assert_eq!(provider.calls(), 10);
    let stats = registry.get_all_circuit_breaker_stats().await;
    assert!(!stats["aws"].enabled);
    assert!(registry.get_open_circuit_breakers().await.is_empty());
}
