//! Retry worker
//!
//! Periodic, out-of-band batch job that drains the retry store. Safe to run
//! from several replicas at once; the store's claim lease keeps them apart.

use std::collections::HashMap;
use std::env::VarError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use opsbot_core::config::parse_or;
use opsbot_core::ConfigError;

use super::{RetryPolicy, RetryRecord, RetryResult, RetryStore};
use crate::error::{StoreError, StoreResult};

/// Module-specific handler for one `operation_type`.
#[async_trait]
pub trait RetryProcessor: Send + Sync {
    /// The `operation_type` this processor handles.
    fn operation_type(&self) -> &str;

    /// Re-attempt the operation described by `record`.
    async fn process_record(&self, record: &RetryRecord) -> RetryResult;
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryWorkerConfig {
    /// Maximum records claimed per batch.
    pub batch_size: usize,
    /// Seconds a claimed record stays invisible to other workers.
    pub lease_secs: u64,
    /// Seconds between batches in [`RetryWorker::run`].
    pub poll_interval_secs: u64,
}

impl Default for RetryWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lease_secs: 300,
            poll_interval_secs: 60,
        }
    }
}

impl RetryWorkerConfig {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_lease(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        Ok(Self {
            batch_size: parse_or(&reader, "RETRY_BATCH_SIZE", defaults.batch_size)?,
            lease_secs: parse_or(&reader, "RETRY_LEASE_SECONDS", defaults.lease_secs)?,
            poll_interval_secs: parse_or(
                &reader,
                "RETRY_POLL_INTERVAL_SECONDS",
                defaults.poll_interval_secs,
            )?,
        })
    }
}

/// Counts from one [`RetryWorker::process_batch`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Store transitions that failed, including claims superseded by another
    /// worker. Those records fall back to lease expiry or the newer claim.
    pub store_errors: usize,
}

enum Transition {
    Success,
    Retry(String),
    DeadLetter(String),
}

/// Batch worker draining a [`RetryStore`].
pub struct RetryWorker {
    store: Arc<dyn RetryStore>,
    policy: RetryPolicy,
    config: RetryWorkerConfig,
    processors: HashMap<String, Arc<dyn RetryProcessor>>,
}

impl RetryWorker {
    pub fn new(store: Arc<dyn RetryStore>, policy: RetryPolicy, config: RetryWorkerConfig) -> Self {
        Self {
            store,
            policy,
            config,
            processors: HashMap::new(),
        }
    }

    /// Route records of the processor's `operation_type` to it.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn RetryProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn register(&mut self, processor: Arc<dyn RetryProcessor>) {
        let operation_type = processor.operation_type().to_string();
        if self
            .processors
            .insert(operation_type.clone(), processor)
            .is_some()
        {
            warn!(
                target: "retry_worker",
                operation_type = %operation_type,
                "Replaced previously registered retry processor"
            );
        }
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Claim one batch of due records and process each.
    #[instrument(skip(self), target = "retry_worker")]
    pub async fn process_batch(&self) -> StoreResult<WorkerReport> {
        let lease = Duration::from_secs(self.config.lease_secs);
        let records = self
            .store
            .claim_batch(self.config.batch_size, lease)
            .await?;

        let mut report = WorkerReport {
            claimed: records.len(),
            ..WorkerReport::default()
        };

        for record in records {
            self.process_record(record, &mut report).await;
        }

        if report.claimed > 0 {
            info!(
                target: "retry_worker",
                claimed = report.claimed,
                succeeded = report.succeeded,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                store_errors = report.store_errors,
                "Processed retry batch"
            );
        }
        Ok(report)
    }

    /// Map one claimed record to its store transition. A `Success` on the
    /// final allowed attempt is kept rather than forced to dead letter, since
    /// the side effect has already happened; only `Retry` is capped.
    async fn decide(&self, record: &RetryRecord) -> Transition {
        let attempt = record.attempts;

        if attempt > self.policy.max_attempts {
            return Transition::DeadLetter(format!(
                "attempt budget of {} exhausted before processing",
                self.policy.max_attempts
            ));
        }

        let Some(processor) = self.processors.get(&record.operation_type) else {
            return Transition::DeadLetter(format!(
                "no retry processor registered for operation type '{}'",
                record.operation_type
            ));
        };

        match processor.process_record(record).await {
            RetryResult::Success => Transition::Success,
            RetryResult::Retry(error) if self.policy.is_exhausted(attempt) => {
                Transition::DeadLetter(format!(
                    "max attempts ({}) exceeded: {error}",
                    self.policy.max_attempts
                ))
            }
            RetryResult::Retry(error) => Transition::Retry(error),
            RetryResult::PermanentFailure(error) => Transition::DeadLetter(error),
        }
    }

    async fn process_record(&self, record: RetryRecord, report: &mut WorkerReport) {
        let id = record.id;
        let attempt = record.attempts;
        let correlation_id = record.correlation_id().unwrap_or("-").to_string();

        let Some(lease) = record.lease else {
            report.store_errors += 1;
            error!(
                target: "retry_worker",
                record_id = %id,
                correlation_id = %correlation_id,
                "Claimed retry record carries no lease, leaving it to expire"
            );
            return;
        };

        let applied = match self.decide(&record).await {
            Transition::Success => {
                debug!(
                    target: "retry_worker",
                    record_id = %id,
                    correlation_id = %correlation_id,
                    attempt,
                    "Retry succeeded"
                );
                self.store
                    .mark_success(id, lease)
                    .await
                    .map(|()| report.succeeded += 1)
            }
            Transition::Retry(error) => {
                let next_retry_at = self.policy.next_retry_at(attempt, Utc::now());
                warn!(
                    target: "retry_worker",
                    record_id = %id,
                    correlation_id = %correlation_id,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "Retry failed, rescheduling"
                );
                self.store
                    .mark_retry(id, lease, &error, next_retry_at)
                    .await
                    .map(|()| report.retried += 1)
            }
            Transition::DeadLetter(error) => {
                error!(
                    target: "retry_worker",
                    record_id = %id,
                    correlation_id = %correlation_id,
                    operation_type = %record.operation_type,
                    attempt,
                    error = %error,
                    "Moving retry record to dead letter"
                );
                self.store
                    .mark_dead_letter(id, lease, &error)
                    .await
                    .map(|()| report.dead_lettered += 1)
            }
        };

        match applied {
            Ok(()) => {}
            Err(StoreError::LeaseLost(_)) => {
                report.store_errors += 1;
                warn!(
                    target: "retry_worker",
                    record_id = %id,
                    correlation_id = %correlation_id,
                    attempt,
                    "Lease superseded before the transition was recorded"
                );
            }
            Err(e) => {
                report.store_errors += 1;
                error!(
                    target: "retry_worker",
                    record_id = %id,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to record retry transition"
                );
            }
        }
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            target: "retry_worker",
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval_secs,
            processors = self.processors.len(),
            "Starting retry worker"
        );

        let mut poll = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.process_batch().await {
                        error!(
                            target: "retry_worker",
                            error = %e,
                            transient = e.is_transient(),
                            "Failed to claim retry batch"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(target: "retry_worker", "Retry worker stopped");
    }
}
