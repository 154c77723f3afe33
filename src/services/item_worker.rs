use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::models::annotation::AnnotationSet;
use crate::models::job::{ItemError, Job, JobStateError};
use crate::services::cancellation::CancellationToken;
use crate::services::clock::Clock;
use crate::services::generator::{AnnotationGenerator, ErrorClass, GenerateError};
use crate::services::job_store::JobStore;
use crate::services::rate_limiter::{LimiterChain, RateLimitError};
use crate::services::retry::{RetryDecision, RetryPolicy, RetryState};

/// How a single item ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// Failed, and this failure completed a run of identical transport
    /// errors long enough to stop the whole job.
    Systemic(String),
}

/// Why one attempt did not produce annotations.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

impl AttemptError {
    fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Generate(e) => e.class(),
            AttemptError::RateLimit(_) => ErrorClass::Transient,
        }
    }

    fn transport_signature(&self) -> Option<String> {
        match self {
            AttemptError::Generate(e) => e.transport_signature(),
            AttemptError::RateLimit(_) => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AttemptError::Generate(e) => e.retry_after(),
            AttemptError::RateLimit(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub call_timeout: Duration,
    pub acquire_timeout: Duration,
    pub systemic_failure_threshold: u32,
}

/// Runs one item through rate limiting, the provider call and retries, and
/// writes every step to the job store.
pub struct ItemWorker {
    store: Arc<JobStore>,
    generator: Arc<dyn AnnotationGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    limiters: LimiterChain,
    settings: WorkerSettings,
}

impl ItemWorker {
    pub fn new(
        store: Arc<JobStore>,
        generator: Arc<dyn AnnotationGenerator>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        limiters: LimiterChain,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            generator,
            clock,
            retry,
            limiters,
            settings,
        }
    }

    pub async fn process(
        &self,
        job_id: Uuid,
        index: usize,
        item_id: &str,
        token: &CancellationToken,
    ) -> ItemOutcome {
        let mut token = token.clone();
        let now = self.clock.now();
        if self.record(job_id, |job| job.begin_item(index, now)).is_none() {
            return ItemOutcome::Cancelled;
        }

        let mut state = RetryState::default();
        loop {
            let wait = state.wait_from(self.clock.now());
            if !wait.is_zero() {
                tokio::select! {
                    _ = self.clock.sleep(wait) => {}
                    _ = token.stopped() => {}
                }
            }
            if token.is_stopped() {
                return self.cancel(job_id, index, item_id, state.attempts);
            }

            let acquired = tokio::select! {
                result = self.limiters.acquire(self.clock.as_ref(), self.settings.acquire_timeout) => Some(result),
                _ = token.stopped() => None,
            };
            let Some(acquired) = acquired else {
                return self.cancel(job_id, index, item_id, state.attempts);
            };

            // A granted token or an expired wait is an attempt; a cancelled wait is not.
            let attempt = state.begin_attempt();
            self.record(job_id, |job| job.start_attempt(index));
            metrics::counter!("batch_item_attempts_total").increment(1);

            let result = match acquired {
                Err(e) => Err(AttemptError::from(e)),
                Ok(_) => self.call(job_id, item_id, attempt).await,
            };

            let error = match result {
                Ok(set) => {
                    let now = self.clock.now();
                    self.record(job_id, |job| job.complete_success(index, set, now));
                    metrics::counter!("batch_items_processed_total", "outcome" => "success")
                        .increment(1);
                    tracing::info!(job_id = %job_id, item_id, attempt, "Item annotated");
                    return ItemOutcome::Succeeded;
                }
                Err(error) => error,
            };

            let now = self.clock.now();
            let item_error = ItemError {
                item_id: item_id.to_string(),
                error: error.to_string(),
                attempt_number: attempt,
                timestamp: now,
            };
            self.record(job_id, |job| job.record_attempt_failure(index, item_error.clone()));

            match self
                .retry
                .on_failure(&mut state, error.class(), error.retry_after(), now)
            {
                RetryDecision::RetryAt(at) => {
                    tracing::warn!(
                        job_id = %job_id,
                        item_id,
                        attempt,
                        retry_at = %at,
                        error = %error,
                        "Transient failure, retrying item"
                    );
                }
                RetryDecision::GiveUp => {
                    return self.fail(job_id, index, item_error, error.transport_signature());
                }
            }
        }
    }

    async fn call(&self, job_id: Uuid, item_id: &str, attempt: u32) -> Result<AnnotationSet, AttemptError> {
        let timeout = self.settings.call_timeout;
        let started = Instant::now();
        tracing::debug!(job_id = %job_id, item_id, attempt, "Calling annotation provider");

        let result = tokio::time::timeout(timeout, self.generator.generate(item_id))
            .await
            .unwrap_or(Err(GenerateError::Timeout(timeout)));

        metrics::histogram!("annotation_generation_seconds").record(started.elapsed().as_secs_f64());
        result.map_err(AttemptError::from)
    }

    fn fail(
        &self,
        job_id: Uuid,
        index: usize,
        error: ItemError,
        transport: Option<String>,
    ) -> ItemOutcome {
        let message = error.error.clone();
        let attempts = error.attempt_number;
        let streak = self
            .record(job_id, |job| job.complete_failure(index, error, transport.as_deref()))
            .unwrap_or(0);
        metrics::counter!("batch_items_processed_total", "outcome" => "failed").increment(1);
        tracing::warn!(
            job_id = %job_id,
            item_index = index,
            attempts,
            error = %message,
            "Item failed"
        );

        let threshold = self.settings.systemic_failure_threshold;
        if transport.is_some() && threshold > 0 && streak >= threshold {
            ItemOutcome::Systemic(format!(
                "{streak} consecutive items failed with: {message}"
            ))
        } else {
            ItemOutcome::Failed
        }
    }

    fn cancel(&self, job_id: Uuid, index: usize, item_id: &str, attempts: u32) -> ItemOutcome {
        let now = self.clock.now();
        self.record(job_id, |job| job.cancel_item(index, now));
        metrics::counter!("batch_items_processed_total", "outcome" => "cancelled").increment(1);
        tracing::info!(job_id = %job_id, item_id, attempts, "Item cancelled before completion");
        ItemOutcome::Cancelled
    }

    fn record<R>(
        &self,
        job_id: Uuid,
        f: impl FnOnce(&mut Job) -> Result<R, JobStateError>,
    ) -> Option<R> {
        match self.store.update(job_id, f) {
            Some(Ok(value)) => Some(value),
            Some(Err(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "Rejected item state change");
                None
            }
            None => {
                tracing::warn!(job_id = %job_id, "Job no longer in store");
                None
            }
        }
    }
}
