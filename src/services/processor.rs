//! Batch job orchestration.
//!
//! `start_batch` validates a submission, records the job and spawns a driver
//! task. The driver runs `min(concurrency, items)` workers over one FIFO
//! queue of item indices and, once every worker has drained, moves the job to
//! its terminal status.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::models::batch::{JobSummary, ProgressSnapshot};
use crate::models::job::{Job, JobStatus};
use crate::models::tier::ServiceTier;
use crate::services::cancellation::{CancellationController, CancellationToken, StopReason};
use crate::services::clock::Clock;
use crate::services::generator::AnnotationGenerator;
use crate::services::item_worker::{ItemOutcome, ItemWorker, WorkerSettings};
use crate::services::job_store::{CancelRequest, JobStore};
use crate::services::progress;
use crate::services::rate_limiter::{LimiterChain, RateLimiter, RateLimiterRegistry};
use crate::services::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub tier: ServiceTier,
    /// Jobs with the same scope share one provider-level rate limiter.
    pub credential_scope: String,
    pub max_batch_items: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub acquire_timeout: Duration,
    /// Consecutive identical transport failures that fail a job; 0 disables.
    pub systemic_failure_threshold: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tier: ServiceTier::Free,
            credential_scope: "default".to_string(),
            max_batch_items: 500,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(120),
            systemic_failure_threshold: 5,
        }
    }
}

/// Submission rejected before a job was created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("itemIds must contain at least one item")]
    EmptyBatch,

    #[error("itemIds has {count} items, the maximum is {max}")]
    TooManyItems { count: usize, max: usize },

    #[error("itemIds[{0}] is blank")]
    BlankItemId(usize),
}

pub struct BatchProcessor {
    config: ProcessorConfig,
    store: Arc<JobStore>,
    generator: Arc<dyn AnnotationGenerator>,
    clock: Arc<dyn Clock>,
    limiters: RateLimiterRegistry,
    running: Arc<DashMap<Uuid, Arc<CancellationController>>>,
}

impl BatchProcessor {
    pub fn new(
        config: ProcessorConfig,
        store: Arc<JobStore>,
        generator: Arc<dyn AnnotationGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            limiters: RateLimiterRegistry::new(Arc::clone(&clock)),
            config,
            store,
            generator,
            clock,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    fn validate(&self, item_ids: &[String]) -> Result<(), ValidationError> {
        if item_ids.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if item_ids.len() > self.config.max_batch_items {
            return Err(ValidationError::TooManyItems {
                count: item_ids.len(),
                max: self.config.max_batch_items,
            });
        }
        if let Some(index) = item_ids.iter().position(|id| id.trim().is_empty()) {
            return Err(ValidationError::BlankItemId(index));
        }
        Ok(())
    }

    /// Accepts a batch and starts processing it in the background.
    ///
    /// Concurrency and rate are clamped into the tier's range. Must be called
    /// from within a tokio runtime.
    pub fn start_batch(
        &self,
        item_ids: Vec<String>,
        concurrency: Option<i64>,
        rate_limit_per_minute: Option<i64>,
    ) -> Result<Uuid, ValidationError> {
        self.validate(&item_ids)?;

        let limits = self.config.tier.limits();
        let concurrency = limits.clamp_concurrency(concurrency);
        let rate = limits.clamp_rate(rate_limit_per_minute);

        let job = Job::new(
            Uuid::new_v4(),
            item_ids,
            self.config.tier,
            concurrency,
            rate,
            self.clock.now(),
        );
        let job_id = job.id;
        let item_ids: Arc<[String]> = job.item_ids.clone().into();
        let total = item_ids.len();
        self.store.insert(job);

        let mut chain = Vec::with_capacity(2);
        if rate < limits.max_rate_per_minute {
            chain.push(Arc::new(RateLimiter::per_minute(rate, Arc::clone(&self.clock))));
        }
        chain.push(
            self.limiters
                .shared(&self.config.credential_scope, limits.max_rate_per_minute),
        );

        let worker = Arc::new(ItemWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&self.generator),
            Arc::clone(&self.clock),
            self.config.retry.clone(),
            LimiterChain::new(chain),
            WorkerSettings {
                call_timeout: self.config.call_timeout,
                acquire_timeout: self.config.acquire_timeout,
                systemic_failure_threshold: self.config.systemic_failure_threshold,
            },
        ));

        let controller = Arc::new(CancellationController::new());
        self.running.insert(job_id, Arc::clone(&controller));

        let run = JobRun {
            job_id,
            item_ids,
            queue: Arc::new(Mutex::new((0..total).collect())),
            workers: concurrency.min(total),
            worker,
            controller,
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            running: Arc::clone(&self.running),
        };
        tokio::spawn(run.drive());

        metrics::counter!("batch_jobs_submitted_total").increment(1);
        metrics::gauge!("batch_active_jobs").set(self.store.active_count() as f64);
        tracing::info!(
            job_id = %job_id,
            items = total,
            concurrency,
            rate_limit_per_minute = rate,
            tier = %self.config.tier,
            "Batch job accepted"
        );

        Ok(job_id)
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.store.get(job_id)
    }

    pub fn get_job_progress(&self, job_id: Uuid) -> Option<ProgressSnapshot> {
        self.store.read(job_id, progress::snapshot)
    }

    /// Requests cooperative cancellation. Items already handed to the
    /// provider finish; nothing new is dispatched.
    pub fn cancel(&self, job_id: Uuid) -> CancelRequest {
        let outcome = self.store.request_cancel(job_id, self.clock.now());
        if outcome == CancelRequest::Accepted {
            if let Some(controller) = self.running.get(&job_id) {
                controller.cancel();
            }
            tracing::info!(job_id = %job_id, "Cancellation requested");
        }
        outcome
    }

    /// True only when this call moved the job towards `CANCELLED`.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        self.cancel(job_id) == CancelRequest::Accepted
    }

    pub fn list_active(&self) -> Vec<JobSummary> {
        self.store.list_active(progress::summary)
    }

    /// Removes terminal jobs that finished more than `ttl` ago.
    pub fn purge_finished(&self, ttl: Duration) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::milliseconds(ttl.as_millis() as i64);
        let purged = self.store.purge_finished(cutoff);
        if purged > 0 {
            tracing::info!(purged, "Purged finished jobs");
        }
        purged
    }
}

/// Everything the background driver of one job needs.
struct JobRun {
    job_id: Uuid,
    item_ids: Arc<[String]>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    workers: usize,
    worker: Arc<ItemWorker>,
    controller: Arc<CancellationController>,
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
    running: Arc<DashMap<Uuid, Arc<CancellationController>>>,
}

impl JobRun {
    async fn drive(self) {
        let mut pool = JoinSet::new();
        for worker_no in 0..self.workers {
            pool.spawn(worker_loop(
                worker_no,
                self.job_id,
                Arc::clone(&self.item_ids),
                Arc::clone(&self.queue),
                Arc::clone(&self.worker),
                Arc::clone(&self.controller),
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
            ));
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!(job_id = %self.job_id, error = %e, "Worker task panicked");
            }
        }

        self.finish();
    }

    fn finish(&self) {
        let now = self.clock.now();
        let reason = self.controller.reason();
        let aborted = matches!(reason, Some(StopReason::Aborted(_)));

        let finished = self.store.update(self.job_id, |job| {
            let undispatched = job.remaining_items();
            job.cancel_remaining(now);

            let status = progress::final_status(job, aborted, undispatched);
            if status == JobStatus::Failed {
                job.failure_reason = Some(match &reason {
                    Some(StopReason::Aborted(why)) => why.clone(),
                    _ => "workers stopped before every item was processed".to_string(),
                });
            }
            if job.status == JobStatus::Pending && status != JobStatus::Cancelled {
                let _ = job.transition(JobStatus::Processing, now);
            }
            job.transition(status, now).map(|()| {
                (
                    status,
                    job.successful_items,
                    job.failed_items,
                    job.cancelled_items,
                )
            })
        });

        self.running.remove(&self.job_id);
        metrics::gauge!("batch_active_jobs").set(self.store.active_count() as f64);

        match finished {
            Some(Ok((status, successful, failed, cancelled))) => {
                metrics::counter!("batch_jobs_finished_total", "status" => status.to_string())
                    .increment(1);
                tracing::info!(
                    job_id = %self.job_id,
                    status = %status,
                    successful,
                    failed,
                    cancelled,
                    "Batch job finished"
                );
            }
            Some(Err(e)) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Could not finalize job");
            }
            None => {
                tracing::warn!(job_id = %self.job_id, "Job removed before it finished");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_no: usize,
    job_id: Uuid,
    item_ids: Arc<[String]>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    worker: Arc<ItemWorker>,
    controller: Arc<CancellationController>,
    store: Arc<JobStore>,
    clock: Arc<dyn Clock>,
) {
    let token: CancellationToken = controller.token();
    tracing::debug!(job_id = %job_id, worker_no, "Worker started");

    loop {
        if token.is_stopped() {
            break;
        }
        let Some(index) = queue.lock().pop_front() else {
            break;
        };

        let now = clock.now();
        store.update(job_id, |job| {
            if job.status == JobStatus::Pending {
                let _ = job.transition(JobStatus::Processing, now);
            }
        });

        if let ItemOutcome::Systemic(reason) =
            worker.process(job_id, index, &item_ids[index], &token).await
        {
            if controller.abort(reason.clone()) {
                tracing::error!(job_id = %job_id, reason = %reason, "Provider looks unreachable, aborting job");
            }
        }
    }

    tracing::debug!(job_id = %job_id, worker_no, "Worker drained");
}
