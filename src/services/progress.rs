//! Progress reporting. Everything here is a pure function of a job record.

use crate::models::batch::{JobSummary, ProgressCounts, ProgressSnapshot};
use crate::models::job::{Job, JobStatus};

/// Share of processed items, 0..=100, rounded to two decimals.
pub fn percentage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = processed as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Remaining time from the moving average of recent item durations, spread
/// over the job's workers. `None` until at least one item has finished.
pub fn estimate_remaining_ms(job: &Job) -> Option<u64> {
    let (count, sum) = job
        .recent_durations_ms()
        .fold((0u64, 0u64), |(n, sum), ms| (n + 1, sum + ms.max(0) as u64));
    if count == 0 {
        return None;
    }
    if job.status.is_terminal() {
        return Some(0);
    }

    let average = sum as f64 / count as f64;
    let workers = job.concurrency.max(1) as f64;
    Some((average * job.remaining_items() as f64 / workers).ceil() as u64)
}

pub fn counts(job: &Job) -> ProgressCounts {
    ProgressCounts {
        total: job.total_items(),
        processed: job.processed_items,
        successful: job.successful_items,
        failed: job.failed_items,
        cancelled: job.cancelled_items,
        percentage: percentage(job.processed_items, job.total_items()),
    }
}

pub fn snapshot(job: &Job) -> ProgressSnapshot {
    ProgressSnapshot {
        job_id: job.id,
        status: job.status,
        progress: counts(job),
        estimated_time_remaining_ms: estimate_remaining_ms(job),
    }
}

pub fn summary(job: &Job) -> JobSummary {
    JobSummary {
        job_id: job.id,
        status: job.status,
        total: job.total_items(),
        processed: job.processed_items,
        percentage: percentage(job.processed_items, job.total_items()),
        created_at: job.created_at,
        started_at: job.started_at,
    }
}

/// Terminal status once every worker of a job has drained.
///
/// `undispatched` is the number of items no worker ever picked up.
pub fn final_status(job: &Job, aborted: bool, undispatched: usize) -> JobStatus {
    if job.cancel_requested {
        JobStatus::Cancelled
    } else if aborted && undispatched > 0 {
        JobStatus::Failed
    } else if job.processed_items == job.total_items() {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    }
}
