use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{ItemError, ItemStatus, Job, JobStatus};

/// Request body for submitting a batch of images for annotation.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatchRequest {
    #[garde(length(min = 1), inner(length(min = 1, max = 256)))]
    pub item_ids: Vec<String>,

    /// Clamped into the tier's range, never rejected.
    #[garde(skip)]
    pub concurrency: Option<i64>,

    #[garde(skip)]
    pub rate_limit_per_minute: Option<i64>,
}

/// Response after a batch is accepted.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBatchResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub total_items: usize,
    pub concurrency: usize,
    pub rate_limit_per_minute: u32,
}

/// Counter block of a progress snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCounts {
    pub total: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub percentage: f64,
}

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: ProgressCounts,
    pub estimated_time_remaining_ms: Option<u64>,
}

/// Caller-facing error entry. Timestamps are kept, internals never are.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemErrorView {
    pub item_id: String,
    pub error: String,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
}

impl From<&ItemError> for ItemErrorView {
    fn from(e: &ItemError) -> Self {
        Self {
            item_id: e.item_id.clone(),
            error: e.error.clone(),
            attempt_number: e.attempt_number,
            timestamp: e.timestamp,
        }
    }
}

/// Response for `GET /api/v1/jobs/{job_id}/status`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: ProgressCounts,
    pub errors: Vec<ItemErrorView>,
    pub estimated_time_remaining_ms: Option<u64>,
    pub concurrency: usize,
    pub rate_limit_per_minute: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusResponse {
    pub fn new(job: &Job, snapshot: ProgressSnapshot) -> Self {
        Self {
            job_id: job.id,
            status: snapshot.status,
            progress: snapshot.progress,
            errors: job.errors.iter().map(ItemErrorView::from).collect(),
            estimated_time_remaining_ms: snapshot.estimated_time_remaining_ms,
            concurrency: job.concurrency,
            rate_limit_per_minute: job.rate_limit_per_minute,
            failure_reason: job.failure_reason.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            updated_at: job.updated_at,
        }
    }
}

/// One row of `GET /api/v1/jobs/{job_id}/items`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub item_id: String,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub annotation_count: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItemsResponse {
    pub job_id: Uuid,
    pub items: Vec<ItemView>,
    /// Every failed attempt, including ones later recovered by a retry.
    pub attempt_history: Vec<ItemErrorView>,
}

impl From<&Job> for JobItemsResponse {
    fn from(job: &Job) -> Self {
        let items = job
            .items
            .iter()
            .map(|item| ItemView {
                item_id: item.item_id.clone(),
                status: item.status,
                attempts: item.attempts,
                last_error: item.last_error.clone(),
                completed_at: item.completed_at,
                annotation_count: item.output.as_ref().map(|set| set.len()),
            })
            .collect();
        Self {
            job_id: job.id,
            items,
            attempt_history: job.attempt_history.iter().map(ItemErrorView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub message: String,
}

/// Summary row for the active-jobs listing.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total: usize,
    pub processed: usize,
    pub percentage: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}
