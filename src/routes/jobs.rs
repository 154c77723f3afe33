use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::batch::{
    CancelResponse, JobItemsResponse, JobStatusResponse, JobSummary, SubmitBatchRequest,
    SubmitBatchResponse,
};
use crate::routes::ApiError;
use crate::services::job_store::CancelRequest;
use crate::services::progress;

/// POST /api/v1/jobs — Submit a batch of image ids for annotation.
pub async fn submit_batch(
    State(state): State<AppState>,
    payload: Result<Json<SubmitBatchRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    request.validate()?;

    let job_id = state.processor.start_batch(
        request.item_ids,
        request.concurrency,
        request.rate_limit_per_minute,
    )?;

    let response = state
        .processor
        .store()
        .read(job_id, |job| SubmitBatchResponse {
            job_id,
            status: job.status,
            message: "Batch accepted for processing".to_string(),
            total_items: job.total_items(),
            concurrency: job.concurrency,
            rate_limit_per_minute: job.rate_limit_per_minute,
        })
        .ok_or_else(|| ApiError::Internal(format!("job {job_id} vanished after submission")))?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/v1/jobs — Summaries of every job still running.
pub async fn list_active_jobs(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.processor.list_active())
}

/// GET /api/v1/jobs/{job_id}/status — Poll job progress.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    state
        .processor
        .store()
        .read(job_id, |job| JobStatusResponse::new(job, progress::snapshot(job)))
        .map(Json)
        .ok_or(ApiError::NotFound(job_id))
}

/// GET /api/v1/jobs/{job_id}/items — Per-item results and attempt history.
pub async fn get_job_items(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobItemsResponse>, ApiError> {
    state
        .processor
        .store()
        .read(job_id, |job| JobItemsResponse::from(job))
        .map(Json)
        .ok_or(ApiError::NotFound(job_id))
}

/// POST /api/v1/jobs/{job_id}/cancel — Stop dispatching new items.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let (cancelled, message) = match state.processor.cancel(job_id) {
        CancelRequest::Accepted => (
            true,
            "Cancellation requested; items already in flight will finish".to_string(),
        ),
        CancelRequest::AlreadyRequested => (false, "Cancellation already requested".to_string()),
        CancelRequest::AlreadyTerminal => {
            let status = state
                .processor
                .store()
                .status(job_id)
                .ok_or(ApiError::NotFound(job_id))?;
            (false, format!("Job already finished with status {status}"))
        }
        CancelRequest::NotFound => return Err(ApiError::NotFound(job_id)),
    };

    Ok(Json(CancelResponse { cancelled, message }))
}
