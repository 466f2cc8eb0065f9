//! Job API endpoints
//!
//! Status polling, listing and cancellation, plus the helpers conversion
//! endpoints use to answer `202 Accepted`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::api::middleware::{ApiError, AppState};
use crate::convert::{Conversion, ConvertError};
use crate::jobs::{Artifact, JobId, JobOutput, JobRecord, JobStatus};

/// Body of a `202 Accepted` answer
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub status: JobStatus,
    pub status_url: String,
}

/// Response for the job listing
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobRecord>,
    pub total: usize,
    pub active: usize,
}

pub type Accepted = (StatusCode, Json<JobAccepted>);

/// Build the job router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job).delete(cancel_job))
}

/// Answer for a freshly submitted job
pub fn accepted(job_id: JobId) -> Accepted {
    let status_url = format!("/api/v1/jobs/{}", job_id);
    (
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id,
            status: JobStatus::Pending,
            status_url,
        }),
    )
}

/// Turn a finished conversion into a job result with downloadable artifacts
pub async fn job_output(conversion: Conversion) -> Result<JobOutput, ConvertError> {
    let mut artifacts = Vec::with_capacity(conversion.files.len());
    for file in &conversion.files {
        artifacts.push(Artifact::from_path(file).await?);
    }
    Ok(JobOutput {
        artifacts,
        message: conversion.message,
        text: conversion.text,
    })
}

/// GET /api/v1/jobs - All known jobs, newest first
async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    let jobs = state.jobs.list().await;
    let active = jobs.iter().filter(|j| !j.status.is_terminal()).count();
    Json(JobListResponse {
        total: jobs.len(),
        active,
        jobs,
    })
}

/// GET /api/v1/jobs/{id} - Job status, progress and artifacts
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .jobs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {}", id)))
}

/// DELETE /api/v1/jobs/{id} - Cancel a job that has not started
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job = state
        .jobs
        .get(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {}", id)))?;

    if !state.jobs.cancel(&id).await {
        // The job may have started between the lookup and the cancel attempt
        let status = state.jobs.get(&id).await.map(|j| j.status).unwrap_or(job.status);
        return Err(ApiError::with_details(
            "CONFLICT",
            "Only pending jobs can be cancelled",
            serde_json::json!({ "status": status }),
        ));
    }

    state
        .jobs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {}", id)))
}
