//! Conversion job orchestration
//!
//! Requests are accepted immediately and run in the background. A semaphore
//! bounds how many conversions run at once, and a job may also wait on a
//! narrower limit of its own before taking a worker. Waiting jobs stay
//! `pending` and can still be cancelled. Records are kept in memory until
//! retention cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use uuid::Uuid;

use crate::convert::ConvertError;
use crate::storage::{mime_type, FileStore};

pub type JobId = String;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// The conversion a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PdfCompress,
    PdfMerge,
    ImagesToPdf,
    PdfToDocx,
    PdfToImages,
    DocumentToPdf,
    SpreadsheetToPdf,
    PdfOcr,
    VideoToMp3,
    AudioTranscription,
}

/// A downloadable output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub filename: String,
    pub url: String,
    pub size: u64,
    pub mime_type: String,
}

impl Artifact {
    /// Describe a stored file
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let size = tokio::fs::metadata(path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            url: format!("/download/{}", urlencoding::encode(&filename)),
            mime_type: mime_type(&filename).to_string(),
            filename,
            size,
        })
    }
}

/// Public view of a job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Uploaded files consumed by the job
    #[serde(skip)]
    inputs: Vec<PathBuf>,
}

impl JobRecord {
    fn new(id: JobId, kind: JobKind, inputs: Vec<PathBuf>) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            error: None,
            artifacts: Vec::new(),
            text: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            inputs,
        }
    }

    fn cancel(&mut self, reason: &str) {
        self.status = JobStatus::Cancelled;
        self.message = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// What a successful job produced
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub artifacts: Vec<Artifact>,
    pub message: String,
    pub text: Option<String>,
}

/// Handle given to a running task
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    manager: JobManager,
}

impl JobContext {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Report progress (clamped to 100)
    pub async fn set_progress(&self, percent: u8) {
        self.manager.set_progress(&self.id, percent).await;
    }
}

struct Inner {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    permits: Arc<Semaphore>,
    workers: usize,
    store: Option<FileStore>,
}

/// Background job manager
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Manager running at most `workers` jobs at once
    pub fn new(workers: usize) -> Self {
        Self::build(workers, None)
    }

    /// Manager that deletes a job's uploaded inputs once it ends
    pub fn with_input_cleanup(workers: usize, store: FileStore) -> Self {
        Self::build(workers, Some(store))
    }

    fn build(workers: usize, store: Option<FileStore>) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(Inner {
                jobs: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers)),
                workers,
                store,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Accept a job and schedule it
    ///
    /// `inputs` are the uploaded files the task consumes; they are removed
    /// when the job reaches a terminal state.
    pub async fn submit<F, Fut>(&self, kind: JobKind, inputs: Vec<PathBuf>, task: F) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, ConvertError>> + Send + 'static,
    {
        self.schedule(kind, inputs, None, task).await
    }

    /// Like [`submit`](Self::submit), but the job also needs a permit from `limit`
    ///
    /// The job stays `pending`, and cancellable, until it holds that permit,
    /// and only then competes for a worker.
    pub async fn submit_limited<F, Fut>(
        &self,
        kind: JobKind,
        inputs: Vec<PathBuf>,
        limit: Arc<Semaphore>,
        task: F,
    ) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, ConvertError>> + Send + 'static,
    {
        self.schedule(kind, inputs, Some(limit), task).await
    }

    async fn schedule<F, Fut>(
        &self,
        kind: JobKind,
        inputs: Vec<PathBuf>,
        limit: Option<Arc<Semaphore>>,
        task: F,
    ) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, ConvertError>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        self.inner
            .jobs
            .write()
            .await
            .insert(id.clone(), JobRecord::new(id.clone(), kind, inputs));
        tracing::info!("Job {} ({:?}) accepted", id, kind);

        let manager = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move { manager.run(job_id, limit, task).await });

        id
    }

    async fn run<F, Fut>(self, id: JobId, limit: Option<Arc<Semaphore>>, task: F)
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutput, ConvertError>> + Send + 'static,
    {
        let slot = match limit {
            Some(limit) => match limit.acquire_owned().await {
                Ok(slot) => Some(slot),
                Err(_) => {
                    self.cancel_pending(&id, "Server is shutting down").await;
                    return;
                }
            },
            None => None,
        };
        if slot.is_some() && !self.is_pending(&id).await {
            tracing::debug!("Job {} left the queue while waiting for its slot", id);
            return;
        }

        let permit = match self.inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.cancel_pending(&id, "Server is shutting down").await;
                return;
            }
        };

        {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(&id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.status = JobStatus::Processing;
                    job.progress = 0;
                    job.started_at = Some(Utc::now());
                }
                Some(job) => {
                    tracing::debug!("Job {} is {:?}, not starting it", id, job.status);
                    return;
                }
                None => return,
            }
        }
        tracing::info!("Job {} started", id);

        let context = JobContext {
            id: id.clone(),
            manager: self.clone(),
        };
        // A panicking task must still leave a terminal record behind
        let outcome = tokio::spawn(task(context)).await;
        drop(permit);
        drop(slot);

        // Inputs are gone by the time the terminal state becomes visible
        let inputs = match self.inner.jobs.write().await.get_mut(&id) {
            Some(job) => std::mem::take(&mut job.inputs),
            None => return,
        };
        self.discard_inputs(inputs).await;

        let mut jobs = self.inner.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return;
        };
        job.finished_at = Some(Utc::now());
        match outcome {
            Ok(Ok(output)) => {
                tracing::info!("Job {} completed: {}", id, output.message);
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.artifacts = output.artifacts;
                job.message = Some(output.message);
                job.text = output.text;
            }
            Ok(Err(e)) => {
                tracing::error!("Job {} failed: {}", id, e);
                job.status = JobStatus::Failed;
                job.error = Some(e.user_message());
            }
            Err(e) => {
                tracing::error!("Job {} aborted: {}", id, e);
                job.status = JobStatus::Failed;
                job.error = Some("Internal error while processing the job".to_string());
            }
        }
    }

    async fn is_pending(&self, id: &str) -> bool {
        self.inner
            .jobs
            .read()
            .await
            .get(id)
            .is_some_and(|j| j.status == JobStatus::Pending)
    }

    async fn set_progress(&self, id: &str, percent: u8) {
        let mut jobs = self.inner.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) => job.progress = percent.min(100),
            None => tracing::warn!("Progress update for unknown job {}", id),
        }
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.inner.jobs.read().await.get(id).cloned()
    }

    /// All jobs, newest first
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.inner.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    pub async fn progress(&self, id: &str) -> Option<u8> {
        self.inner.jobs.read().await.get(id).map(|j| j.progress)
    }

    /// Cancel a job that has not started yet
    ///
    /// Returns false for unknown, running and finished jobs.
    pub async fn cancel(&self, id: &str) -> bool {
        let inputs = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.cancel("Cancelled before it started");
                    std::mem::take(&mut job.inputs)
                }
                _ => return false,
            }
        };
        tracing::info!("Job {} cancelled", id);
        self.discard_inputs(inputs).await;
        true
    }

    /// Pending plus processing jobs
    pub async fn active_count(&self) -> usize {
        self.inner
            .jobs
            .read()
            .await
            .values()
            .filter(|j| !j.status.is_terminal())
            .count()
    }

    /// Forget finished jobs older than `max_age`
    ///
    /// Pending and processing jobs are never removed.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let mut jobs = self.inner.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|t| t < cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::info!("Job cleanup: removed {} expired job(s)", removed);
        }
        removed
    }

    /// Stop accepting work; jobs still waiting are cancelled
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let inputs: Vec<PathBuf> = {
            let mut jobs = self.inner.jobs.write().await;
            jobs.values_mut()
                .filter(|j| j.status == JobStatus::Pending)
                .flat_map(|job| {
                    job.cancel("Server is shutting down");
                    std::mem::take(&mut job.inputs)
                })
                .collect()
        };
        tracing::info!("Job manager shut down");
        self.discard_inputs(inputs).await;
    }

    async fn cancel_pending(&self, id: &str, reason: &str) {
        let inputs = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(id) {
                Some(job) if job.status == JobStatus::Pending => {
                    job.cancel(reason);
                    std::mem::take(&mut job.inputs)
                }
                _ => return,
            }
        };
        self.discard_inputs(inputs).await;
    }

    async fn discard_inputs(&self, inputs: Vec<PathBuf>) {
        if let Some(store) = &self.inner.store {
            for path in inputs {
                store.delete(&path).await;
            }
        }
    }
}
