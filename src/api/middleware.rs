//! Shared API state, error type and middleware
//!
//! Contains:
//! - Request statistics (atomic counters, no locks)
//! - `AppState` shared by every handler
//! - `ApiError`, the JSON error body returned by all endpoints

use axum::{
    extract::{multipart::MultipartError, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::convert::{ConvertError, MediaConverter, PdfTransformer};
use crate::jobs::JobManager;
use crate::storage::{FileStore, StorageError};
use crate::tools::{ProcessRunner, ToolError, ToolRegistry};

// ============================================================================
// Request Statistics
// ============================================================================

/// Lightweight request statistics using atomic operations (no locks)
pub struct RequestStats {
    /// Total number of requests processed
    total_requests: AtomicU64,
    /// Total response time in microseconds (for calculating average)
    total_response_time_us: AtomicU64,
    /// Application start time
    start_time: Instant,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a request with its response time
    pub fn record(&self, duration_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us.fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Average response time in microseconds
    pub fn avg_response_time_us(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let total_time = self.total_response_time_us.load(Ordering::Relaxed);
        total_time as f64 / total as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: FileStore,
    pub tools: Arc<ToolRegistry>,
    pub jobs: JobManager,
    pub pdf: PdfTransformer,
    pub media: MediaConverter,
    pub request_stats: Arc<RequestStats>,
}

impl AppState {
    /// Wire the services together
    ///
    /// Creates the files directory if it does not exist yet.
    pub fn new(
        config: Config,
        tools: ToolRegistry,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, StorageError> {
        let store = FileStore::new(&config.storage.files_dir)?;
        let tools = Arc::new(tools);
        let timeouts = config.tools.timeouts.clone();

        let pdf = PdfTransformer::new(tools.clone(), runner.clone(), timeouts.clone(), store.clone());
        let media = MediaConverter::new(
            tools.clone(),
            runner,
            timeouts,
            config.transcription.clone(),
            config.jobs.transcription_workers,
            store.clone(),
        );
        let jobs = JobManager::with_input_cleanup(config.jobs.workers, store.clone());

        Ok(Self {
            config: Arc::new(config),
            store,
            tools,
            jobs,
            pdf,
            media,
            request_stats: Arc::new(RequestStats::new()),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("PAYLOAD_TOO_LARGE", message)
    }

    pub fn tool_unavailable(message: impl Into<String>) -> Self {
        Self::new("TOOL_UNAVAILABLE", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        match self.error.code.as_str() {
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "CONFLICT" => StatusCode::CONFLICT,
            "PAYLOAD_TOO_LARGE" => StatusCode::PAYLOAD_TOO_LARGE,
            "TOOL_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<ToolError> for ApiError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Unavailable(tool) => ApiError::with_details(
                "TOOL_UNAVAILABLE",
                format!("{} is not available on this server", tool.display_name()),
                serde_json::json!({ "tool": tool }),
            ),
            other => {
                tracing::error!("Tool error outside a job: {}", other);
                ApiError::internal_error("External tool error")
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidName(name) => {
                ApiError::validation_error(format!("Invalid file name: {}", name))
            }
            StorageError::NotFound(name) => ApiError::not_found(format!("File not found: {}", name)),
            StorageError::Io(e) => {
                tracing::error!("Storage IO error: {}", e);
                ApiError::internal_error("Internal error while handling files")
            }
        }
    }
}

impl From<ConvertError> for ApiError {
    fn from(e: ConvertError) -> Self {
        match e {
            ConvertError::InvalidInput(message) => ApiError::validation_error(message),
            ConvertError::Tool(e) => e.into(),
            ConvertError::Storage(e) => e.into(),
            other => {
                tracing::error!("Conversion error: {}", other);
                ApiError::internal_error(other.user_message())
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::payload_too_large("Upload exceeds the maximum allowed size")
        } else {
            ApiError::validation_error(format!("Invalid multipart body: {}", e.body_text()))
        }
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Request statistics middleware
///
/// Records request count and response time for the health endpoint.
pub async fn request_stats_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();

    let response = next.run(request).await;

    state.request_stats.record(start.elapsed().as_micros() as u64);
    response
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolKind;

    #[test]
    fn test_request_stats_average() {
        let stats = RequestStats::new();
        assert_eq!(stats.avg_response_time_us(), 0.0);

        stats.record(100);
        stats.record(300);

        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.avg_response_time_us(), 200.0);
    }

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(ApiError::validation_error("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::payload_too_large("x").status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ApiError::tool_unavailable("x").status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::new("SOMETHING_ELSE", "x").status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_unavailable_tool_maps_to_503_with_details() {
        let error: ApiError = ToolError::Unavailable(ToolKind::Libreoffice).into();
        assert_eq!(error.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.error.details, Some(serde_json::json!({ "tool": "libreoffice" })));
    }

    #[test]
    fn test_storage_errors_map_to_client_errors() {
        let invalid: ApiError = StorageError::InvalidName("../etc".into()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let missing: ApiError = StorageError::NotFound("a.pdf".into()).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_invalid_input_is_a_validation_error() {
        let error: ApiError = ConvertError::InvalidInput("No images provided".into()).into();
        assert_eq!(error.error.code, "VALIDATION_ERROR");
        assert_eq!(error.error.message, "No images provided");
    }

    #[test]
    fn test_error_body_shape() {
        let error = ApiError::with_details("CONFLICT", "busy", serde_json::json!({"status": "processing"}));
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["error"]["code"], "CONFLICT");
        assert_eq!(json["error"]["details"]["status"], "processing");

        let json = serde_json::to_value(ApiError::not_found("gone")).unwrap();
        assert!(json["error"].get("details").is_none());
    }
}
