//! Artifact download endpoint

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::api::middleware::{ApiError, AppState};
use crate::storage::mime_type;

/// Build the download router
pub fn router() -> Router<AppState> {
    Router::new().route("/download/{filename}", get(download))
}

fn content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        filename.replace('"', ""),
        urlencoding::encode(filename)
    )
}

/// GET /download/{filename} - Stream a stored file as an attachment
///
/// Names with path separators or `..` are rejected with 400, unknown names
/// with 404.
async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = state.store.resolve(&filename)?;

    let mut response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime_type(&filename)));
    let disposition = HeaderValue::from_str(&content_disposition(&filename))
        .map_err(|_| ApiError::validation_error(format!("Invalid file name: {}", filename)))?;
    headers.insert(header::CONTENT_DISPOSITION, disposition);

    tracing::debug!("Serving download {}", path.display());
    Ok(response.into_response())
}
