//! Conversion operations
//!
//! Each converter takes input paths and writes outputs to paths chosen by the
//! caller. External tools are reached through [`ProcessRunner`] so tests can
//! script them.
//!
//! [`ProcessRunner`]: crate::tools::ProcessRunner

pub mod archive;
pub mod images;
pub mod media;
pub mod pdf;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;

use crate::storage::StorageError;
use crate::tools::ToolError;

pub use media::MediaConverter;
pub use pdf::PdfTransformer;

/// Error type for conversions
#[derive(Debug, Error)]
pub enum ConvertError {
    /// The request cannot be processed as given (shown to the user as is)
    #[error("{0}")]
    InvalidInput(String),

    /// An external tool is missing, failed or timed out
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The tool reported success but left no usable output
    #[error("{0}")]
    MissingOutput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConvertError {
    /// Message suitable for job status responses
    ///
    /// Tool stderr is logged when the failure happens and is never part of it.
    pub fn user_message(&self) -> String {
        match self {
            ConvertError::Tool(ToolError::Failed { description, code, .. }) => match code {
                Some(code) => format!("{} failed (exit code {})", description, code),
                None => format!("{} was terminated", description),
            },
            ConvertError::Tool(ToolError::Spawn { description, .. }) => {
                format!("{} could not be started", description)
            }
            ConvertError::Storage(_) | ConvertError::Archive(_) | ConvertError::Io(_) => {
                "Internal error while handling files".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result of a successful conversion
#[derive(Debug, Clone, Default)]
pub struct Conversion {
    /// Produced files, in presentation order
    pub files: Vec<PathBuf>,
    pub message: String,
    /// Extracted text (transcriptions)
    pub text: Option<String>,
}

impl Conversion {
    pub fn single(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            files: vec![file.into()],
            message: message.into(),
            text: None,
        }
    }
}

/// Check that a tool actually produced a non-empty file
///
/// An empty leftover is removed.
pub(crate) async fn ensure_output(path: &Path, what: &str) -> Result<u64, ConvertError> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(meta.len()),
        Ok(_) => {
            tracing::error!("{} at {} is empty", what, path.display());
            remove_partial(path).await;
            Err(ConvertError::MissingOutput(format!("The {} could not be created", what)))
        }
        Err(_) => {
            tracing::error!("{} was not created at {}", what, path.display());
            Err(ConvertError::MissingOutput(format!("The {} could not be created", what)))
        }
    }
}

/// Remove a partial output, ignoring absence
pub(crate) async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove partial output {}: {}", path.display(), e),
    }
}

/// Move a file, falling back to copy and delete across filesystems
pub(crate) async fn move_file(from: &Path, to: &Path) -> Result<(), ConvertError> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to).await?;
    fs::remove_file(from).await?;
    Ok(())
}

/// Format a byte count as megabytes
pub(crate) fn megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}
