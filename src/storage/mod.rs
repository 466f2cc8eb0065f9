//! Artifact storage
//!
//! Uploaded inputs and converter outputs live under a single files directory.
//! Every stored name carries a random component, so two requests uploading
//! `report.pdf` at the same moment never share a path.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use tokio::fs;
use uuid::Uuid;

/// Name of the scratch area inside the files directory
const WORK_DIR: &str = ".work";

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested name is empty or tries to leave the files directory
    #[error("Invalid file name: {0}")]
    InvalidName(String),

    /// No stored file with that name
    #[error("File not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sanitize a client-supplied file name
///
/// Keeps only the final path component, ASCII alphanumerics and `._- `,
/// and replaces spaces with underscores.
pub fn safe_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("");

    let cleaned: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect();

    let mut collapsed = cleaned;
    while collapsed.contains("..") {
        collapsed = collapsed.replace("..", ".");
    }

    let trimmed = collapsed.trim_matches('.');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Lowercased extension of a file name, without the dot
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// File stem of a sanitized file name
pub fn stem_of(filename: &str) -> String {
    let safe = safe_filename(filename);
    Path::new(&safe)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string()
}

/// Determine the MIME type from the file extension
pub fn mime_type(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("doc") => "application/msword",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("xls") => "application/vnd.ms-excel",
        Some("csv") => "text/csv",
        Some("txt") => "text/plain",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("wav") => "audio/wav",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

/// File store rooted at the configured files directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the store, creating the root directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join(WORK_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build a unique stored name: `<prefix>_<random>_<safe name>`
    pub fn unique_name(&self, original: &str, prefix: &str) -> String {
        let id = Uuid::new_v4().simple().to_string();
        let prefix = safe_filename(prefix);
        format!("{}_{}_{}", prefix, &id[..8], safe_filename(original))
    }

    /// Path inside the root for a given stored name
    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Reserve a unique output path for a converter
    pub fn reserve(&self, original: &str, prefix: &str) -> PathBuf {
        self.path_of(&self.unique_name(original, prefix))
    }

    /// Write uploaded bytes under a unique name
    pub async fn save(&self, original: &str, prefix: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.reserve(original, prefix);
        fs::write(&path, data).await?;
        tracing::debug!("Stored upload {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    /// Resolve a download name to a stored file
    ///
    /// Rejects empty names, traversal attempts and names of missing files.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, StorageError> {
        if filename.is_empty()
            || filename.contains("..")
            || filename.contains('/')
            || filename.contains('\\')
            || filename.starts_with(WORK_DIR)
        {
            return Err(StorageError::InvalidName(filename.to_string()));
        }

        let path = self.root.join(filename);
        if !path.is_file() {
            return Err(StorageError::NotFound(filename.to_string()));
        }
        Ok(path)
    }

    /// Check that a path is located inside the root
    pub fn contains(&self, path: &Path) -> bool {
        let inside_lexically = path.starts_with(&self.root)
            && !path.components().any(|c| matches!(c, Component::ParentDir));
        if !inside_lexically {
            return false;
        }
        match (path.canonicalize(), self.root.canonicalize()) {
            (Ok(p), Ok(r)) => p.starts_with(r),
            // The file may already be gone; the lexical check is all we have
            _ => true,
        }
    }

    /// Remove a stored file
    ///
    /// Refuses paths outside the root. Returns whether a file was removed.
    pub async fn delete(&self, path: &Path) -> bool {
        if !self.contains(path) {
            tracing::warn!("Refusing to delete file outside the files directory: {}", path.display());
            return false;
        }
        match fs::remove_file(path).await {
            Ok(()) => {
                tracing::debug!("Removed stored file {}", path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("Failed to remove {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Create a scratch directory removed when dropped
    pub fn work_dir(&self) -> Result<TempDir, StorageError> {
        let parent = self.root.join(WORK_DIR);
        std::fs::create_dir_all(&parent)?;
        Ok(tempfile::Builder::new().prefix("job-").tempdir_in(parent)?)
    }

    /// Remove files and leftover scratch directories older than `max_age`
    pub async fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = match SystemTime::now().checked_sub(max_age) {
            Some(t) => t,
            None => return 0,
        };

        let mut removed = sweep(&self.root, cutoff, false).await;
        removed += sweep(&self.root.join(WORK_DIR), cutoff, true).await;

        if removed > 0 {
            tracing::info!("Storage cleanup: removed {} stale entr(ies)", removed);
        }
        removed
    }
}

async fn sweep(dir: &Path, cutoff: SystemTime, include_dirs: bool) -> usize {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Cannot scan {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified = meta.modified().unwrap_or(SystemTime::now());
        if modified >= cutoff {
            continue;
        }

        let path = entry.path();
        let result = if meta.is_file() {
            fs::remove_file(&path).await
        } else if meta.is_dir() && include_dirs {
            fs::remove_dir_all(&path).await
        } else {
            continue;
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!("Failed to remove stale {}: {}", path.display(), e),
        }
    }
    removed
}
