//! External conversion tools
//!
//! The service does no document or media processing of its own beyond
//! image-to-PDF packaging; everything else is delegated to command-line tools
//! installed in the container. This module finds them and runs them.

pub mod runner;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::ToolsConfig;

pub use runner::{run_checked, Invocation, ProcessOutput, ProcessRunner, SystemRunner, ToolError};

/// Known external tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Ghostscript,
    Ocrmypdf,
    Libreoffice,
    Ffmpeg,
    Ffprobe,
    Whisper,
    Tesseract,
}

impl ToolKind {
    pub const ALL: [ToolKind; 7] = [
        ToolKind::Ghostscript,
        ToolKind::Ocrmypdf,
        ToolKind::Libreoffice,
        ToolKind::Ffmpeg,
        ToolKind::Ffprobe,
        ToolKind::Whisper,
        ToolKind::Tesseract,
    ];

    /// Executable names tried in order on `PATH`
    pub fn candidates(self) -> &'static [&'static str] {
        match self {
            ToolKind::Ghostscript => &["gs", "gswin64c"],
            ToolKind::Ocrmypdf => &["ocrmypdf"],
            ToolKind::Libreoffice => &["libreoffice", "soffice"],
            ToolKind::Ffmpeg => &["ffmpeg"],
            ToolKind::Ffprobe => &["ffprobe"],
            ToolKind::Whisper => &["whisper"],
            ToolKind::Tesseract => &["tesseract"],
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::Ghostscript => "Ghostscript",
            ToolKind::Ocrmypdf => "OCRmyPDF",
            ToolKind::Libreoffice => "LibreOffice",
            ToolKind::Ffmpeg => "FFmpeg",
            ToolKind::Ffprobe => "ffprobe",
            ToolKind::Whisper => "Whisper",
            ToolKind::Tesseract => "Tesseract",
        }
    }

    fn configured(self, config: &ToolsConfig) -> Option<&PathBuf> {
        match self {
            ToolKind::Ghostscript => config.ghostscript.as_ref(),
            ToolKind::Ocrmypdf => config.ocrmypdf.as_ref(),
            ToolKind::Libreoffice => config.libreoffice.as_ref(),
            ToolKind::Ffmpeg => config.ffmpeg.as_ref(),
            ToolKind::Ffprobe => config.ffprobe.as_ref(),
            ToolKind::Whisper => config.whisper.as_ref(),
            ToolKind::Tesseract => config.tesseract.as_ref(),
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Availability of one tool, as reported by `/api/v1/tools`
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: ToolKind,
    pub name: &'static str,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Resolved executable paths of the installed tools
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    paths: HashMap<ToolKind, PathBuf>,
}

impl ToolRegistry {
    /// Detect every known tool
    ///
    /// An explicitly configured path wins when it exists; otherwise the first
    /// candidate found on `PATH` is used. Missing tools are not fatal.
    pub fn detect(config: &ToolsConfig) -> Self {
        let mut paths = HashMap::new();

        for kind in ToolKind::ALL {
            match locate(kind, kind.configured(config).map(PathBuf::as_path)) {
                Some(path) => {
                    tracing::info!("{} detected at {}", kind, path.display());
                    paths.insert(kind, path);
                }
                None => {
                    tracing::warn!(
                        "{} not found (tried: {}); dependent tools are unavailable",
                        kind,
                        kind.candidates().join(", ")
                    );
                }
            }
        }

        Self { paths }
    }

    /// Registry with explicit paths, no lookup
    pub fn from_paths(paths: impl IntoIterator<Item = (ToolKind, PathBuf)>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    pub fn get(&self, kind: ToolKind) -> Option<&Path> {
        self.paths.get(&kind).map(PathBuf::as_path)
    }

    pub fn is_available(&self, kind: ToolKind) -> bool {
        self.paths.contains_key(&kind)
    }

    /// Path of a tool or an `Unavailable` error
    pub fn require(&self, kind: ToolKind) -> Result<&Path, ToolError> {
        self.get(kind).ok_or(ToolError::Unavailable(kind))
    }

    pub fn report(&self) -> Vec<ToolStatus> {
        ToolKind::ALL
            .iter()
            .map(|&kind| ToolStatus {
                tool: kind,
                name: kind.display_name(),
                available: self.is_available(kind),
                path: self.get(kind).map(|p| p.display().to_string()),
            })
            .collect()
    }
}

fn locate(kind: ToolKind, configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(
            "Configured path for {} does not exist: {}, falling back to PATH lookup",
            kind,
            path.display()
        );
    }

    kind.candidates()
        .iter()
        .find_map(|name| which::which(name).ok())
}
