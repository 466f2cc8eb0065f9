//! Configuration management
//!
//! This module handles loading and parsing configuration for the conversion service.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Artifact storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Background job configuration
    #[serde(default)]
    pub jobs: JobsConfig,
    /// External tool configuration
    #[serde(default)]
    pub tools: ToolsConfig,
    /// OCR defaults
    #[serde(default)]
    pub ocr: OcrConfig,
    /// Speech-to-text defaults
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin (`*` allows any)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origin() -> String {
    "*".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding uploads and generated artifacts
    #[serde(default = "default_files_dir")]
    pub files_dir: PathBuf,
    /// Directory of static assets served at the site root
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    /// Maximum request body size in bytes (default: 200MB)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    /// Age after which stored files are removed
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Interval between cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_dir: default_files_dir(),
            static_dir: default_static_dir(),
            max_upload_size: default_max_upload_size(),
            retention_hours: default_retention_hours(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

fn default_files_dir() -> PathBuf {
    PathBuf::from("files")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_max_upload_size() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cleanup_interval() -> u64 {
    3600
}

impl StorageConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Maximum number of conversions running at once
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of transcriptions running at once
    #[serde(default = "default_transcription_workers")]
    pub transcription_workers: usize,
    /// Age after which finished jobs are forgotten
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            transcription_workers: default_transcription_workers(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_transcription_workers() -> usize {
    2
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

/// External tool configuration
///
/// Explicit paths take precedence over `PATH` lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ghostscript: Option<PathBuf>,
    #[serde(default)]
    pub ocrmypdf: Option<PathBuf>,
    #[serde(default)]
    pub libreoffice: Option<PathBuf>,
    #[serde(default)]
    pub ffmpeg: Option<PathBuf>,
    #[serde(default)]
    pub ffprobe: Option<PathBuf>,
    #[serde(default)]
    pub whisper: Option<PathBuf>,
    #[serde(default)]
    pub tesseract: Option<PathBuf>,
    /// Per-tool timeouts
    #[serde(default)]
    pub timeouts: ToolTimeouts,
}

/// Subprocess timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTimeouts {
    #[serde(default = "default_long_timeout")]
    pub ocr_secs: u64,
    #[serde(default = "default_long_timeout")]
    pub ghostscript_secs: u64,
    #[serde(default = "default_libreoffice_timeout")]
    pub libreoffice_secs: u64,
    #[serde(default = "default_long_timeout")]
    pub ffmpeg_secs: u64,
    #[serde(default = "default_ffprobe_timeout")]
    pub ffprobe_secs: u64,
    #[serde(default = "default_whisper_timeout")]
    pub whisper_secs: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            ocr_secs: default_long_timeout(),
            ghostscript_secs: default_long_timeout(),
            libreoffice_secs: default_libreoffice_timeout(),
            ffmpeg_secs: default_long_timeout(),
            ffprobe_secs: default_ffprobe_timeout(),
            whisper_secs: default_whisper_timeout(),
        }
    }
}

fn default_long_timeout() -> u64 {
    600
}

fn default_libreoffice_timeout() -> u64 {
    300
}

fn default_ffprobe_timeout() -> u64 {
    90
}

fn default_whisper_timeout() -> u64 {
    1800
}

/// OCR configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Tesseract language used when a request names none
    #[serde(default = "default_ocr_language")]
    pub default_language: String,
    /// Languages with installed trained data
    #[serde(default = "default_ocr_languages")]
    pub allowed_languages: Vec<String>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            default_language: default_ocr_language(),
            allowed_languages: default_ocr_languages(),
        }
    }
}

fn default_ocr_language() -> String {
    "por".to_string()
}

fn default_ocr_languages() -> Vec<String> {
    vec!["por".to_string(), "eng".to_string()]
}

impl OcrConfig {
    /// Check a language spec such as `por` or `por+eng` against the allowed list
    pub fn is_language_allowed(&self, spec: &str) -> bool {
        !spec.is_empty()
            && spec
                .split('+')
                .all(|lang| self.allowed_languages.iter().any(|l| l == lang))
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Whisper model name
    #[serde(default = "default_whisper_model")]
    pub model: String,
    /// Spoken language passed to Whisper
    #[serde(default = "default_transcription_language")]
    pub language: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: default_whisper_model(),
            language: default_transcription_language(),
        }
    }
}

fn default_whisper_model() -> String {
    "small".to_string()
}

fn default_transcription_language() -> String {
    "pt".to_string()
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: format_yaml_error(&e),
        })?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - CONVERTKIT_SERVER_HOST
    /// - CONVERTKIT_SERVER_PORT
    /// - CONVERTKIT_SERVER_CORS_ORIGIN
    /// - CONVERTKIT_FILES_DIR
    /// - CONVERTKIT_STATIC_DIR
    /// - CONVERTKIT_MAX_UPLOAD_MB
    /// - CONVERTKIT_JOB_WORKERS (falls back to WEB_CONCURRENCY)
    /// - CONVERTKIT_WHISPER_MODEL
    /// - CONVERTKIT_OCR_LANGUAGE
    pub fn load_with_env(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CONVERTKIT_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("CONVERTKIT_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Ok(cors_origin) = std::env::var("CONVERTKIT_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }

        if let Ok(dir) = std::env::var("CONVERTKIT_FILES_DIR") {
            self.storage.files_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CONVERTKIT_STATIC_DIR") {
            self.storage.static_dir = PathBuf::from(dir);
        }
        if let Ok(mb) = std::env::var("CONVERTKIT_MAX_UPLOAD_MB") {
            match mb.parse::<u64>().ok().and_then(|mb| mb.checked_mul(1024 * 1024)) {
                Some(bytes) => self.storage.max_upload_size = bytes,
                None => tracing::warn!("Ignoring invalid CONVERTKIT_MAX_UPLOAD_MB '{}'", mb),
            }
        }

        // The container sets WEB_CONCURRENCY; an explicit override wins
        let workers = std::env::var("CONVERTKIT_JOB_WORKERS")
            .or_else(|_| std::env::var("WEB_CONCURRENCY"));
        if let Ok(workers) = workers {
            if let Ok(workers) = workers.parse::<usize>() {
                self.jobs.workers = workers;
            }
        }

        if let Ok(model) = std::env::var("CONVERTKIT_WHISPER_MODEL") {
            self.transcription.model = model;
        }
        if let Ok(lang) = std::env::var("CONVERTKIT_OCR_LANGUAGE") {
            self.ocr.default_language = lang;
        }
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError("server.port must not be 0".into()));
        }
        if self.jobs.workers == 0 {
            return Err(ConfigError::ValidationError("jobs.workers must be at least 1".into()));
        }
        if self.jobs.transcription_workers == 0 {
            return Err(ConfigError::ValidationError(
                "jobs.transcription_workers must be at least 1".into(),
            ));
        }
        if !self.ocr.is_language_allowed(&self.ocr.default_language) {
            return Err(ConfigError::ValidationError(format!(
                "ocr.default_language '{}' is not in ocr.allowed_languages {:?}",
                self.ocr.default_language, self.ocr.allowed_languages
            )));
        }
        Ok(())
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!("at line {}, column {}: {}", location.line(), location.column(), e)
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());


/// Property-based tests for configuration parsing
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_host_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255)
                .prop_map(|(a, b, c, d)| format!("{}.{}.{}.{}", a, b, c, d)),
            Just("localhost".to_string()),
            Just("0.0.0.0".to_string()),
            "[a-z][a-z0-9]{0,10}".prop_map(|s| s),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        /// Serializing a config and loading it back yields the same values
        #[test]
        fn config_yaml_roundtrip(
            host in valid_host_strategy(),
            port in 1u16..=65535,
            workers in 1usize..64,
            retention in 1u64..240,
        ) {
            let mut config = Config::default();
            config.server.host = host.clone();
            config.server.port = port;
            config.jobs.workers = workers;
            config.storage.retention_hours = retention;

            let yaml = serde_yaml::to_string(&config).unwrap();
            let mut file = NamedTempFile::new().unwrap();
            write!(file, "{}", yaml).unwrap();

            let loaded = Config::load(file.path()).unwrap();
            prop_assert_eq!(loaded.server.host, host);
            prop_assert_eq!(loaded.server.port, port);
            prop_assert_eq!(loaded.jobs.workers, workers);
            prop_assert_eq!(loaded.storage.retention_hours, retention);
        }

        /// Any subset of allowed languages joined with '+' is accepted
        #[test]
        fn joined_allowed_languages_accepted(picks in proptest::collection::vec(0usize..2, 1..4)) {
            let ocr = OcrConfig::default();
            let spec = picks
                .iter()
                .map(|i| ocr.allowed_languages[*i].clone())
                .collect::<Vec<_>>()
                .join("+");
            prop_assert!(ocr.is_language_allowed(&spec));
        }
    }
}
