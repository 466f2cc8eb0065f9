//! Audio and video conversions backed by FFmpeg and Whisper

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;
use tokio::sync::Semaphore;

use super::{ensure_output, remove_partial, Conversion, ConvertError};
use crate::config::{ToolTimeouts, TranscriptionConfig};
use crate::storage::FileStore;
use crate::tools::{run_checked, Invocation, ProcessRunner, ToolError, ToolKind, ToolRegistry};

/// Extensions accepted by the video to MP3 conversion
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "mpeg", "mpg", "m4v", "3gp"];

/// Extensions accepted by the transcription
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "ogg", "oga", "opus", "flac", "aac", "wma", "webm", "mp4"];

/// ffmpeg's complaint when the selected streams are empty
const NO_STREAM_MARKER: &str = "Output file #0 does not contain any stream";

/// Outcome of an audio stream check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioProbe {
    pub has_audio: bool,
    pub note: String,
}

impl AudioProbe {
    fn assumed(note: impl Into<String>) -> Self {
        Self {
            has_audio: true,
            note: note.into(),
        }
    }

    fn absent(note: impl Into<String>) -> Self {
        Self {
            has_audio: false,
            note: note.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<serde_json::Value>,
}

/// Media conversions
#[derive(Clone)]
pub struct MediaConverter {
    tools: Arc<ToolRegistry>,
    runner: Arc<dyn ProcessRunner>,
    timeouts: ToolTimeouts,
    transcription: TranscriptionConfig,
    transcription_slots: Arc<Semaphore>,
    store: FileStore,
}

impl MediaConverter {
    pub fn new(
        tools: Arc<ToolRegistry>,
        runner: Arc<dyn ProcessRunner>,
        timeouts: ToolTimeouts,
        transcription: TranscriptionConfig,
        transcription_workers: usize,
        store: FileStore,
    ) -> Self {
        Self {
            tools,
            runner,
            timeouts,
            transcription,
            transcription_slots: Arc::new(Semaphore::new(transcription_workers.max(1))),
            store,
        }
    }

    /// Semaphore bounding concurrent transcriptions, for the job queue
    pub fn transcription_slots(&self) -> Arc<Semaphore> {
        self.transcription_slots.clone()
    }

    /// Free transcription slots
    pub fn transcription_slots_available(&self) -> usize {
        self.transcription_slots.available_permits()
    }

    /// Check for an audio stream with ffprobe
    ///
    /// When the check itself cannot be performed, audio is assumed present so
    /// the conversion is still attempted.
    pub async fn probe_audio(&self, input: &Path) -> AudioProbe {
        let ffprobe = match self.tools.get(ToolKind::Ffprobe) {
            Some(path) => path,
            None => {
                tracing::warn!("ffprobe not found, skipping audio stream check");
                return AudioProbe::assumed("Audio check skipped (ffprobe not found)");
            }
        };

        let invocation = Invocation::new(ffprobe, "ffprobe audio check", Duration::from_secs(self.timeouts.ffprobe_secs))
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-select_streams", "a"])
            .arg(input);

        let output = match self.runner.run(&invocation).await {
            Ok(output) => output,
            Err(ToolError::Timeout { .. }) => {
                tracing::error!("ffprobe timed out while checking {}", input.display());
                return AudioProbe::assumed("Audio check timed out");
            }
            Err(e) => {
                tracing::error!("ffprobe could not run: {}", e);
                return AudioProbe::assumed("Audio check failed");
            }
        };

        if !output.success() {
            tracing::error!("ffprobe failed (exit code {:?}): {}", output.code, output.stderr.trim());
            return AudioProbe::assumed("Stream analysis failed (ffprobe error)");
        }

        if output.stdout.trim().is_empty() {
            tracing::warn!("ffprobe returned no stream data for {}", input.display());
            return AudioProbe::absent("The file may not contain audio or could not be analyzed");
        }

        match serde_json::from_str::<ProbeOutput>(&output.stdout) {
            Ok(probe) if !probe.streams.is_empty() => {
                tracing::info!("Audio stream detected in {}", input.display());
                AudioProbe::assumed("Audio stream found")
            }
            Ok(_) => {
                tracing::info!("No audio stream in {}", input.display());
                AudioProbe::absent("The selected video has no audio track")
            }
            Err(e) => {
                let head: String = output.stdout.chars().take(200).collect();
                tracing::error!("Could not decode ffprobe JSON: {} (output: '{}')", e, head);
                AudioProbe::assumed("Could not read stream information (JSON error)")
            }
        }
    }

    /// Extract the audio track of a video as a 192 kbps MP3
    pub async fn video_to_mp3(&self, input: &Path, output: &Path) -> Result<Conversion, ConvertError> {
        let ffmpeg = self.tools.require(ToolKind::Ffmpeg)?;
        if !input.is_file() {
            return Err(ConvertError::InvalidInput("Input video not found".to_string()));
        }

        let probe = self.probe_audio(input).await;
        if !probe.has_audio {
            tracing::warn!("Conversion cancelled for {}: {}", input.display(), probe.note);
            return Err(ConvertError::InvalidInput(probe.note));
        }

        let invocation = Invocation::new(ffmpeg, "FFmpeg MP3 conversion", Duration::from_secs(self.timeouts.ffmpeg_secs))
            .arg("-i")
            .arg(input)
            .args(["-vn", "-acodec", "libmp3lame", "-ab", "192k", "-ar", "44100", "-y"])
            .arg(output);

        if let Err(e) = run_checked(self.runner.as_ref(), &invocation).await {
            remove_partial(output).await;
            return Err(match e {
                ToolError::Failed { ref stderr, .. } if stderr.contains(NO_STREAM_MARKER) => ConvertError::InvalidInput(
                    "Conversion failed: the file may have no valid audio or be corrupted".to_string(),
                ),
                other => other.into(),
            });
        }

        ensure_output(output, "MP3 file").await?;
        tracing::info!("Video to MP3 finished: {}", output.display());
        Ok(Conversion::single(output, "Video converted to MP3"))
    }

    /// Transcribe speech with the Whisper CLI
    ///
    /// The trimmed text is written to `output` and returned in the conversion.
    /// Callers hold a permit from [`transcription_slots`](Self::transcription_slots)
    /// while this runs.
    pub async fn transcribe(
        &self,
        input: &Path,
        output: &Path,
        language: Option<&str>,
    ) -> Result<Conversion, ConvertError> {
        let whisper = self.tools.require(ToolKind::Whisper)?;
        if !input.is_file() {
            return Err(ConvertError::InvalidInput("Input audio not found".to_string()));
        }

        let language = language.unwrap_or(&self.transcription.language);
        let work = self.store.work_dir()?;

        tracing::info!(
            "Starting Whisper transcription ({}, {}) of {}",
            self.transcription.model,
            language,
            input.display()
        );
        let invocation = Invocation::new(whisper, "Whisper transcription", Duration::from_secs(self.timeouts.whisper_secs))
            .arg(input)
            .arg("--model")
            .arg(&self.transcription.model)
            .arg("--language")
            .arg(language)
            .args(["--fp16", "False", "--output_format", "txt", "--output_dir"])
            .arg(work.path());
        run_checked(self.runner.as_ref(), &invocation).await?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        let transcript = work.path().join(format!("{}.txt", stem));
        let text = match fs::read_to_string(&transcript).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::error!("Whisper finished but {} is unreadable: {}", transcript.display(), e);
                return Err(ConvertError::MissingOutput(
                    "The transcription could not be created".to_string(),
                ));
            }
        };

        fs::write(output, &text).await?;
        let message = if text.is_empty() {
            "Transcription finished (no speech detected)"
        } else {
            "Transcription finished"
        };
        Ok(Conversion {
            files: vec![output.to_path_buf()],
            message: message.to_string(),
            text: Some(text),
        })
    }
}
