//! Media endpoints (audio extraction and transcription)

use axum::{
    extract::{Multipart, State},
    routing::post,
    Router,
};

use crate::api::jobs::{accepted, job_output, Accepted};
use crate::api::middleware::{ApiError, AppState};
use crate::api::upload::UploadForm;
use crate::convert::media::{AUDIO_EXTENSIONS, VIDEO_EXTENSIONS};
use crate::jobs::JobKind;
use crate::tools::ToolKind;

/// Build the media router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/video-to-mp3", post(video_to_mp3))
        .route("/transcribe", post(transcribe))
}

/// Whisper accepts language codes (`pt`) and names (`Portuguese`)
fn is_valid_spoken_language(language: &str) -> bool {
    (2..=20).contains(&language.len()) && language.chars().all(|c| c.is_ascii_alphabetic())
}

/// POST /api/v1/media/video-to-mp3 - Extract the audio track as MP3
async fn video_to_mp3(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file("video_file")?;
    file.require_extension(VIDEO_EXTENSIONS)?;
    state.tools.require(ToolKind::Ffmpeg)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.mp3", file.stem()), "audio");
    let media = state.media.clone();

    let id = state
        .jobs
        .submit(JobKind::VideoToMp3, vec![input.clone()], move |_| async move {
            job_output(media.video_to_mp3(&input, &output).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/media/transcribe - Speech to text with Whisper
///
/// The transcript is returned in the job's `text` and as a `.txt` artifact.
async fn transcribe(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file("audio_file")?;
    file.require_extension(AUDIO_EXTENSIONS)?;
    let language = form.text("language").map(str::to_string);
    if let Some(language) = &language {
        if !is_valid_spoken_language(language) {
            return Err(ApiError::validation_error(format!("Invalid language: {}", language)));
        }
    }
    state.tools.require(ToolKind::Whisper)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.txt", file.stem()), "transcript");
    let media = state.media.clone();
    let slots = media.transcription_slots();

    // Waits for a transcription slot while pending, without taking a worker
    let id = state
        .jobs
        .submit_limited(JobKind::AudioTranscription, vec![input.clone()], slots, move |_| async move {
            job_output(media.transcribe(&input, &output, language.as_deref()).await?).await
        })
        .await;
    Ok(accepted(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spoken_language_validation() {
        assert!(is_valid_spoken_language("pt"));
        assert!(is_valid_spoken_language("Portuguese"));
        assert!(!is_valid_spoken_language("p"));
        assert!(!is_valid_spoken_language("pt; rm -rf"));
        assert!(!is_valid_spoken_language("--model"));
    }
}
