//! HTTP tests against the full router, with scripted tools

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use serde_json::Value;
use tempfile::TempDir;

use super::{build_router, AppState};
use crate::config::Config;
use crate::tools::fake::{full_registry, FakeRunner, FAKE_PDF};
use crate::tools::{ToolKind, ToolRegistry};

struct Harness {
    server: TestServer,
    runner: Arc<FakeRunner>,
    state: AppState,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with(FakeRunner::simulating(), full_registry())
    }

    fn with(runner: FakeRunner, tools: ToolRegistry) -> Self {
        Self::configured(runner, tools, |_| {})
    }

    fn configured(runner: FakeRunner, tools: ToolRegistry, tune: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.files_dir = dir.path().join("files");
        config.storage.static_dir = dir.path().join("static");
        tune(&mut config);

        let runner = Arc::new(runner);
        let state = AppState::new(config, tools, runner.clone()).unwrap();
        let server = TestServer::new(build_router(state.clone())).unwrap();
        Self {
            server,
            runner,
            state,
            dir,
        }
    }

    async fn status_of(&self, id: &str) -> Value {
        let job: Value = self.server.get(&format!("/api/v1/jobs/{}", id)).await.json();
        job["status"].clone()
    }

    fn stored_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.dir.path().join("files"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Submit a form and return the accepted job id
    async fn submit(&self, path: &str, form: MultipartForm) -> String {
        let response = self.server.post(path).multipart(form).await;
        response.assert_status(StatusCode::ACCEPTED);
        let body: Value = response.json();
        assert_eq!(body["status"], "pending");
        let id = body["job_id"].as_str().unwrap().to_string();
        assert_eq!(body["status_url"], format!("/api/v1/jobs/{}", id));
        id
    }

    /// Poll a job until it reaches a terminal state
    async fn finished(&self, id: &str) -> Value {
        for _ in 0..200 {
            let job: Value = self.server.get(&format!("/api/v1/jobs/{}", id)).await.json();
            if matches!(job["status"].as_str(), Some("completed" | "failed" | "cancelled")) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", id);
    }
}

fn pdf_part(name: &str) -> Part {
    Part::bytes(FAKE_PDF.to_vec())
        .file_name(name.to_string())
        .mime_type("application/pdf")
}

fn file_part(name: &str, data: &[u8]) -> Part {
    Part::bytes(data.to_vec()).file_name(name.to_string())
}

fn png_bytes() -> Vec<u8> {
    let mut data = std::io::Cursor::new(Vec::new());
    image::RgbImage::from_pixel(4, 4, image::Rgb([0, 90, 200]))
        .write_to(&mut data, image::ImageFormat::Png)
        .unwrap();
    data.into_inner()
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn test_health_and_tools() {
    let h = Harness::with(
        FakeRunner::simulating(),
        ToolRegistry::from_paths([(ToolKind::Ghostscript, "/usr/bin/gs".into())]),
    );

    let health: Value = h.server.get("/api/v1/health").await.json();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(health["active_jobs"], 0);

    let tools: Value = h.server.get("/api/v1/tools").await.json();
    assert_eq!(tools["available"], 1);
    assert_eq!(tools["total"], 7);
    assert_eq!(tools["tools"][0]["tool"], "ghostscript");
    assert_eq!(tools["tools"][0]["available"], true);
}

#[tokio::test]
async fn test_compress_completes_and_artifact_downloads() {
    let h = Harness::new();
    let form = MultipartForm::new()
        .add_part("pdf_file", pdf_part("report.pdf"))
        .add_text("level", "2");

    let id = h.submit("/api/v1/pdf/compress", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(job["kind"], "pdf_compress");
    assert_eq!(job["progress"], 100);
    assert!(job["message"].as_str().unwrap().contains("level 2"));
    let artifact = &job["artifacts"][0];
    let filename = artifact["filename"].as_str().unwrap();
    assert!(filename.starts_with("compressed_") && filename.ends_with("_report.pdf"));
    assert_eq!(artifact["mime_type"], "application/pdf");

    // The upload is gone, only the output remains
    assert_eq!(h.stored_files(), vec![filename.to_string()]);

    let download = h.server.get(artifact["url"].as_str().unwrap()).await;
    download.assert_status_ok();
    assert_eq!(download.header("content-type"), "application/pdf");
    let disposition = download.header("content-disposition");
    assert!(disposition.to_str().unwrap().starts_with("attachment;"));
    assert_eq!(download.as_bytes().as_ref(), FAKE_PDF);
}

#[tokio::test]
async fn test_compress_with_ocr_runs_both_tools() {
    let h = Harness::new();
    let form = MultipartForm::new()
        .add_part("pdf_file", pdf_part("scan.pdf"))
        .add_text("apply_ocr", "true")
        .add_text("language", "por+eng");

    let id = h.submit("/api/v1/pdf/compress", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(h.runner.programs(), vec!["gs", "ocrmypdf"]);
}

#[tokio::test]
async fn test_malformed_uploads_are_rejected() {
    let h = Harness::new();

    let cases = [
        ("/api/v1/pdf/compress", MultipartForm::new().add_text("level", "3")),
        ("/api/v1/pdf/compress", MultipartForm::new().add_part("pdf_file", file_part("notes.txt", b"hello"))),
        (
            "/api/v1/pdf/compress",
            MultipartForm::new().add_part("pdf_file", pdf_part("a.pdf")).add_text("level", "9"),
        ),
        (
            "/api/v1/pdf/to-images",
            MultipartForm::new().add_part("pdf_file", pdf_part("a.pdf")).add_text("dpi", "10"),
        ),
        (
            "/api/v1/pdf/ocr",
            MultipartForm::new().add_part("pdf_file", pdf_part("a.pdf")).add_text("language", "klingon"),
        ),
        ("/api/v1/pdf/merge", MultipartForm::new().add_part("pdf_files", pdf_part("only.pdf"))),
        ("/api/v1/pdf/images-to-pdf", MultipartForm::new().add_text("note", "no images")),
        (
            "/api/v1/pdf/document-to-pdf",
            MultipartForm::new().add_part("doc_file", file_part("sheet.xlsx", b"PK")),
        ),
        (
            "/api/v1/media/video-to-mp3",
            MultipartForm::new().add_part("video_file", file_part("song.mp3", b"ID3")),
        ),
        (
            "/api/v1/media/transcribe",
            MultipartForm::new()
                .add_part("audio_file", file_part("memo.ogg", b"OggS"))
                .add_text("language", "--model"),
        ),
    ];

    for (path, form) in cases {
        let response = h.server.post(path).multipart(form).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(error_code(&body), "VALIDATION_ERROR", "{}", path);
    }

    assert!(h.stored_files().is_empty());
    assert!(h.runner.calls().is_empty());
    let jobs: Value = h.server.get("/api/v1/jobs").await.json();
    assert_eq!(jobs["total"], 0);
}

#[tokio::test]
async fn test_oversized_upload_is_413() {
    let h = Harness::configured(FakeRunner::simulating(), full_registry(), |config| {
        config.storage.max_upload_size = 1024;
    });
    let mut big = FAKE_PDF.to_vec();
    big.resize(8 * 1024, b' ');
    let form = MultipartForm::new().add_part(
        "pdf_file",
        Part::bytes(big).file_name("big.pdf".to_string()).mime_type("application/pdf"),
    );

    let response = h.server.post("/api/v1/pdf/compress").multipart(form).await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = response.json();
    assert_eq!(error_code(&body), "PAYLOAD_TOO_LARGE");
    assert!(h.stored_files().is_empty());
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_queued_transcriptions_leave_workers_free() {
    let h = Harness::configured(FakeRunner::simulating(), full_registry(), |config| {
        config.jobs.workers = 2;
        config.jobs.transcription_workers = 1;
    });
    // Occupy the only transcription slot
    let slot = h.state.media.transcription_slots().acquire_owned().await.unwrap();

    let audio = || MultipartForm::new().add_part("audio_file", file_part("memo.ogg", b"OggS"));
    let first = h.submit("/api/v1/media/transcribe", audio()).await;
    let second = h.submit("/api/v1/media/transcribe", audio()).await;

    let compress = h
        .submit("/api/v1/pdf/compress", MultipartForm::new().add_part("pdf_file", pdf_part("a.pdf")))
        .await;
    assert_eq!(h.finished(&compress).await["status"], "completed");

    assert_eq!(h.status_of(&first).await, "pending");
    assert_eq!(h.status_of(&second).await, "pending");

    let response = h.server.delete(&format!("/api/v1/jobs/{}", second)).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "cancelled");

    drop(slot);
    let job = h.finished(&first).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["text"], "ola mundo, isto e um teste");
    assert_eq!(h.status_of(&second).await, "cancelled");
    assert_eq!(h.runner.programs().iter().filter(|p| *p == "whisper").count(), 1);
}

#[tokio::test]
async fn test_missing_tool_is_503() {
    let h = Harness::with(FakeRunner::simulating(), ToolRegistry::default());
    let form = MultipartForm::new().add_part("doc_file", file_part("letter.docx", b"PK"));

    let response = h.server.post("/api/v1/pdf/document-to-pdf").multipart(form).await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(error_code(&body), "TOOL_UNAVAILABLE");
    assert_eq!(body["error"]["details"]["tool"], "libreoffice");
    assert!(h.stored_files().is_empty());
}

#[tokio::test]
async fn test_failed_tool_marks_job_failed() {
    let h = Harness::with(FakeRunner::failing("gs", "Error: /syntaxerror in obj"), full_registry());
    let form = MultipartForm::new().add_part("pdf_file", pdf_part("broken.pdf"));

    let id = h.submit("/api/v1/pdf/compress", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "failed");
    assert_eq!(job["error"], "Ghostscript compression failed (exit code 1)");
    assert_eq!(job["artifacts"].as_array().unwrap().len(), 0);
    assert!(h.stored_files().is_empty());
}

#[tokio::test]
async fn test_identical_filenames_get_distinct_outputs() {
    let h = Harness::new();

    let first = h
        .submit("/api/v1/pdf/ocr", MultipartForm::new().add_part("pdf_file", pdf_part("same.pdf")))
        .await;
    let second = h
        .submit("/api/v1/pdf/ocr", MultipartForm::new().add_part("pdf_file", pdf_part("same.pdf")))
        .await;
    assert_ne!(first, second);

    let a = h.finished(&first).await;
    let b = h.finished(&second).await;
    assert_eq!(a["status"], "completed");
    assert_eq!(b["status"], "completed");
    assert_ne!(a["artifacts"][0]["filename"], b["artifacts"][0]["filename"]);
}

#[tokio::test]
async fn test_merge_keeps_upload_order() {
    let h = Harness::new();
    let form = MultipartForm::new()
        .add_part("pdf_files", pdf_part("first.pdf"))
        .add_part("pdf_files", pdf_part("second.pdf"));

    let id = h.submit("/api/v1/pdf/merge", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(job["message"], "2 PDFs merged");
    let call = &h.runner.calls()[0];
    let inputs: Vec<String> = call
        .args
        .iter()
        .rev()
        .take(2)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    assert!(inputs[1].ends_with("_first.pdf"));
    assert!(inputs[0].ends_with("_second.pdf"));
}

#[tokio::test]
async fn test_to_images_delivers_zip() {
    let h = Harness::new();
    let form = MultipartForm::new()
        .add_part("pdf_file", pdf_part("slides.pdf"))
        .add_text("dpi", "200");

    let id = h.submit("/api/v1/pdf/to-images", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(job["message"], "2 image(s) generated at 200 DPI, packed into a ZIP archive");
    let artifacts = job["artifacts"].as_array().unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0]["mime_type"], "application/zip");
    assert!(artifacts[0]["filename"].as_str().unwrap().ends_with("_slides_pages.zip"));
}

#[tokio::test]
async fn test_images_to_pdf_without_tools() {
    let h = Harness::with(FakeRunner::simulating(), ToolRegistry::default());
    let form = MultipartForm::new()
        .add_part("img_files", file_part("one.png", &png_bytes()))
        .add_part("img_files", file_part("two.png", &png_bytes()));

    let id = h.submit("/api/v1/pdf/images-to-pdf", form).await;
    let job = h.finished(&id).await;

    assert_eq!(job["status"], "completed");
    assert_eq!(job["message"], "2 image(s) converted to PDF, 0 skipped");
    assert!(job["artifacts"][0]["filename"].as_str().unwrap().ends_with("_one.pdf"));
}

#[tokio::test]
async fn test_office_conversions() {
    let h = Harness::new();

    let doc = h
        .submit(
            "/api/v1/pdf/document-to-pdf",
            MultipartForm::new().add_part("doc_file", file_part("Letter.DOCX", b"PK")),
        )
        .await;
    let sheet = h
        .submit(
            "/api/v1/pdf/spreadsheet-to-pdf",
            MultipartForm::new().add_part("sheet_file", file_part("budget.csv", b"a,b\n1,2\n")),
        )
        .await;
    let docx = h
        .submit(
            "/api/v1/pdf/to-docx",
            MultipartForm::new()
                .add_part("pdf_file", pdf_part("form.pdf"))
                .add_text("apply_ocr", "on"),
        )
        .await;

    let doc = h.finished(&doc).await;
    assert_eq!(doc["kind"], "document_to_pdf");
    assert_eq!(doc["message"], "Document converted to PDF");

    let sheet = h.finished(&sheet).await;
    assert_eq!(sheet["kind"], "spreadsheet_to_pdf");
    assert_eq!(sheet["status"], "completed");

    let docx = h.finished(&docx).await;
    assert_eq!(docx["message"], "PDF converted to DOCX (with OCR applied first)");
    assert!(docx["artifacts"][0]["filename"].as_str().unwrap().ends_with("_form.docx"));
}

#[tokio::test]
async fn test_media_endpoints() {
    let h = Harness::new();

    let mp3 = h
        .submit(
            "/api/v1/media/video-to-mp3",
            MultipartForm::new().add_part("video_file", file_part("clip.mp4", b"\0\0\0 ftyp")),
        )
        .await;
    let text = h
        .submit(
            "/api/v1/media/transcribe",
            MultipartForm::new()
                .add_part("audio_file", file_part("memo.wav", b"RIFF"))
                .add_text("language", "en"),
        )
        .await;

    let mp3 = h.finished(&mp3).await;
    assert_eq!(mp3["status"], "completed");
    assert_eq!(mp3["artifacts"][0]["mime_type"], "audio/mpeg");

    let text = h.finished(&text).await;
    assert_eq!(text["status"], "completed");
    assert_eq!(text["text"], "ola mundo, isto e um teste");
    assert_eq!(text["artifacts"][0]["mime_type"], "text/plain");
    let whisper = h
        .runner
        .calls()
        .into_iter()
        .find(|c| c.program.ends_with("whisper"))
        .unwrap();
    assert_eq!(whisper.value_after("--language").unwrap().to_str(), Some("en"));
}

#[tokio::test]
async fn test_job_lookup_and_cancel_errors() {
    let h = Harness::new();

    let response = h.server.get("/api/v1/jobs/does-not-exist").await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = h.server.delete("/api/v1/jobs/does-not-exist").await;
    response.assert_status(StatusCode::NOT_FOUND);

    let id = h
        .submit("/api/v1/pdf/ocr", MultipartForm::new().add_part("pdf_file", pdf_part("x.pdf")))
        .await;
    h.finished(&id).await;

    let response = h.server.delete(&format!("/api/v1/jobs/{}", id)).await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(error_code(&body), "CONFLICT");
    assert_eq!(body["error"]["details"]["status"], "completed");

    let jobs: Value = h.server.get("/api/v1/jobs").await.json();
    assert_eq!(jobs["total"], 1);
    assert_eq!(jobs["active"], 0);
    assert_eq!(jobs["jobs"][0]["id"], id.as_str());
}

#[tokio::test]
async fn test_download_rejects_bad_names() {
    let h = Harness::new();

    let response = h.server.get("/download/..%2F..%2Fetc%2Fpasswd").await;
    response.assert_status(StatusCode::BAD_REQUEST);

    let response = h.server.get("/download/nothing_here.pdf").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(error_code(&body), "NOT_FOUND");
}

#[tokio::test]
async fn test_static_fallback() {
    let h = Harness::new();
    let static_dir = h.dir.path().join("static");
    std::fs::create_dir_all(&static_dir).unwrap();
    std::fs::write(static_dir.join("index.html"), "<h1>convertkit</h1>").unwrap();

    let response = h.server.get("/").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "<h1>convertkit</h1>");
}
