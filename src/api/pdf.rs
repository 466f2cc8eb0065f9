//! PDF tool endpoints
//!
//! Every handler validates the form, checks the tools it needs, stores the
//! uploads and submits a background job.

use axum::{
    extract::{Multipart, State},
    routing::post,
    Router,
};

use crate::api::jobs::{accepted, job_output, Accepted};
use crate::api::middleware::{ApiError, AppState};
use crate::api::upload::{UploadForm, UploadedFile};
use crate::convert::archive::create_zip;
use crate::convert::images::{images_to_pdf, IMAGE_EXTENSIONS};
use crate::convert::pdf::{PdfOptions, DOCUMENT_EXTENSIONS, MAX_DPI, MIN_DPI, SPREADSHEET_EXTENSIONS};
use crate::jobs::JobKind;
use crate::tools::ToolKind;

const DEFAULT_LEVEL: u8 = 3;
const MAX_LEVEL: u8 = 4;
const DEFAULT_DPI: u32 = 150;

/// Build the PDF router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/compress", post(compress))
        .route("/merge", post(merge))
        .route("/images-to-pdf", post(images_to_pdf_handler))
        .route("/to-docx", post(to_docx))
        .route("/to-images", post(to_images))
        .route("/document-to-pdf", post(document_to_pdf))
        .route("/spreadsheet-to-pdf", post(spreadsheet_to_pdf))
        .route("/ocr", post(ocr))
}

/// Resolve and check the OCR language of a form
fn ocr_language(state: &AppState, form: &UploadForm) -> Result<String, ApiError> {
    let ocr = &state.config.ocr;
    let language = form.text("language").unwrap_or(ocr.default_language.as_str());
    if !ocr.is_language_allowed(language) {
        return Err(ApiError::with_details(
            "VALIDATION_ERROR",
            format!("Unsupported OCR language: {}", language),
            serde_json::json!({ "allowed": ocr.allowed_languages }),
        ));
    }
    Ok(language.to_string())
}

/// Read a single PDF upload from `pdf_file`
fn pdf_upload(form: &mut UploadForm) -> Result<UploadedFile, ApiError> {
    let file = form.take_file("pdf_file")?;
    file.require_extension(&["pdf"])?;
    Ok(file)
}

/// POST /api/v1/pdf/compress - Compress a PDF, optionally applying OCR
///
/// Fields: `pdf_file`, `level` (0-4, default 3), `apply_ocr`, `language`.
async fn compress(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = pdf_upload(&mut form)?;
    let level: u8 = form.number("level", DEFAULT_LEVEL)?;
    if level > MAX_LEVEL {
        return Err(ApiError::validation_error(format!(
            "Compression level must be between 0 and {}",
            MAX_LEVEL
        )));
    }
    let ocr_language = if form.flag("apply_ocr") {
        Some(ocr_language(&state, &form)?)
    } else {
        None
    };

    state.tools.require(ToolKind::Ghostscript)?;
    if ocr_language.is_some() {
        state.tools.require(ToolKind::Ocrmypdf)?;
    }

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.pdf", file.stem()), "compressed");
    let pdf = state.pdf.clone();
    let options = PdfOptions {
        compression_level: Some(level),
        ocr_language,
    };

    let id = state
        .jobs
        .submit(JobKind::PdfCompress, vec![input.clone()], move |_| async move {
            job_output(pdf.compress_and_ocr(&input, &output, &options).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/merge - Merge two or more PDFs in upload order
async fn merge(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let files = form.take_files("pdf_files")?;
    if files.len() < 2 {
        return Err(ApiError::validation_error("At least two PDFs are required to merge"));
    }
    for file in &files {
        file.require_extension(&["pdf"])?;
    }
    state.tools.require(ToolKind::Ghostscript)?;

    let mut inputs = Vec::with_capacity(files.len());
    for file in &files {
        inputs.push(state.store.save(&file.filename, "merge", &file.data).await?);
    }
    let output = state.store.reserve("merged.pdf", "merged");
    let pdf = state.pdf.clone();
    let sources = inputs.clone();

    let id = state
        .jobs
        .submit(JobKind::PdfMerge, inputs, move |_| async move {
            job_output(pdf.merge(&sources, &output).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/images-to-pdf - One page per image, in upload order
async fn images_to_pdf_handler(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let files = form.take_files("img_files")?;
    if files.is_empty() {
        return Err(ApiError::validation_error("No images provided"));
    }
    for file in &files {
        file.require_extension(IMAGE_EXTENSIONS)?;
    }

    let mut inputs = Vec::with_capacity(files.len());
    for file in &files {
        inputs.push(state.store.save(&file.filename, "image", &file.data).await?);
    }
    let output = state.store.reserve(&format!("{}.pdf", files[0].stem()), "images");
    let sources = inputs.clone();

    let id = state
        .jobs
        .submit(JobKind::ImagesToPdf, inputs, move |_| async move {
            job_output(images_to_pdf(sources, output).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/to-docx - Convert a PDF to DOCX
///
/// With `apply_ocr`, OCR runs first when OCRmyPDF is installed; otherwise the
/// conversion goes ahead and the job message says OCR was skipped.
async fn to_docx(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = pdf_upload(&mut form)?;
    let ocr_language = if form.flag("apply_ocr") {
        Some(ocr_language(&state, &form)?)
    } else {
        None
    };
    state.tools.require(ToolKind::Libreoffice)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.docx", file.stem()), "docx");
    let pdf = state.pdf.clone();

    let id = state
        .jobs
        .submit(JobKind::PdfToDocx, vec![input.clone()], move |_| async move {
            job_output(pdf.to_docx(&input, &output, ocr_language.as_deref()).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/to-images - Render every page to PNG, delivered as a ZIP
async fn to_images(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = pdf_upload(&mut form)?;
    let dpi: u32 = form.number("dpi", DEFAULT_DPI)?;
    if !(MIN_DPI..=MAX_DPI).contains(&dpi) {
        return Err(ApiError::validation_error(format!(
            "DPI must be between {} and {}",
            MIN_DPI, MAX_DPI
        )));
    }
    state.tools.require(ToolKind::Ghostscript)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}_pages.zip", file.stem()), "pages");
    let pdf = state.pdf.clone();
    let store = state.store.clone();

    let id = state
        .jobs
        .submit(JobKind::PdfToImages, vec![input.clone()], move |ctx| async move {
            let work = store.work_dir()?;
            let pages = pdf.to_images(&input, work.path(), dpi).await?;
            ctx.set_progress(60).await;

            let mut archive = create_zip(pages.files, output).await?;
            archive.message = format!("{}, packed into a ZIP archive", pages.message);
            job_output(archive).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/document-to-pdf - Office document to PDF
async fn document_to_pdf(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    office_to_pdf(state, multipart, "doc_file", DOCUMENT_EXTENSIONS, JobKind::DocumentToPdf).await
}

/// POST /api/v1/pdf/spreadsheet-to-pdf - Spreadsheet to PDF
async fn spreadsheet_to_pdf(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    office_to_pdf(state, multipart, "sheet_file", SPREADSHEET_EXTENSIONS, JobKind::SpreadsheetToPdf).await
}

async fn office_to_pdf(
    state: AppState,
    multipart: Multipart,
    field: &str,
    extensions: &[&str],
    kind: JobKind,
) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file(field)?;
    file.require_extension(extensions)?;
    state.tools.require(ToolKind::Libreoffice)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.pdf", file.stem()), "converted");
    let pdf = state.pdf.clone();

    let id = state
        .jobs
        .submit(kind, vec![input.clone()], move |_| async move {
            job_output(pdf.document_to_pdf(&input, &output).await?).await
        })
        .await;
    Ok(accepted(id))
}

/// POST /api/v1/pdf/ocr - Add a searchable text layer
async fn ocr(State(state): State<AppState>, multipart: Multipart) -> Result<Accepted, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let file = pdf_upload(&mut form)?;
    let language = ocr_language(&state, &form)?;
    state.tools.require(ToolKind::Ocrmypdf)?;

    let input = state.store.save(&file.filename, "upload", &file.data).await?;
    let output = state.store.reserve(&format!("{}.pdf", file.stem()), "ocr");
    let pdf = state.pdf.clone();

    let id = state
        .jobs
        .submit(JobKind::PdfOcr, vec![input.clone()], move |_| async move {
            job_output(pdf.ocr(&input, &output, &language).await?).await
        })
        .await;
    Ok(accepted(id))
}
