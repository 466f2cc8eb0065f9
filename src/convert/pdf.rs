//! PDF operations backed by Ghostscript, OCRmyPDF and LibreOffice

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::{ensure_output, megabytes, move_file, remove_partial, Conversion, ConvertError};
use crate::config::ToolTimeouts;
use crate::storage::FileStore;
use crate::tools::{run_checked, Invocation, ProcessRunner, ToolError, ToolKind, ToolRegistry};

/// Extensions accepted by the document to PDF conversion
pub const DOCUMENT_EXTENSIONS: &[&str] = &["docx", "doc", "odt", "txt", "rtf"];

/// Extensions accepted by the spreadsheet to PDF conversion
pub const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv", "ods"];

pub const MIN_DPI: u32 = 50;
pub const MAX_DPI: u32 = 600;

/// Bytes searched for the `%PDF-` marker
const HEADER_WINDOW: usize = 1024;

/// Ghostscript `-dPDFSETTINGS` preset for a compression level (clamped to 0-4)
pub fn pdf_settings(level: u8) -> &'static str {
    match level.min(4) {
        0 => "/default",
        1 => "/prepress",
        2 => "/printer",
        3 => "/ebook",
        _ => "/screen",
    }
}

/// Steps of a combined compression/OCR run
#[derive(Debug, Clone, Default)]
pub struct PdfOptions {
    /// Compression level 0-4, `None` skips compression
    pub compression_level: Option<u8>,
    /// OCR language spec, `None` skips OCR
    pub ocr_language: Option<String>,
}

/// PDF conversions
#[derive(Clone)]
pub struct PdfTransformer {
    tools: Arc<ToolRegistry>,
    runner: Arc<dyn ProcessRunner>,
    timeouts: ToolTimeouts,
    store: FileStore,
}

impl PdfTransformer {
    pub fn new(
        tools: Arc<ToolRegistry>,
        runner: Arc<dyn ProcessRunner>,
        timeouts: ToolTimeouts,
        store: FileStore,
    ) -> Self {
        Self {
            tools,
            runner,
            timeouts,
            store,
        }
    }

    /// Compress a PDF with Ghostscript `pdfwrite`
    pub async fn compress(&self, input: &Path, output: &Path, level: u8) -> Result<Conversion, ConvertError> {
        let gs = self.tools.require(ToolKind::Ghostscript)?;
        let level = level.min(4);
        let settings = pdf_settings(level);

        let invocation = Invocation::new(gs, "Ghostscript compression", secs(self.timeouts.ghostscript_secs))
            .args(["-sDEVICE=pdfwrite", "-dCompatibilityLevel=1.4"])
            .arg(format!("-dPDFSETTINGS={}", settings))
            .args(["-dNOPAUSE", "-dQUIET", "-dBATCH", "-dSAFER"])
            .arg(output_file_arg(output))
            .arg(input);

        if let Err(e) = run_checked(self.runner.as_ref(), &invocation).await {
            remove_partial(output).await;
            return Err(e.into());
        }

        let compressed = ensure_output(output, "compressed PDF").await?;
        let original = fs::metadata(input).await.map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            "Compressed {} ({} -> {}, preset {})",
            input.display(),
            megabytes(original),
            megabytes(compressed),
            settings
        );

        Ok(Conversion::single(
            output,
            format!(
                "Compression finished ({} -> {}, level {})",
                megabytes(original),
                megabytes(compressed),
                level
            ),
        ))
    }

    /// Add a text layer with OCRmyPDF
    ///
    /// Runs on a copy inside a scratch directory and moves the result to `output`.
    pub async fn ocr(&self, input: &Path, output: &Path, language: &str) -> Result<Conversion, ConvertError> {
        let ocrmypdf = self.tools.require(ToolKind::Ocrmypdf)?;
        let work = self.store.work_dir()?;
        let staged_input = work.path().join("input_ocr.pdf");
        let staged_output = work.path().join("output_ocr.pdf");
        fs::copy(input, &staged_input).await?;

        let invocation = Invocation::new(ocrmypdf, "OCRmyPDF", secs(self.timeouts.ocr_secs))
            .args(["--force-ocr", "--optimize", "1", "--output-type", "pdf", "--jobs", "2", "-l"])
            .arg(language)
            .arg(&staged_input)
            .arg(&staged_output);

        run_checked(self.runner.as_ref(), &invocation).await?;
        ensure_output(&staged_output, "OCR output").await?;
        move_file(&staged_output, output).await?;

        tracing::info!("OCR ({}) applied to {}", language, input.display());
        Ok(Conversion::single(output, "OCR applied successfully"))
    }

    /// Compression and/or OCR in sequence
    ///
    /// A compression failure fails the run. An OCR failure after a successful
    /// compression still delivers the compressed file, with a warning message.
    pub async fn compress_and_ocr(
        &self,
        input: &Path,
        output: &Path,
        options: &PdfOptions,
    ) -> Result<Conversion, ConvertError> {
        if options.compression_level.is_none() && options.ocr_language.is_none() {
            return Err(ConvertError::InvalidInput(
                "Choose compression, OCR or both".to_string(),
            ));
        }

        let work = self.store.work_dir()?;
        let mut current: Option<PathBuf> = None;
        let mut message = String::new();

        if let Some(level) = options.compression_level {
            let compressed = work.path().join("compressed.pdf");
            let done = self.compress(input, &compressed, level).await?;
            message = done.message;
            current = Some(compressed);
        }

        if let Some(language) = &options.ocr_language {
            let source = current.clone().unwrap_or_else(|| input.to_path_buf());
            let ocr_output = work.path().join("ocr.pdf");
            match self.ocr(&source, &ocr_output, language).await {
                Ok(_) => {
                    message = if current.is_some() {
                        format!("{}; OCR applied", message)
                    } else {
                        "OCR applied successfully".to_string()
                    };
                    current = Some(ocr_output);
                }
                Err(e) if current.is_some() => {
                    tracing::warn!("OCR failed after compression, keeping the compressed file: {}", e);
                    message = format!("Compression finished, but OCR failed: {}", e.user_message());
                }
                Err(e) => return Err(e),
            }
        }

        let result = current.ok_or_else(|| ConvertError::MissingOutput("No step produced a result".to_string()))?;
        move_file(&result, output).await?;
        Ok(Conversion::single(output, message))
    }

    /// Merge PDFs in the given order
    ///
    /// Inputs without a PDF header are skipped. When Ghostscript rejects the
    /// merge, each input is checked on its own and the unreadable ones are
    /// left out of a second attempt.
    pub async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<Conversion, ConvertError> {
        if inputs.len() < 2 {
            return Err(ConvertError::InvalidInput(
                "At least two PDFs are required to merge".to_string(),
            ));
        }
        let gs = self.tools.require(ToolKind::Ghostscript)?;

        // (1-based position, path)
        let mut valid = Vec::with_capacity(inputs.len());
        let mut skipped = Vec::new();
        for (idx, path) in inputs.iter().enumerate() {
            if has_pdf_header(path).await {
                valid.push((idx + 1, path.clone()));
            } else {
                tracing::warn!("PDF {} ({}) is empty or not a PDF, skipping", idx + 1, path.display());
                skipped.push(idx + 1);
            }
        }
        if valid.is_empty() {
            return Err(ConvertError::InvalidInput("No valid PDF found to merge".to_string()));
        }

        if let Err(e) = self.merge_files(gs, &valid, output).await {
            let rejected = skipped.len();
            let mut readable = Vec::with_capacity(valid.len());
            for (number, path) in valid {
                if self.is_readable(gs, &path).await? {
                    readable.push((number, path));
                } else {
                    tracing::warn!("PDF {} ({}) could not be read, skipping", number, path.display());
                    skipped.push(number);
                }
            }
            if skipped.len() == rejected {
                return Err(e);
            }
            if readable.is_empty() {
                return Err(ConvertError::InvalidInput("None of the PDFs could be read".to_string()));
            }
            self.merge_files(gs, &readable, output).await?;
            valid = readable;
        }
        ensure_output(output, "merged PDF").await?;

        skipped.sort_unstable();
        let message = if skipped.is_empty() {
            format!("{} PDFs merged", valid.len())
        } else {
            let positions: Vec<String> = skipped.iter().map(ToString::to_string).collect();
            format!(
                "PDFs merged ({} of {} merged, skipped PDF {})",
                valid.len(),
                inputs.len(),
                positions.join(", ")
            )
        };
        tracing::info!("{}", message);
        Ok(Conversion::single(output, message))
    }

    async fn merge_files(&self, gs: &Path, inputs: &[(usize, PathBuf)], output: &Path) -> Result<(), ConvertError> {
        let invocation = Invocation::new(gs, "Ghostscript merge", secs(self.timeouts.ghostscript_secs))
            .args(["-dNOPAUSE", "-dQUIET", "-dBATCH", "-dSAFER", "-sDEVICE=pdfwrite"])
            .arg(output_file_arg(output))
            .args(inputs.iter().map(|(_, path)| path));

        if let Err(e) = run_checked(self.runner.as_ref(), &invocation).await {
            remove_partial(output).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Whether Ghostscript can interpret the file on its own
    ///
    /// Only a non-zero exit counts as unreadable; a missing or hung tool is
    /// still an error.
    async fn is_readable(&self, gs: &Path, input: &Path) -> Result<bool, ConvertError> {
        let invocation = Invocation::new(gs, "Ghostscript PDF check", secs(self.timeouts.ghostscript_secs))
            .args(["-dNOPAUSE", "-dQUIET", "-dBATCH", "-dSAFER", "-sDEVICE=nullpage"])
            .arg(input);

        match run_checked(self.runner.as_ref(), &invocation).await {
            Ok(_) => Ok(true),
            Err(ToolError::Failed { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Render every page to `page_<n>.png` inside `out_dir`
    pub async fn to_images(&self, input: &Path, out_dir: &Path, dpi: u32) -> Result<Conversion, ConvertError> {
        let gs = self.tools.require(ToolKind::Ghostscript)?;
        if !input.is_file() {
            return Err(ConvertError::InvalidInput("Input PDF not found".to_string()));
        }
        let dpi = dpi.clamp(MIN_DPI, MAX_DPI);
        fs::create_dir_all(out_dir).await?;

        let invocation = Invocation::new(gs, "Ghostscript rendering", secs(self.timeouts.ghostscript_secs))
            .args(["-dNOPAUSE", "-dQUIET", "-dBATCH", "-dSAFER", "-sDEVICE=png16m"])
            .arg(format!("-r{}", dpi))
            .arg(output_file_arg(&out_dir.join("page_%d.png")))
            .arg(input);
        run_checked(self.runner.as_ref(), &invocation).await?;

        let pages = list_pages(out_dir).await?;
        if pages.is_empty() {
            return Err(ConvertError::MissingOutput("The PDF has no pages".to_string()));
        }

        tracing::info!("Rendered {} page(s) of {} at {} DPI", pages.len(), input.display(), dpi);
        let message = format!("{} image(s) generated at {} DPI", pages.len(), dpi);
        Ok(Conversion {
            files: pages,
            message,
            text: None,
        })
    }

    /// Convert a PDF to DOCX, optionally running OCR first
    ///
    /// OCR problems never fail the conversion; they are noted in the message.
    pub async fn to_docx(
        &self,
        input: &Path,
        output: &Path,
        ocr_language: Option<&str>,
    ) -> Result<Conversion, ConvertError> {
        self.tools.require(ToolKind::Libreoffice)?;
        if !input.is_file() {
            return Err(ConvertError::InvalidInput("Input PDF not found".to_string()));
        }

        let work = self.store.work_dir()?;
        let mut source = input.to_path_buf();
        let mut note = String::new();

        if let Some(language) = ocr_language {
            if !self.tools.is_available(ToolKind::Ocrmypdf) {
                tracing::warn!("OCR requested before DOCX conversion, but OCRmyPDF is not available");
                note = " (OCR not applied: tool unavailable)".to_string();
            } else {
                let ocr_output = work.path().join("ocr.pdf");
                match self.ocr(input, &ocr_output, language).await {
                    Ok(_) => {
                        source = ocr_output;
                        note = " (with OCR applied first)".to_string();
                    }
                    Err(e) => {
                        tracing::warn!("OCR before DOCX conversion failed, using the original PDF: {}", e);
                        note = format!(" (OCR attempt failed: {})", e.user_message());
                    }
                }
            }
        }

        let produced = self
            .libreoffice_convert(&source, &work, "docx:MS Word 2007 XML", Some("writer_pdf_import"))
            .await?;
        ensure_output(&produced, "DOCX file").await?;
        move_file(&produced, output).await?;

        Ok(Conversion::single(output, format!("PDF converted to DOCX{}", note)))
    }

    /// Convert an office document or spreadsheet to PDF with LibreOffice
    pub async fn document_to_pdf(&self, input: &Path, output: &Path) -> Result<Conversion, ConvertError> {
        self.tools.require(ToolKind::Libreoffice)?;
        if !input.is_file() {
            return Err(ConvertError::InvalidInput("Input document not found".to_string()));
        }

        let work = self.store.work_dir()?;
        let produced = self.libreoffice_convert(input, &work, "pdf", None).await?;
        ensure_output(&produced, "PDF file").await?;
        move_file(&produced, output).await?;

        tracing::info!("Converted {} to PDF", input.display());
        Ok(Conversion::single(output, "Document converted to PDF"))
    }

    /// Run a headless LibreOffice conversion into `work`
    ///
    /// LibreOffice names its output `<stem>.<ext>`; that path is returned.
    /// Each run gets its own profile directory so concurrent conversions do
    /// not block on the shared user profile.
    async fn libreoffice_convert(
        &self,
        input: &Path,
        work: &TempDir,
        convert_to: &str,
        input_filter: Option<&str>,
    ) -> Result<PathBuf, ConvertError> {
        let soffice = self.tools.require(ToolKind::Libreoffice)?;
        let outdir = work.path().join("out");
        fs::create_dir_all(&outdir).await?;

        let mut profile = OsString::from("-env:UserInstallation=file://");
        profile.push(work.path().join("profile"));

        let mut invocation = Invocation::new(soffice, "LibreOffice conversion", secs(self.timeouts.libreoffice_secs))
            .arg(profile)
            .args(["--headless", "--invisible"]);
        if let Some(filter) = input_filter {
            invocation = invocation.arg(format!("--infilter={}", filter));
        }
        let invocation = invocation
            .args(["--convert-to", convert_to])
            .arg("--outdir")
            .arg(&outdir)
            .arg(input);

        run_checked(self.runner.as_ref(), &invocation).await?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let extension = convert_to.split(':').next().unwrap_or(convert_to);
        Ok(outdir.join(format!("{}.{}", stem, extension)))
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}

fn output_file_arg(path: &Path) -> OsString {
    let mut arg = OsString::from("-sOutputFile=");
    arg.push(path);
    arg
}

/// Whether the file starts (within the first KiB) with a PDF header
pub async fn has_pdf_header(path: &Path) -> bool {
    let mut file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = vec![0u8; HEADER_WINDOW];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    buf[..filled].windows(5).any(|w| w == b"%PDF-")
}

/// `page_<n>.png` files of a directory in page order
async fn list_pages(dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let mut numbered = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let number = name
            .to_str()
            .and_then(|n| n.strip_prefix("page_"))
            .and_then(|n| n.strip_suffix(".png"))
            .and_then(|n| n.parse::<u32>().ok());
        if let Some(number) = number {
            numbered.push((number, entry.path()));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}
