//! ZIP packaging of converter outputs

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{Conversion, ConvertError};

/// Pack files into a Deflate-compressed ZIP under their base names
///
/// Missing files are skipped. An archive that would end up empty is an
/// error, and a partial archive is removed on error.
pub async fn create_zip(files: Vec<PathBuf>, output: PathBuf) -> Result<Conversion, ConvertError> {
    tokio::task::spawn_blocking(move || {
        let result = write_zip(&files, &output);
        if result.is_err() {
            let _ = std::fs::remove_file(&output);
        }
        result
    })
    .await
    .map_err(|e| ConvertError::Io(io::Error::other(e)))?
}

fn write_zip(files: &[PathBuf], output: &Path) -> Result<Conversion, ConvertError> {
    if files.is_empty() {
        return Err(ConvertError::InvalidInput("No files provided to compress".to_string()));
    }

    tracing::info!(
        "Creating ZIP {} with {} file(s)",
        output.display(),
        files.len()
    );

    let mut zip = ZipWriter::new(File::create(output)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut added = 0;
    for path in files {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if path.is_file() => name,
            _ => {
                tracing::warn!("File not found, not adding to ZIP: {}", path.display());
                continue;
            }
        };
        zip.start_file(name, options)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
        added += 1;
    }
    zip.finish()?;

    if added == 0 {
        return Err(ConvertError::MissingOutput(
            "None of the files could be added to the ZIP archive".to_string(),
        ));
    }

    let message = if added == files.len() {
        "ZIP archive created".to_string()
    } else {
        format!("ZIP archive created ({} of {} files added)", added, files.len())
    };
    Ok(Conversion::single(output, message))
}
