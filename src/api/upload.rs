//! Multipart form handling for the conversion endpoints
//!
//! Forms are read completely before any validation: file parts are kept by
//! field name, plain parts become text fields.

use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::Multipart;

use crate::api::middleware::ApiError;
use crate::storage::{extension_of, stem_of};

/// A file part of a multipart form
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub data: Bytes,
}

impl UploadedFile {
    /// Lowercase extension of the client file name
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.filename)
    }

    pub fn stem(&self) -> String {
        stem_of(&self.filename)
    }

    /// Check the extension against an allow list
    pub fn require_extension(&self, allowed: &[&str]) -> Result<(), ApiError> {
        match self.extension() {
            Some(ext) if allowed.contains(&ext.as_str()) => Ok(()),
            _ => Err(ApiError::with_details(
                "VALIDATION_ERROR",
                format!(
                    "Invalid file type for '{}'. Allowed extensions: {}",
                    self.filename,
                    allowed.join(", ")
                ),
                serde_json::json!({ "field": self.field, "allowed": allowed }),
            )),
        }
    }
}

/// A fully read multipart form
#[derive(Debug, Default)]
pub struct UploadForm {
    files: Vec<UploadedFile>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    /// Read every part of the request
    ///
    /// File inputs left empty by the browser (no name, no content) are dropped.
    pub async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or("").to_string();
            match field.file_name().map(|s| s.to_string()) {
                Some(filename) => {
                    let data = field.bytes().await?;
                    if filename.is_empty() && data.is_empty() {
                        continue;
                    }
                    form.files.push(UploadedFile {
                        field: name,
                        filename,
                        data,
                    });
                }
                None => {
                    let value = field.text().await?;
                    form.fields.insert(name, value);
                }
            }
        }

        tracing::debug!(
            "Multipart form read: {} file(s), {} field(s)",
            form.files.len(),
            form.fields.len()
        );
        Ok(form)
    }

    /// Take the single required file of a field
    pub fn take_file(&mut self, field: &str) -> Result<UploadedFile, ApiError> {
        let position = self
            .files
            .iter()
            .position(|f| f.field == field)
            .ok_or_else(|| ApiError::validation_error(format!("No file provided in field '{}'", field)))?;
        let file = self.files.remove(position);
        ensure_not_empty(&file)?;
        Ok(file)
    }

    /// Take every file of a field, in submission order
    pub fn take_files(&mut self, field: &str) -> Result<Vec<UploadedFile>, ApiError> {
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|f| f.field == field);
        self.files = rest;
        for file in &taken {
            ensure_not_empty(file)?;
        }
        Ok(taken)
    }

    /// Trimmed text value; blank values count as absent
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Checkbox-style flag
    pub fn flag(&self, field: &str) -> bool {
        matches!(
            self.text(field).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("true" | "1" | "on" | "yes")
        )
    }

    /// Parse a numeric field, falling back to `default` when absent
    pub fn number<T: FromStr>(&self, field: &str, default: T) -> Result<T, ApiError> {
        match self.text(field) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::validation_error(format!("Field '{}' must be a number, got '{}'", field, raw))),
        }
    }
}

fn ensure_not_empty(file: &UploadedFile) -> Result<(), ApiError> {
    if file.data.is_empty() {
        return Err(ApiError::validation_error(format!(
            "Uploaded file '{}' is empty",
            file.filename
        )));
    }
    Ok(())
}
