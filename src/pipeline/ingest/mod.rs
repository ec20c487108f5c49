//! Document ingestion: directory walk and per-format converters.
//!
//! Every recognised file becomes one [`IngestedFile`]. A converter failure is
//! confined to its own file: the content is replaced by an error marker and the
//! walk continues. Unrecognised extensions are skipped.

pub mod image;
pub mod pdf;
pub mod table;
pub mod text;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::inference::{InferenceError, VisionClient};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDF parsing failed: {0}")]
    PdfParsing(String),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Text encoding error: {0}")]
    Encoding(String),

    #[error("Unsupported image type for file: {0}")]
    UnknownImageType(String),

    #[error("Vision transcription failed: {0}")]
    Vision(#[from] InferenceError),

    #[error("No vision backend configured for image files")]
    VisionUnavailable,

    #[error("{0} converter panicked")]
    ConverterPanicked(&'static str),
}

/// One converted file, before metadata extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestedFile {
    pub name: String,
    pub content: String,
}

/// Marker content recorded in place of a file that failed to convert.
pub fn error_marker(reason: &str) -> String {
    format!("[Error reading file: {reason}]")
}

/// Converter families, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
    Csv,
    Xlsx,
    Image,
}

impl FileKind {
    /// `None` means the file is not part of the document set.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Text),
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Xlsx),
            "png" | "jpg" | "jpeg" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Image => "image",
        }
    }
}

/// Source of `(name, content)` pairs for a run.
pub trait DocumentIngestor: Send + Sync {
    /// Convert every recognised file under `dir`. Per-file failures are
    /// recorded as error markers; only an unreadable `dir` itself is an error.
    fn ingest(&self, dir: &Path) -> Result<Vec<IngestedFile>, IngestError>;
}

/// Filesystem ingestor with the standard extension dispatch table.
pub struct DirectoryIngestor {
    vision: Option<Arc<dyn VisionClient>>,
    vision_model: String,
}

impl DirectoryIngestor {
    /// Ingestor without a vision backend: image files get an error marker.
    pub fn new() -> Self {
        Self {
            vision: None,
            vision_model: String::new(),
        }
    }

    pub fn with_vision(mut self, client: Arc<dyn VisionClient>, model: &str) -> Self {
        self.vision = Some(client);
        self.vision_model = model.to_string();
        self
    }

    /// The configured vision model is not on the backend: image files are
    /// recorded with a marker naming it.
    pub fn with_missing_vision_model(mut self, model: &str) -> Self {
        self.vision = None;
        self.vision_model = model.to_string();
        self
    }

    /// Run the converter for `kind`. Third-party parsers can panic on
    /// malformed input; the panic is confined to this file.
    fn convert(&self, kind: FileKind, path: &Path) -> Result<String, IngestError> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.convert_unguarded(kind, path)))
            .unwrap_or(Err(IngestError::ConverterPanicked(kind.as_str())))
    }

    fn convert_unguarded(&self, kind: FileKind, path: &Path) -> Result<String, IngestError> {
        match kind {
            FileKind::Pdf => pdf::convert_pdf(path),
            FileKind::Text => text::convert_text(path),
            FileKind::Csv => table::convert_csv(path),
            FileKind::Xlsx => table::convert_xlsx(path),
            FileKind::Image => match self.vision.as_deref() {
                Some(client) => image::convert_image(client, &self.vision_model, path),
                None if self.vision_model.is_empty() => Err(IngestError::VisionUnavailable),
                None => Err(InferenceError::NoModelAvailable(self.vision_model.clone()).into()),
            },
        }
    }
}

impl Default for DirectoryIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentIngestor for DirectoryIngestor {
    fn ingest(&self, dir: &Path) -> Result<Vec<IngestedFile>, IngestError> {
        let mut paths = Vec::new();
        collect_files(dir, &mut paths)?;
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(kind) = FileKind::from_path(&path) else {
                tracing::debug!(file = %path.display(), "Skipping unsupported file");
                continue;
            };
            let name = display_name(dir, &path);

            let content = match self.convert(kind, &path) {
                Ok(content) => {
                    tracing::debug!(file = %name, kind = kind.as_str(), chars = content.len(), "File converted");
                    content
                }
                Err(e) => {
                    tracing::warn!(file = %name, kind = kind.as_str(), error = %e, "File conversion failed");
                    error_marker(&e.to_string())
                }
            };
            files.push(IngestedFile { name, content });
        }

        tracing::info!(dir = %dir.display(), files = files.len(), "Ingestion complete");
        Ok(files)
    }
}

/// Recursive walk collecting regular files, following file symlinks. Unreadable subdirectories are
/// logged and skipped; only the root must be readable.
fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), IngestError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // Symlinked directories are not descended into, so cycles cannot occur.
        if entry.file_type()?.is_dir() {
            if let Err(e) = collect_files(&path, out) {
                tracing::warn!(dir = %path.display(), error = %e, "Skipping unreadable directory");
            }
            continue;
        }
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => out.push(path),
            Ok(_) => {}
            Err(e) => tracing::debug!(file = %path.display(), error = %e, "Skipping dangling link"),
        }
    }
    Ok(())
}

/// Files directly under the root keep their bare name; nested files are
/// named by their `/`-separated path relative to the root.
fn display_name(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
