use std::path::Path;

use super::IngestError;

/// Text layer of a digital PDF, all pages concatenated and trimmed.
pub fn convert_pdf(path: &Path) -> Result<String, IngestError> {
    let bytes = std::fs::read(path)?;
    extract_pdf_text(&bytes)
}

pub fn extract_pdf_text(pdf_bytes: &[u8]) -> Result<String, IngestError> {
    let text = pdf_extract::extract_text_from_mem(pdf_bytes)
        .map_err(|e| IngestError::PdfParsing(e.to_string()))?;
    Ok(text.trim().to_string())
}
