use std::path::Path;

use super::IngestError;

/// Plain text files are read as UTF-8 and trimmed.
pub fn convert_text(path: &Path) -> Result<String, IngestError> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes).map_err(|e| IngestError::Encoding(e.to_string()))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_surrounding_whitespace() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("memo.txt");
        std::fs::write(&path, "\n  Approved by CFO.\n\n").unwrap();
        assert_eq!(convert_text(&path).unwrap(), "Approved by CFO.");
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("latin1.txt");
        std::fs::write(&path, [0x63, 0x61, 0x66, 0xE9]).unwrap();
        assert!(matches!(convert_text(&path), Err(IngestError::Encoding(_))));
    }
}
