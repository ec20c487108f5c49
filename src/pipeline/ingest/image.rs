use std::path::Path;

use base64::Engine;

use super::IngestError;
use crate::pipeline::inference::prompt::{VISION_SYSTEM_PROMPT, VISION_USER_PROMPT};
use crate::pipeline::inference::{sanitize_llm_output, VisionClient};

/// Transcribe an image through the vision backend.
pub fn convert_image(
    client: &dyn VisionClient,
    model: &str,
    path: &Path,
) -> Result<String, IngestError> {
    let mime = mime_guess::from_path(path)
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .ok_or_else(|| IngestError::UnknownImageType(path.display().to_string()))?;

    let bytes = std::fs::read(path)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

    let _span = tracing::info_span!("vision_transcribe", file = %path.display(), mime = %mime).entered();
    let start = std::time::Instant::now();
    let raw = client.chat_with_images(model, VISION_USER_PROMPT, &[encoded], Some(VISION_SYSTEM_PROMPT))?;
    tracing::debug!(
        bytes = bytes.len(),
        elapsed_ms = %start.elapsed().as_millis(),
        "Image transcribed"
    );

    Ok(sanitize_llm_output(&raw))
}
