//! Post-LLM output sanitization.
//!
//! Strips model artifacts (thinking blocks, stray tokens, Markdown fences)
//! and isolates the JSON payload a structured-output call is expected to
//! return.

use std::sync::LazyLock;

use regex::Regex;

use super::InferenceError;

/// Strip model-specific artifacts from raw LLM output.
///
/// Handles:
/// 1. `<think>...</think>` reasoning blocks (closed or left open at the start)
/// 2. Gemma-style thinking prefixes (`<unusedN>thought\n...`) and stray `<unusedN>` tokens
/// 3. Leading/trailing whitespace from stripping
pub fn sanitize_llm_output(raw: &str) -> String {
    static THINK_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
    static UNUSED_TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

    let mut text = THINK_BLOCK_RE.replace_all(raw, "").to_string();

    if let Some(idx) = text.find("<unused") {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + 8..].to_string();
        }
    }

    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();

    text.trim().to_string()
}

/// Locate the JSON document inside a model response.
///
/// Accepts, in order: a ```` ```json ```` fenced block, any fenced block, or the
/// outermost `{...}` / `[...]` span. Returns the payload text, not yet parsed.
pub fn extract_json_payload(response: &str) -> Result<String, InferenceError> {
    let cleaned = sanitize_llm_output(response);

    if let Some(fenced) = fenced_block(&cleaned) {
        return Ok(fenced);
    }

    let start = cleaned
        .find(['{', '['])
        .ok_or_else(|| InferenceError::MalformedResponse("No JSON object found".into()))?;
    let closing = if cleaned[start..].starts_with('{') { '}' } else { ']' };
    let end = cleaned
        .rfind(closing)
        .filter(|&end| end > start)
        .ok_or_else(|| InferenceError::MalformedResponse("Unclosed JSON object".into()))?;

    Ok(cleaned[start..=end].to_string())
}

fn fenced_block(text: &str) -> Option<String> {
    let fence = text.find("```")?;
    let after_fence = &text[fence + 3..];
    // Skip an info string such as `json`.
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let body_end = body.find("```")?;
    let block = body[..body_end].trim();
    if block.starts_with('{') || block.starts_with('[') {
        Some(block.to_string())
    } else {
        None
    }
}
