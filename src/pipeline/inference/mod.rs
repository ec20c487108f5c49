//! Inference capability boundary.
//!
//! Every natural-language step of the audit (metadata, task parsing, relevance,
//! document selection, execution, reflection, report synthesis) goes through
//! [`AuditCapabilities`]. The production implementation drives an
//! [`LlmClient`] (Ollama over HTTP); tests substitute mock clients.
//!
//! Responses are untrusted text. They are sanitized, decoded into strict
//! schemas, and coerced to plain strings here, so nothing untyped flows into
//! the pipeline state.

pub mod types;
pub mod ollama;
pub mod sanitize;
pub mod coerce;
pub mod schema;
pub mod prompt;
pub mod capabilities;

pub use types::*;
pub use ollama::*;
pub use sanitize::*;
pub use coerce::*;
pub use capabilities::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Ollama is not running at {0}")]
    OllamaConnection(String),

    #[error("Ollama returned error (status {status}): {body}")]
    OllamaError { status: u16, body: String },

    #[error("Model not available on the inference backend: {0}")]
    NoModelAvailable(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Malformed model response: {0}")]
    MalformedResponse(String),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),
}

impl From<serde_json::Error> for InferenceError {
    fn from(e: serde_json::Error) -> Self {
        InferenceError::JsonParsing(e.to_string())
    }
}
