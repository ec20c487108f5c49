use super::InferenceError;

/// Text-generation backend abstraction (allows mocking).
pub trait LlmClient: Send + Sync {
    /// Single-turn generation. When `json` is set the backend is asked to
    /// constrain its output to a JSON document.
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        json: bool,
    ) -> Result<String, InferenceError>;

    fn is_model_available(&self, model: &str) -> Result<bool, InferenceError>;

    fn list_models(&self) -> Result<Vec<String>, InferenceError>;
}

/// Vision backend abstraction used by the image converter.
pub trait VisionClient: Send + Sync {
    /// Chat-style request carrying base64-encoded images.
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, InferenceError>;
}
