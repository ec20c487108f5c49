use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{LlmClient, VisionClient};
use super::InferenceError;
use crate::config::AuditorConfig;

/// Ollama HTTP client for local LLM inference.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    /// Create a new OllamaClient pointing at an Ollama instance.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, InferenceError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| InferenceError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    pub fn from_config(config: &AuditorConfig) -> Result<Self, InferenceError> {
        Self::new(&config.ollama_url, config.timeout_secs)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> InferenceError {
        if e.is_connect() {
            InferenceError::OllamaConnection(self.base_url.clone())
        } else if e.is_timeout() {
            InferenceError::HttpClient(format!(
                "Request timed out after {}s",
                self.timeout_secs
            ))
        } else {
            InferenceError::HttpClient(e.to_string())
        }
    }

    fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, InferenceError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(InferenceError::OllamaError {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
    }
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: GenerationOptions,
}

/// Deterministic decoding: audits must not drift between runs more than needed.
#[derive(Serialize)]
struct GenerationOptions {
    temperature: f32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Request body for Ollama /api/chat (vision)
#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaChatMessage<'a>>,
    stream: bool,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct OllamaChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatResponseMessage,
}

#[derive(Deserialize)]
struct OllamaChatResponseMessage {
    content: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

impl LlmClient for OllamaClient {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        system: &str,
        json: bool,
    ) -> Result<String, InferenceError> {
        let body = OllamaGenerateRequest {
            model,
            prompt,
            system,
            stream: false,
            format: json.then_some("json"),
            options: GenerationOptions { temperature: 0.0 },
        };
        let parsed: OllamaGenerateResponse = self.post_json("/api/generate", &body)?;
        Ok(parsed.response)
    }

    fn is_model_available(&self, model: &str) -> Result<bool, InferenceError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }

    fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(InferenceError::OllamaError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

impl VisionClient for OllamaClient {
    fn chat_with_images(
        &self,
        model: &str,
        prompt: &str,
        images: &[String],
        system: Option<&str>,
    ) -> Result<String, InferenceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(OllamaChatMessage {
                role: "system",
                content: system,
                images: None,
            });
        }
        messages.push(OllamaChatMessage {
            role: "user",
            content: prompt,
            images: Some(images),
        });

        let body = OllamaChatRequest {
            model,
            messages,
            stream: false,
            options: GenerationOptions { temperature: 0.0 },
        };
        let parsed: OllamaChatResponse = self.post_json("/api/chat", &body)?;
        Ok(parsed.message.content)
    }
}

type Responder = dyn Fn(&str, &str) -> Result<String, InferenceError> + Send + Sync;

/// One recorded call against [`MockLlmClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub prompt: String,
}

/// Mock LLM client for testing: answers through a closure over
/// `(system, prompt)` and records every call.
pub struct MockLlmClient {
    responder: Box<Responder>,
    available_models: Vec<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    /// Always answer with the same text.
    pub fn new(response: &str) -> Self {
        let response = response.to_string();
        Self::with_responder(move |_, _| Ok(response.clone()))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String, InferenceError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            available_models: vec!["llama3.1:8b".to_string()],
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.available_models = models;
        self
    }

    /// Snapshot of all calls made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(
        &self,
        _model: &str,
        prompt: &str,
        system: &str,
        _json: bool,
    ) -> Result<String, InferenceError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                system: system.to_string(),
                prompt: prompt.to_string(),
            });
        }
        (self.responder)(system, prompt)
    }

    fn is_model_available(&self, model: &str) -> Result<bool, InferenceError> {
        Ok(self.available_models.iter().any(|m| m.starts_with(model)))
    }

    fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        Ok(self.available_models.clone())
    }
}

/// Mock vision client for testing: returns a fixed transcription or error.
pub struct MockVisionClient {
    response: Result<String, String>,
}

impl MockVisionClient {
    pub fn new(response: &str) -> Self {
        Self {
            response: Ok(response.to_string()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: Err(reason.to_string()),
        }
    }
}

impl VisionClient for MockVisionClient {
    fn chat_with_images(
        &self,
        _model: &str,
        _prompt: &str,
        images: &[String],
        _system: Option<&str>,
    ) -> Result<String, InferenceError> {
        if images.is_empty() {
            return Err(InferenceError::MalformedResponse("no image supplied".into()));
        }
        self.response
            .clone()
            .map_err(InferenceError::HttpClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_client_returns_configured_response() {
        let client = MockLlmClient::new("test response");
        let result = client.generate("model", "prompt", "system", true).unwrap();
        assert_eq!(result, "test response");
    }

    #[test]
    fn mock_client_records_calls_in_order() {
        let client = MockLlmClient::new("{}");
        client.generate("m", "first", "sys-a", true).unwrap();
        client.generate("m", "second", "sys-b", false).unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].prompt, "first");
        assert_eq!(calls[1].system, "sys-b");
    }

    #[test]
    fn mock_client_responder_sees_system_prompt() {
        let client = MockLlmClient::with_responder(|system, _| {
            if system.contains("relevance") {
                Ok("yes".into())
            } else {
                Ok("no".into())
            }
        });
        assert_eq!(client.generate("m", "p", "check relevance", true).unwrap(), "yes");
        assert_eq!(client.generate("m", "p", "other", true).unwrap(), "no");
    }

    #[test]
    fn mock_client_lists_models() {
        let client = MockLlmClient::new("").with_models(vec![
            "llama3.1:8b".into(),
            "qwen2.5:14b".into(),
        ]);
        let models = client.list_models().unwrap();
        assert_eq!(models.len(), 2);
        assert!(client.is_model_available("qwen2.5").unwrap());
        assert!(!client.is_model_available("mistral").unwrap());
    }

    #[test]
    fn mock_vision_client_rejects_empty_image_list() {
        let client = MockVisionClient::new("text");
        assert!(client.chat_with_images("m", "p", &[], None).is_err());
        assert_eq!(
            client
                .chat_with_images("m", "p", &["aGVsbG8=".to_string()], None)
                .unwrap(),
            "text"
        );
    }

    #[test]
    fn client_follows_configured_endpoint() {
        let config = AuditorConfig::from_lookup(|key| match key {
            "TASKAUDIT_OLLAMA_URL" => Some("http://gpu-box:11434/".into()),
            "TASKAUDIT_TIMEOUT_SECS" => Some("45".into()),
            _ => None,
        });
        let client = OllamaClient::from_config(&config).unwrap();
        assert_eq!(client.base_url(), "http://gpu-box:11434");
        assert_eq!(client.timeout_secs, 45);
    }

    #[test]
    fn generate_request_serializes_json_format() {
        let body = OllamaGenerateRequest {
            model: "m",
            prompt: "p",
            system: "s",
            stream: false,
            format: Some("json"),
            options: GenerationOptions { temperature: 0.0 },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"format\":\"json\""));
        assert!(json.contains("\"stream\":false"));
    }

    #[test]
    fn generate_request_omits_format_for_free_text() {
        let body = OllamaGenerateRequest {
            model: "m",
            prompt: "p",
            system: "s",
            stream: false,
            format: None,
            options: GenerationOptions { temperature: 0.0 },
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("format"));
    }

    #[test]
    fn unreachable_backend_surfaces_connection_error() {
        // Port 9 (discard) is essentially never serving HTTP.
        let client = OllamaClient::new("http://127.0.0.1:9", 2).unwrap();
        let err = client.generate("m", "p", "s", true).unwrap_err();
        assert!(matches!(
            err,
            InferenceError::OllamaConnection(_) | InferenceError::HttpClient(_)
        ));
    }
}
