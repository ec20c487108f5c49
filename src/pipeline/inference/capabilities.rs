use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::prompt::*;
use super::sanitize::sanitize_llm_output;
use super::schema::{self, DocumentMetadata, ExecutionOutcome};
use super::types::LlmClient;
use super::InferenceError;
use crate::diagnostic;
use crate::pipeline::state::{Document, RelevanceVerdict, Task, TaskResult};

/// The opaque reasoning steps the audit pipeline delegates to a model.
///
/// Each method has a fixed input/output contract; implementations decide how
/// to obtain the answer. Errors are fatal to the calling stage.
pub trait AuditCapabilities: Send + Sync {
    /// Describe one ingested file.
    fn extract_metadata(&self, name: &str, content: &str) -> Result<DocumentMetadata, InferenceError>;

    /// Split a raw task block into tasks without rewording them.
    fn parse_tasks(&self, raw: &str) -> Result<Vec<Task>, InferenceError>;

    /// Decide once whether the whole task block is in-domain.
    fn classify_relevance(&self, raw: &str) -> Result<RelevanceVerdict, InferenceError>;

    /// Names of the documents strictly necessary to complete `task`.
    fn select_necessary_docs(&self, task: &str, documents: &[Document]) -> Result<Vec<String>, InferenceError>;

    /// Execute `task` against its bound documents only.
    fn execute_task(
        &self,
        task: &str,
        documents: &[&Document],
        reflection_notes: Option<&str>,
    ) -> Result<ExecutionOutcome, InferenceError>;

    /// Free-text notes identifying unsuccessful tasks.
    fn reflect(&self, results: &[TaskResult]) -> Result<String, InferenceError>;

    /// One report section for one task result.
    fn synthesize_report_section(&self, result: &TaskResult) -> Result<String, InferenceError>;
}

/// Production capabilities backed by an [`LlmClient`] in JSON mode.
pub struct LlmCapabilities {
    llm: Arc<dyn LlmClient>,
    model: String,
    dump_dir: Option<PathBuf>,
}

impl LlmCapabilities {
    pub fn new(llm: Arc<dyn LlmClient>, model: &str) -> Self {
        Self {
            llm,
            model: model.to_string(),
            dump_dir: None,
        }
    }

    /// Write every prompt/response pair under `dir/calls/`.
    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    fn call(
        &self,
        capability: &'static str,
        system: &str,
        prompt: &str,
        json: bool,
    ) -> Result<String, InferenceError> {
        let start = Instant::now();
        let result = self.llm.generate(&self.model, prompt, system, json);

        match &result {
            Ok(response) => tracing::debug!(
                capability,
                model = %self.model,
                prompt_len = prompt.len(),
                response_len = response.len(),
                elapsed_ms = %start.elapsed().as_millis(),
                "Inference call complete"
            ),
            Err(e) => tracing::warn!(
                capability,
                model = %self.model,
                elapsed_ms = %start.elapsed().as_millis(),
                error = %e,
                "Inference call failed"
            ),
        }

        if let Some(dir) = diagnostic::calls_dir(self.dump_dir.as_deref()) {
            let body = match &result {
                Ok(r) => format!("## system\n{system}\n\n## prompt\n{prompt}\n\n## response\n{r}\n"),
                Err(e) => format!("## system\n{system}\n\n## prompt\n{prompt}\n\n## error\n{e}\n"),
            };
            diagnostic::dump_text(&dir, &diagnostic::call_file_name(capability), &body);
        }

        result
    }
}

impl AuditCapabilities for LlmCapabilities {
    fn extract_metadata(&self, name: &str, content: &str) -> Result<DocumentMetadata, InferenceError> {
        let response = self.call(
            "extract_metadata",
            METADATA_SYSTEM_PROMPT,
            &build_metadata_prompt(name, content),
            true,
        )?;
        schema::parse_metadata(&response)
    }

    fn parse_tasks(&self, raw: &str) -> Result<Vec<Task>, InferenceError> {
        let response = self.call("parse_tasks", TASK_PARSER_SYSTEM_PROMPT, raw, true)?;
        schema::parse_tasks(&response)
    }

    fn classify_relevance(&self, raw: &str) -> Result<RelevanceVerdict, InferenceError> {
        let response = self.call("classify_relevance", RELEVANCE_SYSTEM_PROMPT, raw, true)?;
        schema::parse_relevance(&response)
    }

    fn select_necessary_docs(&self, task: &str, documents: &[Document]) -> Result<Vec<String>, InferenceError> {
        let response = self.call(
            "select_necessary_docs",
            SELECTION_SYSTEM_PROMPT,
            &build_selection_prompt(task, documents),
            true,
        )?;
        schema::parse_selection(&response)
    }

    fn execute_task(
        &self,
        task: &str,
        documents: &[&Document],
        reflection_notes: Option<&str>,
    ) -> Result<ExecutionOutcome, InferenceError> {
        let response = self.call(
            "execute_task",
            EXECUTION_SYSTEM_PROMPT,
            &build_execution_prompt(task, documents, reflection_notes),
            true,
        )?;
        schema::parse_execution(&response)
    }

    fn reflect(&self, results: &[TaskResult]) -> Result<String, InferenceError> {
        let response = self.call(
            "reflect",
            REFLECTION_SYSTEM_PROMPT,
            &build_reflection_prompt(results),
            false,
        )?;
        Ok(sanitize_llm_output(&response))
    }

    fn synthesize_report_section(&self, result: &TaskResult) -> Result<String, InferenceError> {
        let response = self.call(
            "synthesize_report_section",
            REPORT_SYSTEM_PROMPT,
            &build_report_prompt(result),
            true,
        )?;
        schema::parse_report_section(&response)
    }
}
