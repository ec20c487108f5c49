//! Audit state: the single record threaded through every pipeline stage.
//!
//! ```text
//! ingest → documents → tasks_parsed → bindings → results → report
//! ```
//!
//! Each run owns exactly one `AuditState`. Stages mutate it in place; the
//! checkpoint store persists a serialized copy after every transition.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A free-text audit task. Position in `tasks_parsed` is its identity.
pub type Task = String;

/// Prefix of the fixed report emitted when the relevance gate rejects the task set.
pub const REJECTION_PREFIX: &str =
    "The given tasks are not relevant to SOX and financial standards, because of ";

/// Report body used when execution produced no task results at all.
pub const EMPTY_REPORT: &str = "No audit tasks were executed.\n";

/// One ingested file with its extracted metadata. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub purpose: String,
    /// Possible use cases returned by metadata extraction.
    pub usage_notes: String,
    pub content: String,
}

/// The documents judged necessary to complete one task.
///
/// Documents are referenced by name and resolved against
/// [`AuditState::documents`]; bindings never embed copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDocumentBinding {
    pub task: Task,
    #[serde(rename = "docs")]
    pub doc_names: Vec<String>,
}

/// PASS/FAIL outcome of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    /// Case-insensitive parse; anything other than pass/fail is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" => Some(Self::Pass),
            "FAIL" | "FAILED" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of executing one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task: Task,
    pub output: String,
    pub verdict: Verdict,
    /// Names of the documents the answer relies on (may be empty).
    pub evidence_files: Vec<String>,
}

/// Outcome of the single, global relevance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub is_relevant: bool,
    pub reason: String,
}

impl Default for RelevanceVerdict {
    /// Until the gate runs (or when it is disabled) the task set is relevant.
    fn default() -> Self {
        Self {
            is_relevant: true,
            reason: String::new(),
        }
    }
}

/// Aggregate root for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditState {
    pub data_path: PathBuf,
    pub tasks_raw: String,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub tasks_parsed: Vec<Task>,
    #[serde(default)]
    pub bindings: Vec<TaskDocumentBinding>,
    #[serde(default)]
    pub results: Vec<TaskResult>,
    #[serde(default)]
    pub relevance: RelevanceVerdict,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub reflection_notes: String,
    #[serde(default)]
    pub iteration_count: u32,
    pub max_iterations: u32,
}

impl AuditState {
    pub fn new(data_path: impl Into<PathBuf>, tasks_raw: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            data_path: data_path.into(),
            tasks_raw: tasks_raw.into(),
            documents: Vec::new(),
            tasks_parsed: Vec::new(),
            bindings: Vec::new(),
            results: Vec::new(),
            relevance: RelevanceVerdict::default(),
            report: String::new(),
            reflection_notes: String::new(),
            iteration_count: 0,
            max_iterations,
        }
    }

    /// Look up a canonical document by name.
    pub fn document(&self, name: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.name == name)
    }

    /// Resolve a binding's names to canonical documents, preserving binding order.
    pub fn bound_documents(&self, binding: &TaskDocumentBinding) -> Vec<&Document> {
        binding
            .doc_names
            .iter()
            .filter_map(|name| self.document(name))
            .collect()
    }

    pub fn pass_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.verdict == Verdict::Pass)
            .count()
    }

    pub fn fail_count(&self) -> usize {
        self.results.len() - self.pass_count()
    }

    /// Structural invariants that must hold after every stage.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.iteration_count > self.max_iterations {
            return Err(format!(
                "iteration_count {} exceeds max_iterations {}",
                self.iteration_count, self.max_iterations
            ));
        }
        for binding in &self.bindings {
            if let Some(missing) = binding
                .doc_names
                .iter()
                .find(|name| self.document(name).is_none())
            {
                return Err(format!(
                    "binding for task '{}' references unknown document '{missing}'",
                    binding.task
                ));
            }
        }
        if !self.bindings.is_empty() && self.bindings.len() != self.tasks_parsed.len() {
            return Err(format!(
                "{} bindings for {} parsed tasks",
                self.bindings.len(),
                self.tasks_parsed.len()
            ));
        }
        if !self.results.is_empty() && self.results.len() != self.bindings.len() {
            return Err(format!(
                "{} results for {} bindings",
                self.results.len(),
                self.bindings.len()
            ));
        }
        Ok(())
    }
}

/// Fixed report produced when the relevance gate rejects the task set.
pub fn rejection_report(reason: &str) -> String {
    format!("{REJECTION_PREFIX}{reason}")
}
