//! Strict response schemas for each structured inference call.
//!
//! Fields that should be strings are decoded as `serde_json::Value` and pushed
//! through [`coerce_text`], so a model that answers `{"name": ...}` where a
//! string was asked for still yields a typed result. Missing required fields
//! are a malformed response, never a silent default.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::coerce::{coerce_list, coerce_opt, coerce_text};
use super::sanitize::{extract_json_payload, sanitize_llm_output};
use super::InferenceError;
use crate::pipeline::state::{RelevanceVerdict, Task, Verdict};

/// Output of `extract_metadata`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub purpose: String,
    pub possible_use_cases: String,
}

/// Output of `execute_task`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub verdict: Verdict,
    pub evidence_files: Vec<String>,
}

fn decode<T: for<'de> Deserialize<'de>>(response: &str) -> Result<T, InferenceError> {
    let payload = extract_json_payload(response)?;
    Ok(serde_json::from_str(&payload)?)
}

pub fn parse_metadata(response: &str) -> Result<DocumentMetadata, InferenceError> {
    #[derive(Deserialize)]
    struct Raw {
        purpose: Option<Value>,
        #[serde(alias = "use_cases", alias = "usage_notes")]
        possible_use_cases: Option<Value>,
    }

    let raw: Raw = decode(response)?;
    if raw.purpose.is_none() && raw.possible_use_cases.is_none() {
        return Err(InferenceError::MalformedResponse(
            "metadata response has neither purpose nor possible_use_cases".into(),
        ));
    }
    Ok(DocumentMetadata {
        purpose: coerce_opt(raw.purpose.as_ref()),
        possible_use_cases: coerce_opt(raw.possible_use_cases.as_ref()),
    })
}

pub fn parse_tasks(response: &str) -> Result<Vec<Task>, InferenceError> {
    let payload = extract_json_payload(response)?;
    let value: Value = serde_json::from_str(&payload)?;
    let items = match &value {
        Value::Array(_) => Some(&value),
        Value::Object(map) => map.get("tasks"),
        _ => None,
    }
    .ok_or_else(|| InferenceError::MalformedResponse("tasks response has no 'tasks' list".into()))?;

    Ok(coerce_list(Some(items))
        .iter()
        .map(|t| normalize_task(t))
        .filter(|t| !t.is_empty())
        .collect())
}

/// Strip a leading enumeration marker (`1.`, `2)`, `-`, `*`) and surrounding
/// whitespace, leaving the task wording untouched.
pub fn normalize_task(task: &str) -> String {
    static ENUMERATION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?:\d+\s*[.)]|[-*•])\s*").expect("valid regex")
    });
    ENUMERATION_RE.replace(task, "").trim().to_string()
}

pub fn parse_relevance(response: &str) -> Result<RelevanceVerdict, InferenceError> {
    #[derive(Deserialize)]
    struct Raw {
        is_relevant: Value,
        reason: Option<Value>,
    }

    let raw: Raw = decode(response)?;
    let is_relevant = match &raw.is_relevant {
        Value::Bool(b) => *b,
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => true,
            "false" | "no" => false,
            other => {
                return Err(InferenceError::MalformedResponse(format!(
                    "is_relevant is not a boolean: {other}"
                )))
            }
        },
        other => {
            return Err(InferenceError::MalformedResponse(format!(
                "is_relevant is not a boolean: {other}"
            )))
        }
    };
    Ok(RelevanceVerdict {
        is_relevant,
        reason: coerce_opt(raw.reason.as_ref()),
    })
}

/// Document names selected for a task, in the order the model returned them.
pub fn parse_selection(response: &str) -> Result<Vec<String>, InferenceError> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(alias = "documents", alias = "doc_names")]
        docs: Option<Value>,
    }

    let raw: Raw = decode(response)?;
    let docs = raw.docs.ok_or_else(|| {
        InferenceError::MalformedResponse("selection response has no 'docs' list".into())
    })?;
    Ok(coerce_list(Some(&docs)))
}

pub fn parse_execution(response: &str) -> Result<ExecutionOutcome, InferenceError> {
    #[derive(Deserialize)]
    struct Raw {
        output: Option<Value>,
        #[serde(alias = "pass_or_fail", alias = "status")]
        verdict: Option<Value>,
        #[serde(alias = "file_names", alias = "files")]
        evidence_files: Option<Value>,
        file_name: Option<Value>,
    }

    let raw: Raw = decode(response)?;
    let verdict_text = coerce_opt(raw.verdict.as_ref());
    let verdict = Verdict::parse(&verdict_text).ok_or_else(|| {
        InferenceError::MalformedResponse(format!("verdict must be PASS or FAIL, got '{verdict_text}'"))
    })?;

    let mut evidence_files = coerce_list(raw.evidence_files.as_ref());
    for name in coerce_list(raw.file_name.as_ref()) {
        if !evidence_files.contains(&name) {
            evidence_files.push(name);
        }
    }

    Ok(ExecutionOutcome {
        output: coerce_opt(raw.output.as_ref()),
        verdict,
        evidence_files,
    })
}

pub fn parse_report_section(response: &str) -> Result<String, InferenceError> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(alias = "section", alias = "report")]
        output: Value,
    }

    // Models occasionally answer the report in plain prose; accept that too.
    match decode::<Raw>(response) {
        Ok(raw) => Ok(coerce_text(&raw.output)),
        Err(_) => {
            let text = sanitize_llm_output(response);
            if text.is_empty() {
                Err(InferenceError::MalformedResponse("empty report section".into()))
            } else {
                Ok(text)
            }
        }
    }
}
