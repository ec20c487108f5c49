//! Stage functions over [`AuditState`].
//!
//! Each stage reads the fields written by its predecessors, invokes one
//! inference capability (per item where the stage loops), and commits its own
//! fields. Stages are atomic: on error the caller discards the partially
//! mutated state and never checkpoints it.

use std::time::Instant;

use thiserror::Error;

use super::graph::StageName;
use super::inference::{AuditCapabilities, InferenceError};
use super::ingest::{DocumentIngestor, IngestError};
use super::state::{
    rejection_report, AuditState, Document, TaskDocumentBinding, TaskResult, Verdict,
    EMPTY_REPORT,
};

/// Output recorded for a task that has no bound documents.
pub const NO_EVIDENCE_OUTPUT: &str =
    "No documents were bound to this task, so there is no evidence to complete it.";

/// Delimiter line wrapped around each report section.
pub const REPORT_DELIMITER: &str = "***********\n";

#[derive(Error, Debug)]
pub enum StageError {
    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("{0}")]
    Invalid(String),
}

/// Collaborators shared by every stage of a run.
pub struct StageContext<'a> {
    pub capabilities: &'a dyn AuditCapabilities,
    pub ingestor: &'a dyn DocumentIngestor,
}

/// Run one stage against `state`.
pub fn run_stage(
    stage: StageName,
    ctx: &StageContext<'_>,
    state: &mut AuditState,
) -> Result<(), StageError> {
    match stage {
        StageName::MetadataExtraction => extract_metadata(ctx, state),
        StageName::TaskParsing => parse_tasks(ctx, state),
        StageName::RelevanceCheck => check_relevance(ctx, state),
        StageName::Mapping => map_documents(ctx, state),
        StageName::Execution => execute(ctx, state),
        StageName::Reflection => reflect(ctx, state),
        StageName::Reporting => report(ctx, state),
        StageName::Done => Ok(()),
    }
}

/// Ingest `data_path` and describe every file. Any inference failure is fatal.
pub fn extract_metadata(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let files = ctx.ingestor.ingest(&state.data_path)?;

    let mut documents = Vec::with_capacity(files.len());
    for file in files {
        let start = Instant::now();
        let meta = ctx.capabilities.extract_metadata(&file.name, &file.content)?;
        tracing::debug!(
            file = %file.name,
            elapsed_ms = %start.elapsed().as_millis(),
            "Metadata extracted"
        );
        documents.push(Document {
            name: file.name,
            purpose: meta.purpose,
            usage_notes: meta.possible_use_cases,
            content: file.content,
        });
    }

    tracing::info!(documents = documents.len(), "Documents described");
    state.documents = documents;
    Ok(())
}

pub fn parse_tasks(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let tasks = ctx.capabilities.parse_tasks(&state.tasks_raw)?;
    if tasks.is_empty() {
        return Err(StageError::Invalid(
            "task parsing returned no tasks for a non-empty task block".into(),
        ));
    }
    tracing::info!(tasks = tasks.len(), "Tasks parsed");
    state.tasks_parsed = tasks;
    Ok(())
}

pub fn check_relevance(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let verdict = ctx.capabilities.classify_relevance(&state.tasks_raw)?;
    tracing::info!(
        is_relevant = verdict.is_relevant,
        reason = %verdict.reason,
        "Relevance classified"
    );
    state.relevance = verdict;
    Ok(())
}

/// Bind every parsed task to the documents it needs, in task order.
pub fn map_documents(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let mut bindings = Vec::with_capacity(state.tasks_parsed.len());

    for (task_index, task) in state.tasks_parsed.iter().enumerate() {
        let doc_names = if state.documents.is_empty() {
            Vec::new()
        } else {
            let selected = ctx.capabilities.select_necessary_docs(task, &state.documents)?;
            resolve_names(&selected, &state.documents, task_index)
        };
        tracing::debug!(task_index, docs = ?doc_names, "Task bound");
        bindings.push(TaskDocumentBinding {
            task: task.clone(),
            doc_names,
        });
    }

    state.bindings = bindings;
    Ok(())
}

/// Map model-returned names onto canonical document names. Exact matches win;
/// otherwise a case-insensitive match is accepted. Unknown names are dropped
/// and duplicates collapse to their first occurrence.
fn resolve_names(selected: &[String], documents: &[Document], task_index: usize) -> Vec<String> {
    let mut resolved: Vec<String> = Vec::new();
    for raw in selected {
        let wanted = raw.trim();
        let found = documents
            .iter()
            .find(|d| d.name == wanted)
            .or_else(|| documents.iter().find(|d| d.name.eq_ignore_ascii_case(wanted)));
        match found {
            Some(doc) if !resolved.contains(&doc.name) => resolved.push(doc.name.clone()),
            Some(_) => {}
            None => tracing::warn!(task_index, name = %wanted, "Selected document does not exist, dropping"),
        }
    }
    resolved
}

/// First pass executes every binding. After a reflection round only the
/// failed tasks are re-executed, with the reflection notes attached.
pub fn execute(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let retry = state.iteration_count > 0 && state.results.len() == state.bindings.len();

    if !retry {
        let mut results = Vec::with_capacity(state.bindings.len());
        for (task_index, binding) in state.bindings.iter().enumerate() {
            results.push(execute_binding(ctx, state, task_index, binding, None)?);
        }
        state.results = results;
    } else {
        let notes = Some(state.reflection_notes.as_str()).filter(|n| !n.trim().is_empty());
        let mut replacements = Vec::new();
        for (task_index, binding) in state.bindings.iter().enumerate() {
            if state.results[task_index].verdict == Verdict::Fail {
                replacements.push((task_index, execute_binding(ctx, state, task_index, binding, notes)?));
            }
        }
        tracing::info!(
            iteration = state.iteration_count,
            retried = replacements.len(),
            "Failed tasks re-executed"
        );
        for (task_index, result) in replacements {
            state.results[task_index] = result;
        }
    }

    tracing::info!(
        passed = state.pass_count(),
        failed = state.fail_count(),
        "Execution complete"
    );
    Ok(())
}

fn execute_binding(
    ctx: &StageContext<'_>,
    state: &AuditState,
    task_index: usize,
    binding: &TaskDocumentBinding,
    notes: Option<&str>,
) -> Result<TaskResult, StageError> {
    let documents = state.bound_documents(binding);
    if documents.is_empty() {
        tracing::debug!(task_index, "No bound documents, recording FAIL");
        return Ok(TaskResult {
            task: binding.task.clone(),
            output: NO_EVIDENCE_OUTPUT.to_string(),
            verdict: Verdict::Fail,
            evidence_files: Vec::new(),
        });
    }

    let start = Instant::now();
    let outcome = ctx.capabilities.execute_task(&binding.task, &documents, notes)?;

    let mut evidence_files = Vec::new();
    for name in &outcome.evidence_files {
        match documents.iter().find(|d| d.name.eq_ignore_ascii_case(name.trim())) {
            Some(doc) if !evidence_files.contains(&doc.name) => evidence_files.push(doc.name.clone()),
            Some(_) => {}
            None => tracing::warn!(task_index, name = %name, "Evidence file is not a bound document, dropping"),
        }
    }

    tracing::debug!(
        task_index,
        verdict = %outcome.verdict,
        elapsed_ms = %start.elapsed().as_millis(),
        "Task executed"
    );
    Ok(TaskResult {
        task: binding.task.clone(),
        output: outcome.output,
        verdict: outcome.verdict,
        evidence_files,
    })
}

pub fn reflect(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    let notes = ctx.capabilities.reflect(&state.results)?;
    state.reflection_notes = notes;
    state.iteration_count += 1;
    tracing::info!(
        iteration = state.iteration_count,
        max_iterations = state.max_iterations,
        "Reflection recorded"
    );
    Ok(())
}

/// Terminal stage. Always leaves a non-empty `report`.
pub fn report(ctx: &StageContext<'_>, state: &mut AuditState) -> Result<(), StageError> {
    if !state.relevance.is_relevant {
        state.report = rejection_report(&state.relevance.reason);
        return Ok(());
    }
    if state.results.is_empty() {
        state.report = EMPTY_REPORT.to_string();
        return Ok(());
    }

    let mut report = String::new();
    for result in &state.results {
        let mut section = ctx.capabilities.synthesize_report_section(result)?;
        if !section.ends_with('\n') {
            section.push('\n');
        }
        report.push_str(REPORT_DELIMITER);
        report.push_str(&section);
        report.push_str(REPORT_DELIMITER);
    }
    state.report = report;
    Ok(())
}

/// Post-conditions checked after `stage` commits.
pub fn check_postconditions(stage: StageName, state: &AuditState) -> Result<(), String> {
    state.check_invariants()?;
    match stage {
        StageName::Mapping if state.bindings.len() != state.tasks_parsed.len() => Err(format!(
            "mapping produced {} bindings for {} tasks",
            state.bindings.len(),
            state.tasks_parsed.len()
        )),
        StageName::Execution if state.results.len() != state.bindings.len() => Err(format!(
            "execution produced {} results for {} bindings",
            state.results.len(),
            state.bindings.len()
        )),
        StageName::Reporting if state.report.is_empty() => {
            Err("reporting finished with an empty report".into())
        }
        _ => Ok(()),
    }
}
