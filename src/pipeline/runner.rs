//! Run driver: input validation, the stage loop, checkpointing and result shaping.
//!
//! This is the single place where an [`AuditError`] becomes the caller-facing
//! `{success: false, error, execution_time}` payload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use super::checkpoint::{open_configured_store, Checkpoint, CheckpointError, CheckpointStore};
use super::graph::{is_transition, PipelineGraph, StageName};
use super::inference::{
    AuditCapabilities, InferenceError, LlmCapabilities, LlmClient, OllamaClient, VisionClient,
};
use super::ingest::{DirectoryIngestor, DocumentIngestor};
use super::stages::{check_postconditions, run_stage, StageContext, StageError};
use super::state::{AuditState, RelevanceVerdict, Task, Verdict};
use crate::config::{AuditorConfig, PipelineOptions};
use crate::diagnostic;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Data path does not exist: {0}")]
    DataPathMissing(PathBuf),

    #[error("Data path is not a directory: {0}")]
    DataPathNotDirectory(PathBuf),

    #[error("No tasks provided")]
    NoTasks,

    #[error("Run id must not be empty")]
    EmptyRunId,

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: StageName,
        #[source]
        source: StageError,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("No checkpoint found for run {0}")]
    NothingToResume(String),

    #[error("Pipeline invariant violated after {stage}: {reason}")]
    InvariantViolated { stage: StageName, reason: String },
}

/// One executed task as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionDetail {
    pub task: Task,
    pub output: String,
    pub status: Verdict,
    pub evidence_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSuccess {
    pub success: bool,
    pub run_id: String,
    pub report: String,
    pub execution_details: Vec<ExecutionDetail>,
    pub documents_processed: usize,
    pub tasks_count: usize,
    pub execution_time: f64,
    pub relevance: RelevanceVerdict,
    pub reflection_notes: String,
    pub iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub success: bool,
    pub run_id: String,
    pub error: String,
    pub execution_time: f64,
}

/// Caller-facing outcome of a run. Serializes to the flat success or
/// failure shape, distinguished by the `success` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunResult {
    Success(RunSuccess),
    Failure(RunFailure),
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn execution_time(&self) -> f64 {
        match self {
            Self::Success(s) => s.execution_time,
            Self::Failure(f) => f.execution_time,
        }
    }

    fn from_state(run_id: &str, state: &AuditState, execution_time: f64) -> Self {
        Self::Success(RunSuccess {
            success: true,
            run_id: run_id.to_string(),
            report: state.report.clone(),
            execution_details: state
                .results
                .iter()
                .map(|r| ExecutionDetail {
                    task: r.task.clone(),
                    output: r.output.clone(),
                    status: r.verdict,
                    evidence_files: r.evidence_files.clone(),
                })
                .collect(),
            documents_processed: state.documents.len(),
            tasks_count: state.tasks_parsed.len(),
            execution_time,
            relevance: state.relevance.clone(),
            reflection_notes: state.reflection_notes.clone(),
            iterations: state.iteration_count,
        })
    }

    fn from_error(run_id: &str, error: &AuditError, execution_time: f64) -> Self {
        Self::Failure(RunFailure {
            success: false,
            run_id: run_id.to_string(),
            error: error.to_string(),
            execution_time,
        })
    }
}

/// Drives audit runs. Holds no per-run state; one instance can serve many
/// runs, each with its own `AuditState`.
pub struct Auditor {
    capabilities: Arc<dyn AuditCapabilities>,
    ingestor: Arc<dyn DocumentIngestor>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    graph: PipelineGraph,
    dump_dir: Option<PathBuf>,
}

impl Auditor {
    pub fn new(
        capabilities: Arc<dyn AuditCapabilities>,
        ingestor: Arc<dyn DocumentIngestor>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            capabilities,
            ingestor,
            checkpoints: None,
            graph: PipelineGraph::new(options),
            dump_dir: None,
        }
    }

    /// Production wiring: Ollama-backed capabilities and vision, filesystem
    /// ingestion, and the configured checkpoint database when reachable.
    pub fn from_config(config: &AuditorConfig) -> Result<Self, InferenceError> {
        let client = Arc::new(OllamaClient::from_config(config)?);
        Self::from_clients(config, client.clone(), client)
    }

    /// Wire an auditor over explicit backends after confirming the configured
    /// models exist. The text model is required; without the vision model,
    /// image files are recorded with an error marker.
    pub fn from_clients(
        config: &AuditorConfig,
        llm: Arc<dyn LlmClient>,
        vision: Arc<dyn VisionClient>,
    ) -> Result<Self, InferenceError> {
        if !llm.is_model_available(&config.model)? {
            return Err(InferenceError::NoModelAvailable(config.model.clone()));
        }
        tracing::info!(model = %config.model, "Audit model confirmed");

        let ingestor = if llm.is_model_available(&config.vision_model)? {
            DirectoryIngestor::new().with_vision(vision, &config.vision_model)
        } else {
            tracing::warn!(
                model = %config.vision_model,
                "Vision model not available, image files will not be transcribed"
            );
            DirectoryIngestor::new().with_missing_vision_model(&config.vision_model)
        };
        let capabilities = LlmCapabilities::new(llm, &config.model)
            .with_dump_dir(config.dump_dir.clone());

        let mut auditor = Self::new(
            Arc::new(capabilities),
            Arc::new(ingestor),
            config.pipeline.clone(),
        )
        .with_dump_dir(config.dump_dir.clone());
        auditor.checkpoints = open_configured_store(config.checkpoint_db.as_deref());
        Ok(auditor)
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_dump_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dump_dir = dir;
        self
    }

    pub fn checkpoints(&self) -> Option<&dyn CheckpointStore> {
        self.checkpoints.as_deref()
    }

    /// Run the whole pipeline for `tasks` over the files under `data_path`.
    pub fn invoke(&self, run_id: &str, data_path: &Path, tasks: &[String]) -> RunResult {
        let start = Instant::now();
        match self.try_invoke(run_id, data_path, tasks) {
            Ok(state) => RunResult::from_state(run_id, &state, start.elapsed().as_secs_f64()),
            Err(e) => {
                tracing::error!(run_id, error = %e, "Audit run failed");
                RunResult::from_error(run_id, &e, start.elapsed().as_secs_f64())
            }
        }
    }

    /// Continue a run from its latest checkpoint.
    pub fn resume(&self, run_id: &str) -> RunResult {
        let start = Instant::now();
        match self.try_resume(run_id) {
            Ok(state) => RunResult::from_state(run_id, &state, start.elapsed().as_secs_f64()),
            Err(e) => {
                tracing::error!(run_id, error = %e, "Audit resume failed");
                RunResult::from_error(run_id, &e, start.elapsed().as_secs_f64())
            }
        }
    }

    pub fn try_invoke(
        &self,
        run_id: &str,
        data_path: &Path,
        tasks: &[String],
    ) -> Result<AuditState, AuditError> {
        let tasks_raw = validate_inputs(run_id, data_path, tasks)?;
        tracing::info!(
            run_id,
            data_path = %data_path.display(),
            tasks = tasks_raw.lines().count(),
            "Starting audit run"
        );

        let state = AuditState::new(data_path, tasks_raw, self.graph.options().max_iterations);
        let seq = self.latest_checkpoint(run_id).map(|c| c.seq).unwrap_or(0);
        self.drive(run_id, state, self.graph.initial(), seq)
    }

    pub fn try_resume(&self, run_id: &str) -> Result<AuditState, AuditError> {
        let store = self
            .checkpoints
            .as_deref()
            .ok_or_else(|| AuditError::NothingToResume(run_id.to_string()))?;
        let checkpoint = store
            .latest(run_id)?
            .ok_or_else(|| AuditError::NothingToResume(run_id.to_string()))?;

        tracing::info!(
            run_id,
            seq = checkpoint.seq,
            next_stage = %checkpoint.next_stage,
            "Resuming audit run"
        );
        self.drive(run_id, checkpoint.state, checkpoint.next_stage, checkpoint.seq)
    }

    /// Latest checkpoint, treating an unreadable store as empty.
    fn latest_checkpoint(&self, run_id: &str) -> Option<Checkpoint> {
        let store = self.checkpoints.as_deref()?;
        match store.latest(run_id) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(run_id, error = %e, "Could not read checkpoints");
                None
            }
        }
    }

    fn drive(
        &self,
        run_id: &str,
        mut state: AuditState,
        start: StageName,
        mut seq: u32,
    ) -> Result<AuditState, AuditError> {
        let _run_span = tracing::info_span!("audit_run", run_id = %run_id).entered();
        let ctx = StageContext {
            capabilities: self.capabilities.as_ref(),
            ingestor: self.ingestor.as_ref(),
        };
        let dump_dir = diagnostic::dump_dir_for(self.dump_dir.as_deref(), run_id);
        let max_steps = self.graph.max_steps(state.max_iterations);

        let mut stage = start;
        let mut steps = 0usize;
        while stage != StageName::Done {
            steps += 1;
            if steps > max_steps {
                return Err(AuditError::InvariantViolated {
                    stage,
                    reason: format!("exceeded {max_steps} stage executions"),
                });
            }

            let _stage_span = tracing::info_span!("stage", stage = %stage).entered();
            let stage_start = Instant::now();

            // Stages are atomic: work on a copy and commit only on success.
            let mut next_state = state.clone();
            run_stage(stage, &ctx, &mut next_state)
                .map_err(|source| AuditError::Stage { stage, source })?;
            check_postconditions(stage, &next_state)
                .map_err(|reason| AuditError::InvariantViolated { stage, reason })?;
            state = next_state;

            let next = self.graph.next(stage, &state);
            if !is_transition(stage, next) {
                return Err(AuditError::InvariantViolated {
                    stage,
                    reason: format!("no transition {stage} -> {next}"),
                });
            }

            seq += 1;
            tracing::info!(
                seq,
                next_stage = %next,
                elapsed_ms = %stage_start.elapsed().as_millis(),
                "Stage complete"
            );
            self.persist(run_id, seq, stage, next, &state);
            if let Some(dir) = &dump_dir {
                diagnostic::dump_json(dir, &format!("{seq:02}-{stage}.json"), &state);
            }

            stage = next;
        }

        tracing::info!(
            documents = state.documents.len(),
            tasks = state.tasks_parsed.len(),
            passed = state.pass_count(),
            failed = state.fail_count(),
            "Audit run complete"
        );
        Ok(state)
    }

    /// Save a checkpoint. Failures are logged and the run continues.
    fn persist(
        &self,
        run_id: &str,
        seq: u32,
        completed: StageName,
        next: StageName,
        state: &AuditState,
    ) {
        let Some(store) = self.checkpoints.as_deref() else {
            return;
        };
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            seq,
            completed_stage: completed,
            next_stage: next,
            state: state.clone(),
            saved_at: chrono::Utc::now(),
        };
        if let Err(e) = store.save(&checkpoint) {
            tracing::warn!(run_id, seq, error = %e, "Checkpoint save failed, continuing without it");
        }
    }
}

/// Validate the run inputs and render the task list as a numbered block.
fn validate_inputs(run_id: &str, data_path: &Path, tasks: &[String]) -> Result<String, AuditError> {
    if run_id.trim().is_empty() {
        return Err(AuditError::EmptyRunId);
    }
    if !data_path.exists() {
        return Err(AuditError::DataPathMissing(data_path.to_path_buf()));
    }
    if !data_path.is_dir() {
        return Err(AuditError::DataPathNotDirectory(data_path.to_path_buf()));
    }

    let tasks: Vec<String> = tasks
        .iter()
        .map(|t| single_line(t))
        .filter(|t| !t.is_empty())
        .collect();
    if tasks.is_empty() {
        return Err(AuditError::NoTasks);
    }

    Ok(tasks
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. {t}", i + 1))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Join the lines of a task with single spaces so the numbered block keeps
/// one task per line.
fn single_line(task: &str) -> String {
    task.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
