//! End-to-end runs through the public API against a scripted LLM.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;

use taskaudit_lib::config::PipelineOptions;
use taskaudit_lib::diagnostic;
use taskaudit_lib::pipeline::inference::prompt::*;
use taskaudit_lib::pipeline::inference::{InferenceError, LlmCapabilities, MockLlmClient};
use taskaudit_lib::pipeline::ingest::DirectoryIngestor;
use taskaudit_lib::pipeline::stages::NO_EVIDENCE_OUTPUT;
use taskaudit_lib::pipeline::{
    open_configured_store, Auditor, CheckpointStore, MemoryCheckpointStore, RunResult, RunSuccess,
    StageName, Verdict,
};

const TASKS: [&str; 2] = ["Check for negative net pay", "Verify overtime hours"];

struct Script {
    relevant: bool,
    fail_execution: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            relevant: true,
            fail_execution: false,
        }
    }
}

fn scripted(script: Script) -> Arc<MockLlmClient> {
    Arc::new(MockLlmClient::with_responder(move |system, prompt| {
        let body = if system == METADATA_SYSTEM_PROMPT {
            json!({"purpose": "Payroll register", "possible_use_cases": "net pay and overtime review"})
        } else if system == TASK_PARSER_SYSTEM_PROMPT {
            json!({"tasks": prompt.lines().collect::<Vec<_>>()})
        } else if system == RELEVANCE_SYSTEM_PROMPT {
            json!({"is_relevant": script.relevant, "reason": "unrelated to payroll"})
        } else if system == SELECTION_SYSTEM_PROMPT {
            let docs: Vec<&str> = ["payroll.csv", "memo.txt"]
                .into_iter()
                .filter(|name| prompt.contains(&format!("File Name: {name}")))
                .take(1)
                .collect();
            json!({"docs": docs})
        } else if system == EXECUTION_SYSTEM_PROMPT {
            if script.fail_execution {
                return Err(InferenceError::OllamaConnection("http://localhost:11434".into()));
            }
            let verdict = if prompt.contains("Row 3,Ben,900,180,-5") { "FAIL" } else { "PASS" };
            json!({"output": "Reviewed rows 1-3", "verdict": verdict, "evidence_files": ["payroll.csv"]})
        } else if system == REFLECTION_SYSTEM_PROMPT {
            return Ok("Task 1 failed: Ben has negative net pay.".to_string());
        } else if system == REPORT_SYSTEM_PROMPT {
            json!({"output": prompt.lines().next().unwrap_or_default()})
        } else {
            return Err(InferenceError::MalformedResponse(format!("unexpected system prompt: {system}")));
        };
        Ok(body.to_string())
    }))
}

fn auditor(mock: &Arc<MockLlmClient>, options: PipelineOptions) -> Auditor {
    let capabilities = LlmCapabilities::new(mock.clone(), "llama3.1:8b");
    Auditor::new(Arc::new(capabilities), Arc::new(DirectoryIngestor::new()), options)
}

fn payroll_dir() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("payroll.csv"),
        "ACME payroll\nEmployee,Gross,Tax,Net\nAna,1000,200,800\nBen,900,180,-5\n",
    )
    .unwrap();
    std::fs::write(tmp.path().join("memo.txt"), "Overtime approved for March.\n").unwrap();
    std::fs::write(tmp.path().join("slides.pptx"), "ignored").unwrap();
    tmp
}

fn tasks() -> Vec<String> {
    TASKS.iter().map(|t| t.to_string()).collect()
}

fn expect_success(result: RunResult) -> RunSuccess {
    match result {
        RunResult::Success(s) => s,
        RunResult::Failure(f) => panic!("run failed: {}", f.error),
    }
}

fn calls_with(mock: &MockLlmClient, system: &str) -> usize {
    mock.calls().iter().filter(|c| c.system == system).count()
}

#[test]
fn full_run_reports_every_task() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let result = expect_success(auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &tasks()));

    assert_eq!(result.documents_processed, 2);
    assert_eq!(result.tasks_count, 2);
    assert_eq!(result.execution_details.len(), 2);
    assert_eq!(result.execution_details[0].task, TASKS[0]);
    assert_eq!(result.execution_details[1].task, TASKS[1]);
    assert!(result
        .execution_details
        .iter()
        .all(|d| d.status == Verdict::Fail && d.evidence_files == vec!["payroll.csv"]));
    assert!(result.relevance.is_relevant);
    assert_eq!(
        result.report,
        "***********\nTask: Check for negative net pay\n***********\n\
         ***********\nTask: Verify overtime hours\n***********\n"
    );
    assert_eq!(calls_with(&mock, METADATA_SYSTEM_PROMPT), 2);
    assert_eq!(calls_with(&mock, RELEVANCE_SYSTEM_PROMPT), 1);
    assert_eq!(calls_with(&mock, REFLECTION_SYSTEM_PROMPT), 0);
}

#[test]
fn task_block_is_numbered_and_parsed_back() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let auditor = auditor(&mock, PipelineOptions::default()).with_checkpoints(store.clone());
    expect_success(auditor.invoke("run-1", dir.path(), &tasks()));

    let parse_call = mock
        .calls()
        .into_iter()
        .find(|c| c.system == TASK_PARSER_SYSTEM_PROMPT)
        .unwrap();
    assert_eq!(parse_call.prompt, "1. Check for negative net pay\n2. Verify overtime hours");

    let state = store.latest("run-1").unwrap().unwrap().state;
    assert_eq!(state.tasks_parsed, TASKS.to_vec());
}

#[test]
fn multi_line_task_runs_as_one_task() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let tasks = vec!["Check net pay\nincluding bonuses".to_string(), TASKS[1].to_string()];
    let result = expect_success(auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &tasks));

    assert_eq!(result.tasks_count, 2);
    assert_eq!(result.execution_details[0].task, "Check net pay including bonuses");
    let parse_call = mock
        .calls()
        .into_iter()
        .find(|c| c.system == TASK_PARSER_SYSTEM_PROMPT)
        .unwrap();
    assert_eq!(parse_call.prompt, "1. Check net pay including bonuses\n2. Verify overtime hours");
}

#[test]
fn execution_prompt_carries_document_content_verbatim() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    expect_success(
        auditor(&mock, PipelineOptions::default())
            .with_checkpoints(store.clone())
            .invoke("run-1", dir.path(), &tasks()),
    );

    let state = store.latest("run-1").unwrap().unwrap().state;
    let payroll = state.document("payroll.csv").unwrap();
    let execution_calls: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|c| c.system == EXECUTION_SYSTEM_PROMPT)
        .collect();
    assert_eq!(execution_calls.len(), 2);
    assert!(execution_calls.iter().all(|c| c.prompt.contains(&payroll.content)));
    assert!(execution_calls.iter().all(|c| !c.prompt.contains("Overtime approved")));
}

#[test]
fn bindings_only_reference_known_documents() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    expect_success(
        auditor(&mock, PipelineOptions::default())
            .with_checkpoints(store.clone())
            .invoke("run-1", dir.path(), &tasks()),
    );

    for checkpoint in store.history("run-1").unwrap() {
        let state = &checkpoint.state;
        for binding in &state.bindings {
            for name in &binding.doc_names {
                assert!(state.document(name).is_some(), "unknown document {name}");
            }
        }
        assert!(state.check_invariants().is_ok());
    }
}

#[test]
fn empty_directory_fails_every_task_for_lack_of_evidence() {
    let dir = tempfile::tempdir().unwrap();
    let mock = scripted(Script::default());
    let result = expect_success(auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &tasks()));

    assert_eq!(result.documents_processed, 0);
    assert_eq!(result.tasks_count, 2);
    assert_eq!(result.execution_details.len(), 2);
    for detail in &result.execution_details {
        assert_eq!(detail.status, Verdict::Fail);
        assert_eq!(detail.output, NO_EVIDENCE_OUTPUT);
        assert!(detail.evidence_files.is_empty());
    }
    assert_eq!(calls_with(&mock, SELECTION_SYSTEM_PROMPT), 0);
    assert_eq!(calls_with(&mock, EXECUTION_SYSTEM_PROMPT), 0);
    assert!(!result.report.is_empty());
}

#[test]
fn relevance_rejection_produces_fixed_report() {
    let dir = payroll_dir();
    let mock = scripted(Script {
        relevant: false,
        ..Default::default()
    });
    let result = expect_success(auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &tasks()));

    assert_eq!(
        result.report,
        "The given tasks are not relevant to SOX and financial standards, because of unrelated to payroll"
    );
    assert!(result.execution_details.is_empty());
    assert!(!result.relevance.is_relevant);
    assert_eq!(calls_with(&mock, SELECTION_SYSTEM_PROMPT), 0);
    assert_eq!(calls_with(&mock, EXECUTION_SYSTEM_PROMPT), 0);
    assert_eq!(calls_with(&mock, REPORT_SYSTEM_PROMPT), 0);
}

#[test]
fn empty_task_list_fails_before_any_stage() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let result = auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &[]);

    match result {
        RunResult::Failure(f) => {
            assert!(f.error.contains("No tasks"));
            assert!(f.execution_time >= 0.0);
        }
        RunResult::Success(_) => panic!("empty task list must fail"),
    }
    assert!(mock.calls().is_empty());
}

#[test]
fn missing_data_path_fails_before_any_stage() {
    let dir = tempfile::tempdir().unwrap();
    let mock = scripted(Script::default());
    let result =
        auditor(&mock, PipelineOptions::default()).invoke("run-1", &dir.path().join("absent"), &tasks());

    assert!(!result.is_success());
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["success"], false);
    assert!(json["error"].as_str().unwrap().contains("does not exist"));
    assert!(mock.calls().is_empty());
}

#[test]
fn repeated_runs_have_identical_counts() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let auditor = auditor(&mock, PipelineOptions::default());

    let first = expect_success(auditor.invoke("run-1", dir.path(), &tasks()));
    let second = expect_success(auditor.invoke("run-2", dir.path(), &tasks()));
    assert_eq!(first.tasks_count, second.tasks_count);
    assert_eq!(first.documents_processed, second.documents_processed);
    assert_eq!(first.execution_details.len(), second.execution_details.len());
}

#[test]
fn inference_failure_is_reported_with_stage_context() {
    let dir = payroll_dir();
    let mock = scripted(Script {
        fail_execution: true,
        ..Default::default()
    });
    let result = auditor(&mock, PipelineOptions::default()).invoke("run-1", dir.path(), &tasks());

    match result {
        RunResult::Failure(f) => {
            assert!(f.error.contains("execution"), "error was: {}", f.error);
            assert!(f.error.contains("Ollama is not running"));
        }
        RunResult::Success(_) => panic!("execution failure must fail the run"),
    }
}

#[test]
fn failed_run_resumes_from_last_checkpoint() {
    let dir = payroll_dir();
    let store = Arc::new(MemoryCheckpointStore::new());

    let failing = scripted(Script {
        fail_execution: true,
        ..Default::default()
    });
    let first = auditor(&failing, PipelineOptions::default())
        .with_checkpoints(store.clone())
        .invoke("run-1", dir.path(), &tasks());
    assert!(!first.is_success());

    let latest = store.latest("run-1").unwrap().unwrap();
    assert_eq!(latest.completed_stage, StageName::Mapping);
    assert_eq!(latest.next_stage, StageName::Execution);

    let healthy = scripted(Script::default());
    let resumed = expect_success(
        auditor(&healthy, PipelineOptions::default())
            .with_checkpoints(store.clone())
            .resume("run-1"),
    );
    assert_eq!(resumed.execution_details.len(), 2);
    assert_eq!(resumed.documents_processed, 2);
    assert_eq!(calls_with(&healthy, METADATA_SYSTEM_PROMPT), 0);
    assert_eq!(calls_with(&healthy, SELECTION_SYSTEM_PROMPT), 0);
    assert_eq!(calls_with(&healthy, EXECUTION_SYSTEM_PROMPT), 2);

    let done = store.latest("run-1").unwrap().unwrap();
    assert_eq!(done.next_stage, StageName::Done);

    let seqs: Vec<u32> = store.history("run-1").unwrap().iter().map(|c| c.seq).collect();
    assert_eq!(seqs, (1..=seqs.len() as u32).collect::<Vec<_>>());

    // A finished run resumes to the same result without further calls.
    let again = expect_success(
        auditor(&healthy, PipelineOptions::default())
            .with_checkpoints(store)
            .resume("run-1"),
    );
    assert_eq!(again.report, resumed.report);
    assert_eq!(calls_with(&healthy, EXECUTION_SYSTEM_PROMPT), 2);
}

#[test]
fn resume_without_checkpoints_fails() {
    let mock = scripted(Script::default());
    let result = auditor(&mock, PipelineOptions::default())
        .with_checkpoints(Arc::new(MemoryCheckpointStore::new()))
        .resume("never-ran");
    assert!(!result.is_success());
}

#[test]
fn unavailable_checkpoint_backend_degrades_to_plain_run() {
    let dir = payroll_dir();
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let store = open_configured_store(Some(&blocker.path().join("checkpoints.db")));
    assert!(store.is_none());

    let mock = scripted(Script::default());
    let auditor = auditor(&mock, PipelineOptions::default());
    assert!(auditor.checkpoints().is_none());
    let result = expect_success(auditor.invoke("run-1", dir.path(), &tasks()));
    assert_eq!(result.tasks_count, 2);
}

/// Store whose writes always fail.
struct BrokenStore;

impl CheckpointStore for BrokenStore {
    fn save(&self, _c: &taskaudit_lib::pipeline::Checkpoint) -> Result<(), taskaudit_lib::pipeline::CheckpointError> {
        Err(taskaudit_lib::pipeline::CheckpointError::LockPoisoned)
    }
    fn latest(&self, _run_id: &str) -> Result<Option<taskaudit_lib::pipeline::Checkpoint>, taskaudit_lib::pipeline::CheckpointError> {
        Err(taskaudit_lib::pipeline::CheckpointError::LockPoisoned)
    }
    fn history(&self, _run_id: &str) -> Result<Vec<taskaudit_lib::pipeline::Checkpoint>, taskaudit_lib::pipeline::CheckpointError> {
        Ok(vec![])
    }
    fn list_runs(&self) -> Result<Vec<taskaudit_lib::pipeline::RunSummary>, taskaudit_lib::pipeline::CheckpointError> {
        Ok(vec![])
    }
}

#[test]
fn failing_checkpoint_writes_do_not_fail_the_run() {
    let dir = payroll_dir();
    let mock = scripted(Script::default());
    let result = auditor(&mock, PipelineOptions::default())
        .with_checkpoints(Arc::new(BrokenStore))
        .invoke("run-1", dir.path(), &tasks());
    assert!(result.is_success());
}

#[test]
fn reflection_loop_retries_failures_until_ceiling() {
    let dir = payroll_dir();
    let retried = Arc::new(AtomicBool::new(false));
    let seen = retried.clone();
    let mock = Arc::new(MockLlmClient::with_responder(move |system, prompt| {
        let body = if system == METADATA_SYSTEM_PROMPT {
            json!({"purpose": "p", "possible_use_cases": "u"})
        } else if system == TASK_PARSER_SYSTEM_PROMPT {
            json!({"tasks": prompt.lines().collect::<Vec<_>>()})
        } else if system == RELEVANCE_SYSTEM_PROMPT {
            json!({"is_relevant": true, "reason": ""})
        } else if system == SELECTION_SYSTEM_PROMPT {
            json!({"docs": ["payroll.csv"]})
        } else if system == EXECUTION_SYSTEM_PROMPT {
            let with_notes = prompt.contains("Reviewer notes from the previous attempt");
            if with_notes {
                seen.store(true, Ordering::SeqCst);
            }
            json!({"output": "o", "verdict": if with_notes { "PASS" } else { "FAIL" }, "evidence_files": []})
        } else if system == REFLECTION_SYSTEM_PROMPT {
            return Ok("Both tasks lacked evidence.".to_string());
        } else {
            json!({"output": "section"})
        };
        Ok(body.to_string())
    }));

    let options = PipelineOptions {
        relevance_gate: true,
        reflection: true,
        max_iterations: 2,
    };
    let result = expect_success(auditor(&mock, options).invoke("run-1", dir.path(), &tasks()));

    assert!(retried.load(Ordering::SeqCst));
    assert_eq!(result.iterations, 2);
    assert_eq!(result.reflection_notes, "Both tasks lacked evidence.");
    assert!(result.execution_details.iter().all(|d| d.status == Verdict::Pass));
    assert_eq!(calls_with(&mock, REFLECTION_SYSTEM_PROMPT), 2);
    // Two first-pass executions, then only the two failures once.
    assert_eq!(calls_with(&mock, EXECUTION_SYSTEM_PROMPT), 4);
}

#[test]
fn unreadable_file_flows_downstream_as_error_marker() {
    let dir = payroll_dir();
    std::fs::write(dir.path().join("scan.pdf"), b"corrupt").unwrap();
    let mock = scripted(Script::default());
    let store = Arc::new(MemoryCheckpointStore::new());
    let result = expect_success(
        auditor(&mock, PipelineOptions::default())
            .with_checkpoints(store.clone())
            .invoke("run-1", dir.path(), &tasks()),
    );

    assert_eq!(result.documents_processed, 3);
    let state = store.latest("run-1").unwrap().unwrap().state;
    assert!(state
        .document("scan.pdf")
        .unwrap()
        .content
        .starts_with("[Error reading file: "));
}

#[test]
fn stage_snapshots_are_dumped_when_configured() {
    let dir = payroll_dir();
    let dumps = tempfile::tempdir().unwrap();
    let mock = scripted(Script::default());
    let auditor = auditor(&mock, PipelineOptions::default()).with_dump_dir(Some(dumps.path().to_path_buf()));
    expect_success(auditor.invoke("run-1", dir.path(), &tasks()));

    let run_dir = diagnostic::dump_dir_for(Some(dumps.path()), "run-1").unwrap();
    assert!(Path::new(&run_dir).join("01-metadata_extraction.json").exists());
    assert!(run_dir.join("06-reporting.json").exists());
}
