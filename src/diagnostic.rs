//! Pipeline diagnostic dump: writes intermediate artifacts to disk.
//!
//! Enabled only when a dump directory is configured (`TASKAUDIT_DUMP_DIR`).
//!
//! **Output structure**:
//! ```text
//! {dump_dir}/
//!   {run_id}/
//!     01-metadata_extraction.json
//!     02-task_parsing.json
//!     ...
//!   calls/
//!     20260101T120000.123-3f2a9c1e-parse_tasks.txt
//! ```
//!
//! Every writer logs failures and returns; nothing here can fail a run.

use std::path::{Path, PathBuf};

use uuid::Uuid;

const CALLS_SUBDIR: &str = "calls";

fn ensure_dir(dir: PathBuf) -> Option<PathBuf> {
    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "Diagnostic dump: failed to create directory"
        );
        return None;
    }
    Some(dir)
}

/// Returns the dump directory for a run, or `None` if diagnostics are disabled.
pub fn dump_dir_for(base: Option<&Path>, run_id: &str) -> Option<PathBuf> {
    ensure_dir(base?.join(sanitize_component(run_id)))
}

/// Directory for raw inference call transcripts.
pub fn calls_dir(base: Option<&Path>) -> Option<PathBuf> {
    ensure_dir(base?.join(CALLS_SUBDIR))
}

/// Unique, time-sortable file name for one inference call.
pub fn call_file_name(capability: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let id = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}-{capability}.txt", &id[..8])
}

/// Run ids come from callers; keep them from escaping the dump directory.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Snapshot any serializable value as pretty JSON.
pub fn dump_json<T: serde::Serialize>(dir: &Path, filename: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => write_artifact(dir, filename, &json),
        Err(e) => tracing::warn!(
            file = filename,
            error = %e,
            "Dump skipped: state not serializable"
        ),
    }
}

/// Record a prompt/response transcript verbatim.
pub fn dump_text(dir: &Path, filename: &str, text: &str) {
    write_artifact(dir, filename, text);
}

fn write_artifact(dir: &Path, filename: &str, body: &str) {
    let target = dir.join(filename);
    if let Err(e) = std::fs::write(&target, body) {
        tracing::warn!(path = %target.display(), error = %e, "Dump write failed");
        return;
    }
    tracing::debug!(path = %target.display(), bytes = body.len(), "Dump written");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AuditState;

    #[test]
    fn disabled_without_base_dir() {
        assert!(dump_dir_for(None, "run-1").is_none());
        assert!(calls_dir(None).is_none());
    }

    #[test]
    fn run_dir_is_created_under_base() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = dump_dir_for(Some(base.path()), "audit-2024").unwrap();
        assert!(run_dir.is_dir());
        assert_eq!(run_dir, base.path().join("audit-2024"));
    }

    #[test]
    fn calls_dir_sits_beside_run_dirs() {
        let base = tempfile::tempdir().unwrap();
        let calls = calls_dir(Some(base.path())).unwrap();
        assert_eq!(calls, base.path().join("calls"));
        assert!(calls.is_dir());
    }

    #[test]
    fn run_id_cannot_escape_base_dir() {
        let base = tempfile::tempdir().unwrap();
        let dir = dump_dir_for(Some(base.path()), "../../etc").unwrap();
        assert!(dir.starts_with(base.path()));
        assert!(dir.ends_with("______etc"));
        assert_eq!(sanitize_component(""), "_");
    }

    #[test]
    fn call_file_names_are_unique() {
        let a = call_file_name("reflect");
        let b = call_file_name("reflect");
        assert_ne!(a, b);
        assert!(a.ends_with("-reflect.txt"));
    }

    #[test]
    fn state_snapshot_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = AuditState::new("/data/payroll", "1. Check net pay", 3);
        state.iteration_count = 2;

        dump_json(dir.path(), "03-relevance_check.json", &state);

        let raw = std::fs::read_to_string(dir.path().join("03-relevance_check.json")).unwrap();
        let back: AuditState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tasks_raw, "1. Check net pay");
        assert_eq!(back.iteration_count, 2);
    }

    #[test]
    fn transcript_is_written_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = "=== system ===\nYou audit.\n=== response ===\n{\"verdict\": \"PASS\"}";
        dump_text(dir.path(), "call.txt", transcript);
        let content = std::fs::read_to_string(dir.path().join("call.txt")).unwrap();
        assert_eq!(content, transcript);
    }

    #[test]
    fn unwritable_target_is_only_logged() {
        let missing = Path::new("/nonexistent/taskaudit-dump");
        dump_json(missing, "01-metadata_extraction.json", &AuditState::new("/data", "1. t", 1));
        dump_text(missing, "call.txt", "prompt");
    }
}
