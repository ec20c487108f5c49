//! Checkpoint store: durable `AuditState` snapshots keyed by run id.
//!
//! One row is appended per stage transition; the row with the highest `seq`
//! for a run is its current position. Rows are never updated in place.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::graph::StageName;
use super::state::AuditState;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Unknown stage name in checkpoint: {0}")]
    UnknownStage(String),

    #[error("Invalid timestamp in checkpoint: {0}")]
    InvalidTimestamp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint store lock poisoned")]
    LockPoisoned,
}

/// Snapshot taken after `completed_stage` committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub seq: u32,
    pub completed_stage: StageName,
    /// Position to re-enter on resume.
    pub next_stage: StageName,
    pub state: AuditState,
    pub saved_at: DateTime<Utc>,
}

/// Per-run summary for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub checkpoints: u32,
    pub next_stage: StageName,
    pub updated_at: DateTime<Utc>,
}

pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All checkpoints of a run, oldest first.
    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Most recently updated runs first.
    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL DEFAULT (datetime('now'))
         );
         CREATE TABLE IF NOT EXISTS checkpoints (
             run_id TEXT NOT NULL,
             seq INTEGER NOT NULL,
             completed_stage TEXT NOT NULL,
             next_stage TEXT NOT NULL,
             state_json TEXT NOT NULL,
             saved_at TEXT NOT NULL,
             PRIMARY KEY (run_id, seq)
         );
         INSERT INTO schema_version (version) VALUES (1);",
    ),
    (
        2,
        "CREATE INDEX IF NOT EXISTS idx_checkpoints_saved_at ON checkpoints (saved_at);
         INSERT INTO schema_version (version) VALUES (2);",
    ),
];

/// SQLite-backed store. The connection is shared behind a mutex, so concurrent
/// runs may use one store.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CheckpointError>,
    ) -> Result<T, CheckpointError> {
        let conn = self.conn.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        f(&conn)
    }
}

/// Run all pending migrations.
fn run_migrations(conn: &Connection) -> Result<(), CheckpointError> {
    let current_version = current_schema_version(conn);
    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            tracing::info!("Running checkpoint migration v{version}");
            conn.execute_batch(sql)
                .map_err(|e| CheckpointError::MigrationFailed {
                    version: *version,
                    reason: e.to_string(),
                })?;
        }
    }
    Ok(())
}

/// Current schema version (0 if no schema exists yet).
fn current_schema_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
    .unwrap_or(0)
}

type CheckpointRow = (String, u32, String, String, String, String);

fn row_to_checkpoint(row: CheckpointRow) -> Result<Checkpoint, CheckpointError> {
    let (run_id, seq, completed, next, state_json, saved_at) = row;
    Ok(Checkpoint {
        run_id,
        seq,
        completed_stage: parse_stage(&completed)?,
        next_stage: parse_stage(&next)?,
        state: serde_json::from_str(&state_json)?,
        saved_at: parse_timestamp(&saved_at)?,
    })
}

fn parse_stage(s: &str) -> Result<StageName, CheckpointError> {
    StageName::parse(s).ok_or_else(|| CheckpointError::UnknownStage(s.to_string()))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CheckpointError::InvalidTimestamp(format!("{s}: {e}")))
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

const SELECT_COLUMNS: &str =
    "SELECT run_id, seq, completed_stage, next_stage, state_json, saved_at FROM checkpoints";

impl CheckpointStore for SqliteCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let state_json = serde_json::to_string(&checkpoint.state)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (run_id, seq, completed_stage, next_stage, state_json, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.run_id,
                    checkpoint.seq,
                    checkpoint.completed_stage.as_str(),
                    checkpoint.next_stage.as_str(),
                    state_json,
                    checkpoint.saved_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1"),
                    params![run_id],
                    read_row,
                )
                .optional()?)
        })?;
        row.map(row_to_checkpoint).transpose()
    }

    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE run_id = ?1 ORDER BY seq ASC"))?;
            let rows = stmt
                .query_map(params![run_id], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(row_to_checkpoint).collect()
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.run_id, counts.n, c.next_stage, c.saved_at
                 FROM checkpoints c
                 JOIN (SELECT run_id, MAX(seq) AS max_seq, COUNT(*) AS n
                       FROM checkpoints GROUP BY run_id) counts
                   ON counts.run_id = c.run_id AND counts.max_seq = c.seq
                 ORDER BY c.saved_at DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(run_id, checkpoints, next, saved_at)| {
                Ok(RunSummary {
                    run_id,
                    checkpoints,
                    next_stage: parse_stage(&next)?,
                    updated_at: parse_timestamp(&saved_at)?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        runs.entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        Ok(runs
            .get(run_id)
            .and_then(|history| history.iter().max_by_key(|c| c.seq))
            .cloned())
    }

    fn history(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        let mut history = runs.get(run_id).cloned().unwrap_or_default();
        history.sort_by_key(|c| c.seq);
        Ok(history)
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let runs = self.runs.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .filter_map(|(run_id, history)| {
                let last = history.iter().max_by_key(|c| c.seq)?;
                Some(RunSummary {
                    run_id: run_id.clone(),
                    checkpoints: history.len() as u32,
                    next_stage: last.next_stage,
                    updated_at: last.saved_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

/// Open the configured SQLite store. A missing path or an unusable database
/// yields `None` with a warning; the run then proceeds without persistence.
pub fn open_configured_store(path: Option<&Path>) -> Option<Arc<dyn CheckpointStore>> {
    let path = path?;
    match SqliteCheckpointStore::open(path) {
        Ok(store) => {
            tracing::info!(path = %path.display(), "Checkpoint store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Checkpoint store unavailable, running without persistence"
            );
            None
        }
    }
}
