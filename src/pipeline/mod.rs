pub mod state;
pub mod inference; // Ollama-backed reasoning capabilities
pub mod ingest; // Directory walk + per-format converters
pub mod stages;
pub mod graph; // Stage transition table
pub mod checkpoint; // Durable per-run snapshots (SQLite)
pub mod runner;

pub use state::*;
pub use graph::{PipelineGraph, StageName};
pub use checkpoint::{
    open_configured_store, Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore,
    RunSummary, SqliteCheckpointStore,
};
pub use runner::{AuditError, Auditor, ExecutionDetail, RunFailure, RunResult, RunSuccess};
