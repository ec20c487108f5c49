//! Audit pipeline state machine.
//!
//! ```text
//! metadata_extraction → task_parsing → [relevance_check] → mapping → execution
//!                                            │                         │  ↑
//!                                            │ rejected                ↓  │ iteration_count < max
//!                                            │                      [reflection]
//!                                            ↓                         │
//!                                        reporting ←───────────────────┘
//!                                            ↓
//!                                          done
//! ```
//!
//! Every edge the runner takes must appear in [`TRANSITIONS`]. The only cycle
//! is execution ⇄ reflection, bounded by `AuditState::max_iterations`.

use serde::{Deserialize, Serialize};

use crate::config::PipelineOptions;
use crate::pipeline::state::AuditState;

/// Pipeline positions. `Done` is the terminal marker, not a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    MetadataExtraction,
    TaskParsing,
    RelevanceCheck,
    Mapping,
    Execution,
    Reflection,
    Reporting,
    Done,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataExtraction => "metadata_extraction",
            Self::TaskParsing => "task_parsing",
            Self::RelevanceCheck => "relevance_check",
            Self::Mapping => "mapping",
            Self::Execution => "execution",
            Self::Reflection => "reflection",
            Self::Reporting => "reporting",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata_extraction" => Some(Self::MetadataExtraction),
            "task_parsing" => Some(Self::TaskParsing),
            "relevance_check" => Some(Self::RelevanceCheck),
            "mapping" => Some(Self::Mapping),
            "execution" => Some(Self::Execution),
            "reflection" => Some(Self::Reflection),
            "reporting" => Some(Self::Reporting),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every legal edge `(from, to)`.
pub const TRANSITIONS: &[(StageName, StageName)] = &[
    (StageName::MetadataExtraction, StageName::TaskParsing),
    (StageName::TaskParsing, StageName::RelevanceCheck),
    (StageName::TaskParsing, StageName::Mapping),
    (StageName::RelevanceCheck, StageName::Mapping),
    (StageName::RelevanceCheck, StageName::Reporting),
    (StageName::Mapping, StageName::Execution),
    (StageName::Execution, StageName::Reflection),
    (StageName::Execution, StageName::Reporting),
    (StageName::Reflection, StageName::Execution),
    (StageName::Reflection, StageName::Reporting),
    (StageName::Reporting, StageName::Done),
];

pub fn is_transition(from: StageName, to: StageName) -> bool {
    TRANSITIONS.contains(&(from, to))
}

/// Transition function over [`StageName`], parameterised by the stage toggles.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    options: PipelineOptions,
}

impl PipelineGraph {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }

    pub fn initial(&self) -> StageName {
        StageName::MetadataExtraction
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Position to enter after `completed` has committed its changes to `state`.
    pub fn next(&self, completed: StageName, state: &AuditState) -> StageName {
        match completed {
            StageName::MetadataExtraction => StageName::TaskParsing,
            StageName::TaskParsing if self.options.relevance_gate => StageName::RelevanceCheck,
            StageName::TaskParsing => StageName::Mapping,
            StageName::RelevanceCheck if state.relevance.is_relevant => StageName::Mapping,
            StageName::RelevanceCheck => StageName::Reporting,
            StageName::Mapping => StageName::Execution,
            StageName::Execution if self.should_reflect(state) => StageName::Reflection,
            StageName::Execution => StageName::Reporting,
            StageName::Reflection if state.iteration_count < state.max_iterations => {
                StageName::Execution
            }
            StageName::Reflection => StageName::Reporting,
            StageName::Reporting | StageName::Done => StageName::Done,
        }
    }

    fn should_reflect(&self, state: &AuditState) -> bool {
        self.options.reflection && state.iteration_count < state.max_iterations
    }

    /// Upper bound on stage executions for one run: every acyclic stage once
    /// plus one execution/reflection pair per allowed iteration.
    pub fn max_steps(&self, max_iterations: u32) -> usize {
        6 + 2 * max_iterations as usize
    }
}
