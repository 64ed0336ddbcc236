//! Shared domain types for the trajectory orchestrator.
//!
//! Everything that crosses a crate boundary lives here: part and turn
//! records, evaluation state, the trajectory tree, the envoi test RPC
//! shapes, the error enum, and the environment-driven configuration.

pub mod config;
pub mod envoi;
pub mod error;
pub mod evaluation;
pub mod part;
pub mod trajectory;
pub mod turn;

pub use config::{ConfigIssue, ConfigSeverity, OrchestratorConfig};
pub use envoi::{EnvoiCall, TestCase, TestOutcome, TestingState};
pub use error::{Error, Result};
pub use evaluation::{
    EvalEvent, EvalEventKind, EvalStatus, EvalTestResult, EvaluationRecord, SuiteResult,
};
pub use part::{PartKind, PartPayload, PartRecord, RepoCheckpoint, TokenUsage};
pub use trajectory::{Artifacts, SessionEnd, StopReason, Trajectory};
pub use turn::TurnRecord;
