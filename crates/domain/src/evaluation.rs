//! Evaluation records and the events that surface their progress.
//!
//! Each newly observed commit gets exactly one [`EvaluationRecord`]
//! (keyed by commit hash). Status only moves forward:
//! queued -> running -> completed | failed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl EvalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-suite tallies inside an evaluation payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteResult {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub error: Option<String>,
}

/// One test inside an evaluation run, as reported by the driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalTestResult {
    /// Suite path the test belongs to, e.g. `torture/part_3`.
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub test_id: String,
    /// `passed`, `failed`, `timeout`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub failure_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stderr_tail: Option<String>,
    #[serde(default)]
    pub stdout_tail: Option<String>,
    /// Test source, when the driver includes it.
    #[serde(default)]
    pub source: Option<String>,
    /// Pre-rendered compiler/runtime diagnostic, when available.
    #[serde(default)]
    pub rendered_diagnostic: Option<String>,
}

impl EvalTestResult {
    pub fn is_passed(&self) -> bool {
        self.status.eq_ignore_ascii_case("passed")
    }

    /// Stable reference string used for feedback and regression diffing.
    pub fn reference(&self) -> String {
        let test_id = if self.test_id.is_empty() {
            "unknown_test"
        } else {
            &self.test_id
        };
        match self.suite.as_deref() {
            Some(suite) if !suite.is_empty() => format!("{suite}/{test_id}"),
            _ => test_id.to_owned(),
        }
    }

    /// Best available failure message: explicit message, then stderr,
    /// then stdout tails.
    pub fn failure_message(&self) -> Option<&str> {
        [&self.message, &self.stderr_tail, &self.stdout_tail]
            .into_iter()
            .find_map(|m| m.as_deref().map(str::trim).filter(|m| !m.is_empty()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Evaluation record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Independent execution of the full test suite against one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub eval_id: String,
    pub commit: String,
    /// Part number that produced the commit.
    pub part: u32,
    #[serde(default)]
    pub trigger_turn: u32,
    pub status: EvalStatus,
    #[serde(default)]
    pub queued_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub suite_results: BTreeMap<String, SuiteResult>,
    #[serde(default)]
    pub tests: Vec<EvalTestResult>,
    /// Raw driver payload, kept for offline inspection.
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EvaluationRecord {
    /// A winner: completed, at least one test, all passing, no error.
    pub fn is_winning(&self) -> bool {
        self.status == EvalStatus::Completed
            && self.total > 0
            && self.passed == self.total
            && !self
                .error
                .as_deref()
                .is_some_and(|e| !e.trim().is_empty())
    }

    /// Completed cleanly but found nothing to run.
    pub fn is_no_tests(&self) -> bool {
        self.status == EvalStatus::Completed && self.total == 0 && self.error.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Eval events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalEventKind {
    /// Out-of-band evaluation of a checkpointed commit.
    CommitAsync,
    /// In-line turn-end evaluation of the working tree.
    TurnEndBlocking,
}

/// A visible emission of evaluation state, attributed to a part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalEvent {
    pub eval_id: String,
    pub kind: EvalEventKind,
    pub trigger_part: u32,
    #[serde(default)]
    pub trigger_turn: u32,
    #[serde(default)]
    pub target_commit: Option<String>,
    #[serde(default)]
    pub queued_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    pub status: EvalStatus,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub suite_results: BTreeMap<String, SuiteResult>,
    #[serde(default)]
    pub tests: Vec<EvalTestResult>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EvalEvent {
    /// Project an evaluation record into its event form.
    pub fn from_record(evaluation: &EvaluationRecord, kind: EvalEventKind) -> Self {
        Self {
            eval_id: evaluation.eval_id.clone(),
            kind,
            trigger_part: evaluation.part,
            trigger_turn: evaluation.trigger_turn,
            target_commit: Some(evaluation.commit.clone()),
            queued_at: evaluation.queued_at.clone(),
            started_at: evaluation.started_at.clone(),
            finished_at: evaluation.completed_at.clone(),
            status: evaluation.status,
            passed: evaluation.passed,
            failed: evaluation.failed,
            total: evaluation.total,
            suite_results: evaluation.suite_results.clone(),
            tests: evaluation.tests.clone(),
            error: evaluation.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(passed: u32, total: u32, error: Option<&str>) -> EvaluationRecord {
        EvaluationRecord {
            eval_id: "e1".into(),
            commit: "abc".into(),
            part: 1,
            trigger_turn: 1,
            status: EvalStatus::Completed,
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            passed,
            failed: total - passed,
            total,
            suite_results: BTreeMap::new(),
            tests: vec![],
            payload: None,
            command: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: error.map(str::to_owned),
        }
    }

    #[test]
    fn all_pass_with_tests_wins() {
        assert!(completed(7, 7, None).is_winning());
    }

    #[test]
    fn zero_total_is_not_a_winner() {
        let eval = completed(0, 0, None);
        assert!(!eval.is_winning());
        assert!(eval.is_no_tests());
    }

    #[test]
    fn error_disqualifies() {
        assert!(!completed(7, 7, Some("session teardown failed")).is_winning());
        // Whitespace-only errors do not count.
        assert!(completed(7, 7, Some("  ")).is_winning());
    }
}
