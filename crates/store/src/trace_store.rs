//! Trace snapshot persistence: save after every semantic state change,
//! load to resume a prior run.
//!
//! Saves serialize through an async lock so snapshots reach the blob
//! store in the order they were built; the latest write for the key
//! wins.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use ec_domain::{
    Artifacts, EvalEventKind, EvaluationRecord, Result, SessionEnd, StopReason, Trajectory,
    TurnRecord,
};

use crate::blob::{trajectory_key, BlobStore};
use crate::codec::{decode_trace_rows, encode_trace_rows};
use crate::rows::{row_to_part, trajectory_to_rows, TraceRow};

/// The trajectory tree shared between the coordinator, the part
/// pipeline, and evaluation workers.
pub type SharedTrajectory = Arc<Mutex<Trajectory>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TraceStore {
    blobs: Arc<dyn BlobStore>,
    trajectory_id: String,
    environment: String,
    task_params: Value,
    suites: Mutex<Value>,
    bundle_uri: Mutex<Option<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl TraceStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        trajectory_id: impl Into<String>,
        environment: impl Into<String>,
        task_params: Value,
    ) -> Self {
        Self {
            blobs,
            trajectory_id: trajectory_id.into(),
            environment: environment.into(),
            task_params,
            suites: Mutex::new(Value::Null),
            bundle_uri: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn trace_uri(&self) -> String {
        self.blobs.uri(&trajectory_key(&self.trajectory_id, "trace.parquet"))
    }

    /// Record the discovered suite layout, denormalized into every row.
    pub fn set_suites(&self, suites: Value) {
        *self.suites.lock() = suites;
    }

    /// Record the bundle URI once the finalizer exported it.
    pub fn set_bundle_uri(&self, uri: String) {
        *self.bundle_uri.lock() = Some(uri);
    }

    /// Write the current trajectory state as a full snapshot.
    pub async fn save(&self, trace: &SharedTrajectory) -> Result<String> {
        let _writer = self.write_lock.lock().await;
        let rows = {
            let guard = trace.lock();
            let suites = self.suites.lock().clone();
            let bundle_uri = self.bundle_uri.lock().clone();
            trajectory_to_rows(
                &guard,
                &self.environment,
                &self.task_params,
                &suites,
                bundle_uri.as_deref(),
            )
        };
        let bytes = encode_trace_rows(&rows)?;
        self.blobs
            .put(&trajectory_key(&self.trajectory_id, "trace.parquet"), bytes)
            .await
    }

    /// Load the latest snapshot for a trajectory id, rebuilding the
    /// trajectory tree. `None` when no snapshot exists.
    pub async fn load(
        blobs: &dyn BlobStore,
        trajectory_id: &str,
    ) -> Result<Option<Trajectory>> {
        let key = trajectory_key(trajectory_id, "trace.parquet");
        let Some(bytes) = blobs.get(&key).await? else {
            return Ok(None);
        };
        let rows = decode_trace_rows(bytes)?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rebuild_trajectory(trajectory_id, &rows)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Snapshot rebuild
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild a [`Trajectory`] from decoded snapshot rows.
///
/// Rows arrive sorted by part. Turn windows come back from the
/// denormalized turn columns; evaluations are replayed from the
/// commit_async eval events in part order, latest status winning.
fn rebuild_trajectory(trajectory_id: &str, rows: &[TraceRow]) -> Trajectory {
    let first = &rows[0];
    let last = &rows[rows.len() - 1];

    let mut trace = Trajectory::new(
        trajectory_id.to_owned(),
        first.session_id.clone().unwrap_or_default(),
        first.agent.clone().unwrap_or_default(),
        first.agent_model.clone().unwrap_or_default(),
        first.started_at.clone().unwrap_or_default(),
    );

    // Parts, in part order.
    trace.parts = rows.iter().map(row_to_part).collect();

    // Turn windows, grouped by the denormalized turn column.
    let mut turns: BTreeMap<u32, TurnRecord> = BTreeMap::new();
    for row in rows {
        let Some(turn_no) = row.turn.filter(|t| *t > 0) else {
            continue;
        };
        let turn_no = turn_no as u32;
        let part = row.part.max(0) as u32;
        let entry = turns.entry(turn_no).or_insert_with(|| TurnRecord {
            turn: turn_no,
            session_id: row.session_id.clone().unwrap_or_default(),
            timestamp: row.timestamp.clone().unwrap_or_default(),
            prompt: String::new(),
            part_start: Some(part),
            part_end: Some(part),
            git_commit: None,
            feedback_eval_id: None,
            token_usage: None,
        });
        entry.part_start = Some(entry.part_start.unwrap_or(part).min(part));
        entry.part_end = Some(entry.part_end.unwrap_or(part).max(part));
        if let Some(prompt) = &row.turn_user_message {
            entry.prompt = prompt.clone();
        }
        if row.turn_feedback_eval_id.is_some() {
            entry.feedback_eval_id = row.turn_feedback_eval_id.clone();
        }
        if row.git_commit.is_some() {
            entry.git_commit = row.git_commit.clone();
        }
    }
    trace.turns = turns.into_values().collect();

    // Evaluations replayed from commit_async events, in part order.
    for part in &trace.parts {
        for event in &part.eval_events_delta {
            if event.kind != EvalEventKind::CommitAsync {
                continue;
            }
            let Some(commit) = event.target_commit.clone() else {
                continue;
            };
            let record = EvaluationRecord {
                eval_id: event.eval_id.clone(),
                commit: commit.clone(),
                part: event.trigger_part,
                trigger_turn: event.trigger_turn,
                status: event.status,
                queued_at: event.queued_at.clone(),
                started_at: event.started_at.clone(),
                completed_at: event.finished_at.clone(),
                duration_ms: None,
                passed: event.passed,
                failed: event.failed,
                total: event.total,
                suite_results: event.suite_results.clone(),
                tests: event.tests.clone(),
                payload: None,
                command: None,
                exit_code: None,
                stdout: None,
                stderr: None,
                error: event.error.clone(),
            };
            trace.evaluations.insert(commit, record);
        }
    }

    // Session end and artifacts from the last row.
    if let Some(reason) = last.session_end_reason.as_deref() {
        let reason = match reason {
            "solved" => Some(StopReason::Solved),
            "part_limit" => Some(StopReason::PartLimit),
            "timeout" => Some(StopReason::Timeout),
            "agent_error" => Some(StopReason::AgentError),
            "envoi_error" => Some(StopReason::EnvoiError),
            _ => None,
        };
        if let Some(reason) = reason {
            trace.session_end = Some(SessionEnd {
                reason,
                total_parts: last.session_end_total_parts.unwrap_or(0).max(0) as u32,
                total_turns: last.session_end_total_turns.unwrap_or(0).max(0) as u32,
                final_git_commit: last.session_end_final_commit.clone(),
            });
        }
    }
    if let Some(artifacts) = last
        .artifacts
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Artifacts>(raw).ok())
    {
        trace.artifacts = Some(artifacts);
    }

    trace
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use ec_domain::{EvalEvent, EvalStatus, PartKind, PartRecord};

    fn part(n: u32, commit: Option<&str>) -> PartRecord {
        PartRecord {
            part: n,
            session_id: "sess-1".into(),
            agent_model: "model-x".into(),
            timestamp: format!("2026-01-01T00:00:0{n}Z"),
            role: "assistant".into(),
            kind: PartKind::Text,
            summary: Some(format!("part {n}")),
            content: None,
            files: vec![],
            patch: None,
            duration_ms: None,
            summary_word_count: Some(2),
            content_word_count: None,
            summary_token_estimate: Some(2),
            content_token_estimate: None,
            tool_name: None,
            tool_status: None,
            tool_input: None,
            tool_output: None,
            tool_error: None,
            tool_exit_code: None,
            token_usage: None,
            git_commit: commit.map(str::to_owned),
            repo_checkpoint: None,
            testing_state: None,
            envoi_calls: vec![],
            eval_events_delta: vec![],
        }
    }

    fn sample_trajectory() -> Trajectory {
        let mut trace = Trajectory::new(
            "traj-1".into(),
            "sess-1".into(),
            "codex".into(),
            "model-x".into(),
            "2026-01-01T00:00:00Z".into(),
        );
        trace.parts = vec![part(1, None), part(2, Some("aaa"))];
        trace.turns = vec![TurnRecord {
            turn: 1,
            session_id: "sess-1".into(),
            timestamp: "2026-01-01T00:00:00Z".into(),
            prompt: "solve it".into(),
            part_start: Some(1),
            part_end: Some(2),
            git_commit: Some("aaa".into()),
            feedback_eval_id: None,
            token_usage: None,
        }];

        let mut evaluation = EvaluationRecord {
            eval_id: "eval-1".into(),
            commit: "aaa".into(),
            part: 2,
            trigger_turn: 1,
            status: EvalStatus::Completed,
            queued_at: Some("q".into()),
            started_at: Some("s".into()),
            completed_at: Some("c".into()),
            duration_ms: Some(10),
            passed: 7,
            failed: 0,
            total: 7,
            suite_results: Default::default(),
            tests: vec![],
            payload: None,
            command: None,
            exit_code: Some(0),
            stdout: None,
            stderr: None,
            error: None,
        };
        trace.parts[1]
            .eval_events_delta
            .push(EvalEvent::from_record(&evaluation, EvalEventKind::CommitAsync));
        evaluation.status = EvalStatus::Completed;
        trace.evaluations.insert("aaa".into(), evaluation);
        trace
    }

    #[tokio::test]
    async fn save_then_load_restores_structure() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = TraceStore::new(
            blobs.clone(),
            "traj-1",
            "c_compiler",
            serde_json::json!({"lang": "en"}),
        );
        let trace: SharedTrajectory = Arc::new(Mutex::new(sample_trajectory()));

        store.save(&trace).await.unwrap();

        let loaded = TraceStore::load(blobs.as_ref(), "traj-1")
            .await
            .unwrap()
            .expect("snapshot present");

        assert_eq!(loaded.trajectory_id, "traj-1");
        assert_eq!(loaded.agent, "codex");
        assert_eq!(loaded.started_at, "2026-01-01T00:00:00Z");
        assert_eq!(loaded.last_part(), 2);
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.turns[0].prompt, "solve it");
        assert_eq!(loaded.turns[0].part_start, Some(1));
        assert_eq!(loaded.turns[0].part_end, Some(2));

        let evaluation = loaded.evaluations.get("aaa").expect("evaluation rebuilt");
        assert_eq!(evaluation.status, EvalStatus::Completed);
        assert_eq!(evaluation.passed, 7);
        assert!(evaluation.is_winning());
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let blobs = MemoryBlobStore::new();
        assert!(TraceStore::load(&blobs, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_snapshot_wins() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = TraceStore::new(blobs.clone(), "traj-1", "env", Value::Null);
        let trace: SharedTrajectory = Arc::new(Mutex::new(sample_trajectory()));

        store.save(&trace).await.unwrap();
        trace.lock().parts.push(part(3, None));
        store.save(&trace).await.unwrap();

        let loaded = TraceStore::load(blobs.as_ref(), "traj-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_part(), 3);
    }
}
