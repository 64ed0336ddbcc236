//! Part stream pipeline: one call per part the agent emits, strictly in
//! emission order, on the coordinator.
//!
//! Numbering, enrichment, test-call tracking, checkpoint triggering,
//! evaluation scheduling, and the post-latch interrupt all happen here.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use ec_domain::{EnvoiCall, PartKind, PartPayload, PartRecord, Result};
use ec_domain::part::{token_estimate, word_count};
use ec_sandbox::Sandbox;
use ec_store::{LogSink, SharedTrajectory, TraceStore};

use crate::checkpoint::checkpoint_workspace;
use crate::evaluator::EvaluationScheduler;
use crate::latch::WinnerLatch;
use crate::tracker::SolveTracker;

/// Tool name under which agents surface test RPC invocations.
pub const ENVOI_TOOL_NAME: &str = "run_tests";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PartStreamPipeline {
    sandbox: Arc<dyn Sandbox>,
    trace: SharedTrajectory,
    store: Arc<TraceStore>,
    sink: LogSink,
    evaluator: Arc<EvaluationScheduler>,
    latch: Arc<WinnerLatch>,
    tracker: SolveTracker,
    interrupt_patterns: Vec<String>,
    session_id: String,
    agent_model: String,
    part_count: u32,
    latest_commit: Option<String>,
    last_part_timestamp_ms: Option<i64>,
}

impl PartStreamPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        trace: SharedTrajectory,
        store: Arc<TraceStore>,
        sink: LogSink,
        evaluator: Arc<EvaluationScheduler>,
        latch: Arc<WinnerLatch>,
        tracker: SolveTracker,
        interrupt_patterns: Vec<String>,
        session_id: String,
        agent_model: String,
        part_count: u32,
        latest_commit: Option<String>,
    ) -> Self {
        Self {
            sandbox,
            trace,
            store,
            sink,
            evaluator,
            latch,
            tracker,
            interrupt_patterns,
            session_id,
            agent_model,
            part_count,
            latest_commit,
            last_part_timestamp_ms: None,
        }
    }

    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    pub fn latest_commit(&self) -> Option<&str> {
        self.latest_commit.as_deref()
    }

    pub fn tracker(&self) -> &SolveTracker {
        &self.tracker
    }

    /// Rehydrate the tracker from prior parts' calls (resume path).
    pub fn seed_tracker(&mut self, calls: &[EnvoiCall]) {
        self.tracker.update(calls);
    }

    pub fn set_session_id(&mut self, session_id: String) {
        self.session_id = session_id;
    }

    /// Ingest one streamed part. Returns the allocated part number.
    pub async fn ingest(&mut self, payload: PartPayload, turn: u32) -> Result<u32> {
        let part_no = self.part_count + 1;
        let mut record = self.build_record(part_no, &payload);

        // Test RPC calls observed inside tool parts feed the tracker.
        if payload.kind == PartKind::Tool
            && payload.tool_name.as_deref() == Some(ENVOI_TOOL_NAME)
        {
            let calls = decode_envoi_calls(payload.tool_output.as_ref());
            if !calls.is_empty() {
                self.tracker.update(&calls);
                record.envoi_calls = calls;
                record.testing_state = Some(self.tracker.snapshot());
            }
        }

        // File changes trigger a checkpoint; a genuinely new commit
        // gets queued for evaluation.
        if !payload.files.is_empty() {
            let checkpoint = checkpoint_workspace(
                self.sandbox.as_ref(),
                part_no,
                &payload.files,
                self.latest_commit.as_deref(),
            )
            .await;

            let commit_after = checkpoint.commit_after.clone();
            let is_new_commit = commit_after.is_some()
                && checkpoint.commit_before != checkpoint.commit_after;

            record.git_commit = commit_after.clone().or_else(|| self.latest_commit.clone());
            record.repo_checkpoint = Some(checkpoint);

            if let Some(commit) = commit_after {
                self.latest_commit = Some(commit.clone());
                if is_new_commit {
                    self.evaluator.schedule(&commit, part_no, turn).await;
                }
            }
        } else {
            record.git_commit = self.latest_commit.clone();
        }

        {
            let mut guard = self.trace.lock();
            if let Some(turn_record) = guard.turns.iter_mut().find(|t| t.turn == turn) {
                turn_record.part_start =
                    Some(turn_record.part_start.unwrap_or(part_no).min(part_no));
                turn_record.part_end =
                    Some(turn_record.part_end.unwrap_or(part_no).max(part_no));
                if record.git_commit.is_some() {
                    turn_record.git_commit = record.git_commit.clone();
                }
                turn_record.session_id = self.session_id.clone();
            }
            guard.parts.push(record);
        }

        self.part_count = part_no;
        self.last_part_timestamp_ms = payload.timestamp_ms;
        self.sink.bind_context(None, None, Some(turn), Some(part_no));

        if let Err(e) = self.store.save(&self.trace).await {
            self.sink.warn(
                "stream",
                "trace.save_failed",
                format!("snapshot save failed: {e}"),
                Value::Null,
            );
        }

        // A latched winner means every further part is doomed to be
        // trimmed; tell the in-sandbox client to stop.
        if let Some(latch_part) = self.latch.get() {
            if part_no >= latch_part {
                send_client_interrupt(
                    Arc::clone(&self.sandbox),
                    self.interrupt_patterns.clone(),
                    self.sink.clone(),
                );
            }
        }

        Ok(part_no)
    }

    fn build_record(&self, part_no: u32, payload: &PartPayload) -> PartRecord {
        let duration_ms = payload.duration_ms.or_else(|| {
            match (self.last_part_timestamp_ms, payload.timestamp_ms) {
                (Some(prev), Some(now)) if now >= prev => Some(now - prev),
                _ => None,
            }
        });

        PartRecord {
            part: part_no,
            session_id: self.session_id.clone(),
            agent_model: self.agent_model.clone(),
            timestamp: Utc::now().to_rfc3339(),
            role: payload.role.clone(),
            kind: payload.kind,
            summary: payload.summary.clone(),
            content: payload.content.clone(),
            files: payload.files.clone(),
            patch: payload.patch.clone(),
            duration_ms,
            summary_word_count: payload.summary.as_deref().map(word_count),
            content_word_count: payload.content.as_deref().map(word_count),
            summary_token_estimate: payload.summary.as_deref().map(token_estimate),
            content_token_estimate: payload.content.as_deref().map(token_estimate),
            tool_name: payload.tool_name.clone(),
            tool_status: payload.tool_status.clone(),
            tool_input: payload.tool_input.clone().map(|mut v| {
                redact_secrets(&mut v);
                v
            }),
            tool_output: payload.tool_output.clone(),
            tool_error: payload.tool_error.clone(),
            tool_exit_code: payload.tool_exit_code,
            token_usage: payload.token_usage.clone(),
            git_commit: None,
            repo_checkpoint: None,
            testing_state: None,
            envoi_calls: Vec::new(),
            eval_events_delta: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode test-call records from a tool part's output. The output is
/// either a JSON object or a string containing one.
pub fn decode_envoi_calls(output: Option<&Value>) -> Vec<EnvoiCall> {
    let Some(output) = output else {
        return Vec::new();
    };
    let value: Option<Value> = match output {
        Value::String(raw) => serde_json::from_str(raw).ok(),
        other => Some(other.clone()),
    };
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        Some(obj @ Value::Object(_)) => serde_json::from_value::<EnvoiCall>(obj)
            .map(|call| vec![call])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

const SECRET_KEY_MARKERS: &[&str] = &[
    "key",
    "token",
    "secret",
    "password",
    "credential",
    "authorization",
];

/// Replace secret-like values in a tool input with a placeholder.
pub fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if SECRET_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                    *entry = Value::String("[redacted]".to_owned());
                } else {
                    redact_secrets(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

/// Best-effort SIGTERM of the agent's in-sandbox client processes.
/// Fire-and-forget; failure is logged and never blocks the caller.
pub fn send_client_interrupt(
    sandbox: Arc<dyn Sandbox>,
    patterns: Vec<String>,
    sink: LogSink,
) {
    if patterns.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let command = patterns
            .iter()
            .map(|p| format!("pkill -f {} > /dev/null 2>&1 || true", crate::envoi::sh_quote(p)))
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(e) = sandbox.run_simple(&command, 10).await {
            sink.warn(
                "stream",
                "winner.interrupt_failed",
                format!("winner interrupt failed: {e}"),
                Value::Null,
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redaction_hits_nested_secretish_keys() {
        let mut input = json!({
            "api_key": "sk-123",
            "nested": {"Authorization": "Bearer x", "path": "/workspace/a.c"},
            "args": [{"password": "hunter2"}],
        });
        redact_secrets(&mut input);
        assert_eq!(input["api_key"], "[redacted]");
        assert_eq!(input["nested"]["Authorization"], "[redacted]");
        assert_eq!(input["nested"]["path"], "/workspace/a.c");
        assert_eq!(input["args"][0]["password"], "[redacted]");
    }

    #[test]
    fn envoi_calls_decode_from_string_or_object() {
        let call = json!({
            "path": "basics",
            "timestamp": "t1",
            "duration_ms": 9,
            "status_code": 200,
            "result": {"passed": 3, "failed": 0, "total": 3}
        });

        let from_obj = decode_envoi_calls(Some(&call));
        assert_eq!(from_obj.len(), 1);
        assert!(from_obj[0].is_full_pass());

        let as_string = Value::String(call.to_string());
        let from_str = decode_envoi_calls(Some(&as_string));
        assert_eq!(from_str.len(), 1);
        assert_eq!(from_str[0].path, "basics");

        assert!(decode_envoi_calls(Some(&json!("not json"))).is_empty());
        assert!(decode_envoi_calls(None).is_empty());
    }
}
