//! Flat trace rows: one row per part, trajectory-level columns
//! denormalized onto every row, nested objects JSON-encoded.
//!
//! Denormalization is wasteful but makes any snapshot self-contained:
//! a single row carries enough context to interpret the part without
//! joining other artifacts.

use std::collections::HashMap;

use serde_json::Value;

use ec_domain::{PartRecord, Trajectory, TurnRecord};

pub const TRACE_SCHEMA_VERSION: &str = "envoi.trace.v2";

/// One parquet row of the trace snapshot.
#[derive(Debug, Clone, Default)]
pub struct TraceRow {
    pub trajectory_id: String,
    pub session_id: Option<String>,
    pub agent: Option<String>,
    pub agent_model: Option<String>,
    pub started_at: Option<String>,
    pub trace_schema_version: String,
    pub environment: Option<String>,
    pub task_params: Option<String>,
    pub part: i32,
    pub timestamp: Option<String>,
    pub role: Option<String>,
    pub part_type: Option<String>,
    pub summary: Option<String>,
    pub duration_ms: Option<i64>,
    pub git_commit: Option<String>,
    pub files: Option<String>,
    pub content: Option<String>,
    pub summary_word_count: Option<i32>,
    pub content_word_count: Option<i32>,
    pub summary_token_estimate: Option<i32>,
    pub content_token_estimate: Option<i32>,
    pub tool_name: Option<String>,
    pub tool_status: Option<String>,
    pub tool_input: Option<String>,
    pub tool_output: Option<String>,
    pub tool_error: Option<String>,
    pub tool_exit_code: Option<i32>,
    pub token_usage: Option<String>,
    pub patch: Option<String>,
    pub envoi_calls: Option<String>,
    pub testing_state: Option<String>,
    pub repo_checkpoint: Option<String>,
    pub turn: Option<i32>,
    pub turn_user_message: Option<String>,
    pub turn_feedback_eval_id: Option<String>,
    pub eval_events_delta: Option<String>,
    pub session_end_reason: Option<String>,
    pub session_end_total_parts: Option<i32>,
    pub session_end_total_turns: Option<i32>,
    pub session_end_final_commit: Option<String>,
    pub suites: Option<String>,
    pub artifacts: Option<String>,
    pub bundle_uri: Option<String>,
}

/// Compact-JSON encode a serializable value, `None` for nothing.
pub fn json_or_none<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn json_if_nonempty<T: serde::Serialize>(items: &[T]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        serde_json::to_string(items).ok()
    }
}

/// Map each part number to the turn window that contains it.
fn build_turn_map(turns: &[TurnRecord]) -> HashMap<u32, &TurnRecord> {
    let mut mapping = HashMap::new();
    for turn in turns {
        if let (Some(start), Some(end)) = (turn.part_start, turn.part_end) {
            for part in start..=end {
                mapping.insert(part, turn);
            }
        }
    }
    mapping
}

/// Convert a trajectory to flat rows for parquet serialization.
///
/// Rows are produced in part order. The turn's prompt and feedback
/// pointer appear only on the turn's first part row.
pub fn trajectory_to_rows(
    trace: &Trajectory,
    environment: &str,
    task_params: &Value,
    suites: &Value,
    bundle_uri: Option<&str>,
) -> Vec<TraceRow> {
    let turn_map = build_turn_map(&trace.turns);

    let end = trace.session_end.as_ref();
    let task_params_json = json_or_none(task_params);
    let suites_json = json_or_none(suites);
    let artifacts_json = trace.artifacts.as_ref().and_then(json_or_none);

    let mut rows: Vec<TraceRow> = trace
        .parts
        .iter()
        .map(|part| {
            let turn = turn_map.get(&part.part).copied();
            let is_turn_start = turn.and_then(|t| t.part_start) == Some(part.part);
            TraceRow {
                trajectory_id: trace.trajectory_id.clone(),
                session_id: Some(part.session_id.clone()),
                agent: Some(trace.agent.clone()),
                agent_model: Some(part.agent_model.clone()),
                started_at: Some(trace.started_at.clone()),
                trace_schema_version: TRACE_SCHEMA_VERSION.to_owned(),
                environment: Some(environment.to_owned()),
                task_params: task_params_json.clone(),
                part: part.part as i32,
                timestamp: Some(part.timestamp.clone()),
                role: Some(part.role.clone()),
                part_type: Some(part.kind.as_str().to_owned()),
                summary: part.summary.clone(),
                duration_ms: part.duration_ms,
                git_commit: part.git_commit.clone(),
                files: json_if_nonempty(&part.files),
                content: part.content.clone(),
                summary_word_count: part.summary_word_count.map(|v| v as i32),
                content_word_count: part.content_word_count.map(|v| v as i32),
                summary_token_estimate: part.summary_token_estimate.map(|v| v as i32),
                content_token_estimate: part.content_token_estimate.map(|v| v as i32),
                tool_name: part.tool_name.clone(),
                tool_status: part.tool_status.clone(),
                tool_input: part.tool_input.as_ref().and_then(json_or_none),
                tool_output: part.tool_output.as_ref().and_then(json_or_none),
                tool_error: part.tool_error.clone(),
                tool_exit_code: part.tool_exit_code,
                token_usage: part.token_usage.as_ref().and_then(json_or_none),
                patch: part.patch.clone(),
                envoi_calls: json_if_nonempty(&part.envoi_calls),
                testing_state: part.testing_state.as_ref().and_then(json_or_none),
                repo_checkpoint: part.repo_checkpoint.as_ref().and_then(json_or_none),
                turn: turn.map(|t| t.turn as i32),
                turn_user_message: if is_turn_start {
                    turn.map(|t| t.prompt.clone())
                } else {
                    None
                },
                turn_feedback_eval_id: if is_turn_start {
                    turn.and_then(|t| t.feedback_eval_id.clone())
                } else {
                    None
                },
                eval_events_delta: json_if_nonempty(&part.eval_events_delta),
                session_end_reason: end.map(|e| e.reason.as_str().to_owned()),
                session_end_total_parts: end.map(|e| e.total_parts as i32),
                session_end_total_turns: end.map(|e| e.total_turns as i32),
                session_end_final_commit: end.and_then(|e| e.final_git_commit.clone()),
                suites: suites_json.clone(),
                artifacts: artifacts_json.clone(),
                bundle_uri: bundle_uri.map(str::to_owned),
            }
        })
        .collect();

    rows.sort_by_key(|row| row.part);
    rows
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &Option<String>) -> Option<T> {
    raw.as_deref().and_then(|s| serde_json::from_str(s).ok())
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &Option<String>) -> Vec<T> {
    parse_json(raw).unwrap_or_default()
}

/// Rebuild a [`PartRecord`] from a decoded row.
pub fn row_to_part(row: &TraceRow) -> PartRecord {
    PartRecord {
        part: row.part.max(0) as u32,
        session_id: row.session_id.clone().unwrap_or_default(),
        agent_model: row.agent_model.clone().unwrap_or_default(),
        timestamp: row.timestamp.clone().unwrap_or_default(),
        role: row.role.clone().unwrap_or_default(),
        kind: match row.part_type.as_deref() {
            Some("reasoning") => ec_domain::PartKind::Reasoning,
            Some("tool") => ec_domain::PartKind::Tool,
            Some("patch") => ec_domain::PartKind::Patch,
            _ => ec_domain::PartKind::Text,
        },
        summary: row.summary.clone(),
        content: row.content.clone(),
        files: parse_json_list(&row.files),
        patch: row.patch.clone(),
        duration_ms: row.duration_ms,
        summary_word_count: row.summary_word_count.map(|v| v.max(0) as u32),
        content_word_count: row.content_word_count.map(|v| v.max(0) as u32),
        summary_token_estimate: row.summary_token_estimate.map(|v| v.max(0) as u32),
        content_token_estimate: row.content_token_estimate.map(|v| v.max(0) as u32),
        tool_name: row.tool_name.clone(),
        tool_status: row.tool_status.clone(),
        tool_input: parse_json(&row.tool_input),
        tool_output: parse_json(&row.tool_output),
        tool_error: row.tool_error.clone(),
        tool_exit_code: row.tool_exit_code,
        token_usage: parse_json(&row.token_usage),
        git_commit: row.git_commit.clone(),
        repo_checkpoint: parse_json(&row.repo_checkpoint),
        testing_state: parse_json(&row.testing_state),
        envoi_calls: parse_json_list(&row.envoi_calls),
        eval_events_delta: parse_json_list(&row.eval_events_delta),
    }
}
