//! Part records: the smallest agent-produced event unit.
//!
//! The agent adapter streams one [`PartPayload`] per emitted part; the
//! part pipeline enriches each payload into a [`PartRecord`] before it
//! is appended to the trajectory.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envoi::{EnvoiCall, TestingState};
use crate::evaluation::EvalEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Part kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The kind of event a part carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartKind {
    /// A chunk of model reasoning.
    Reasoning,
    /// A chunk of assistant text.
    Text,
    /// A tool invocation with its result.
    Tool,
    /// A file patch applied to the workspace.
    Patch,
}

impl PartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Text => "text",
            Self::Tool => "tool",
            Self::Patch => "patch",
        }
    }
}

impl std::fmt::Display for PartKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Token usage attributed to a part or a whole turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The wire shape an agent emits once per part, in order, during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartPayload {
    pub kind: PartKind,
    pub role: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Workspace-relative paths this part changed.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_status: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_output: Option<Value>,
    #[serde(default)]
    pub tool_error: Option<String>,
    #[serde(default)]
    pub tool_exit_code: Option<i32>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repo checkpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recorded when a part that changed files yielded a new git commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoCheckpoint {
    pub commit_before: Option<String>,
    pub commit_after: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub message: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Part record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully enriched part as persisted in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    /// Part number, dense and strictly increasing from 1.
    pub part: u32,
    pub session_id: String,
    pub agent_model: String,
    /// RFC 3339 timestamp of ingestion.
    pub timestamp: String,
    pub role: String,
    pub kind: PartKind,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub patch: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub summary_word_count: Option<u32>,
    #[serde(default)]
    pub content_word_count: Option<u32>,
    #[serde(default)]
    pub summary_token_estimate: Option<u32>,
    #[serde(default)]
    pub content_token_estimate: Option<u32>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_status: Option<String>,
    /// Tool input with secret-like keys redacted.
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_output: Option<Value>,
    #[serde(default)]
    pub tool_error: Option<String>,
    #[serde(default)]
    pub tool_exit_code: Option<i32>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    /// Workspace HEAD after checkpointing this part.
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub repo_checkpoint: Option<RepoCheckpoint>,
    #[serde(default)]
    pub testing_state: Option<TestingState>,
    #[serde(default)]
    pub envoi_calls: Vec<EnvoiCall>,
    /// Evaluation-state emissions attributed to this part.
    #[serde(default)]
    pub eval_events_delta: Vec<EvalEvent>,
}

/// Count whitespace-separated words.
pub fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Rough token estimate: one token per four characters, at least one.
pub fn token_estimate(text: &str) -> u32 {
    std::cmp::max(1, text.len().div_ceil(4)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PartKind::Patch).unwrap(), "\"patch\"");
        let kind: PartKind = serde_json::from_str("\"tool\"").unwrap();
        assert_eq!(kind, PartKind::Tool);
    }

    #[test]
    fn token_estimate_has_floor_of_one() {
        assert_eq!(token_estimate(""), 1);
        assert_eq!(token_estimate("abc"), 1);
        assert_eq!(token_estimate("abcd"), 1);
        assert_eq!(token_estimate("abcde"), 2);
    }

    #[test]
    fn word_count_splits_on_whitespace() {
        assert_eq!(word_count("one  two\nthree"), 3);
        assert_eq!(word_count(""), 0);
    }
}
