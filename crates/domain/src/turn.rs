//! Turn records: one prompt/response cycle.
//!
//! A turn does not own its parts; it holds the `[part_start, part_end]`
//! window into the trajectory's part list.

use serde::{Deserialize, Serialize};

use crate::part::TokenUsage;

/// One prompt-response cycle of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub session_id: String,
    /// RFC 3339 timestamp of the turn start.
    pub timestamp: String,
    /// The prompt sent for this turn.
    pub prompt: String,
    /// First part of this turn, set when the first part streams in.
    #[serde(default)]
    pub part_start: Option<u32>,
    /// Last part of this turn, advanced as parts stream in.
    #[serde(default)]
    pub part_end: Option<u32>,
    /// Workspace HEAD at turn start, updated from the last part.
    #[serde(default)]
    pub git_commit: Option<String>,
    /// Evaluation whose results shaped this turn's prompt.
    #[serde(default)]
    pub feedback_eval_id: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

impl TurnRecord {
    /// Whether any part was recorded inside this turn.
    pub fn has_parts(&self) -> bool {
        self.part_start.is_some()
    }
}
