//! The trajectory tree: parts, turns, evaluations, and the session end.
//!
//! Every mutation happens on the coordinator; evaluation workers only
//! touch the record they own and hand updates back through the shared
//! lock. Winner projection trims the tree so that no part later than
//! the winning part survives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::evaluation::{EvalEvent, EvaluationRecord};
use crate::part::PartRecord;
use crate::turn::TurnRecord;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop reason / session end / artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why the trajectory stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Solved,
    PartLimit,
    Timeout,
    AgentError,
    EnvoiError,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solved => "solved",
            Self::PartLimit => "part_limit",
            Self::Timeout => "timeout",
            Self::AgentError => "agent_error",
            Self::EnvoiError => "envoi_error",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnd {
    pub reason: StopReason,
    pub total_parts: u32,
    pub total_turns: u32,
    #[serde(default)]
    pub final_git_commit: Option<String>,
}

/// Object-store locations of the trajectory's exported artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default)]
    pub trace_parquet: Option<String>,
    #[serde(default)]
    pub repo_bundle: Option<String>,
    #[serde(default)]
    pub logs_parquet: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trajectory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The unit of a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub trajectory_id: String,
    pub session_id: String,
    pub agent: String,
    pub agent_model: String,
    /// RFC 3339 timestamp of the first run; preserved across resumes.
    pub started_at: String,
    #[serde(default)]
    pub parts: Vec<PartRecord>,
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    /// Keyed by commit hash; at most one evaluation per commit.
    #[serde(default)]
    pub evaluations: HashMap<String, EvaluationRecord>,
    #[serde(default)]
    pub artifacts: Option<Artifacts>,
    #[serde(default)]
    pub session_end: Option<SessionEnd>,
}

impl Trajectory {
    pub fn new(
        trajectory_id: String,
        session_id: String,
        agent: String,
        agent_model: String,
        started_at: String,
    ) -> Self {
        Self {
            trajectory_id,
            session_id,
            agent,
            agent_model,
            started_at,
            parts: Vec::new(),
            turns: Vec::new(),
            evaluations: HashMap::new(),
            artifacts: None,
            session_end: None,
        }
    }

    /// Highest part number recorded, or 0.
    pub fn last_part(&self) -> u32 {
        self.parts.iter().map(|p| p.part).max().unwrap_or(0)
    }

    /// Highest turn number recorded, or 0.
    pub fn last_turn(&self) -> u32 {
        self.turns.iter().map(|t| t.turn).max().unwrap_or(0)
    }

    /// Most recent known workspace commit: the session end's final commit
    /// if set, otherwise the newest part that carries one.
    pub fn latest_commit(&self) -> Option<String> {
        if let Some(end) = &self.session_end {
            if let Some(commit) = end.final_git_commit.as_deref() {
                if !commit.trim().is_empty() {
                    return Some(commit.to_owned());
                }
            }
        }
        for part in self.parts.iter().rev() {
            if let Some(commit) = part.git_commit.as_deref() {
                if !commit.is_empty() {
                    return Some(commit.to_owned());
                }
            }
            if let Some(checkpoint) = &part.repo_checkpoint {
                if let Some(after) = checkpoint.commit_after.as_deref() {
                    if !after.is_empty() {
                        return Some(after.to_owned());
                    }
                }
                if let Some(before) = checkpoint.commit_before.as_deref() {
                    if !before.is_empty() {
                        return Some(before.to_owned());
                    }
                }
            }
        }
        None
    }

    /// The winning evaluation with the smallest part number; ties broken
    /// by lexicographically smaller commit.
    pub fn first_winning(&self) -> Option<(&str, &EvaluationRecord)> {
        let mut winner: Option<(&str, &EvaluationRecord)> = None;
        for (commit, evaluation) in &self.evaluations {
            if !evaluation.is_winning() {
                continue;
            }
            match winner {
                None => winner = Some((commit, evaluation)),
                Some((best_commit, best)) => {
                    if evaluation.part < best.part
                        || (evaluation.part == best.part && commit.as_str() < best_commit)
                    {
                        winner = Some((commit, evaluation));
                    }
                }
            }
        }
        winner
    }

    /// The newest part record with the given number.
    pub fn find_part_mut(&mut self, part: u32) -> Option<&mut PartRecord> {
        self.parts.iter_mut().rev().find(|p| p.part == part)
    }

    /// Attach an eval event to its triggering part, falling back to the
    /// newest part when the trigger was already trimmed away.
    pub fn append_eval_event(&mut self, event: EvalEvent) {
        let trigger = event.trigger_part;
        if let Some(record) = self.find_part_mut(trigger) {
            record.eval_events_delta.push(event);
        } else if let Some(record) = self.parts.last_mut() {
            record.eval_events_delta.push(event);
        }
    }

    /// Drop every part, turn window, and evaluation past `max_part`.
    pub fn trim_after_part(&mut self, max_part: u32) {
        if max_part == 0 {
            self.parts.clear();
            self.turns.clear();
            self.evaluations.clear();
            return;
        }

        self.parts.retain(|p| p.part <= max_part);

        let mut kept_turns = Vec::with_capacity(self.turns.len());
        for mut turn in self.turns.drain(..) {
            let Some(start) = turn.part_start else {
                continue;
            };
            if start > max_part {
                continue;
            }
            if turn.part_end.is_some_and(|end| end > max_part) {
                turn.part_end = Some(max_part);
            }
            if let Some(end) = turn.part_end {
                let last_commit = self
                    .parts
                    .iter()
                    .rev()
                    .find(|p| p.part <= end && p.part >= start)
                    .and_then(|p| p.git_commit.clone());
                if last_commit.is_some() {
                    turn.git_commit = last_commit;
                }
            }
            kept_turns.push(turn);
        }
        self.turns = kept_turns;

        self.evaluations
            .retain(|_, evaluation| evaluation.part <= max_part);
    }

    /// Project the trajectory to end at the winning part. Returns the
    /// winning part number when projection applied.
    pub fn apply_winner_projection(
        &mut self,
        winner_commit: &str,
        winner_part: u32,
    ) -> Option<u32> {
        if winner_part == 0 {
            return None;
        }
        self.trim_after_part(winner_part);
        if let Some(end) = &mut self.session_end {
            end.final_git_commit = Some(winner_commit.to_owned());
            end.total_parts = winner_part;
        }
        Some(winner_part)
    }
}
