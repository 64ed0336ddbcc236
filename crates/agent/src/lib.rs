//! Agent contract: the interface every coding agent must implement.
//!
//! The orchestrator never talks to an LLM directly. It calls `setup` to
//! provision the agent inside a sandbox, `run_turn` to execute one
//! prompt/response cycle, and `stop` to tear down. Parts stream through
//! a bounded channel, one send per emitted part, strictly in order,
//! before `run_turn` resolves.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ec_domain::{PartPayload, Result, TokenUsage};
use ec_sandbox::Sandbox;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Setup types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Base credential container. Agents read what they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCredentials {
    #[serde(default)]
    pub api_key: String,
    /// Agent-specific extras (e.g. an auth.json blob), keyed by name.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Additional image layers an agent needs beyond the environment image.
#[derive(Debug, Clone, Default)]
pub struct ImageRequirements {
    pub apt_packages: Vec<String>,
    pub pip_packages: Vec<String>,
    pub npm_packages: Vec<String>,
}

/// Everything an agent needs for sandbox provisioning.
///
/// The orchestrator builds this once and passes it to `setup`; the
/// agent reads what it needs and ignores the rest.
#[derive(Debug, Clone, Default)]
pub struct AgentSetupContext {
    pub model: String,
    pub credentials: AgentCredentials,
    /// Environment files uploaded into the sandbox, path -> contents.
    pub env_files: HashMap<String, String>,
    pub mcp_server_content: String,
    pub mcp_enabled: bool,
    pub workspace_gitignore: String,
    pub runtime_env: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to a single turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt_text: String,
    pub timeout_seconds: u64,
    pub current_turn: u32,
    /// Parts the agent may still emit before the run hits its cap.
    pub remaining_parts_budget: u32,
    pub global_part_count: u32,
    pub global_max_parts: u32,
    pub global_max_turns: u32,
    pub global_elapsed_seconds: u64,
}

/// Outcome of a successful turn. `run_turn` returns `None` on failure.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub session_id: String,
    pub token_usage: Option<TokenUsage>,
    /// Agent-native response metadata, kept opaque.
    pub response: Option<serde_json::Value>,
}

/// Inputs to the per-turn timeout computation.
#[derive(Debug, Clone, Copy)]
pub struct TurnTimeoutParams {
    pub remaining_parts: u32,
    pub remaining_run_seconds: u64,
    pub message_timeout_seconds: u64,
}

/// Sender the agent pushes one [`PartPayload`] into per emitted part.
pub type PartSender = mpsc::Sender<PartPayload>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Abstraction over a coding agent running inside a sandbox.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Agent name, e.g. `"opencode"` or `"codex"`.
    fn name(&self) -> &str;

    /// Absolute paths of log files this agent writes inside the sandbox.
    fn log_files(&self) -> Vec<String> {
        Vec::new()
    }

    /// `pkill -f` patterns matching the agent's in-sandbox client
    /// processes, used for the best-effort winner interrupt.
    fn client_process_patterns(&self) -> Vec<String> {
        Vec::new()
    }

    /// The effective model string, applying agent-specific defaults.
    fn resolve_model(&self, requested: Option<&str>) -> String {
        requested.unwrap_or_default().to_owned()
    }

    /// Image layers this agent needs beyond the environment image.
    fn image_requirements(&self) -> ImageRequirements {
        ImageRequirements::default()
    }

    /// Credentials resolved from the process environment.
    fn resolve_credentials(&self) -> Result<AgentCredentials> {
        Ok(AgentCredentials::default())
    }

    /// Compute the timeout for the next turn: bounded by the remaining
    /// wall clock and a per-part budget estimate.
    fn compute_turn_timeout(&self, params: TurnTimeoutParams) -> u64 {
        let budget = params
            .message_timeout_seconds
            .saturating_mul(params.remaining_parts.max(1) as u64);
        budget.min(params.remaining_run_seconds).max(1)
    }

    /// Provision this agent inside the sandbox: upload client scripts,
    /// config files, credentials, environment files; run the
    /// environment's workspace initializer. After this returns, the
    /// agent is ready for `create_session`.
    async fn setup(&self, sandbox: &dyn Sandbox, ctx: &AgentSetupContext) -> Result<()>;

    /// Create or return a session ID for this trajectory.
    async fn create_session(&self, trajectory_id: &str) -> Result<String>;

    /// Run one agent turn, streaming each emitted part through `parts`
    /// in order before returning. `None` signals a turn-level failure.
    async fn run_turn(&self, req: TurnRequest, parts: PartSender) -> Result<Option<TurnOutcome>>;

    /// Create a recovery session after a failed turn.
    async fn recover_session(&self, trajectory_id: &str, attempt: u32) -> Result<String>;

    /// Best-effort retrieval of unflushed parts after a crash. `None`
    /// when the agent does not support post-crash collection.
    async fn collect_crash_messages(
        &self,
        _session_id: &str,
    ) -> Result<Option<Vec<PartPayload>>> {
        Ok(None)
    }

    /// Tear down the agent. Idempotent.
    async fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TimeoutOnly;

    #[async_trait::async_trait]
    impl Agent for TimeoutOnly {
        fn name(&self) -> &str {
            "timeout-only"
        }

        async fn setup(&self, _: &dyn Sandbox, _: &AgentSetupContext) -> Result<()> {
            Ok(())
        }

        async fn create_session(&self, _: &str) -> Result<String> {
            Ok("s".into())
        }

        async fn run_turn(&self, _: TurnRequest, _: PartSender) -> Result<Option<TurnOutcome>> {
            Ok(None)
        }

        async fn recover_session(&self, _: &str, _: u32) -> Result<String> {
            Ok("s".into())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn turn_timeout_is_clamped_by_remaining_wall_clock() {
        let agent = TimeoutOnly;
        let timeout = agent.compute_turn_timeout(TurnTimeoutParams {
            remaining_parts: 10,
            remaining_run_seconds: 300,
            message_timeout_seconds: 600,
        });
        assert_eq!(timeout, 300);
    }

    #[test]
    fn turn_timeout_scales_with_parts_budget() {
        let agent = TimeoutOnly;
        let timeout = agent.compute_turn_timeout(TurnTimeoutParams {
            remaining_parts: 3,
            remaining_run_seconds: 10_000,
            message_timeout_seconds: 600,
        });
        assert_eq!(timeout, 1800);
    }

    #[test]
    fn turn_timeout_never_drops_to_zero() {
        let agent = TimeoutOnly;
        let timeout = agent.compute_turn_timeout(TurnTimeoutParams {
            remaining_parts: 0,
            remaining_run_seconds: 0,
            message_timeout_seconds: 600,
        });
        assert_eq!(timeout, 1);
    }
}
