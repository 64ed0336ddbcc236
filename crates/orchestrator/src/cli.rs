//! Command-line surface: argument parsing and the bridge from CLI
//! arguments to [`RunParams`].
//!
//! Agent and sandbox backends are linked in by the front-end binary;
//! this crate only defines the argument shape they share.

use clap::{Parser, Subcommand};
use serde_json::Value;

use ec_agent::AgentSetupContext;
use ec_domain::OrchestratorConfig;

use crate::advisor::AdvisorConfig;
use crate::runner::RunParams;

#[derive(Debug, Parser)]
#[command(name = "ec-orchestrator", about = "Coding-agent trajectory orchestrator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate the environment-derived configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Validate,
    Show,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run arguments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Arguments for a single trajectory run, shared with front-ends.
#[derive(Debug, Clone, Parser)]
pub struct RunArgs {
    /// Agent backend name, e.g. `codex` or `opencode`.
    #[arg(long)]
    pub agent: String,

    /// Model override; the agent applies its default when omitted.
    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub max_parts: Option<u32>,

    #[arg(long)]
    pub max_turns: Option<u32>,

    #[arg(long, default_value_t = 7200)]
    pub timeout_seconds: u64,

    /// Test path to run during evaluation. Repeat to target multiple
    /// paths; omitted means the full suite.
    #[arg(long = "test")]
    pub test_paths: Vec<String>,

    /// Reuse an id to resume a prior run.
    #[arg(long)]
    pub trajectory_id: Option<String>,

    /// Environment name, recorded on every trace row.
    #[arg(long)]
    pub environment: String,

    /// Advisor model spec; enables the advisor step.
    #[arg(long)]
    pub advisor_model: Option<String>,
}

impl RunArgs {
    /// Resolve into [`RunParams`]. `task_prompt`/`task_params` come
    /// from the front-end's task loader; advisor credentials from the
    /// environment.
    pub fn into_params(
        self,
        config: &OrchestratorConfig,
        resolved_model: String,
        task_prompt: String,
        task_params: Value,
        setup: AgentSetupContext,
    ) -> RunParams {
        let advisor = self.advisor_model.as_deref().and_then(|model| {
            let api_key = std::env::var("ADVISOR_API_KEY").unwrap_or_default();
            if api_key.trim().is_empty() {
                tracing::warn!("advisor model set but ADVISOR_API_KEY is missing; advisor disabled");
                return None;
            }
            Some(AdvisorConfig {
                model: model.to_owned(),
                base_url: std::env::var("ADVISOR_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_owned()),
                api_key,
                timeout_seconds: config.advisor_timeout_seconds,
                failed_tests_limit: config.failed_test_feedback_limit,
            })
        });

        RunParams {
            trajectory_id: self.trajectory_id,
            model: resolved_model,
            environment: self.environment,
            task_prompt,
            task_params,
            max_parts: self.max_parts.filter(|v| *v > 0),
            max_turns: self.max_turns.filter(|v| *v > 0),
            run_timeout_seconds: self.timeout_seconds,
            test_paths: self.test_paths,
            setup,
            advisor,
        }
    }
}
