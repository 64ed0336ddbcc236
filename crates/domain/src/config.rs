//! Orchestrator configuration, sourced from environment variables.
//!
//! Every knob has a default; unset or unparsable values fall back
//! silently. Hard floors (concurrency >= 1, evaluation timeout >= 60s)
//! are applied at load time so the rest of the code never re-checks.

use std::fmt;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running commit evaluations.
    pub evaluation_concurrency: usize,
    /// Wall-clock cap for a single evaluation run, seconds.
    pub evaluation_timeout_seconds: u64,
    /// Test path evaluated per run; empty string means the full suite.
    pub evaluation_test_path: String,
    /// Base URL of the envoi server as seen from inside the sandbox.
    pub evaluation_envoi_url: String,
    /// Consecutive turn failures tolerated before giving up.
    pub turn_recovery_retries: u32,
    /// Per-message timeout used by the turn-timeout estimate, seconds.
    pub message_timeout_seconds: u64,
    pub logs_flush_interval_seconds: u64,
    pub logs_flush_batch_size: usize,
    /// Extra sandbox lifetime beyond the run timeout, seconds.
    pub shutdown_grace_seconds: u64,
    /// How long finalization waits for in-flight evaluations, seconds.
    pub evaluator_drain_timeout_seconds: u64,
    /// Whether to load a prior snapshot for the same trajectory id.
    pub resume_from_store: bool,
    pub advisor_timeout_seconds: u64,
    /// Cap on failing tests rendered into turn feedback.
    pub failed_test_feedback_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            evaluation_concurrency: 1,
            evaluation_timeout_seconds: 7200,
            evaluation_test_path: "basics".into(),
            evaluation_envoi_url: "http://localhost:8000".into(),
            turn_recovery_retries: 3,
            message_timeout_seconds: 600,
            logs_flush_interval_seconds: 5,
            logs_flush_batch_size: 50,
            shutdown_grace_seconds: 300,
            evaluator_drain_timeout_seconds: 30,
            resume_from_store: true,
            advisor_timeout_seconds: 180,
            failed_test_feedback_limit: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment, applying defaults and floors.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            evaluation_concurrency: env_usize("EVALUATION_CONCURRENCY", defaults.evaluation_concurrency).max(1),
            evaluation_timeout_seconds: env_u64("EVALUATION_TIMEOUT_SECONDS", defaults.evaluation_timeout_seconds).max(60),
            evaluation_test_path: env_string("EVALUATION_TEST_PATH", &defaults.evaluation_test_path),
            evaluation_envoi_url: non_empty_or(
                env_string("EVALUATION_ENVOI_URL", &defaults.evaluation_envoi_url),
                &defaults.evaluation_envoi_url,
            ),
            turn_recovery_retries: env_u64("TURN_RECOVERY_RETRIES", defaults.turn_recovery_retries as u64) as u32,
            message_timeout_seconds: env_u64("MESSAGE_TIMEOUT_SECONDS", defaults.message_timeout_seconds).max(1),
            logs_flush_interval_seconds: env_u64("LOGS_FLUSH_INTERVAL_SECONDS", defaults.logs_flush_interval_seconds).max(1),
            logs_flush_batch_size: env_usize("LOGS_FLUSH_BATCH_SIZE", defaults.logs_flush_batch_size).max(1),
            shutdown_grace_seconds: env_u64("SHUTDOWN_GRACE_SECONDS", defaults.shutdown_grace_seconds),
            evaluator_drain_timeout_seconds: env_u64("EVALUATOR_DRAIN_TIMEOUT_SECONDS", defaults.evaluator_drain_timeout_seconds),
            resume_from_store: env_bool("RESUME_FROM_S3", defaults.resume_from_store),
            advisor_timeout_seconds: env_u64("ADVISOR_TIMEOUT_SECONDS", defaults.advisor_timeout_seconds).max(1),
            failed_test_feedback_limit: env_usize("FAILED_TEST_FEEDBACK_LIMIT", defaults.failed_test_feedback_limit).max(1),
        }
    }

    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.evaluation_envoi_url.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "evaluation_envoi_url".into(),
                message: "envoi URL must not be empty".into(),
            });
        }
        if self.evaluation_concurrency > 16 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "evaluation_concurrency".into(),
                message: format!(
                    "{} concurrent evaluations will contend for sandbox CPU",
                    self.evaluation_concurrency
                ),
            });
        }
        if self.logs_flush_interval_seconds > 60 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "logs_flush_interval_seconds".into(),
                message: "flush intervals above 60s risk losing logs on a crash".into(),
            });
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .map(|v| v.trim().to_owned())
        .unwrap_or_else(|_| default.to_owned())
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_owned()
    } else {
        value
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
