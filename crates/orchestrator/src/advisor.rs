//! External advisor: an out-of-band review LLM that reads the turn-end
//! evaluation and annotates the feedback with an assessment.
//!
//! Talks to any OpenAI-compatible chat-completions endpoint. Failures
//! here never fail the turn; the caller records "advisor unavailable"
//! text instead.

use serde_json::Value;

use ec_domain::{Error, EvalTestResult, Result};
use ec_sandbox::Sandbox;

use crate::envoi::{sh_quote, EvalPayload};
use crate::feedback::select_failed_tests;

const MAX_OUTPUT_TOKENS: u32 = 2200;
const SNAPSHOT_MAX_FILES: usize = 80;
const SNAPSHOT_MAX_FILE_CHARS: usize = 24_000;
const SNAPSHOT_MAX_TOTAL_CHARS: usize = 220_000;

const SYSTEM_PROMPT: &str = "You are a senior engineer reviewing an autonomous \
coding agent's progress on a programming task. You receive the task, the \
current failing tests, and a snapshot of the code. Point out the most likely \
root causes and the highest-leverage next steps. Be specific and terse.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AdvisorConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: String,
    pub timeout_seconds: u64,
    pub failed_tests_limit: usize,
}

pub struct AdvisorClient {
    config: AdvisorConfig,
    client: reqwest::Client,
}

impl AdvisorClient {
    pub fn new(config: AdvisorConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Config("advisor API key is missing".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// Produce an assessment of the current turn-end evaluation.
    pub async fn assess(
        &self,
        sandbox: &dyn Sandbox,
        task_prompt: &str,
        commit: Option<&str>,
        payload: &EvalPayload,
    ) -> Result<String> {
        let snapshot = collect_code_snapshot(sandbox, commit).await;
        let user_prompt = build_user_prompt(
            task_prompt,
            commit,
            payload,
            &snapshot,
            self.config.failed_tests_limit,
        );

        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ],
        });

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Http(format!(
                "advisor request failed with status {status}: {}",
                value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            )));
        }

        let text = extract_completion_text(&value);
        if text.is_empty() {
            return Err(Error::Http("advisor returned no text content".into()));
        }
        Ok(format!("External advisor assessment:\n{text}"))
    }
}

/// Pull `choices[0].message.content` out of a chat-completions response.
fn extract_completion_text(body: &Value) -> String {
    body.get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_user_prompt(
    task_prompt: &str,
    commit: Option<&str>,
    payload: &EvalPayload,
    code_snapshot: &str,
    failed_tests_limit: usize,
) -> String {
    let mut sections = vec![
        format!("Task:\n{task_prompt}"),
        format!(
            "Current commit: {}\nScore: passed={} failed={} total={}",
            commit.unwrap_or("(unknown)"),
            payload.passed,
            payload.failed,
            payload.total
        ),
    ];

    let failing = render_failing_tests(&payload.tests, failed_tests_limit);
    if !failing.is_empty() {
        sections.push(format!("Failing tests:\n{failing}"));
    }
    if !code_snapshot.is_empty() {
        sections.push(format!("Code snapshot:\n{code_snapshot}"));
    }
    sections.push(
        "Assess the state of the solution and list the most promising next steps."
            .to_owned(),
    );
    sections.join("\n\n")
}

fn render_failing_tests(tests: &[EvalTestResult], limit: usize) -> String {
    select_failed_tests(tests, limit)
        .iter()
        .map(|test| {
            let mut line = format!("- {} [{}]", test.reference(), test.status);
            if let Some(message) = test.failure_message() {
                let first_line = message.lines().next().unwrap_or("");
                line.push_str(": ");
                line.push_str(first_line);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Code snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collect source files at `commit` (or HEAD) from the workspace,
/// capped by file count and character budgets. Best-effort: git errors
/// yield an empty snapshot.
async fn collect_code_snapshot(sandbox: &dyn Sandbox, commit: Option<&str>) -> String {
    let git_ref = commit.filter(|c| !c.trim().is_empty()).unwrap_or("HEAD");
    let list_cmd = format!(
        "cd /workspace && git ls-tree -r --name-only {}",
        sh_quote(git_ref)
    );
    let Ok(listing) = sandbox.run_simple(&list_cmd, 30).await else {
        return String::new();
    };
    if !listing.success() {
        return String::new();
    }

    let mut snapshot = String::new();
    let mut files_taken = 0usize;
    for path in listing.stdout.lines().map(str::trim).filter(|p| !p.is_empty()) {
        if files_taken >= SNAPSHOT_MAX_FILES || snapshot.len() >= SNAPSHOT_MAX_TOTAL_CHARS {
            break;
        }
        if !is_source_path(path) {
            continue;
        }
        let show_cmd = format!(
            "cd /workspace && git show {}:{}",
            sh_quote(git_ref),
            sh_quote(path)
        );
        let Ok(output) = sandbox.run_simple(&show_cmd, 30).await else {
            continue;
        };
        if !output.success() {
            continue;
        }
        let mut contents = output.stdout;
        contents.truncate(SNAPSHOT_MAX_FILE_CHARS);
        snapshot.push_str(&format!("=== {path} ===\n{contents}\n"));
        files_taken += 1;
    }
    snapshot
}

fn is_source_path(path: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        ".c", ".h", ".cc", ".cpp", ".hpp", ".rs", ".py", ".js", ".ts", ".go", ".java",
        ".sh", ".mk", "Makefile", ".toml", ".yaml", ".yml",
    ];
    SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_comes_from_first_choice() {
        let body = serde_json::json!({
            "model": "advisor-1",
            "choices": [
                {"message": {"role": "assistant", "content": " look at the parser "},
                 "finish_reason": "stop"},
                {"message": {"role": "assistant", "content": "ignored"}},
            ]
        });
        assert_eq!(extract_completion_text(&body), "look at the parser");

        let empty = serde_json::json!({"choices": []});
        assert_eq!(extract_completion_text(&empty), "");
        assert_eq!(extract_completion_text(&serde_json::json!({})), "");
    }

    #[test]
    fn user_prompt_contains_failing_tests() {
        let payload = EvalPayload {
            passed: 1,
            failed: 1,
            total: 2,
            tests: vec![EvalTestResult {
                suite: Some("basics".into()),
                test_id: "t_add".into(),
                status: "failed".into(),
                message: Some("expected 3, got 4\nextra".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let prompt = build_user_prompt("write a compiler", Some("abc"), &payload, "", 10);
        assert!(prompt.contains("basics/t_add"));
        assert!(prompt.contains("expected 3, got 4"));
        assert!(!prompt.contains("extra"));
    }

    #[test]
    fn source_path_filter() {
        assert!(is_source_path("src/main.c"));
        assert!(is_source_path("Makefile"));
        assert!(!is_source_path("build/output.bin"));
    }
}
