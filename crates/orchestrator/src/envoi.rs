//! In-sandbox evaluation driving: command construction, the JSON marker
//! contract, and test-schema discovery.
//!
//! The driver prints exactly one line starting with
//! [`EVALUATION_JSON_MARKER`] followed by a JSON payload. That line is
//! the sole authoritative evaluation result; everything else on stdout
//! is noise.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ec_domain::envoi::extract_leaf_paths;
use ec_domain::{EvalTestResult, Result, SuiteResult};
use ec_sandbox::{ExecOutput, Sandbox};

pub const EVALUATION_JSON_MARKER: &str = "__ENVOI_EVAL_JSON__";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The driver's marker-line payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalPayload {
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub suite_results: BTreeMap<String, SuiteResult>,
    #[serde(default)]
    pub tests: Vec<EvalTestResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl EvalPayload {
    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    pub fn all_passing(&self) -> bool {
        self.total > 0 && self.passed == self.total && !self.has_error()
    }

    /// Raw JSON form, kept on the evaluation record.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Command output plus the parsed marker payload, if any.
#[derive(Debug, Clone)]
pub struct EvalRun {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub payload: Option<EvalPayload>,
}

/// Scan stdout (bottom-up) for the marker line and parse its payload.
pub fn parse_eval_payload(stdout: &str) -> Option<EvalPayload> {
    for line in stdout.lines().rev() {
        let Some(raw) = line.strip_prefix(EVALUATION_JSON_MARKER) else {
            continue;
        };
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        return serde_json::from_str(raw).ok();
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// POSIX single-quote a string for interpolation into `sh -c`.
pub fn sh_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':'))
    {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The in-sandbox python driver shared by commit and working-tree runs.
///
/// Opens a test-server session with the repo as submission, invokes the
/// configured test path (or the full suite), aggregates totals across
/// nested suite results, and prints the marker line.
fn driver_script(repo_dir: &str, envoi_url: &str, test_path: &str) -> String {
    let repo_dir_json = serde_json::to_string(repo_dir).unwrap_or_default();
    let envoi_url_json = serde_json::to_string(envoi_url).unwrap_or_default();
    let test_path_json = serde_json::to_string(test_path).unwrap_or_default();
    let marker_json = serde_json::to_string(EVALUATION_JSON_MARKER).unwrap_or_default();
    format!(
        r#"python3 - <<'PY'
import asyncio
import json
import time
import traceback
import envoi
repo_dir = {repo_dir_json}
envoi_url = {envoi_url_json}
eval_test_path = {test_path_json}
marker = {marker_json}
def _collect_totals(node):
    if isinstance(node, dict):
        passed = node.get('passed')
        failed = node.get('failed')
        total = node.get('total')
        if isinstance(passed, int) and isinstance(failed, int) and isinstance(total, int):
            return max(0, passed), max(0, failed), max(0, total)
        p = f = t = 0
        for value in node.values():
            cp, cf, ct = _collect_totals(value)
            p += cp
            f += cf
            t += ct
        return p, f, t
    if isinstance(node, list):
        p = f = t = 0
        for value in node:
            cp, cf, ct = _collect_totals(value)
            p += cp
            f += cf
            t += ct
        return p, f, t
    return 0, 0, 0
async def _main() -> None:
    started_at = time.monotonic()
    payload = {{
        'duration_ms': 0,
        'passed': 0,
        'failed': 0,
        'total': 0,
        'suite_results': {{}},
        'error': None,
    }}
    try:
        docs = envoi.Documents(repo_dir)
        async with await envoi.connect_session(
            envoi_url,
            connect_timeout_seconds=7200,
            submission=docs,
            session_timeout_seconds=7200,
        ) as session:
            result = (
                await session.test(eval_test_path)
                if eval_test_path
                else await session.test()
            )
            passed, failed, total = _collect_totals(result)
            payload['passed'] = int(passed)
            payload['failed'] = int(failed)
            payload['total'] = int(total)
            suite_key = eval_test_path if eval_test_path else 'all'
            payload['suite_results'] = {{
                suite_key: {{
                    'ok': failed == 0 and total > 0,
                    'passed': int(passed),
                    'failed': int(failed),
                    'total': int(total),
                    'error': None,
                }}
            }}
            if isinstance(result, dict) and isinstance(result.get('tests'), list):
                payload['tests'] = result['tests']
    except Exception as error:
        msg = str(error).strip()
        payload['error'] = msg if msg else type(error).__name__
        payload['traceback'] = traceback.format_exc()
    finally:
        payload['duration_ms'] = int((time.monotonic() - started_at) * 1000)
    print(marker + json.dumps(payload, ensure_ascii=False))
asyncio.run(_main())
PY"#
    )
}

/// Shell command evaluating `commit`: clone the workspace into a fresh
/// scratch dir, check out the commit, run the driver, always clean up.
pub fn build_commit_evaluation_command(
    commit: &str,
    eval_repo_dir: &str,
    envoi_url: &str,
    test_path: &str,
) -> String {
    let quoted_repo = sh_quote(eval_repo_dir);
    let quoted_commit = sh_quote(commit);
    let driver = driver_script(eval_repo_dir, envoi_url, test_path);
    format!(
        "set -euo pipefail\n\
         repo_dir={quoted_repo}\n\
         rm -rf \"$repo_dir\"\n\
         git clone -q /workspace \"$repo_dir\"\n\
         cd \"$repo_dir\"\n\
         git checkout -q {quoted_commit}\n\
         {driver}\n\
         status=$?\n\
         cd /workspace\n\
         rm -rf \"$repo_dir\"\n\
         exit $status\n"
    )
}

/// Shell command evaluating the current working tree of `/workspace`,
/// uncommitted changes included.
pub fn build_workspace_evaluation_command(envoi_url: &str, test_path: &str) -> String {
    let driver = driver_script("/workspace", envoi_url, test_path);
    format!("set -uo pipefail\ncd /workspace\n{driver}\n")
}

/// Scratch directory for a commit evaluation, unique per attempt.
pub fn eval_repo_dir(commit: &str) -> String {
    let short: String = commit.chars().take(12).collect();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("/tmp/envoi-eval-{short}-{}", &nonce[..8])
}

/// Package an [`ExecOutput`] with its parsed payload.
pub fn eval_run_from_output(command: String, output: ExecOutput) -> EvalRun {
    let payload = parse_eval_payload(&output.stdout);
    EvalRun {
        command,
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        payload,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fetch the server's `/schema` inside the sandbox and extract leaf
/// test paths. Missing or unreadable schema degrades to an empty set.
pub async fn discover_test_paths(sandbox: &dyn Sandbox, envoi_url: &str) -> Result<Vec<String>> {
    let command = format!("curl -sf {}/schema", sh_quote(envoi_url));
    let output = sandbox.run_simple(&command, 30).await?;
    if !output.success() || output.stdout.trim().is_empty() {
        tracing::warn!("/schema not available, running without completion tracking");
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(&output.stdout) {
        Ok(schema) => Ok(extract_leaf_paths(&schema)),
        Err(e) => {
            tracing::warn!(error = %e, "schema parse error");
            Ok(Vec::new())
        }
    }
}

/// Check user-selected test paths against the discovered set. A path is
/// valid when it is a leaf or the prefix of one.
pub fn validate_selected_paths(selected: &[String], discovered: &[String]) -> Vec<String> {
    let mut invalid = Vec::new();
    for path in selected {
        let is_leaf = discovered.iter().any(|d| d == path);
        let has_child = discovered.iter().any(|d| d.starts_with(&format!("{path}/")));
        if !is_leaf && !has_child {
            invalid.push(path.clone());
        }
    }
    invalid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_parse_takes_last_marker_line() {
        let stdout = format!(
            "noise\n{m}{}\nmore\n{m}{}\n",
            r#"{"passed": 1, "failed": 0, "total": 1}"#,
            r#"{"passed": 7, "failed": 0, "total": 7}"#,
            m = EVALUATION_JSON_MARKER,
        );
        let payload = parse_eval_payload(&stdout).unwrap();
        assert_eq!(payload.passed, 7);
        assert!(payload.all_passing());
    }

    #[test]
    fn marker_absent_is_none() {
        assert!(parse_eval_payload("just logs\n").is_none());
        assert!(parse_eval_payload(&format!("{EVALUATION_JSON_MARKER}\n")).is_none());
    }

    #[test]
    fn malformed_marker_json_is_none() {
        let stdout = format!("{EVALUATION_JSON_MARKER}{{not json\n");
        assert!(parse_eval_payload(&stdout).is_none());
    }

    #[test]
    fn sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("abc123"), "abc123");
        assert_eq!(sh_quote("a b"), "'a b'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn commit_command_clones_checks_out_and_cleans_up() {
        let cmd = build_commit_evaluation_command(
            "deadbeef",
            "/tmp/envoi-eval-deadbeef-1234",
            "http://localhost:8000",
            "basics",
        );
        assert!(cmd.contains("git clone -q /workspace"));
        assert!(cmd.contains("git checkout -q deadbeef"));
        assert!(cmd.contains(EVALUATION_JSON_MARKER));
        assert!(cmd.contains("rm -rf \"$repo_dir\""));
    }

    #[test]
    fn selected_path_validation_accepts_prefixes() {
        let discovered = vec![
            "basics".to_string(),
            "torture/part_1".to_string(),
            "torture/part_2".to_string(),
        ];
        let invalid = validate_selected_paths(
            &["torture".to_string(), "basics".to_string(), "nope".to_string()],
            &discovered,
        );
        assert_eq!(invalid, vec!["nope"]);
    }

    #[test]
    fn eval_repo_dirs_are_unique_per_attempt() {
        let a = eval_repo_dir("deadbeefcafe0123");
        let b = eval_repo_dir("deadbeefcafe0123");
        assert!(a.starts_with("/tmp/envoi-eval-deadbeefcafe-"));
        assert_ne!(a, b);
    }
}
