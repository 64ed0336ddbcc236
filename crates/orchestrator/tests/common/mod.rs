//! Shared doubles for trajectory scenario tests: a command-matching
//! mock sandbox and a turn-scripted agent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ec_agent::{Agent, AgentSetupContext, TurnOutcome, TurnRequest};
use ec_domain::{PartKind, PartPayload, Result, TokenUsage};
use ec_sandbox::{ExecOutput, ExecRequest, FileUpload, Sandbox};
use ec_orchestrator::envoi::EVALUATION_JSON_MARKER;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mock sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scripted outcome of one commit evaluation.
#[derive(Clone)]
pub struct EvalScript {
    pub payload_json: String,
    pub delay_ms: u64,
    pub exit_code: i32,
}

impl EvalScript {
    pub fn all_pass(total: u32, delay_ms: u64) -> Self {
        Self {
            payload_json: format!(
                r#"{{"duration_ms": 5, "passed": {total}, "failed": 0, "total": {total}, "suite_results": {{}}}}"#
            ),
            delay_ms,
            exit_code: 0,
        }
    }

    pub fn partial(passed: u32, total: u32, delay_ms: u64) -> Self {
        Self {
            payload_json: format!(
                r#"{{"duration_ms": 5, "passed": {passed}, "failed": {}, "total": {total}, "suite_results": {{}}}}"#,
                total - passed
            ),
            delay_ms,
            exit_code: 0,
        }
    }
}

/// Sandbox double that pattern-matches incoming shell commands.
pub struct MockSandbox {
    head: Mutex<String>,
    /// Commits handed out by successive checkpoint commands.
    checkpoint_commits: Mutex<VecDeque<String>>,
    commit_evals: Mutex<HashMap<String, EvalScript>>,
    /// Marker payloads for successive turn-end (working tree) runs.
    workspace_evals: Mutex<VecDeque<String>>,
    schema_json: Mutex<Option<String>>,
    bundle_bytes: Vec<u8>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    pub commands: Mutex<Vec<String>>,
    pub bundle_exports: Mutex<Vec<String>>,
    pub interrupt_count: AtomicUsize,
    pub terminated: AtomicBool,
    evals_running: AtomicUsize,
    pub max_evals_running: AtomicUsize,
}

impl MockSandbox {
    pub fn new(initial_head: &str) -> Self {
        Self {
            head: Mutex::new(initial_head.to_owned()),
            checkpoint_commits: Mutex::new(VecDeque::new()),
            commit_evals: Mutex::new(HashMap::new()),
            workspace_evals: Mutex::new(VecDeque::new()),
            schema_json: Mutex::new(Some(r#"{"tests": ["basics"]}"#.to_owned())),
            bundle_bytes: b"GITBUNDLEv2".to_vec(),
            files: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            bundle_exports: Mutex::new(Vec::new()),
            interrupt_count: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            evals_running: AtomicUsize::new(0),
            max_evals_running: AtomicUsize::new(0),
        }
    }

    pub fn head(&self) -> String {
        self.head.lock().clone()
    }

    pub fn push_checkpoint_commit(&self, commit: &str) {
        self.checkpoint_commits.lock().push_back(commit.to_owned());
    }

    pub fn script_commit_eval(&self, commit: &str, script: EvalScript) {
        self.commit_evals.lock().insert(commit.to_owned(), script);
    }

    pub fn push_workspace_eval(&self, payload_json: &str) {
        self.workspace_evals.lock().push_back(payload_json.to_owned());
    }

    pub fn set_schema(&self, schema_json: Option<&str>) {
        *self.schema_json.lock() = schema_json.map(str::to_owned);
    }

    pub fn ran_command_containing(&self, needle: &str) -> bool {
        self.commands.lock().iter().any(|c| c.contains(needle))
    }

    fn ok(stdout: String) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
            duration_ms: 1,
        }
    }

    fn fail(code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.to_owned(),
            duration_ms: 1,
        }
    }

    async fn run_commit_eval(&self, command: &str) -> ExecOutput {
        let commit = command
            .lines()
            .find_map(|l| l.trim().strip_prefix("git checkout -q "))
            .unwrap_or("")
            .trim()
            .to_owned();
        let script = self.commit_evals.lock().get(&commit).cloned();
        let Some(script) = script else {
            return Self::fail(128, &format!("unknown commit {commit}"));
        };

        let running = self.evals_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_evals_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(script.delay_ms)).await;
        self.evals_running.fetch_sub(1, Ordering::SeqCst);

        if script.exit_code != 0 {
            return Self::fail(script.exit_code, "evaluation driver failed");
        }
        Self::ok(format!(
            "cloning...\n{EVALUATION_JSON_MARKER}{}\n",
            script.payload_json
        ))
    }

    fn run_workspace_eval(&self) -> ExecOutput {
        match self.workspace_evals.lock().pop_front() {
            Some(payload) => Self::ok(format!("{EVALUATION_JSON_MARKER}{payload}\n")),
            None => Self::ok("driver produced no output\n".to_owned()),
        }
    }
}

#[async_trait::async_trait]
impl Sandbox for MockSandbox {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutput> {
        let command = req.command.clone();
        self.commands.lock().push(command.clone());

        if command.contains("pkill -f") {
            self.interrupt_count.fetch_add(1, Ordering::SeqCst);
            return Ok(Self::ok(String::new()));
        }
        if command.contains("curl -sf") {
            return Ok(match self.schema_json.lock().clone() {
                Some(schema) => Self::ok(schema),
                None => Self::fail(22, "connection refused"),
            });
        }
        if command.contains("git clone -q /workspace") {
            return Ok(self.run_commit_eval(&command).await);
        }
        if command.contains("git add -A") {
            // Checkpoint: pop the next scripted commit, else HEAD stays.
            let mut head = self.head.lock();
            if let Some(next) = self.checkpoint_commits.lock().pop_front() {
                *head = next;
            }
            return Ok(Self::ok(format!("{}\n", head.clone())));
        }
        if command.contains("git checkout -q -f") {
            let target = command
                .split_whitespace()
                .last()
                .unwrap_or_default()
                .to_owned();
            *self.head.lock() = target;
            return Ok(Self::ok(String::new()));
        }
        if command.contains("git bundle create") {
            let target = command
                .lines()
                .find_map(|l| l.trim().strip_prefix("git branch -f __envoi_bundle_export__ "))
                .unwrap_or("")
                .trim()
                .to_owned();
            self.bundle_exports.lock().push(target);
            self.files
                .lock()
                .insert("/tmp/repo.bundle".to_owned(), self.bundle_bytes.clone());
            return Ok(Self::ok(String::new()));
        }
        if command.contains("git rev-parse HEAD") {
            return Ok(Self::ok(format!("{}\n", self.head.lock().clone())));
        }
        if command.contains("git clone -q /tmp/resume.bundle") {
            // Workspace restore: HEAD becomes the checked-out commit.
            if let Some(commit) = command
                .lines()
                .find_map(|l| l.trim().strip_prefix("git checkout -q "))
            {
                *self.head.lock() = commit.trim().to_owned();
            }
            return Ok(Self::ok(String::new()));
        }
        if command.contains("cd /workspace") && command.contains(EVALUATION_JSON_MARKER) {
            return Ok(self.run_workspace_eval());
        }
        if command.contains("ls -1 /tmp/envoi_") || command.starts_with("tail -n") {
            return Ok(Self::ok(String::new()));
        }
        Ok(Self::ok(String::new()))
    }

    async fn write_file(&self, path: &str, contents: &[u8], _ensure: bool) -> Result<()> {
        self.files.lock().insert(path.to_owned(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ec_domain::Error::Sandbox(format!("no such file: {path}")))
    }

    async fn write_files_parallel(&self, files: Vec<FileUpload>, _concurrency: usize) -> Result<()> {
        for file in files {
            self.files.lock().insert(file.path, file.contents);
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub enum TurnScript {
    Fail,
    Parts(Vec<PartPayload>),
}

pub struct ScriptedAgent {
    turns: Mutex<VecDeque<TurnScript>>,
    crash_messages: Mutex<Option<Vec<PartPayload>>>,
    pub recover_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<TurnScript>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            crash_messages: Mutex::new(None),
            recover_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_crash_messages(self, messages: Vec<PartPayload>) -> Self {
        *self.crash_messages.lock() = Some(messages);
        self
    }
}

#[async_trait::async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    fn client_process_patterns(&self) -> Vec<String> {
        vec!["/sandbox/scripted_client.py chat-stream".to_owned()]
    }

    async fn setup(&self, _: &dyn Sandbox, _: &AgentSetupContext) -> Result<()> {
        Ok(())
    }

    async fn create_session(&self, trajectory_id: &str) -> Result<String> {
        Ok(format!("sess-{trajectory_id}"))
    }

    async fn run_turn(
        &self,
        _req: TurnRequest,
        parts: mpsc::Sender<PartPayload>,
    ) -> Result<Option<TurnOutcome>> {
        let script = self.turns.lock().pop_front();
        match script {
            Some(TurnScript::Parts(payloads)) => {
                for payload in payloads {
                    if parts.send(payload).await.is_err() {
                        break;
                    }
                }
                Ok(Some(TurnOutcome {
                    session_id: String::new(),
                    token_usage: Some(TokenUsage {
                        prompt_tokens: 100,
                        completion_tokens: 50,
                        total_tokens: 150,
                    }),
                    response: None,
                }))
            }
            Some(TurnScript::Fail) | None => Ok(None),
        }
    }

    async fn recover_session(&self, trajectory_id: &str, attempt: u32) -> Result<String> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sess-{trajectory_id}-r{attempt}"))
    }

    async fn collect_crash_messages(&self, _: &str) -> Result<Option<Vec<PartPayload>>> {
        Ok(self.crash_messages.lock().clone())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Part payload builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn text_part(summary: &str) -> PartPayload {
    PartPayload {
        kind: PartKind::Text,
        role: "assistant".to_owned(),
        summary: Some(summary.to_owned()),
        content: Some(summary.to_owned()),
        files: vec![],
        patch: None,
        tool_name: None,
        tool_status: None,
        tool_input: None,
        tool_output: None,
        tool_error: None,
        tool_exit_code: None,
        token_usage: None,
        timestamp_ms: None,
        duration_ms: Some(10),
    }
}

pub fn patch_part(files: &[&str]) -> PartPayload {
    PartPayload {
        kind: PartKind::Patch,
        role: "assistant".to_owned(),
        summary: Some(format!("edit {}", files.join(", "))),
        content: None,
        files: files.iter().map(|f| (*f).to_owned()).collect(),
        patch: Some("--- a\n+++ b\n".to_owned()),
        tool_name: None,
        tool_status: None,
        tool_input: None,
        tool_output: None,
        tool_error: None,
        tool_exit_code: None,
        token_usage: None,
        timestamp_ms: None,
        duration_ms: Some(30),
    }
}

pub fn envoi_tool_part(path: &str, passed: u32, total: u32, ts: &str) -> PartPayload {
    let output = serde_json::json!({
        "path": path,
        "timestamp": ts,
        "duration_ms": 40,
        "status_code": 200,
        "result": {"passed": passed, "failed": total - passed, "total": total},
    });
    PartPayload {
        kind: PartKind::Tool,
        role: "assistant".to_owned(),
        summary: Some(format!("run_tests {path}")),
        content: None,
        files: vec![],
        patch: None,
        tool_name: Some("run_tests".to_owned()),
        tool_status: Some("completed".to_owned()),
        tool_input: Some(serde_json::json!({"path": path, "api_key": "sk-secret"})),
        tool_output: Some(output),
        tool_error: None,
        tool_exit_code: Some(0),
        token_usage: None,
        timestamp_ms: None,
        duration_ms: Some(40),
    }
}
