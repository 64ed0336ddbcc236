//! Sandbox contract consumed by the orchestration core.
//!
//! The core assumes nothing beyond this surface: execute a shell command
//! with line-streamed stdio, read and write files, terminate. Remote
//! backends (Modal, E2B) implement this trait elsewhere; [`LocalSandbox`]
//! runs everything in-place for development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use ec_domain::Result;

mod local;

pub use local::LocalSandbox;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Callback invoked once per streamed output line, without the newline.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A shell command to execute inside the sandbox.
#[derive(Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    /// Hard wall-clock cap in seconds. 0 means no explicit cap.
    pub timeout_seconds: u64,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub on_stdout_line: Option<LineCallback>,
    pub on_stderr_line: Option<LineCallback>,
}

impl ExecRequest {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn on_stdout(mut self, callback: LineCallback) -> Self {
        self.on_stdout_line = Some(callback);
        self
    }

    pub fn on_stderr(mut self, callback: LineCallback) -> Self {
        self.on_stderr_line = Some(callback);
        self
    }
}

impl std::fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecRequest")
            .field("command", &self.command)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

/// Result of a completed (or timed-out) sandbox command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
}

/// Exit code reported when the command hit its wall-clock cap.
pub const EXIT_TIMEOUT: i32 = 124;

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Timeouts surface as exit code 124 or -1 depending on the backend.
    pub fn timed_out(&self) -> bool {
        self.exit_code == EXIT_TIMEOUT || self.exit_code == -1
    }
}

/// A file to upload with [`Sandbox::write_files_parallel`].
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub path: String,
    pub contents: Vec<u8>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Abstraction over a disposable Linux sandbox.
///
/// Implementations must deliver stderr by command completion at the
/// latest; line streaming is best-effort where the backend supports it.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute a shell command and wait for it to finish or time out.
    async fn run(&self, req: ExecRequest) -> Result<ExecOutput>;

    /// Write a file, creating parent directories when asked.
    async fn write_file(&self, path: &str, contents: &[u8], ensure_parent_dirs: bool)
        -> Result<()>;

    /// Read a file's full contents.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Upload many files with bounded concurrency.
    async fn write_files_parallel(&self, files: Vec<FileUpload>, concurrency: usize)
        -> Result<()>;

    /// Tear down the sandbox. Idempotent.
    async fn terminate(&self) -> Result<()>;

    /// Convenience: run a plain command with a timeout, no streaming.
    async fn run_simple(&self, command: &str, timeout_seconds: u64) -> Result<ExecOutput> {
        self.run(ExecRequest::shell(command).timeout(timeout_seconds))
            .await
    }
}
