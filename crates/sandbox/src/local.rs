//! Local-process sandbox backend.
//!
//! Runs commands directly on the host with `sh -c`. Paths are used
//! verbatim, so this backend is meant to run inside a disposable
//! container (where it *is* the sandbox) or against scratch directories
//! in tests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures_util::{stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use ec_domain::{Error, Result};

use crate::{ExecOutput, ExecRequest, FileUpload, LineCallback, Sandbox, EXIT_TIMEOUT};

/// Sandbox backend that executes on the local machine.
pub struct LocalSandbox {
    default_cwd: Option<String>,
    extra_env: HashMap<String, String>,
    terminated: AtomicBool,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self {
            default_cwd: None,
            extra_env: HashMap::new(),
            terminated: AtomicBool::new(false),
        }
    }

    /// Use `dir` as the working directory for commands without a cwd.
    pub fn with_default_cwd(mut self, dir: impl Into<String>) -> Self {
        self.default_cwd = Some(dir.into());
        self
    }

    /// Export an environment variable into every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    fn check_alive(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::Sandbox("sandbox already terminated".into()));
        }
        Ok(())
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Read lines from a pipe into a buffer, invoking the optional callback.
async fn drain_lines<R>(reader: R, buffer: &mut String, callback: Option<LineCallback>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(cb) = &callback {
            cb(&line);
        }
        buffer.push_str(&line);
        buffer.push('\n');
    }
}

#[async_trait::async_trait]
impl Sandbox for LocalSandbox {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutput> {
        self.check_alive()?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&req.command);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(cwd) = req.cwd.as_deref().or(self.default_cwd.as_deref()) {
            cmd.current_dir(cwd);
        }
        for (key, value) in self.extra_env.iter().chain(req.env.iter()) {
            cmd.env(key, value);
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn: {e}")))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        let stdout_task = async {
            if let Some(pipe) = stdout_pipe {
                drain_lines(pipe, &mut stdout_buf, req.on_stdout_line.clone()).await;
            }
        };
        let stderr_task = async {
            if let Some(pipe) = stderr_pipe {
                drain_lines(pipe, &mut stderr_buf, req.on_stderr_line.clone()).await;
            }
        };

        let wait_all = async {
            tokio::join!(stdout_task, stderr_task);
            child.wait().await
        };

        let exit_code = if req.timeout_seconds > 0 {
            let cap = std::time::Duration::from_secs(req.timeout_seconds);
            match tokio::time::timeout(cap, wait_all).await {
                Ok(status) => status
                    .map_err(|e| Error::Sandbox(format!("wait failed: {e}")))?
                    .code()
                    .unwrap_or(-1),
                Err(_) => {
                    tracing::warn!(
                        command = %req.command,
                        timeout_seconds = req.timeout_seconds,
                        "command timed out, killing"
                    );
                    EXIT_TIMEOUT
                }
            }
        } else {
            wait_all
                .await
                .map_err(|e| Error::Sandbox(format!("wait failed: {e}")))?
                .code()
                .unwrap_or(-1)
        };

        Ok(ExecOutput {
            exit_code,
            stdout: stdout_buf,
            stderr: stderr_buf,
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        ensure_parent_dirs: bool,
    ) -> Result<()> {
        self.check_alive()?;
        if ensure_parent_dirs {
            if let Some(parent) = std::path::Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.check_alive()?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_files_parallel(
        &self,
        files: Vec<FileUpload>,
        concurrency: usize,
    ) -> Result<()> {
        self.check_alive()?;
        let results: Vec<Result<()>> = stream::iter(files)
            .map(|file| async move {
                if let Some(parent) = std::path::Path::new(&file.path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&file.path, &file.contents).await?;
                Ok(())
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_command_and_captures_streams() {
        let sandbox = LocalSandbox::new();
        let out = sandbox
            .run_simple("echo hello && echo oops >&2", 10)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn streams_lines_through_callback() {
        let seen: Arc<line_collector::Collector> = Arc::new(line_collector::Collector::new());
        let seen_ref = seen.clone();
        let sandbox = LocalSandbox::new();
        let req = ExecRequest::shell("printf 'a\\nb\\n'")
            .timeout(10)
            .on_stdout(Arc::new(move |line| seen_ref.push(line)));
        let out = sandbox.run(req).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(seen.take(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn timeout_reports_exit_code_124() {
        let sandbox = LocalSandbox::new();
        let out = sandbox.run_simple("sleep 5", 1).await.unwrap();
        assert!(out.timed_out());
        assert_eq!(out.exit_code, EXIT_TIMEOUT);
    }

    #[tokio::test]
    async fn file_roundtrip_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/file.txt");
        let path_str = path.to_str().unwrap();

        let sandbox = LocalSandbox::new();
        sandbox.write_file(path_str, b"payload", true).await.unwrap();
        let read = sandbox.read_file(path_str).await.unwrap();
        assert_eq!(read, b"payload");
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_blocks_commands() {
        let sandbox = LocalSandbox::new();
        sandbox.terminate().await.unwrap();
        sandbox.terminate().await.unwrap();
        assert!(sandbox.run_simple("true", 5).await.is_err());
    }

    /// Tiny mutex-based line collector so tests avoid extra dev-deps.
    mod line_collector {
        pub struct Collector(std::sync::Mutex<Vec<String>>);

        impl Collector {
            pub fn new() -> Self {
                Self(std::sync::Mutex::new(Vec::new()))
            }

            pub fn push(&self, line: &str) {
                self.0.lock().unwrap().push(line.to_owned());
            }

            pub fn take(&self) -> Vec<String> {
                std::mem::take(&mut self.0.lock().unwrap())
            }
        }
    }
}
