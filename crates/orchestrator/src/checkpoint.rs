//! Workspace checkpointer: commit file changes after a part and record
//! the resulting HEAD.
//!
//! Never fails the turn. A git failure is logged and the part keeps the
//! prior HEAD as both commit_before and commit_after. A commit whose
//! tree equals its parent's is silently skipped (`git commit` refuses,
//! `|| true` keeps the sequence going, and HEAD stays put).

use ec_domain::RepoCheckpoint;
use ec_sandbox::Sandbox;

use crate::envoi::sh_quote;

pub const GIT_AUTHOR_NAME: &str = "Agent";
pub const GIT_AUTHOR_EMAIL: &str = "agent@example.com";

/// Read the workspace HEAD, or `None` when unavailable.
pub async fn get_git_commit(sandbox: &dyn Sandbox) -> Option<String> {
    let output = sandbox
        .run_simple("cd /workspace && git rev-parse HEAD", 30)
        .await
        .ok()?;
    if !output.success() {
        return None;
    }
    let head = output.stdout.trim();
    (!head.is_empty()).then(|| head.to_owned())
}

/// Stage and commit everything in the workspace, then report HEAD.
///
/// `prev_head` is the last HEAD this trajectory observed; it becomes
/// `commit_before` and the fallback `commit_after` on failure.
pub async fn checkpoint_workspace(
    sandbox: &dyn Sandbox,
    part: u32,
    files_changed: &[String],
    prev_head: Option<&str>,
) -> RepoCheckpoint {
    let message = format!("checkpoint after part {part}");
    let command = format!(
        "cd /workspace && git add -A && \
         (git -c user.name={} -c user.email={} commit -q -m {} || true) && \
         git rev-parse HEAD",
        sh_quote(GIT_AUTHOR_NAME),
        sh_quote(GIT_AUTHOR_EMAIL),
        sh_quote(&message),
    );

    let commit_before = prev_head.map(str::to_owned);
    match sandbox.run_simple(&command, 120).await {
        Ok(output) if output.success() => {
            let head = output.stdout.lines().last().unwrap_or("").trim().to_owned();
            let commit_after = if head.is_empty() {
                commit_before.clone()
            } else {
                Some(head)
            };
            RepoCheckpoint {
                commit_before,
                commit_after,
                files_changed: files_changed.to_vec(),
                message,
            }
        }
        Ok(output) => {
            tracing::warn!(
                part,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "workspace checkpoint failed"
            );
            RepoCheckpoint {
                commit_after: commit_before.clone(),
                commit_before,
                files_changed: files_changed.to_vec(),
                message,
            }
        }
        Err(e) => {
            tracing::warn!(part, error = %e, "workspace checkpoint errored");
            RepoCheckpoint {
                commit_after: commit_before.clone(),
                commit_before,
                files_changed: files_changed.to_vec(),
                message,
            }
        }
    }
}

/// Force-checkout a commit in the workspace. Returns false on failure.
pub async fn checkout_commit(sandbox: &dyn Sandbox, commit: &str) -> bool {
    let command = format!(
        "cd /workspace && git checkout -q -f {}",
        sh_quote(commit)
    );
    match sandbox.run_simple(&command, 60).await {
        Ok(output) if output.success() => {
            tracing::info!(commit = %&commit[..commit.len().min(10)], "checked out commit");
            true
        }
        Ok(output) => {
            tracing::warn!(
                commit = %&commit[..commit.len().min(10)],
                stderr = %output.stderr.trim(),
                "failed to checkout commit"
            );
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "checkout errored");
            false
        }
    }
}
