//! Session finalizer: winner projection, bundle export, final flushes.
//!
//! Runs on every loop exit, normal or not. Each step is best-effort;
//! a failure is logged and the remaining steps still run, so the trace
//! and logs reach the store even on a dying run.

use std::sync::Arc;

use serde_json::Value;

use ec_domain::{Artifacts, EvalTestResult, SessionEnd, StopReason};
use ec_sandbox::Sandbox;
use ec_store::{
    parse_jsonl_records, trajectory_key, BlobStore, LogRecord, LogSink, SharedTrajectory,
    TraceStore,
};

use crate::checkpoint::{checkout_commit, get_git_commit};
use crate::envoi::sh_quote;
use crate::latch::WinnerLatch;
use crate::logsflush::LogFlusher;

const BUNDLE_EXPORT_REF: &str = "__envoi_bundle_export__";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resume helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Restore `/workspace` from the prior run's git bundle, checked out at
/// `commit`. Returns false (and logs) when the bundle is absent or the
/// restore fails; the caller continues with a fresh workspace.
pub async fn restore_workspace_from_bundle(
    sandbox: &dyn Sandbox,
    blobs: &dyn BlobStore,
    trajectory_id: &str,
    commit: &str,
    sink: &LogSink,
) -> bool {
    let key = trajectory_key(trajectory_id, "repo.bundle");
    let bundle = match blobs.get(&key).await {
        Ok(Some(bytes)) if !bytes.is_empty() => bytes,
        Ok(_) => {
            sink.info(
                "resume",
                "resume.bundle_missing",
                "repo.bundle not found; continuing without workspace restore",
                Value::Null,
            );
            return false;
        }
        Err(e) => {
            sink.warn(
                "resume",
                "resume.bundle_read_failed",
                format!("failed to read repo.bundle: {e}"),
                Value::Null,
            );
            return false;
        }
    };

    if let Err(e) = sandbox
        .write_file("/tmp/resume.bundle", &bundle, false)
        .await
    {
        sink.warn(
            "resume",
            "resume.bundle_upload_failed",
            format!("failed to upload bundle into sandbox: {e}"),
            Value::Null,
        );
        return false;
    }

    let restore_cmd = format!(
        "set -euo pipefail\n\
         rm -rf /tmp/resume_repo\n\
         git clone -q /tmp/resume.bundle /tmp/resume_repo\n\
         cd /tmp/resume_repo\n\
         git checkout -q {}\n\
         rm -rf /workspace\n\
         mkdir -p /workspace\n\
         cp -a /tmp/resume_repo/. /workspace/\n\
         cd /workspace\n\
         git config user.email 'agent@example.com'\n\
         git config user.name 'Agent'\n",
        sh_quote(commit)
    );
    match sandbox.run_simple(&restore_cmd, 300).await {
        Ok(output) if output.success() => {
            sink.info(
                "resume",
                "resume.workspace_restored",
                format!("restored workspace from bundle at commit {commit}"),
                Value::Null,
            );
            true
        }
        Ok(output) => {
            sink.warn(
                "resume",
                "resume.restore_failed",
                format!("workspace restore failed: {}", output.stderr.trim()),
                Value::Null,
            );
            false
        }
        Err(e) => {
            sink.warn(
                "resume",
                "resume.restore_failed",
                format!("workspace restore errored: {e}"),
                Value::Null,
            );
            false
        }
    }
}

/// The most recent completed turn-end evaluation's test list, used to
/// seed regression feedback after a resume.
pub fn find_latest_turn_end_tests(
    trace: &ec_domain::Trajectory,
) -> Option<Vec<EvalTestResult>> {
    for part in trace.parts.iter().rev() {
        for event in part.eval_events_delta.iter().rev() {
            if event.kind != ec_domain::EvalEventKind::TurnEndBlocking {
                continue;
            }
            if event.status != ec_domain::EvalStatus::Completed {
                continue;
            }
            if event.tests.is_empty() {
                continue;
            }
            return Some(event.tests.clone());
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox log collection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Collect structured runtime/worker logs written under sandbox /tmp.
pub async fn collect_sandbox_structured_logs(sandbox: &dyn Sandbox) -> Vec<LogRecord> {
    let listing = match sandbox
        .run_simple("ls -1 /tmp/envoi_*.jsonl 2>/dev/null || true", 30)
        .await
    {
        Ok(output) if output.success() => output,
        _ => return Vec::new(),
    };

    let mut paths: Vec<&str> = listing
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    paths.sort_unstable();

    let mut records = Vec::new();
    for path in paths {
        let source = if path.contains("runtime") {
            "runtime"
        } else {
            "session_worker"
        };
        match sandbox
            .run_simple(&format!("cat {}", sh_quote(path)), 60)
            .await
        {
            Ok(output) if output.success() => {
                records.extend(parse_jsonl_records(&output.stdout, source, path));
            }
            Ok(output) => {
                tracing::warn!(path, stderr = %output.stderr.trim(), "failed reading sandbox log file");
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "failed reading sandbox log file");
            }
        }
    }
    records
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// End of session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EndSessionParams {
    pub reason: StopReason,
    pub part_count: u32,
    pub turn_count: u32,
    pub final_commit_hint: Option<String>,
}

/// Fix the session end, project to the winner, export the bundle, and
/// flush everything. The sandbox stays alive; the caller terminates it.
pub async fn end_session(
    sandbox: &dyn Sandbox,
    blobs: &dyn BlobStore,
    trace: &SharedTrajectory,
    store: &Arc<TraceStore>,
    sink: &LogSink,
    flusher: &Arc<LogFlusher>,
    latch: &WinnerLatch,
    mut params: EndSessionParams,
) {
    if params.part_count == 0 && params.turn_count == 0 {
        sink.info(
            "finalize",
            "end.nothing_to_save",
            "nothing to save (0 parts), skipping export",
            Value::Null,
        );
        return;
    }

    // Prefer the live workspace HEAD over the loop's last observation.
    let mut final_commit = params.final_commit_hint.clone();
    if let Some(head) = get_git_commit(sandbox).await {
        final_commit = Some(head);
    }

    // Re-scan for a winner; projection may shrink the trace.
    let winner = {
        let guard = trace.lock();
        guard
            .first_winning()
            .map(|(commit, evaluation)| (commit.to_owned(), evaluation.part))
    };
    let mut bundle_export_commit = final_commit.clone();
    if let Some((winner_commit, winner_part)) = &winner {
        {
            let mut guard = trace.lock();
            guard.apply_winner_projection(winner_commit, *winner_part);
            params.part_count = guard.last_part();
            params.turn_count = guard.last_turn();
        }
        final_commit = Some(winner_commit.clone());
        bundle_export_commit = Some(winner_commit.clone());

        let checked_out = checkout_commit(sandbox, winner_commit).await;
        if checked_out {
            params.reason = StopReason::Solved;
            sink.info(
                "finalize",
                "winner.finalized",
                format!(
                    "final winner commit={} part={winner_part}",
                    &winner_commit[..winner_commit.len().min(10)]
                ),
                serde_json::json!({"commit": winner_commit, "part": winner_part}),
            );
        } else if !latch.is_latched() {
            // Winner only surfaced during finalization and the checkout
            // failed; the workspace does not reflect it.
            sink.warn(
                "finalize",
                "winner.checkout_failed",
                "winning commit checkout failed; keeping prior stop reason",
                serde_json::json!({"commit": winner_commit}),
            );
        } else {
            params.reason = StopReason::Solved;
        }
    }

    // Fix the session end before any sandbox-dependent export step.
    let trajectory_id = {
        let mut guard = trace.lock();
        guard.session_end = Some(SessionEnd {
            reason: params.reason,
            total_parts: params.part_count,
            total_turns: params.turn_count,
            final_git_commit: final_commit.clone(),
        });
        guard.artifacts = Some(Artifacts {
            trace_parquet: Some(store.trace_uri()),
            repo_bundle: None,
            logs_parquet: Some(flusher.logs_uri()),
        });
        guard.trajectory_id.clone()
    };
    save_logged(store, trace, sink).await;

    // Export the git bundle of the chosen commit (winner, else HEAD).
    match export_bundle(
        sandbox,
        blobs,
        &trajectory_id,
        bundle_export_commit.as_deref(),
    )
    .await
    {
        Ok(Some(bundle_uri)) => {
            store.set_bundle_uri(bundle_uri.clone());
            let mut guard = trace.lock();
            if let Some(artifacts) = &mut guard.artifacts {
                artifacts.repo_bundle = Some(bundle_uri);
            }
        }
        Ok(None) => {}
        Err(e) => {
            sink.warn(
                "finalize",
                "bundle.export_failed",
                format!("bundle export failed: {e}"),
                Value::Null,
            );
        }
    }
    save_logged(store, trace, sink).await;

    // Merge sandbox-side structured logs, then force the final flush.
    let sandbox_logs = collect_sandbox_structured_logs(sandbox).await;
    if !sandbox_logs.is_empty() {
        sink.extend(sandbox_logs);
    }
    if let Err(e) = flusher.flush(true).await {
        sink.warn(
            "finalize",
            "logs.final_flush_failed",
            format!("final logs flush failed: {e}"),
            Value::Null,
        );
    }

    sink.info(
        "finalize",
        "session.ended",
        format!(
            "reason={} parts={} turns={}",
            params.reason, params.part_count, params.turn_count
        ),
        serde_json::json!({
            "reason": params.reason.as_str(),
            "total_parts": params.part_count,
            "total_turns": params.turn_count,
            "final_commit": final_commit,
        }),
    );
}

/// Create and upload the git bundle. The export ref is a temporary
/// branch at the chosen commit, deleted again on exit.
async fn export_bundle(
    sandbox: &dyn Sandbox,
    blobs: &dyn BlobStore,
    trajectory_id: &str,
    export_commit: Option<&str>,
) -> ec_domain::Result<Option<String>> {
    let target = export_commit
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("HEAD");
    let bundle_cmd = format!(
        "set -euo pipefail\n\
         cd /workspace\n\
         git branch -f {r} {t}\n\
         cleanup() {{\n\
           git branch -D {r} >/dev/null 2>&1 || true\n\
         }}\n\
         trap cleanup EXIT\n\
         git bundle create /tmp/repo.bundle refs/heads/{r}\n",
        r = BUNDLE_EXPORT_REF,
        t = sh_quote(target),
    );
    let output = sandbox.run_simple(&bundle_cmd, 120).await?;
    if !output.success() {
        return Err(ec_domain::Error::Git(format!(
            "git bundle create failed: {}",
            output.stderr.trim()
        )));
    }

    let bundle = sandbox.read_file("/tmp/repo.bundle").await?;
    if bundle.is_empty() {
        return Ok(None);
    }
    tracing::info!(bytes = bundle.len(), "bundle exported");
    let uri = blobs
        .put(&trajectory_key(trajectory_id, "repo.bundle"), bundle)
        .await?;
    Ok(Some(uri))
}

async fn save_logged(store: &Arc<TraceStore>, trace: &SharedTrajectory, sink: &LogSink) {
    if let Err(e) = store.save(trace).await {
        sink.error(
            "finalize",
            "trace.save_failed",
            format!("final snapshot save failed: {e}"),
            Value::Null,
        );
    }
}
