//! Evaluation scheduler: bounded-concurrency commit evaluations,
//! out-of-band of the agent's work.
//!
//! One evaluation per commit, ever. Workers acquire a semaphore permit
//! before flipping the record to `running`, so at most
//! `EVALUATION_CONCURRENCY` evaluations run at once. Results post back
//! into the shared trajectory; a winning result fires the on-winner
//! callback from the worker task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ec_domain::{EvalEvent, EvalEventKind, EvalStatus, EvaluationRecord};
use ec_sandbox::Sandbox;
use ec_store::{LogSink, SharedTrajectory, TraceStore};

use crate::envoi::{
    build_commit_evaluation_command, eval_repo_dir, eval_run_from_output, EvalRun,
};

pub type ShouldStop = Arc<dyn Fn() -> bool + Send + Sync>;
pub type OnWinner = Arc<dyn Fn(&str, &EvaluationRecord) + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EvaluationScheduler {
    sandbox: Arc<dyn Sandbox>,
    trace: SharedTrajectory,
    store: Arc<TraceStore>,
    sink: LogSink,
    envoi_url: String,
    test_path: String,
    timeout_seconds: u64,
    semaphore: Arc<Semaphore>,
    should_stop: ShouldStop,
    on_winner: OnWinner,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    seen_commits: Mutex<HashSet<String>>,
}

pub struct SchedulerConfig {
    pub envoi_url: String,
    pub test_path: String,
    pub timeout_seconds: u64,
    pub concurrency: usize,
}

impl EvaluationScheduler {
    /// Build the scheduler. Evaluations left `queued`/`running` by a
    /// prior interrupted run are marked failed up front so resume never
    /// reports a phantom in-flight evaluation.
    pub async fn new(
        sandbox: Arc<dyn Sandbox>,
        trace: SharedTrajectory,
        store: Arc<TraceStore>,
        sink: LogSink,
        config: SchedulerConfig,
        should_stop: ShouldStop,
        on_winner: OnWinner,
    ) -> Arc<Self> {
        let mut interrupted = Vec::new();
        let seen: HashSet<String> = {
            let mut guard = trace.lock();
            let now = Utc::now().to_rfc3339();
            for evaluation in guard.evaluations.values_mut() {
                if matches!(evaluation.status, EvalStatus::Queued | EvalStatus::Running) {
                    evaluation.status = EvalStatus::Failed;
                    evaluation.error =
                        Some("Interrupted before evaluation completed".to_owned());
                    evaluation.completed_at = Some(now.clone());
                    interrupted.push(evaluation.clone());
                }
            }
            for evaluation in &interrupted {
                guard.append_eval_event(EvalEvent::from_record(
                    evaluation,
                    EvalEventKind::CommitAsync,
                ));
            }
            guard.evaluations.keys().cloned().collect()
        };

        let scheduler = Arc::new(Self {
            sandbox,
            trace,
            store,
            sink,
            envoi_url: config.envoi_url,
            test_path: config.test_path,
            timeout_seconds: config.timeout_seconds,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            should_stop,
            on_winner,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            seen_commits: Mutex::new(seen),
        });

        if !interrupted.is_empty() {
            scheduler.save().await;
        }
        scheduler
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.lock().iter().any(|t| !t.is_finished())
    }

    /// Queue an evaluation for a newly observed commit. No-op once a
    /// winner latched or when the commit was already scheduled.
    pub async fn schedule(self: &Arc<Self>, commit: &str, part: u32, turn: u32) {
        if (self.should_stop)() {
            return;
        }
        if !self.seen_commits.lock().insert(commit.to_owned()) {
            return;
        }

        let evaluation = EvaluationRecord {
            eval_id: uuid::Uuid::new_v4().simple().to_string(),
            commit: commit.to_owned(),
            part,
            trigger_turn: turn,
            status: EvalStatus::Queued,
            queued_at: Some(Utc::now().to_rfc3339()),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            passed: 0,
            failed: 0,
            total: 0,
            suite_results: Default::default(),
            tests: Vec::new(),
            payload: None,
            command: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
        };

        self.sink.info(
            "evaluator",
            "eval.queued",
            format!("queued commit {} from part {part}", short(commit)),
            serde_json::json!({"commit": commit, "part": part, "turn": turn}),
        );

        {
            let mut guard = self.trace.lock();
            guard
                .evaluations
                .insert(commit.to_owned(), evaluation.clone());
            guard.append_eval_event(EvalEvent::from_record(
                &evaluation,
                EvalEventKind::CommitAsync,
            ));
        }
        self.save().await;

        let scheduler = Arc::clone(self);
        let commit = commit.to_owned();
        let handle = tokio::spawn(async move {
            scheduler.run_one(commit).await;
        });
        self.tasks.lock().push(handle);
    }

    /// Worker: wait for a permit, run the evaluation, post the result.
    async fn run_one(self: Arc<Self>, commit: String) {
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                }
            }
        };

        {
            let mut guard = self.trace.lock();
            let Some(evaluation) = guard.evaluations.get_mut(&commit) else {
                return;
            };
            // Skip work that cancel_pending already failed.
            if evaluation.status != EvalStatus::Queued {
                return;
            }
            evaluation.status = EvalStatus::Running;
            evaluation.started_at = Some(Utc::now().to_rfc3339());
            let event = EvalEvent::from_record(evaluation, EvalEventKind::CommitAsync);
            guard.append_eval_event(event);
        }
        self.save().await;

        let repo_dir = eval_repo_dir(&commit);
        let command = build_commit_evaluation_command(
            &commit,
            &repo_dir,
            &self.envoi_url,
            &self.test_path,
        );
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self
                .sandbox
                .run_simple(&command, self.timeout_seconds) => Some(result),
        };

        let winner = {
            let mut guard = self.trace.lock();
            let Some(evaluation) = guard.evaluations.get_mut(&commit) else {
                return;
            };
            match outcome {
                Some(Ok(output)) => {
                    apply_result(evaluation, eval_run_from_output(command, output));
                }
                Some(Err(e)) => {
                    apply_failure(evaluation, &e.to_string());
                    evaluation.command = Some(command);
                }
                None => {
                    apply_failure(evaluation, "Cancelled during shutdown");
                }
            }
            if evaluation.duration_ms.is_none() {
                evaluation.duration_ms = Some(started.elapsed().as_millis() as i64);
            }
            evaluation.completed_at = Some(Utc::now().to_rfc3339());
            let event = EvalEvent::from_record(evaluation, EvalEventKind::CommitAsync);
            let snapshot = evaluation.clone();
            guard.append_eval_event(event);
            snapshot
        };

        if winner.is_no_tests() {
            self.sink.info(
                "evaluator",
                "eval.no_tests",
                format!("commit {} status=no_tests", short(&commit)),
                serde_json::json!({"commit": commit}),
            );
        } else {
            let level_event = if winner.status == EvalStatus::Failed {
                "eval.failed"
            } else {
                "eval.completed"
            };
            self.sink.info(
                "evaluator",
                level_event,
                format!(
                    "commit {} status={} passed={}/{}",
                    short(&commit),
                    winner.status,
                    winner.passed,
                    winner.total
                ),
                serde_json::json!({
                    "commit": commit,
                    "status": winner.status.as_str(),
                    "passed": winner.passed,
                    "total": winner.total,
                }),
            );
        }
        self.save().await;

        if winner.is_winning() {
            (self.on_winner)(&commit, &winner);
        }

        drop(permit);
    }

    /// Drain all in-flight workers before returning.
    pub async fn wait(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    /// Fail queued evaluations with `reason`, cancel running workers,
    /// and fail their records unless they already finished.
    pub async fn cancel_pending(&self, reason: &str) {
        self.cancel.cancel();

        {
            let mut guard = self.trace.lock();
            let now = Utc::now().to_rfc3339();
            let mut events = Vec::new();
            for evaluation in guard.evaluations.values_mut() {
                if matches!(evaluation.status, EvalStatus::Queued | EvalStatus::Running) {
                    evaluation.status = EvalStatus::Failed;
                    if evaluation.error.is_none() {
                        evaluation.error = Some(reason.to_owned());
                    }
                    if evaluation.completed_at.is_none() {
                        evaluation.completed_at = Some(now.clone());
                    }
                    events.push(EvalEvent::from_record(
                        evaluation,
                        EvalEventKind::CommitAsync,
                    ));
                }
            }
            for event in events {
                guard.append_eval_event(event);
            }
        }

        let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in &pending {
            handle.abort();
        }
        for handle in pending {
            let _ = handle.await;
        }
        self.save().await;
    }

    async fn save(&self) {
        if let Err(e) = self.store.save(&self.trace).await {
            self.sink.warn(
                "evaluator",
                "trace.save_failed",
                format!("snapshot save failed: {e}"),
                serde_json::Value::Null,
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result application
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fold a finished command into the record. Nonzero exit or a missing
/// marker line both mean `failed`; otherwise the payload is applied.
fn apply_result(evaluation: &mut EvaluationRecord, run: EvalRun) {
    evaluation.command = Some(run.command);
    evaluation.exit_code = Some(run.exit_code);
    evaluation.stdout = Some(run.stdout);
    evaluation.stderr = Some(run.stderr);

    if run.exit_code != 0 {
        evaluation.status = EvalStatus::Failed;
        evaluation.error = Some(format!(
            "Evaluation command failed with exit code {}",
            run.exit_code
        ));
        clear_results(evaluation);
        return;
    }

    let Some(payload) = run.payload else {
        evaluation.status = EvalStatus::Failed;
        evaluation.error = Some("Missing evaluation payload in command output".to_owned());
        clear_results(evaluation);
        return;
    };

    evaluation.status = EvalStatus::Completed;
    evaluation.error = payload.error.clone().filter(|e| !e.trim().is_empty());
    evaluation.duration_ms = Some(payload.duration_ms);
    evaluation.passed = payload.passed;
    evaluation.failed = payload.failed;
    evaluation.total = payload.total;
    evaluation.suite_results = payload.suite_results.clone();
    evaluation.tests = payload.tests.clone();
    evaluation.payload = Some(payload.to_value());
}

fn apply_failure(evaluation: &mut EvaluationRecord, error: &str) {
    evaluation.status = EvalStatus::Failed;
    evaluation.error = Some(error.to_owned());
    clear_results(evaluation);
}

fn clear_results(evaluation: &mut EvaluationRecord) {
    evaluation.passed = 0;
    evaluation.failed = 0;
    evaluation.total = 0;
    evaluation.suite_results = Default::default();
    evaluation.tests = Vec::new();
    evaluation.payload = None;
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(10)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoi::EvalPayload;
    use ec_sandbox::ExecOutput;

    fn queued(commit: &str) -> EvaluationRecord {
        EvaluationRecord {
            eval_id: "e".into(),
            commit: commit.into(),
            part: 1,
            trigger_turn: 1,
            status: EvalStatus::Queued,
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            passed: 0,
            failed: 0,
            total: 0,
            suite_results: Default::default(),
            tests: Vec::new(),
            payload: None,
            command: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
        }
    }

    #[test]
    fn nonzero_exit_fails_the_evaluation() {
        let mut evaluation = queued("abc");
        apply_result(
            &mut evaluation,
            eval_run_from_output(
                "cmd".into(),
                ExecOutput {
                    exit_code: 2,
                    stdout: String::new(),
                    stderr: "boom".into(),
                    duration_ms: 10,
                },
            ),
        );
        assert_eq!(evaluation.status, EvalStatus::Failed);
        assert!(evaluation.error.as_deref().unwrap().contains("exit code 2"));
    }

    #[test]
    fn missing_marker_fails_the_evaluation() {
        let mut evaluation = queued("abc");
        apply_result(
            &mut evaluation,
            eval_run_from_output(
                "cmd".into(),
                ExecOutput {
                    exit_code: 0,
                    stdout: "no marker here\n".into(),
                    stderr: String::new(),
                    duration_ms: 10,
                },
            ),
        );
        assert_eq!(evaluation.status, EvalStatus::Failed);
        assert!(evaluation
            .error
            .as_deref()
            .unwrap()
            .contains("Missing evaluation payload"));
    }

    #[test]
    fn payload_is_applied_on_success() {
        let payload = EvalPayload {
            duration_ms: 1234,
            passed: 7,
            failed: 0,
            total: 7,
            ..Default::default()
        };
        let stdout = format!(
            "{}{}\n",
            crate::envoi::EVALUATION_JSON_MARKER,
            serde_json::to_string(&payload).unwrap()
        );
        let mut evaluation = queued("abc");
        apply_result(
            &mut evaluation,
            eval_run_from_output(
                "cmd".into(),
                ExecOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                    duration_ms: 10,
                },
            ),
        );
        assert_eq!(evaluation.status, EvalStatus::Completed);
        assert_eq!(evaluation.passed, 7);
        assert!(evaluation.is_winning());
    }
}
