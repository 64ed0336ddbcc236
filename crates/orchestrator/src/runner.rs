//! The trajectory runner: setup, resume, the main turn loop, and the
//! hand-off to the session finalizer.
//!
//! The coordinator task here is the only writer to parts, turns, and
//! the session end. Every external call converts failure into either a
//! failed-record entry or a loop-state transition; nothing is thrown
//! past this function once the run is underway.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use ec_agent::{Agent, AgentSetupContext, TurnRequest, TurnTimeoutParams};
use ec_domain::{
    EvalTestResult, OrchestratorConfig, PartPayload, Result, StopReason, Trajectory, TurnRecord,
};
use ec_sandbox::Sandbox;
use ec_store::{BlobStore, LogSink, SharedTrajectory, TraceStore};

use crate::advisor::{AdvisorClient, AdvisorConfig};
use crate::envoi::{
    build_workspace_evaluation_command, discover_test_paths, eval_run_from_output,
    validate_selected_paths,
};
use crate::evaluator::{EvaluationScheduler, SchedulerConfig};
use crate::feedback::{
    build_followup_prompt, build_turn_end_eval_event, format_turn_end_feedback,
};
use crate::finalize::{
    end_session, find_latest_turn_end_tests, restore_workspace_from_bundle, EndSessionParams,
};
use crate::latch::WinnerLatch;
use crate::logsflush::LogFlusher;
use crate::stream::{send_client_interrupt, PartStreamPipeline};
use crate::tracker::SolveTracker;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunParams {
    /// Reuse an id to resume a prior run; `None` mints a fresh one.
    pub trajectory_id: Option<String>,
    pub model: String,
    pub environment: String,
    /// The task's initial prompt.
    pub task_prompt: String,
    pub task_params: Value,
    pub max_parts: Option<u32>,
    pub max_turns: Option<u32>,
    pub run_timeout_seconds: u64,
    /// Explicitly selected test paths; empty means server default.
    pub test_paths: Vec<String>,
    pub setup: AgentSetupContext,
    pub advisor: Option<AdvisorConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one full trajectory. Returns the trajectory id; the sandbox is
/// terminated before returning.
pub async fn run_trajectory(
    agent: Arc<dyn Agent>,
    sandbox: Arc<dyn Sandbox>,
    blobs: Arc<dyn BlobStore>,
    config: OrchestratorConfig,
    params: RunParams,
) -> Result<String> {
    let trajectory_id = params
        .trajectory_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let sink = LogSink::new(config.logs_flush_batch_size);
    sink.bind_context(Some(trajectory_id.clone()), None, None, None);
    let flusher = LogFlusher::new(
        sink.clone(),
        Arc::clone(&blobs),
        trajectory_id.clone(),
        config.logs_flush_interval_seconds,
        config.logs_flush_batch_size,
    );
    let flush_task = flusher.spawn();

    let outcome = run_inner(
        Arc::clone(&agent),
        Arc::clone(&sandbox),
        Arc::clone(&blobs),
        &config,
        &params,
        &trajectory_id,
        &sink,
        &flusher,
    )
    .await;

    if let Err(e) = &outcome {
        sink.error(
            "runner",
            "run.setup_failed",
            format!("trajectory setup failed: {e}"),
            Value::Null,
        );
        let _ = flusher.flush(true).await;
    }

    flusher.stop();
    let _ = flush_task.await;
    if let Err(e) = sandbox.terminate().await {
        tracing::warn!(error = %e, "sandbox terminate failed");
    }

    outcome.map(|_| trajectory_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Setup + main loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn run_inner(
    agent: Arc<dyn Agent>,
    sandbox: Arc<dyn Sandbox>,
    blobs: Arc<dyn BlobStore>,
    config: &OrchestratorConfig,
    params: &RunParams,
    trajectory_id: &str,
    sink: &LogSink,
    flusher: &Arc<LogFlusher>,
) -> Result<()> {
    let start_time = Instant::now();

    // ── Resume: load a prior snapshot for the same trajectory id ────
    let existing = if config.resume_from_store {
        match TraceStore::load(blobs.as_ref(), trajectory_id).await {
            Ok(existing) => existing,
            Err(e) => {
                sink.warn(
                    "resume",
                    "resume.load_failed",
                    format!("snapshot load failed, starting fresh: {e}"),
                    Value::Null,
                );
                None
            }
        }
    } else {
        None
    };
    let existing = existing.filter(|trace| {
        if trace.agent != agent.name() {
            sink.info(
                "resume",
                "resume.agent_mismatch",
                format!(
                    "existing trajectory agent={} differs from requested agent={}; starting fresh",
                    trace.agent,
                    agent.name()
                ),
                Value::Null,
            );
            false
        } else {
            true
        }
    });
    if let Some(trace) = &existing {
        sink.info(
            "resume",
            "resume.found",
            format!(
                "found existing trace: parts={} turns={}",
                trace.parts.len(),
                trace.turns.len()
            ),
            Value::Null,
        );
    }

    let store = Arc::new(TraceStore::new(
        Arc::clone(&blobs),
        trajectory_id,
        params.environment.clone(),
        params.task_params.clone(),
    ));

    // ── Provision agent, restore workspace, open session ────────────
    agent.setup(sandbox.as_ref(), &params.setup).await?;

    if let Some(commit) = existing.as_ref().and_then(Trajectory::latest_commit) {
        restore_workspace_from_bundle(
            sandbox.as_ref(),
            blobs.as_ref(),
            trajectory_id,
            &commit,
            sink,
        )
        .await;
    }

    let mut session_id = agent.create_session(trajectory_id).await?;
    if session_id.is_empty() {
        return Err(ec_domain::Error::Agent {
            agent: agent.name().to_owned(),
            message: "failed to create session".to_owned(),
        });
    }
    sink.bind_context(None, Some(session_id.clone()), None, None);

    // ── Build or adopt the trajectory tree ──────────────────────────
    let (trace, resumed_part_count, resumed_turn_count, resume_commit) = match existing {
        Some(mut trace) => {
            trace.session_id = session_id.clone();
            trace.agent = agent.name().to_owned();
            trace.agent_model = params.model.clone();
            trace.session_end = None;
            let parts = trace.last_part();
            let turns = trace.last_turn();
            let commit = trace.latest_commit();
            sink.info(
                "resume",
                "resume.continuing",
                format!("continuing from part={parts} turn={turns}"),
                Value::Null,
            );
            (trace, parts, turns, commit)
        }
        None => (
            Trajectory::new(
                trajectory_id.to_owned(),
                session_id.clone(),
                agent.name().to_owned(),
                params.model.clone(),
                Utc::now().to_rfc3339(),
            ),
            0,
            0,
            None,
        ),
    };
    let previous_turn_end_seed = find_latest_turn_end_tests(&trace);
    let resume_calls: Vec<ec_domain::EnvoiCall> = trace
        .parts
        .iter()
        .flat_map(|p| p.envoi_calls.iter().cloned())
        .collect();
    let trace: SharedTrajectory = Arc::new(parking_lot::Mutex::new(trace));
    if let Err(e) = store.save(&trace).await {
        sink.warn(
            "runner",
            "trace.save_failed",
            format!("initial snapshot save failed: {e}"),
            Value::Null,
        );
    }

    // ── Discover test paths from the server schema ──────────────────
    let required_paths =
        discover_test_paths(sandbox.as_ref(), &config.evaluation_envoi_url).await?;
    if required_paths.is_empty() {
        sink.info(
            "runner",
            "schema.unavailable",
            "schema unavailable, running without completion tracking",
            Value::Null,
        );
    } else {
        sink.info(
            "runner",
            "schema.discovered",
            format!("discovered {} test paths", required_paths.len()),
            serde_json::json!({"count": required_paths.len()}),
        );
    }
    if !params.test_paths.is_empty() && !required_paths.is_empty() {
        let invalid = validate_selected_paths(&params.test_paths, &required_paths);
        if !invalid.is_empty() {
            return Err(ec_domain::Error::Config(format!(
                "unknown test path(s): {}",
                invalid.join(", ")
            )));
        }
    }
    store.set_suites(serde_json::json!({ "required_paths": &required_paths }));

    let eval_test_path = params
        .test_paths
        .first()
        .cloned()
        .unwrap_or_else(|| config.evaluation_test_path.clone());

    // ── Winner latch, evaluator, pipeline ───────────────────────────
    let latch = Arc::new(WinnerLatch::new());
    let on_winner = {
        let latch = Arc::clone(&latch);
        let sandbox = Arc::clone(&sandbox);
        let sink = sink.clone();
        let patterns = agent.client_process_patterns();
        Arc::new(move |commit: &str, evaluation: &ec_domain::EvaluationRecord| {
            if latch.latch(evaluation.part) {
                sink.info(
                    "evaluator",
                    "winner.latched",
                    format!(
                        "latched first winner commit={} part={} score={}/{}",
                        &commit[..commit.len().min(10)],
                        evaluation.part,
                        evaluation.passed,
                        evaluation.total
                    ),
                    serde_json::json!({
                        "commit": commit,
                        "part": evaluation.part,
                    }),
                );
                send_client_interrupt(Arc::clone(&sandbox), patterns.clone(), sink.clone());
            }
        })
    };
    let should_stop = {
        let latch = Arc::clone(&latch);
        Arc::new(move || latch.is_latched())
    };
    let evaluator = EvaluationScheduler::new(
        Arc::clone(&sandbox),
        Arc::clone(&trace),
        Arc::clone(&store),
        sink.clone(),
        SchedulerConfig {
            envoi_url: config.evaluation_envoi_url.clone(),
            test_path: eval_test_path.clone(),
            timeout_seconds: config.evaluation_timeout_seconds,
            concurrency: config.evaluation_concurrency,
        },
        should_stop,
        on_winner,
    )
    .await;

    // Seed the latch from any prior winning evaluation.
    if let Some((_, part)) = {
        let guard = trace.lock();
        guard.first_winning().map(|(c, e)| (c.to_owned(), e.part))
    } {
        latch.latch(part);
    }

    // A fresh run still starts from the workspace's root commit.
    let resume_commit = match resume_commit {
        Some(commit) => Some(commit),
        None => crate::checkpoint::get_git_commit(sandbox.as_ref()).await,
    };

    let mut tracker = SolveTracker::new(required_paths);
    tracker.update(&resume_calls);
    let mut pipeline = PartStreamPipeline::new(
        Arc::clone(&sandbox),
        Arc::clone(&trace),
        Arc::clone(&store),
        sink.clone(),
        Arc::clone(&evaluator),
        Arc::clone(&latch),
        tracker,
        agent.client_process_patterns(),
        session_id.clone(),
        params.model.clone(),
        resumed_part_count,
        resume_commit,
    );

    let advisor = match &params.advisor {
        Some(advisor_config) => match AdvisorClient::new(AdvisorConfig {
            model: advisor_config.model.clone(),
            base_url: advisor_config.base_url.clone(),
            api_key: advisor_config.api_key.clone(),
            timeout_seconds: advisor_config.timeout_seconds,
            failed_tests_limit: advisor_config.failed_tests_limit,
        }) {
            Ok(client) => Some(client),
            Err(e) => {
                sink.warn(
                    "advisor",
                    "advisor.disabled",
                    format!("advisor disabled: {e}"),
                    Value::Null,
                );
                None
            }
        },
        None => None,
    };

    // ── Main loop ───────────────────────────────────────────────────
    let mut turn_count = resumed_turn_count;
    let mut consecutive_failures: u32 = 0;
    let mut next_feedback_eval_id: Option<String> = None;
    let mut previous_turn_end_tests: Option<Vec<EvalTestResult>> = previous_turn_end_seed;
    let mut prompt_text = if pipeline.part_count() == 0 {
        params.task_prompt.clone()
    } else {
        build_followup_prompt(pipeline.tracker(), None, true)
    };
    let end_reason;
    let mut final_commit_hint = pipeline.latest_commit().map(str::to_owned);

    loop {
        sink.bind_context(None, None, Some(turn_count + 1), Some(pipeline.part_count()));

        // Guards, in order: winner, part budget, turn budget, wall clock.
        if let Some(commit) = stop_for_winner(
            &trace, &store, sandbox.as_ref(), &latch, sink, "before turn start",
        )
        .await
        {
            final_commit_hint = Some(commit);
            end_reason = StopReason::Solved;
            break;
        }
        if params
            .max_parts
            .is_some_and(|cap| cap > 0 && pipeline.part_count() >= cap)
        {
            end_reason = StopReason::PartLimit;
            break;
        }
        if params
            .max_turns
            .is_some_and(|cap| cap > 0 && turn_count >= cap)
        {
            sink.info(
                "runner",
                "turn.limit_reached",
                format!("reached turn limit ({turn_count})"),
                Value::Null,
            );
            end_reason = StopReason::PartLimit;
            break;
        }
        let elapsed = start_time.elapsed().as_secs();
        if elapsed > params.run_timeout_seconds {
            end_reason = StopReason::Timeout;
            break;
        }

        let remaining_run_seconds = params.run_timeout_seconds - elapsed;
        let remaining_parts_budget = params
            .max_parts
            .filter(|cap| *cap > 0)
            .map(|cap| cap.saturating_sub(pipeline.part_count()).max(1))
            .unwrap_or(0);
        let remaining_parts_for_timeout = if remaining_parts_budget > 0 {
            remaining_parts_budget
        } else {
            ((remaining_run_seconds / 60).max(1)) as u32
        };
        let turn_timeout_seconds = agent.compute_turn_timeout(TurnTimeoutParams {
            remaining_parts: remaining_parts_for_timeout,
            remaining_run_seconds,
            message_timeout_seconds: config.message_timeout_seconds,
        });

        // Prospective turn record; discarded again if it stays empty.
        turn_count += 1;
        sink.info(
            "runner",
            "turn.started",
            format!(
                "turn {turn_count} (parts={} timeout={turn_timeout_seconds}s)",
                pipeline.part_count()
            ),
            serde_json::json!({"turn": turn_count, "timeout_seconds": turn_timeout_seconds}),
        );
        {
            let mut guard = trace.lock();
            guard.turns.push(TurnRecord {
                turn: turn_count,
                session_id: session_id.clone(),
                timestamp: Utc::now().to_rfc3339(),
                prompt: prompt_text.clone(),
                part_start: None,
                part_end: None,
                git_commit: pipeline.latest_commit().map(str::to_owned),
                feedback_eval_id: next_feedback_eval_id.take(),
                token_usage: None,
            });
        }

        // ── Run the turn, streaming parts through the pipeline ─────
        let request = TurnRequest {
            prompt_text: prompt_text.clone(),
            timeout_seconds: turn_timeout_seconds,
            current_turn: turn_count,
            remaining_parts_budget,
            global_part_count: pipeline.part_count(),
            global_max_parts: params.max_parts.unwrap_or(0),
            global_max_turns: params.max_turns.unwrap_or(0),
            global_elapsed_seconds: elapsed,
        };
        let (tx, mut rx) = mpsc::channel::<PartPayload>(64);
        let agent_for_turn = Arc::clone(&agent);
        let mut turn_future = Box::pin(agent_for_turn.run_turn(request, tx));

        let turn_result = loop {
            tokio::select! {
                maybe_payload = rx.recv() => match maybe_payload {
                    Some(payload) => {
                        if let Err(e) = pipeline.ingest(payload, turn_count).await {
                            sink.warn(
                                "stream",
                                "part.ingest_failed",
                                format!("part ingest failed: {e}"),
                                Value::Null,
                            );
                        }
                    }
                    // Sender gone: the turn future is about to resolve.
                    None => break (&mut turn_future).await,
                },
                result = &mut turn_future => {
                    while let Some(payload) = rx.recv().await {
                        if let Err(e) = pipeline.ingest(payload, turn_count).await {
                            sink.warn(
                                "stream",
                                "part.ingest_failed",
                                format!("part ingest failed: {e}"),
                                Value::Null,
                            );
                        }
                    }
                    break result;
                }
            }
        };
        if let Some(commit) = pipeline.latest_commit() {
            final_commit_hint = Some(commit.to_owned());
        }

        let outcome = match turn_result {
            Ok(outcome) => outcome,
            Err(e) => {
                sink.error(
                    "runner",
                    "turn.errored",
                    format!("turn errored: {e}"),
                    Value::Null,
                );
                None
            }
        };

        // ── Turn failure: recover or give up ───────────────────────
        let Some(outcome) = outcome else {
            if let Some(commit) = stop_for_winner(
                &trace, &store, sandbox.as_ref(), &latch, sink, "after interrupted turn",
            )
            .await
            {
                final_commit_hint = Some(commit);
                end_reason = StopReason::Solved;
                break;
            }
            {
                let mut guard = trace.lock();
                let discard = guard
                    .turns
                    .last()
                    .is_some_and(|t| t.turn == turn_count && !t.has_parts());
                if discard {
                    guard.turns.pop();
                    turn_count -= 1;
                }
            }
            consecutive_failures += 1;
            sink.warn(
                "runner",
                "turn.failed",
                format!(
                    "no response from agent (recovery {consecutive_failures}/{})",
                    config.turn_recovery_retries
                ),
                Value::Null,
            );
            dump_agent_logs(sandbox.as_ref(), agent.as_ref(), sink).await;

            if consecutive_failures <= config.turn_recovery_retries {
                match agent
                    .recover_session(trajectory_id, consecutive_failures)
                    .await
                {
                    Ok(recovered) if !recovered.is_empty() => {
                        session_id = recovered;
                        pipeline.set_session_id(session_id.clone());
                        sink.bind_context(None, Some(session_id.clone()), None, None);
                        trace.lock().session_id = session_id.clone();
                        let _ = store.save(&trace).await;
                        prompt_text = build_followup_prompt(pipeline.tracker(), None, true);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        sink.warn(
                            "runner",
                            "turn.recover_failed",
                            format!("session recovery failed: {e}"),
                            Value::Null,
                        );
                    }
                }
            }
            end_reason = StopReason::AgentError;
            break;
        };

        // ── Successful turn ────────────────────────────────────────
        consecutive_failures = 0;
        if !outcome.session_id.is_empty() && outcome.session_id != session_id {
            session_id = outcome.session_id.clone();
            pipeline.set_session_id(session_id.clone());
            sink.bind_context(None, Some(session_id.clone()), None, None);
            trace.lock().session_id = session_id.clone();
        }
        {
            let mut guard = trace.lock();
            if let Some(turn_record) =
                guard.turns.iter_mut().find(|t| t.turn == turn_count)
            {
                turn_record.token_usage = outcome.token_usage.clone();
                turn_record.session_id = session_id.clone();
            }
        }
        let _ = store.save(&trace).await;

        if let Some(commit) = stop_for_winner(
            &trace, &store, sandbox.as_ref(), &latch, sink, "after turn",
        )
        .await
        {
            final_commit_hint = Some(commit);
            end_reason = StopReason::Solved;
            break;
        }

        // ── Turn-end blocking evaluation of the working tree ───────
        let command =
            build_workspace_evaluation_command(&config.evaluation_envoi_url, &eval_test_path);
        let (turn_end_run, turn_end_error) = match sandbox
            .run_simple(&command, config.evaluation_timeout_seconds)
            .await
        {
            Ok(output) => (Some(eval_run_from_output(command, output)), None),
            Err(e) => (
                None,
                Some(format!("Turn-end full evaluation failed:\n{e}")),
            ),
        };

        let (turn_end_passed, turn_end_total, turn_end_has_error) = match &turn_end_run {
            Some(run) => match &run.payload {
                Some(payload) => {
                    if payload.total == 0 && payload.passed == 0 && !payload.has_error() {
                        sink.info("runner", "turn_end.no_tests", "turn_end status=no_tests", Value::Null);
                    } else {
                        sink.info(
                            "runner",
                            "turn_end.completed",
                            format!(
                                "turn_end passed={}/{} status_error={}",
                                payload.passed,
                                payload.total,
                                payload.has_error()
                            ),
                            Value::Null,
                        );
                    }
                    (Some(payload.passed), Some(payload.total), payload.has_error())
                }
                None => {
                    sink.warn("runner", "turn_end.payload_missing", "turn_end payload missing", Value::Null);
                    (None, None, true)
                }
            },
            None => (None, None, true),
        };
        let turn_end_solved = matches!((turn_end_passed, turn_end_total), (Some(p), Some(t)) if t > 0 && p == t)
            && !turn_end_has_error;

        // ── Advisor (optional, never fatal) ────────────────────────
        let mut advisor_assessment: Option<String> = None;
        if let (Some(client), Some(run)) = (&advisor, &turn_end_run) {
            if let Some(payload) = &run.payload {
                if !turn_end_solved {
                    let started = Instant::now();
                    match client
                        .assess(
                            sandbox.as_ref(),
                            &params.task_prompt,
                            pipeline.latest_commit(),
                            payload,
                        )
                        .await
                    {
                        Ok(assessment) => {
                            sink.info(
                                "advisor",
                                "advisor.completed",
                                format!(
                                    "advisor run_success elapsed_ms={} chars={}",
                                    started.elapsed().as_millis(),
                                    assessment.len()
                                ),
                                Value::Null,
                            );
                            advisor_assessment = Some(assessment);
                        }
                        Err(e) => {
                            sink.warn(
                                "advisor",
                                "advisor.failed",
                                format!("advisor failed: {e}"),
                                Value::Null,
                            );
                            advisor_assessment =
                                Some(format!("advisor unavailable: {e}"));
                        }
                    }
                }
            }
        }

        // ── Feedback + turn-end eval event ─────────────────────────
        let feedback = match (&turn_end_run, &turn_end_error) {
            (Some(run), _) => format_turn_end_feedback(
                run,
                config.failed_test_feedback_limit,
                advisor_assessment.as_deref(),
                previous_turn_end_tests.as_deref(),
            ),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };

        let turn_eval_part = {
            let guard = trace.lock();
            guard
                .turns
                .iter()
                .find(|t| t.turn == turn_count)
                .and_then(|t| t.part_end)
                .unwrap_or_else(|| pipeline.part_count())
        };
        if turn_eval_part > 0 {
            let event = build_turn_end_eval_event(
                turn_count,
                turn_eval_part,
                pipeline.latest_commit(),
                turn_end_run.as_ref(),
                turn_end_error.clone(),
            );
            next_feedback_eval_id = Some(event.eval_id.clone());
            if event.status == ec_domain::EvalStatus::Completed && !event.tests.is_empty() {
                previous_turn_end_tests = Some(event.tests.clone());
            }
            trace.lock().append_eval_event(event);
            let _ = store.save(&trace).await;
        }

        sink.info(
            "runner",
            "turn.completed",
            format!(
                "turn={turn_count} parts={} commit={} turn_end_eval={}",
                pipeline.part_count(),
                pipeline.latest_commit().unwrap_or("none"),
                match (turn_end_passed, turn_end_total) {
                    (Some(p), Some(t)) => format!("{p}/{t}"),
                    _ => "unknown".to_owned(),
                }
            ),
            Value::Null,
        );
        let _ = flusher.flush(true).await;

        if turn_end_solved {
            end_reason = StopReason::Solved;
            break;
        }
        if params
            .max_parts
            .is_some_and(|cap| cap > 0 && pipeline.part_count() >= cap)
        {
            end_reason = StopReason::PartLimit;
            break;
        }

        prompt_text = build_followup_prompt(pipeline.tracker(), Some(&feedback), true);
    }

    // ── Crash salvage for terminal agent errors ─────────────────────
    if end_reason == StopReason::AgentError {
        salvage_crash_messages(
            agent.as_ref(),
            &mut pipeline,
            &trace,
            &session_id,
            &mut turn_count,
            &prompt_text,
            sink,
        )
        .await;
    }

    // ── Drain the evaluator, then finalize ──────────────────────────
    if config.evaluator_drain_timeout_seconds > 0 {
        let drain = tokio::time::timeout(
            std::time::Duration::from_secs(config.evaluator_drain_timeout_seconds),
            evaluator.wait(),
        )
        .await;
        if drain.is_err() {
            sink.warn(
                "evaluator",
                "eval.drain_timeout",
                format!(
                    "shutdown drain timed out after {}s; cancelling pending evaluations",
                    config.evaluator_drain_timeout_seconds
                ),
                Value::Null,
            );
            evaluator
                .cancel_pending("Cancelled during shutdown: evaluation drain timed out")
                .await;
        }
    } else {
        evaluator.wait().await;
    }

    let (part_total, turn_total) = {
        let guard = trace.lock();
        (
            guard.last_part().max(pipeline.part_count()),
            guard.last_turn().max(turn_count),
        )
    };
    end_session(
        sandbox.as_ref(),
        blobs.as_ref(),
        &trace,
        &store,
        sink,
        flusher,
        &latch,
        EndSessionParams {
            reason: end_reason,
            part_count: part_total,
            turn_count: turn_total,
            final_commit_hint,
        },
    )
    .await;

    agent.stop().await.ok();
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stop-on-winner guard: scan evaluations, latch, project the trace,
/// and check out the winning commit. Returns the winning commit when a
/// winner exists.
async fn stop_for_winner(
    trace: &SharedTrajectory,
    store: &Arc<TraceStore>,
    sandbox: &dyn Sandbox,
    latch: &WinnerLatch,
    sink: &LogSink,
    detection_point: &str,
) -> Option<String> {
    let (commit, part, passed, total) = {
        let guard = trace.lock();
        let (commit, evaluation) = guard.first_winning()?;
        (
            commit.to_owned(),
            evaluation.part,
            evaluation.passed,
            evaluation.total,
        )
    };
    latch.latch(part);
    trace.lock().apply_winner_projection(&commit, part);
    if let Err(e) = store.save(trace).await {
        sink.warn(
            "runner",
            "trace.save_failed",
            format!("post-projection snapshot save failed: {e}"),
            Value::Null,
        );
    }
    crate::checkpoint::checkout_commit(sandbox, &commit).await;
    sink.info(
        "runner",
        "winner.detected",
        format!(
            "winner detected {detection_point} commit={} part={part} score={passed}/{total}",
            &commit[..commit.len().min(10)]
        ),
        serde_json::json!({"commit": commit, "part": part}),
    );
    Some(commit)
}

/// Best-effort retrieval of unflushed parts after a crash; salvaged
/// parts land in a final turn so nothing the agent produced is lost.
async fn salvage_crash_messages(
    agent: &dyn Agent,
    pipeline: &mut PartStreamPipeline,
    trace: &SharedTrajectory,
    session_id: &str,
    turn_count: &mut u32,
    prompt_text: &str,
    sink: &LogSink,
) {
    let messages = match agent.collect_crash_messages(session_id).await {
        Ok(Some(messages)) if !messages.is_empty() => messages,
        Ok(_) => return,
        Err(e) => {
            sink.warn(
                "runner",
                "crash.collect_failed",
                format!("could not collect crash messages: {e}"),
                Value::Null,
            );
            return;
        }
    };

    *turn_count += 1;
    let crash_turn = *turn_count;
    trace.lock().turns.push(TurnRecord {
        turn: crash_turn,
        session_id: session_id.to_owned(),
        timestamp: Utc::now().to_rfc3339(),
        prompt: prompt_text.to_owned(),
        part_start: None,
        part_end: None,
        git_commit: pipeline.latest_commit().map(str::to_owned),
        feedback_eval_id: None,
        token_usage: None,
    });

    let message_count = messages.len();
    for payload in messages {
        if let Err(e) = pipeline.ingest(payload, crash_turn).await {
            sink.warn(
                "runner",
                "crash.ingest_failed",
                format!("crash message ingest failed: {e}"),
                Value::Null,
            );
        }
    }

    // A turn that stayed empty is dropped again.
    let mut guard = trace.lock();
    if guard
        .turns
        .last()
        .is_some_and(|t| t.turn == crash_turn && !t.has_parts())
    {
        guard.turns.pop();
        *turn_count -= 1;
    } else {
        sink.info(
            "runner",
            "crash.salvaged",
            format!("saved {message_count} messages before crash"),
            Value::Null,
        );
    }
}

/// Tail the agent's in-sandbox log files into the structured log stream
/// after a failed turn.
async fn dump_agent_logs(sandbox: &dyn Sandbox, agent: &dyn Agent, sink: &LogSink) {
    for path in agent.log_files() {
        let command = format!("tail -n 50 {} 2>/dev/null || true", crate::envoi::sh_quote(&path));
        if let Ok(output) = sandbox.run_simple(&command, 15).await {
            if !output.stdout.trim().is_empty() {
                sink.debug(
                    "runner",
                    "agent.log_tail",
                    format!("{path}:\n{}", output.stdout.trim_end()),
                    serde_json::json!({"path": path}),
                );
            }
        }
    }
}
