//! Follow-up prompt composition: turn-end evaluation feedback, failing
//! test selection, diagnostic clustering, and the regression section.

use std::collections::BTreeMap;

use chrono::Utc;

use ec_domain::{EvalEvent, EvalEventKind, EvalStatus, EvalTestResult};

use crate::envoi::EvalRun;
use crate::tracker::SolveTracker;

const MAX_INLINE_TEST_MESSAGE_CHARS: usize = 800;
const CLUSTER_LIMIT: usize = 8;
const REGRESSION_LIMIT: usize = 10;

pub const CONTINUE_PROMPT: &str = "Continue.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the re-injection prompt for the next turn.
pub fn build_followup_prompt(
    tracker: &SolveTracker,
    evaluation_feedback: Option<&str>,
    include_test_status: bool,
) -> String {
    let mut sections = vec![CONTINUE_PROMPT.to_owned()];
    if let Some(feedback) = evaluation_feedback.filter(|f| !f.is_empty()) {
        sections.push(format!("End-of-turn evaluation feedback:\n{feedback}"));
    }
    if include_test_status {
        let status = build_unsolved_status_lines(tracker);
        if !status.is_empty() {
            sections.push(format!("Current test status:\n{}", status.join("\n")));
        }
    }
    sections.join("\n\n")
}

/// Render up to ten unsolved paths with their latest scores.
pub fn build_unsolved_status_lines(tracker: &SolveTracker) -> Vec<String> {
    tracker
        .unsolved_paths()
        .into_iter()
        .take(10)
        .map(|path| match tracker.latest_call_for_path(path) {
            Some(call) => match &call.result {
                Some(result) => {
                    format!("  - {path}: {}/{}", result.passed, result.total)
                }
                None => format!("  - {path}: not run"),
            },
            None => format!("  - {path}: not run"),
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn-end evaluation feedback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render compact, actionable turn-end evaluation feedback.
pub fn format_turn_end_feedback(
    run: &EvalRun,
    failed_tests_limit: usize,
    advisor_assessment: Option<&str>,
    previous_turn_end_tests: Option<&[EvalTestResult]>,
) -> String {
    let mut lines: Vec<String> = vec!["Turn-end full evaluation result:".to_owned()];
    lines.push(format!("exit_code: {}", run.exit_code));

    match &run.payload {
        Some(payload) => {
            lines.push(format!(
                "summary: passed={} failed={} total={} duration_ms={}",
                payload.passed, payload.failed, payload.total, payload.duration_ms
            ));
            if !payload.suite_results.is_empty() {
                lines.push("suites:".to_owned());
                for (suite, result) in &payload.suite_results {
                    lines.push(format!("- {suite}: {}/{}", result.passed, result.total));
                }
            }
            lines.push(build_regression_section(
                &payload.tests,
                previous_turn_end_tests,
                REGRESSION_LIMIT,
            ));
            lines.push(build_cluster_summary(&payload.tests, CLUSTER_LIMIT));

            let selected = select_failed_tests(&payload.tests, failed_tests_limit);
            if selected.is_empty() {
                lines.push("top_failed_tests_with_source: 0".to_owned());
            } else {
                lines.push(format!(
                    "Top failed tests with source:\ncount: {} (limit={})",
                    selected.len(),
                    failed_tests_limit.max(1)
                ));
                for (index, test) in selected.iter().enumerate() {
                    lines.push(String::new());
                    lines.push(format_single_failed_test(index + 1, test));
                }
            }
            lines.push(format!("failed_tests_selected: {}", selected.len()));

            if let Some(error) = payload.error.as_deref().filter(|e| !e.trim().is_empty()) {
                lines.push(format!("error: {error}"));
            }
        }
        None => {
            lines.push("payload: null".to_owned());
            if !run.stdout.trim().is_empty() {
                lines.push(format!(
                    "stdout: {}",
                    truncate(&run.stdout, MAX_INLINE_TEST_MESSAGE_CHARS)
                ));
            }
            if !run.stderr.trim().is_empty() {
                lines.push(format!(
                    "stderr: {}",
                    truncate(&run.stderr, MAX_INLINE_TEST_MESSAGE_CHARS)
                ));
            }
        }
    }

    if let Some(assessment) = advisor_assessment.filter(|a| !a.trim().is_empty()) {
        lines.push(String::new());
        lines.push(assessment.trim().to_owned());
    }

    lines.join("\n").trim().to_owned()
}

/// Pick failing tests for feedback: stable suite/test order, one entry
/// per (suite, test_id), capped at `limit`.
pub fn select_failed_tests(
    tests: &[EvalTestResult],
    limit: usize,
) -> Vec<&EvalTestResult> {
    let mut failed: Vec<&EvalTestResult> =
        tests.iter().filter(|t| !t.is_passed()).collect();
    failed.sort_by(|a, b| {
        (a.suite.as_deref().unwrap_or(""), a.test_id.as_str())
            .cmp(&(b.suite.as_deref().unwrap_or(""), b.test_id.as_str()))
    });

    let mut seen = std::collections::HashSet::new();
    let mut selected = Vec::new();
    for test in failed {
        let key = (
            test.suite.clone().unwrap_or_default(),
            test.test_id.clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        selected.push(test);
        if selected.len() >= limit.max(1) {
            break;
        }
    }
    selected
}

fn format_single_failed_test(index: usize, test: &EvalTestResult) -> String {
    let status = if test.status.is_empty() {
        "failed"
    } else {
        &test.status
    };
    let label = match test.failure_type.as_deref() {
        Some(failure_type) => format!("{status}/{failure_type}"),
        None => status.to_owned(),
    };

    let mut lines = vec![format!("{index}. {}", test.reference()), format!("status: {label}")];
    if let Some(message) = test.failure_message() {
        lines.push("error:".to_owned());
        lines.push(truncate(message, MAX_INLINE_TEST_MESSAGE_CHARS));
    }
    if let Some(diagnostic) = test.rendered_diagnostic.as_deref() {
        lines.push("diagnostic:".to_owned());
        lines.push("```text".to_owned());
        lines.push(diagnostic.to_owned());
        lines.push("```".to_owned());
    }
    match test.source.as_deref() {
        Some(source) => {
            lines.push("source:".to_owned());
            lines.push("```".to_owned());
            lines.push(source.to_owned());
            lines.push("```".to_owned());
        }
        None => lines.push("source: (missing)".to_owned()),
    }
    lines.join("\n")
}

/// Group failing tests by failure signature and render the top groups.
pub fn build_cluster_summary(tests: &[EvalTestResult], limit: usize) -> String {
    let mut clusters: BTreeMap<String, (usize, Vec<String>)> = BTreeMap::new();
    for test in tests.iter().filter(|t| !t.is_passed()) {
        let key = match (test.failure_type.as_deref(), test.failure_message()) {
            (Some(failure_type), _) => failure_type.to_owned(),
            (None, Some(message)) => {
                truncate(message.lines().next().unwrap_or(""), 80)
            }
            (None, None) => "unknown".to_owned(),
        };
        let entry = clusters.entry(key).or_default();
        entry.0 += 1;
        if entry.1.len() < 3 {
            entry.1.push(test.reference());
        }
    }

    if clusters.is_empty() {
        return "diagnostic_clusters: 0".to_owned();
    }

    let mut ranked: Vec<(String, (usize, Vec<String>))> = clusters.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.0.cmp(&b.0)));

    let mut lines = vec![format!(
        "diagnostic_clusters: {} (top {})",
        ranked.len(),
        limit.max(1)
    )];
    for (key, (count, samples)) in ranked.into_iter().take(limit.max(1)) {
        lines.push(format!("- {key}: count={count}"));
        if !samples.is_empty() {
            lines.push(format!("  samples: {}", samples.join(", ")));
        }
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Regression section
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_key(test: &EvalTestResult) -> (String, String) {
    (
        test.suite.clone().unwrap_or_default(),
        test.test_id.clone(),
    )
}

/// Compare the current turn-end tests against the previous turn's.
pub fn build_regression_section(
    current: &[EvalTestResult],
    previous: Option<&[EvalTestResult]>,
    limit: usize,
) -> String {
    let Some(previous) = previous else {
        return "regressions_vs_previous_turn_end: unavailable (no previous turn-end snapshot)"
            .to_owned();
    };
    if current.is_empty() {
        return "regressions_vs_previous_turn_end: unavailable (current turn-end test details missing)"
            .to_owned();
    }

    let prev_by_key: BTreeMap<_, _> = previous.iter().map(|t| (test_key(t), t)).collect();
    let cur_by_key: BTreeMap<_, _> = current.iter().map(|t| (test_key(t), t)).collect();

    let prev_passed = prev_by_key.values().filter(|t| t.is_passed()).count();
    let cur_passed = cur_by_key.values().filter(|t| t.is_passed()).count();
    let still_failing = cur_by_key.values().filter(|t| !t.is_passed()).count();

    let newly_broken: Vec<&&EvalTestResult> = prev_by_key
        .iter()
        .filter(|(key, prev)| {
            prev.is_passed() && cur_by_key.get(*key).is_some_and(|cur| !cur.is_passed())
        })
        .filter_map(|(key, _)| cur_by_key.get(key))
        .collect();
    let newly_fixed = prev_by_key
        .iter()
        .filter(|(key, prev)| {
            !prev.is_passed() && cur_by_key.get(*key).is_some_and(|cur| cur.is_passed())
        })
        .count();

    let mut lines = vec![
        "regressions_vs_previous_turn_end:".to_owned(),
        format!("- baseline_tests: {}", prev_by_key.len()),
        format!("- current_tests: {}", cur_by_key.len()),
        format!(
            "- passed_delta: {} ({prev_passed}->{cur_passed})",
            cur_passed as i64 - prev_passed as i64
        ),
        format!("- newly_broken: {}", newly_broken.len()),
        format!("- newly_fixed: {newly_fixed}"),
        format!("- currently_failing: {still_failing}"),
    ];

    if !newly_broken.is_empty() {
        lines.push("- newly_broken_top:".to_owned());
        for (index, test) in newly_broken.iter().take(limit.max(1)).enumerate() {
            let suffix = test
                .failure_type
                .as_deref()
                .map(|f| format!("/{f}"))
                .unwrap_or_default();
            lines.push(format!(
                "  {}. {}: passed -> {}{suffix}",
                index + 1,
                test.reference(),
                test.status
            ));
            if let Some(message) = test.failure_message() {
                lines.push(format!(
                    "     error: {}",
                    truncate(message, MAX_INLINE_TEST_MESSAGE_CHARS)
                ));
            }
        }
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn-end eval event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the blocking turn-end evaluation event attached to the turn's
/// last part.
pub fn build_turn_end_eval_event(
    turn: u32,
    part: u32,
    commit: Option<&str>,
    run: Option<&EvalRun>,
    error: Option<String>,
) -> EvalEvent {
    let mut status = EvalStatus::Failed;
    let mut passed = 0;
    let mut failed = 0;
    let mut total = 0;
    let mut suite_results = BTreeMap::new();
    let mut tests = Vec::new();
    let mut event_error = error;

    if let Some(payload) = run.and_then(|r| r.payload.as_ref()) {
        passed = payload.passed;
        failed = payload.failed;
        total = payload.total;
        suite_results = payload.suite_results.clone();
        tests = payload.tests.clone();
        if event_error.is_none() {
            event_error = payload.error.clone().filter(|e| !e.trim().is_empty());
        }
        status = EvalStatus::Completed;
    }
    if let Some(run) = run {
        if run.exit_code != 0 {
            if event_error.is_none() {
                event_error = Some(format!(
                    "Turn-end evaluation command failed with exit code {}",
                    run.exit_code
                ));
            }
            status = EvalStatus::Failed;
        }
    }
    if event_error.is_some() {
        status = EvalStatus::Failed;
    }

    let now = Utc::now().to_rfc3339();
    EvalEvent {
        eval_id: uuid::Uuid::new_v4().simple().to_string(),
        kind: EvalEventKind::TurnEndBlocking,
        trigger_part: part,
        trigger_turn: turn,
        target_commit: commit.map(str::to_owned),
        queued_at: Some(now.clone()),
        started_at: Some(now.clone()),
        finished_at: Some(now),
        status,
        passed,
        failed,
        total,
        suite_results,
        tests,
        error: event_error,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_owned();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{} ...", text[..cut].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envoi::EvalPayload;

    fn test_result(suite: &str, id: &str, status: &str) -> EvalTestResult {
        EvalTestResult {
            suite: Some(suite.into()),
            test_id: id.into(),
            status: status.into(),
            message: (status != "passed").then(|| format!("{id} blew up")),
            ..Default::default()
        }
    }

    #[test]
    fn followup_prompt_includes_feedback_block() {
        let tracker = SolveTracker::new(vec!["basics".into()]);
        let prompt = build_followup_prompt(&tracker, Some("all bad"), false);
        assert!(prompt.starts_with(CONTINUE_PROMPT));
        assert!(prompt.contains("End-of-turn evaluation feedback:\nall bad"));
    }

    #[test]
    fn failed_test_selection_dedupes_and_caps() {
        let tests = vec![
            test_result("b", "t1", "failed"),
            test_result("a", "t1", "failed"),
            test_result("a", "t1", "failed"),
            test_result("a", "t2", "passed"),
            test_result("c", "t9", "failed"),
        ];
        let selected = select_failed_tests(&tests, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].reference(), "a/t1");
        assert_eq!(selected[1].reference(), "b/t1");
    }

    #[test]
    fn regression_section_spots_newly_broken() {
        let previous = vec![
            test_result("s", "t1", "passed"),
            test_result("s", "t2", "failed"),
        ];
        let current = vec![
            test_result("s", "t1", "failed"),
            test_result("s", "t2", "passed"),
        ];
        let section = build_regression_section(&current, Some(&previous), 10);
        assert!(section.contains("- newly_broken: 1"));
        assert!(section.contains("- newly_fixed: 1"));
        assert!(section.contains("s/t1: passed -> failed"));
    }

    #[test]
    fn turn_end_event_completed_on_clean_payload() {
        let run = EvalRun {
            command: "c".into(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            payload: Some(EvalPayload {
                passed: 5,
                failed: 0,
                total: 5,
                ..Default::default()
            }),
        };
        let event = build_turn_end_eval_event(2, 7, Some("abc"), Some(&run), None);
        assert_eq!(event.kind, EvalEventKind::TurnEndBlocking);
        assert_eq!(event.status, EvalStatus::Completed);
        assert_eq!(event.trigger_part, 7);
        assert_eq!(event.passed, 5);
    }

    #[test]
    fn turn_end_event_failed_on_nonzero_exit() {
        let run = EvalRun {
            command: "c".into(),
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
            payload: None,
        };
        let event = build_turn_end_eval_event(1, 1, None, Some(&run), None);
        assert_eq!(event.status, EvalStatus::Failed);
        assert!(event.error.as_deref().unwrap().contains("exit code 3"));
    }
}
