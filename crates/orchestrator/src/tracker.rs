//! SolveTracker: which required test paths has the agent solved so far.
//!
//! Fed by the part stream pipeline as test calls are observed. A path
//! counts as solved once any call for it comes back with every test
//! passing. Calls are deduplicated so replays (resume, turn-level
//! reconciliation) never double-count.

use std::collections::HashSet;

use ec_domain::{EnvoiCall, TestingState};

pub struct SolveTracker {
    required_paths: Vec<String>,
    solved: HashSet<String>,
    all_calls: Vec<EnvoiCall>,
    seen_call_keys: HashSet<String>,
}

impl SolveTracker {
    pub fn new(required_paths: Vec<String>) -> Self {
        Self {
            required_paths,
            solved: HashSet::new(),
            all_calls: Vec::new(),
            seen_call_keys: HashSet::new(),
        }
    }

    /// Fold new calls into the tracker, ignoring ones seen before.
    ///
    /// Solved-ness follows the latest call per path: a full pass solves
    /// it, any later non-passing call unsolves it again.
    pub fn update(&mut self, calls: &[EnvoiCall]) {
        for call in calls {
            let key = call.dedup_key();
            if !self.seen_call_keys.insert(key) {
                continue;
            }
            if call.is_full_pass() {
                self.solved.insert(call.path.clone());
            } else {
                self.solved.remove(&call.path);
            }
            self.all_calls.push(call.clone());
        }
    }

    pub fn unsolved_paths(&self) -> Vec<&str> {
        self.required_paths
            .iter()
            .filter(|p| !self.solved.contains(*p))
            .map(String::as_str)
            .collect()
    }

    pub fn latest_call_for_path(&self, path: &str) -> Option<&EnvoiCall> {
        self.all_calls.iter().rev().find(|c| c.path == path)
    }

    pub fn is_fully_solved(&self) -> bool {
        !self.required_paths.is_empty()
            && self
                .required_paths
                .iter()
                .all(|p| self.solved.contains(p))
    }

    /// Snapshot for the current part record.
    pub fn snapshot(&self) -> TestingState {
        let latest = self.all_calls.last();
        TestingState {
            solved_paths: self.solved.len() as u32,
            total_paths: self.required_paths.len() as u32,
            latest_path: latest.map(|c| c.path.clone()),
            latest_passed: latest.and_then(|c| c.result.as_ref()).map(|r| r.passed),
            latest_total: latest.and_then(|c| c.result.as_ref()).map(|r| r.total),
            latest_status_code: latest.map(|c| c.status_code),
            latest_error: latest.and_then(|c| c.error.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_domain::TestOutcome;

    fn call(path: &str, ts: &str, passed: u32, total: u32) -> EnvoiCall {
        EnvoiCall {
            path: path.into(),
            timestamp: ts.into(),
            duration_ms: 5,
            status_code: 200,
            error: None,
            result: Some(TestOutcome {
                passed,
                failed: total - passed,
                total,
                cases: vec![],
            }),
        }
    }

    #[test]
    fn full_pass_solves_the_path() {
        let mut tracker = SolveTracker::new(vec!["basics".into(), "torture/part_1".into()]);
        tracker.update(&[call("basics", "t1", 3, 3)]);
        assert_eq!(tracker.unsolved_paths(), vec!["torture/part_1"]);
        assert!(!tracker.is_fully_solved());

        tracker.update(&[call("torture/part_1", "t2", 9, 9)]);
        assert!(tracker.is_fully_solved());
    }

    #[test]
    fn partial_pass_does_not_solve() {
        let mut tracker = SolveTracker::new(vec!["basics".into()]);
        tracker.update(&[call("basics", "t1", 2, 3)]);
        assert_eq!(tracker.unsolved_paths(), vec!["basics"]);
    }

    #[test]
    fn duplicate_calls_are_ignored() {
        let mut tracker = SolveTracker::new(vec!["basics".into()]);
        let c = call("basics", "t1", 2, 3);
        tracker.update(&[c.clone(), c.clone()]);
        tracker.update(&[c]);
        assert_eq!(tracker.snapshot().latest_passed, Some(2));
        assert_eq!(tracker.all_calls.len(), 1);
    }

    #[test]
    fn solved_set_follows_latest_call_per_path() {
        let mut tracker = SolveTracker::new(vec!["basics".into()]);
        tracker.update(&[call("basics", "t1", 3, 3)]);
        assert!(tracker.unsolved_paths().is_empty());

        // A later failing call unsolves the path again.
        tracker.update(&[call("basics", "t2", 1, 3)]);
        assert_eq!(tracker.unsolved_paths(), vec!["basics"]);
        let state = tracker.snapshot();
        assert_eq!(state.latest_passed, Some(1));
        assert_eq!(state.solved_paths, 0);
    }

    #[test]
    fn empty_required_set_is_never_fully_solved() {
        let tracker = SolveTracker::new(vec![]);
        assert!(!tracker.is_fully_solved());
    }
}
