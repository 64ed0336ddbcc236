//! Shapes of the envoi test RPC as observed from inside the sandbox.
//!
//! The orchestrator never talks to the test server directly; it decodes
//! test-call records out of tool parts and out of the evaluation driver's
//! marker line, and it reads `/schema` once at session start to learn the
//! set of leaf test paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test call records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single test case inside a test run result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// Aggregated outcome of one test RPC invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub cases: Vec<TestCase>,
}

/// One observed test RPC call, decoded from a tool part's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvoiCall {
    pub path: String,
    pub timestamp: String,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub status_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<TestOutcome>,
}

impl EnvoiCall {
    /// Dedup key: the same call observed twice must only count once.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.path, self.timestamp, self.status_code, self.duration_ms
        )
    }

    /// A call solves its path when every test in the result passed.
    pub fn is_full_pass(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|r| r.total > 0 && r.passed == r.total)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Testing state snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Running snapshot of test progress, attached to each part record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestingState {
    pub solved_paths: u32,
    pub total_paths: u32,
    #[serde(default)]
    pub latest_path: Option<String>,
    #[serde(default)]
    pub latest_passed: Option<u32>,
    #[serde(default)]
    pub latest_total: Option<u32>,
    #[serde(default)]
    pub latest_status_code: Option<i32>,
    #[serde(default)]
    pub latest_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema discovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Walk an envoi `/schema` document and collect all leaf test paths.
///
/// The current server emits the flat form `{"tests": ["basics", ...]}`;
/// older deployments nested suites under `children`/`suites` maps, so
/// that walk is kept as a fallback.
pub fn extract_leaf_paths(schema: &Value) -> Vec<String> {
    if let Some(tests) = schema.get("tests").and_then(Value::as_array) {
        let mut paths: Vec<String> = tests
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        paths.sort();
        return paths;
    }

    let mut leaves = Vec::new();
    walk_schema(schema, "", &mut leaves);
    leaves.sort();
    leaves
}

fn walk_schema(node: &Value, prefix: &str, leaves: &mut Vec<String>) {
    if let Some(obj) = node.as_object() {
        let children = obj.get("children").or_else(|| obj.get("suites"));
        if let Some(children) = children.and_then(Value::as_object) {
            for (key, child) in children {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}/{key}")
                };
                walk_schema(child, &path, leaves);
            }
            return;
        }
    }
    if !prefix.is_empty() {
        leaves.push(prefix.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_schema_paths_are_sorted() {
        let schema = json!({"tests": ["wacct/chapter_2", "basics", "torture/part_1"]});
        assert_eq!(
            extract_leaf_paths(&schema),
            vec!["basics", "torture/part_1", "wacct/chapter_2"]
        );
    }

    #[test]
    fn nested_schema_falls_back_to_walk() {
        let schema = json!({
            "children": {
                "torture": {"children": {"part_1": {}, "part_2": {}}},
                "basics": {}
            }
        });
        assert_eq!(
            extract_leaf_paths(&schema),
            vec!["basics", "torture/part_1", "torture/part_2"]
        );
    }

    #[test]
    fn full_pass_requires_nonzero_total() {
        let call = EnvoiCall {
            path: "basics".into(),
            timestamp: "t".into(),
            duration_ms: 10,
            status_code: 200,
            error: None,
            result: Some(TestOutcome { passed: 0, failed: 0, total: 0, cases: vec![] }),
        };
        assert!(!call.is_full_pass());
    }
}
