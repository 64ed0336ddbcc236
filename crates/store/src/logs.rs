//! Structured log capture.
//!
//! Instead of a process-wide mutable callback, every component holds a
//! cloned [`LogSink`] handle. Records buffer in memory; the sink wakes
//! the flush task when an error or warning arrives or the pending batch
//! crosses the configured threshold. Records also mirror into `tracing`
//! so a live terminal sees them immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// One structured log record as persisted in `logs.parquet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 timestamp.
    pub ts: String,
    pub level: LogLevel,
    pub component: String,
    /// Dotted event name, e.g. `eval.completed`.
    pub event: String,
    pub message: String,
    #[serde(default)]
    pub trajectory_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Where the record came from: `orchestrator`, `runtime`, ...
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub turn: Option<u32>,
    #[serde(default)]
    pub part: Option<u32>,
    /// Free-form extra fields.
    #[serde(default)]
    pub fields: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
struct LogContext {
    trajectory_id: Option<String>,
    session_id: Option<String>,
    turn: Option<u32>,
    part: Option<u32>,
}

struct SinkInner {
    records: Mutex<Vec<LogRecord>>,
    context: Mutex<LogContext>,
    wake: Notify,
    batch_size: usize,
    flushed_count: AtomicUsize,
}

/// Cloneable handle that buffers structured log records.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    pub fn new(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                records: Mutex::new(Vec::new()),
                context: Mutex::new(LogContext::default()),
                wake: Notify::new(),
                batch_size: batch_size.max(1),
                flushed_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Bind ambient context merged into every subsequent record.
    pub fn bind_context(
        &self,
        trajectory_id: Option<String>,
        session_id: Option<String>,
        turn: Option<u32>,
        part: Option<u32>,
    ) {
        let mut ctx = self.inner.context.lock();
        if trajectory_id.is_some() {
            ctx.trajectory_id = trajectory_id;
        }
        if session_id.is_some() {
            ctx.session_id = session_id;
        }
        if turn.is_some() {
            ctx.turn = turn;
        }
        if part.is_some() {
            ctx.part = part;
        }
    }

    pub fn debug(&self, component: &str, event: &str, message: impl Into<String>, fields: Value) {
        self.record(LogLevel::Debug, component, event, message.into(), fields);
    }

    pub fn info(&self, component: &str, event: &str, message: impl Into<String>, fields: Value) {
        self.record(LogLevel::Info, component, event, message.into(), fields);
    }

    pub fn warn(&self, component: &str, event: &str, message: impl Into<String>, fields: Value) {
        self.record(LogLevel::Warning, component, event, message.into(), fields);
    }

    pub fn error(&self, component: &str, event: &str, message: impl Into<String>, fields: Value) {
        self.record(LogLevel::Error, component, event, message.into(), fields);
    }

    fn record(&self, level: LogLevel, component: &str, event: &str, message: String, fields: Value) {
        let ctx = self.inner.context.lock().clone();
        let record = LogRecord {
            ts: Utc::now().to_rfc3339(),
            level,
            component: component.to_owned(),
            event: event.to_owned(),
            message,
            trajectory_id: ctx.trajectory_id,
            session_id: ctx.session_id,
            source: "orchestrator".to_owned(),
            turn: ctx.turn,
            part: ctx.part,
            fields,
        };

        match level {
            LogLevel::Debug => tracing::debug!(event, component, "{}", record.message),
            LogLevel::Info => tracing::info!(event, component, "{}", record.message),
            LogLevel::Warning => tracing::warn!(event, component, "{}", record.message),
            LogLevel::Error => tracing::error!(event, component, "{}", record.message),
        }

        let pending = {
            let mut records = self.inner.records.lock();
            records.push(record);
            records.len() - self.inner.flushed_count.load(Ordering::SeqCst)
        };

        if matches!(level, LogLevel::Error | LogLevel::Warning)
            || pending >= self.inner.batch_size
        {
            self.inner.wake.notify_one();
        }
    }

    /// Append records collected outside the sink (sandbox-side logs).
    pub fn extend(&self, records: Vec<LogRecord>) {
        if records.is_empty() {
            return;
        }
        self.inner.records.lock().extend(records);
        self.inner.wake.notify_one();
    }

    /// Total records accepted so far.
    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.lock().is_empty()
    }

    /// Records accepted since the last [`mark_flushed`](Self::mark_flushed).
    pub fn pending(&self) -> usize {
        self.len() - self.inner.flushed_count.load(Ordering::SeqCst)
    }

    /// Snapshot the full record list for a flush.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.inner.records.lock().clone()
    }

    /// Record that `count` records have been durably flushed.
    pub fn mark_flushed(&self, count: usize) {
        self.inner.flushed_count.store(count, Ordering::SeqCst);
    }

    /// Wait until the sink signals the flush task.
    pub async fn wakeup(&self) {
        self.inner.wake.notified().await;
    }

    /// Wake the flush task unconditionally (shutdown path).
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox-side jsonl parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse newline-delimited JSON log records collected from the sandbox.
///
/// Invalid lines are preserved as error records rather than dropped, so
/// a corrupted log file is still visible downstream.
pub fn parse_jsonl_records(raw: &str, source: &str, log_path: &str) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                let get = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
                records.push(LogRecord {
                    ts: get("ts").unwrap_or_else(|| Utc::now().to_rfc3339()),
                    level: match get("level").as_deref() {
                        Some("error") => LogLevel::Error,
                        Some("warning") => LogLevel::Warning,
                        Some("debug") => LogLevel::Debug,
                        _ => LogLevel::Info,
                    },
                    component: get("component").unwrap_or_else(|| source.to_owned()),
                    event: get("event").unwrap_or_default(),
                    message: get("message").unwrap_or_default(),
                    trajectory_id: get("trajectory_id"),
                    session_id: get("session_id"),
                    source: source.to_owned(),
                    turn: None,
                    part: None,
                    fields: serde_json::json!({
                        "log_path": log_path,
                        "line_no": line_no + 1,
                        "raw": value,
                    }),
                });
            }
            Err(_) => {
                let mut preview = trimmed.to_owned();
                preview.truncate(500);
                records.push(LogRecord {
                    ts: Utc::now().to_rfc3339(),
                    level: LogLevel::Error,
                    component: source.to_owned(),
                    event: "log.parse_error".to_owned(),
                    message: "invalid JSON log line".to_owned(),
                    trajectory_id: None,
                    session_id: None,
                    source: source.to_owned(),
                    turn: None,
                    part: None,
                    fields: serde_json::json!({
                        "log_path": log_path,
                        "line_no": line_no + 1,
                        "raw": preview,
                    }),
                });
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_merged_into_records() {
        let sink = LogSink::new(50);
        sink.bind_context(Some("traj".into()), None, Some(3), None);
        sink.info("loop", "turn.started", "turn 3", Value::Null);
        let records = sink.snapshot();
        assert_eq!(records[0].trajectory_id.as_deref(), Some("traj"));
        assert_eq!(records[0].turn, Some(3));
        assert_eq!(records[0].part, None);
    }

    #[tokio::test]
    async fn warning_wakes_the_flusher() {
        let sink = LogSink::new(1000);
        sink.warn("eval", "eval.failed", "boom", Value::Null);
        // Must resolve immediately because the warning queued a permit.
        tokio::time::timeout(std::time::Duration::from_millis(50), sink.wakeup())
            .await
            .expect("wakeup not signalled");
    }

    #[test]
    fn pending_tracks_flush_marks() {
        let sink = LogSink::new(50);
        sink.info("a", "e", "1", Value::Null);
        sink.info("a", "e", "2", Value::Null);
        assert_eq!(sink.pending(), 2);
        sink.mark_flushed(2);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn jsonl_parse_keeps_invalid_lines_as_errors() {
        let raw = "{\"level\":\"info\",\"message\":\"ok\"}\nnot-json\n";
        let records = parse_jsonl_records(raw, "runtime", "/tmp/envoi_runtime.jsonl");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, LogLevel::Info);
        assert_eq!(records[1].level, LogLevel::Error);
        assert_eq!(records[1].event, "log.parse_error");
    }
}
