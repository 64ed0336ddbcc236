//! Columnar codec: trace rows and log records to/from parquet bytes.
//!
//! Columns are built positionally as (field, array) pairs so the schema
//! can never drift from the data.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use ec_domain::{Error, Result};

use crate::logs::LogRecord;
use crate::rows::TraceRow;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Column assembly helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Columns {
    fields: Vec<Field>,
    arrays: Vec<ArrayRef>,
}

impl Columns {
    fn new() -> Self {
        Self {
            fields: Vec::new(),
            arrays: Vec::new(),
        }
    }

    fn utf8(&mut self, name: &str, values: Vec<Option<String>>) {
        self.fields.push(Field::new(name, DataType::Utf8, true));
        self.arrays.push(Arc::new(StringArray::from(values)));
    }

    fn int32(&mut self, name: &str, values: Vec<Option<i32>>) {
        self.fields.push(Field::new(name, DataType::Int32, true));
        self.arrays.push(Arc::new(Int32Array::from(values)));
    }

    fn int64(&mut self, name: &str, values: Vec<Option<i64>>) {
        self.fields.push(Field::new(name, DataType::Int64, true));
        self.arrays.push(Arc::new(Int64Array::from(values)));
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        let schema = Arc::new(Schema::new(self.fields));
        let batch = RecordBatch::try_new(schema.clone(), self.arrays)
            .map_err(|e| Error::Store(format!("building record batch: {e}")))?;

        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)
            .map_err(|e| Error::Store(format!("opening parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| Error::Store(format!("writing parquet: {e}")))?;
        writer
            .close()
            .map_err(|e| Error::Store(format!("closing parquet: {e}")))?;
        Ok(buffer)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row extraction helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn utf8_at(batch: &RecordBatch, name: &str, row: usize) -> Option<String> {
    let column = batch.column_by_name(name)?;
    let array = column.as_any().downcast_ref::<StringArray>()?;
    (!array.is_null(row)).then(|| array.value(row).to_owned())
}

fn int32_at(batch: &RecordBatch, name: &str, row: usize) -> Option<i32> {
    let column = batch.column_by_name(name)?;
    let array = column.as_any().downcast_ref::<Int32Array>()?;
    (!array.is_null(row)).then(|| array.value(row))
}

fn int64_at(batch: &RecordBatch, name: &str, row: usize) -> Option<i64> {
    let column = batch.column_by_name(name)?;
    let array = column.as_any().downcast_ref::<Int64Array>()?;
    (!array.is_null(row)).then(|| array.value(row))
}

fn read_batches(bytes: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .map_err(|e| Error::Store(format!("opening parquet reader: {e}")))?
        .build()
        .map_err(|e| Error::Store(format!("building parquet reader: {e}")))?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| Error::Store(format!("reading parquet: {e}")))?);
    }
    Ok(batches)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize trace rows (already in monotonic part order) to parquet.
pub fn encode_trace_rows(rows: &[TraceRow]) -> Result<Vec<u8>> {
    let mut columns = Columns::new();

    macro_rules! utf8 {
        ($name:literal, $get:expr) => {
            columns.utf8($name, rows.iter().map($get).collect())
        };
    }
    macro_rules! int32 {
        ($name:literal, $get:expr) => {
            columns.int32($name, rows.iter().map($get).collect())
        };
    }

    utf8!("trajectory_id", |r: &TraceRow| Some(r.trajectory_id.clone()));
    utf8!("session_id", |r: &TraceRow| r.session_id.clone());
    utf8!("agent", |r: &TraceRow| r.agent.clone());
    utf8!("agent_model", |r: &TraceRow| r.agent_model.clone());
    utf8!("started_at", |r: &TraceRow| r.started_at.clone());
    utf8!("trace_schema_version", |r: &TraceRow| Some(
        r.trace_schema_version.clone()
    ));
    utf8!("environment", |r: &TraceRow| r.environment.clone());
    utf8!("task_params", |r: &TraceRow| r.task_params.clone());
    int32!("part", |r: &TraceRow| Some(r.part));
    utf8!("timestamp", |r: &TraceRow| r.timestamp.clone());
    utf8!("role", |r: &TraceRow| r.role.clone());
    utf8!("part_type", |r: &TraceRow| r.part_type.clone());
    utf8!("summary", |r: &TraceRow| r.summary.clone());
    columns.int64("duration_ms", rows.iter().map(|r| r.duration_ms).collect());
    utf8!("git_commit", |r: &TraceRow| r.git_commit.clone());
    utf8!("files", |r: &TraceRow| r.files.clone());
    utf8!("content", |r: &TraceRow| r.content.clone());
    int32!("summary_word_count", |r: &TraceRow| r.summary_word_count);
    int32!("content_word_count", |r: &TraceRow| r.content_word_count);
    int32!("summary_token_estimate", |r: &TraceRow| r
        .summary_token_estimate);
    int32!("content_token_estimate", |r: &TraceRow| r
        .content_token_estimate);
    utf8!("tool_name", |r: &TraceRow| r.tool_name.clone());
    utf8!("tool_status", |r: &TraceRow| r.tool_status.clone());
    utf8!("tool_input", |r: &TraceRow| r.tool_input.clone());
    utf8!("tool_output", |r: &TraceRow| r.tool_output.clone());
    utf8!("tool_error", |r: &TraceRow| r.tool_error.clone());
    int32!("tool_exit_code", |r: &TraceRow| r.tool_exit_code);
    utf8!("token_usage", |r: &TraceRow| r.token_usage.clone());
    utf8!("patch", |r: &TraceRow| r.patch.clone());
    utf8!("envoi_calls", |r: &TraceRow| r.envoi_calls.clone());
    utf8!("testing_state", |r: &TraceRow| r.testing_state.clone());
    utf8!("repo_checkpoint", |r: &TraceRow| r.repo_checkpoint.clone());
    int32!("turn", |r: &TraceRow| r.turn);
    utf8!("turn_user_message", |r: &TraceRow| r.turn_user_message.clone());
    utf8!("turn_feedback_eval_id", |r: &TraceRow| r
        .turn_feedback_eval_id
        .clone());
    utf8!("eval_events_delta", |r: &TraceRow| r.eval_events_delta.clone());
    utf8!("session_end_reason", |r: &TraceRow| r
        .session_end_reason
        .clone());
    int32!("session_end_total_parts", |r: &TraceRow| r
        .session_end_total_parts);
    int32!("session_end_total_turns", |r: &TraceRow| r
        .session_end_total_turns);
    utf8!("session_end_final_commit", |r: &TraceRow| r
        .session_end_final_commit
        .clone());
    utf8!("suites", |r: &TraceRow| r.suites.clone());
    utf8!("artifacts", |r: &TraceRow| r.artifacts.clone());
    utf8!("bundle_uri", |r: &TraceRow| r.bundle_uri.clone());

    columns.into_bytes()
}

/// Deserialize trace rows from parquet bytes, sorted by part.
pub fn decode_trace_rows(bytes: Vec<u8>) -> Result<Vec<TraceRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(bytes)? {
        for i in 0..batch.num_rows() {
            rows.push(TraceRow {
                trajectory_id: utf8_at(&batch, "trajectory_id", i).unwrap_or_default(),
                session_id: utf8_at(&batch, "session_id", i),
                agent: utf8_at(&batch, "agent", i),
                agent_model: utf8_at(&batch, "agent_model", i),
                started_at: utf8_at(&batch, "started_at", i),
                trace_schema_version: utf8_at(&batch, "trace_schema_version", i)
                    .unwrap_or_default(),
                environment: utf8_at(&batch, "environment", i),
                task_params: utf8_at(&batch, "task_params", i),
                part: int32_at(&batch, "part", i).unwrap_or(0),
                timestamp: utf8_at(&batch, "timestamp", i),
                role: utf8_at(&batch, "role", i),
                part_type: utf8_at(&batch, "part_type", i),
                summary: utf8_at(&batch, "summary", i),
                duration_ms: int64_at(&batch, "duration_ms", i),
                git_commit: utf8_at(&batch, "git_commit", i),
                files: utf8_at(&batch, "files", i),
                content: utf8_at(&batch, "content", i),
                summary_word_count: int32_at(&batch, "summary_word_count", i),
                content_word_count: int32_at(&batch, "content_word_count", i),
                summary_token_estimate: int32_at(&batch, "summary_token_estimate", i),
                content_token_estimate: int32_at(&batch, "content_token_estimate", i),
                tool_name: utf8_at(&batch, "tool_name", i),
                tool_status: utf8_at(&batch, "tool_status", i),
                tool_input: utf8_at(&batch, "tool_input", i),
                tool_output: utf8_at(&batch, "tool_output", i),
                tool_error: utf8_at(&batch, "tool_error", i),
                tool_exit_code: int32_at(&batch, "tool_exit_code", i),
                token_usage: utf8_at(&batch, "token_usage", i),
                patch: utf8_at(&batch, "patch", i),
                envoi_calls: utf8_at(&batch, "envoi_calls", i),
                testing_state: utf8_at(&batch, "testing_state", i),
                repo_checkpoint: utf8_at(&batch, "repo_checkpoint", i),
                turn: int32_at(&batch, "turn", i),
                turn_user_message: utf8_at(&batch, "turn_user_message", i),
                turn_feedback_eval_id: utf8_at(&batch, "turn_feedback_eval_id", i),
                eval_events_delta: utf8_at(&batch, "eval_events_delta", i),
                session_end_reason: utf8_at(&batch, "session_end_reason", i),
                session_end_total_parts: int32_at(&batch, "session_end_total_parts", i),
                session_end_total_turns: int32_at(&batch, "session_end_total_turns", i),
                session_end_final_commit: utf8_at(&batch, "session_end_final_commit", i),
                suites: utf8_at(&batch, "suites", i),
                artifacts: utf8_at(&batch, "artifacts", i),
                bundle_uri: utf8_at(&batch, "bundle_uri", i),
            });
        }
    }
    rows.sort_by_key(|row| row.part);
    Ok(rows)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize log records to parquet.
pub fn encode_log_records(records: &[LogRecord]) -> Result<Vec<u8>> {
    let mut columns = Columns::new();
    columns.utf8("ts", records.iter().map(|r| Some(r.ts.clone())).collect());
    columns.utf8(
        "level",
        records
            .iter()
            .map(|r| Some(r.level.as_str().to_owned()))
            .collect(),
    );
    columns.utf8(
        "component",
        records.iter().map(|r| Some(r.component.clone())).collect(),
    );
    columns.utf8(
        "event",
        records.iter().map(|r| Some(r.event.clone())).collect(),
    );
    columns.utf8(
        "message",
        records.iter().map(|r| Some(r.message.clone())).collect(),
    );
    columns.utf8(
        "trajectory_id",
        records.iter().map(|r| r.trajectory_id.clone()).collect(),
    );
    columns.utf8(
        "session_id",
        records.iter().map(|r| r.session_id.clone()).collect(),
    );
    columns.utf8(
        "source",
        records.iter().map(|r| Some(r.source.clone())).collect(),
    );
    columns.int32(
        "turn",
        records.iter().map(|r| r.turn.map(|v| v as i32)).collect(),
    );
    columns.int32(
        "part",
        records.iter().map(|r| r.part.map(|v| v as i32)).collect(),
    );
    columns.utf8(
        "fields",
        records
            .iter()
            .map(|r| {
                if r.fields.is_null() {
                    None
                } else {
                    serde_json::to_string(&r.fields).ok()
                }
            })
            .collect(),
    );
    columns.into_bytes()
}

/// Deserialize log records from parquet bytes.
pub fn decode_log_records(bytes: Vec<u8>) -> Result<Vec<LogRecord>> {
    use crate::logs::LogLevel;

    let mut records = Vec::new();
    for batch in read_batches(bytes)? {
        for i in 0..batch.num_rows() {
            records.push(LogRecord {
                ts: utf8_at(&batch, "ts", i).unwrap_or_default(),
                level: match utf8_at(&batch, "level", i).as_deref() {
                    Some("error") => LogLevel::Error,
                    Some("warning") => LogLevel::Warning,
                    Some("debug") => LogLevel::Debug,
                    _ => LogLevel::Info,
                },
                component: utf8_at(&batch, "component", i).unwrap_or_default(),
                event: utf8_at(&batch, "event", i).unwrap_or_default(),
                message: utf8_at(&batch, "message", i).unwrap_or_default(),
                trajectory_id: utf8_at(&batch, "trajectory_id", i),
                session_id: utf8_at(&batch, "session_id", i),
                source: utf8_at(&batch, "source", i).unwrap_or_default(),
                turn: int32_at(&batch, "turn", i).map(|v| v.max(0) as u32),
                part: int32_at(&batch, "part", i).map(|v| v.max(0) as u32),
                fields: utf8_at(&batch, "fields", i)
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(serde_json::Value::Null),
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogLevel;

    #[test]
    fn trace_rows_roundtrip() {
        let rows = vec![
            TraceRow {
                trajectory_id: "t1".into(),
                part: 1,
                part_type: Some("text".into()),
                summary: Some("hello".into()),
                trace_schema_version: crate::rows::TRACE_SCHEMA_VERSION.into(),
                ..Default::default()
            },
            TraceRow {
                trajectory_id: "t1".into(),
                part: 2,
                part_type: Some("patch".into()),
                git_commit: Some("abc123".into()),
                duration_ms: Some(42),
                tool_exit_code: Some(0),
                trace_schema_version: crate::rows::TRACE_SCHEMA_VERSION.into(),
                ..Default::default()
            },
        ];

        let bytes = encode_trace_rows(&rows).unwrap();
        let decoded = decode_trace_rows(bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].summary.as_deref(), Some("hello"));
        assert_eq!(decoded[1].git_commit.as_deref(), Some("abc123"));
        assert_eq!(decoded[1].duration_ms, Some(42));
        assert_eq!(decoded[1].part_type.as_deref(), Some("patch"));
    }

    #[test]
    fn empty_trace_encodes() {
        let bytes = encode_trace_rows(&[]).unwrap();
        assert!(decode_trace_rows(bytes).unwrap().is_empty());
    }

    #[test]
    fn log_records_roundtrip() {
        let records = vec![LogRecord {
            ts: "2026-01-01T00:00:00Z".into(),
            level: LogLevel::Warning,
            component: "evaluator".into(),
            event: "eval.failed".into(),
            message: "missing marker".into(),
            trajectory_id: Some("t1".into()),
            session_id: None,
            source: "orchestrator".into(),
            turn: Some(2),
            part: Some(7),
            fields: serde_json::json!({"commit": "abc"}),
        }];

        let bytes = encode_log_records(&records).unwrap();
        let decoded = decode_log_records(bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].level, LogLevel::Warning);
        assert_eq!(decoded[0].event, "eval.failed");
        assert_eq!(decoded[0].fields["commit"], "abc");
    }
}
