//! Durable persistence for trajectories: blob store adapter, columnar
//! trace/log codecs, and the snapshot save/resume-load path.

pub mod blob;
pub mod codec;
pub mod logs;
pub mod rows;
pub mod trace_store;

pub use blob::{trajectory_key, BlobStore, FsBlobStore, MemoryBlobStore};
pub use codec::{decode_log_records, decode_trace_rows, encode_log_records, encode_trace_rows};
pub use logs::{parse_jsonl_records, LogLevel, LogRecord, LogSink};
pub use rows::{TraceRow, TRACE_SCHEMA_VERSION};
pub use trace_store::{SharedTrajectory, TraceStore};
