//! Background log flush loop.
//!
//! Wakes on sink signal (error/warning recorded, batch threshold) or on
//! interval expiry, snapshots the full record list, and rewrites
//! `logs.parquet`. One flush at a time; the finalizer runs a forced
//! flush at the end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ec_domain::Result;
use ec_store::{codec::encode_log_records, trajectory_key, BlobStore, LogSink};

pub struct LogFlusher {
    sink: LogSink,
    blobs: Arc<dyn BlobStore>,
    trajectory_id: String,
    interval: Duration,
    batch_size: usize,
    stop: CancellationToken,
    flush_gate: tokio::sync::Mutex<()>,
    last_flush: Mutex<Instant>,
}

impl LogFlusher {
    pub fn new(
        sink: LogSink,
        blobs: Arc<dyn BlobStore>,
        trajectory_id: impl Into<String>,
        interval_seconds: u64,
        batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            blobs,
            trajectory_id: trajectory_id.into(),
            interval: Duration::from_secs(interval_seconds.max(1)),
            batch_size: batch_size.max(1),
            stop: CancellationToken::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            last_flush: Mutex::new(Instant::now()),
        })
    }

    pub fn logs_uri(&self) -> String {
        self.blobs
            .uri(&trajectory_key(&self.trajectory_id, "logs.parquet"))
    }

    /// Spawn the periodic flush task. Runs until [`stop`](Self::stop),
    /// then performs one final forced flush.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let flusher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flusher.stop.cancelled() => break,
                    _ = flusher.sink.wakeup() => {}
                    _ = tokio::time::sleep(flusher.interval) => {}
                }
                if let Err(e) = flusher.flush(false).await {
                    tracing::warn!(error = %e, "periodic logs flush failed");
                }
            }
            if let Err(e) = flusher.flush(true).await {
                tracing::warn!(error = %e, "final periodic logs flush failed");
            }
        })
    }

    pub fn stop(&self) {
        self.stop.cancel();
        self.sink.notify();
    }

    /// Flush buffered records. Without `force`, skips when nothing new
    /// arrived, or the batch is small and the interval hasn't elapsed.
    /// Returns how many records are durable after the call.
    pub async fn flush(&self, force: bool) -> Result<usize> {
        if self.sink.is_empty() {
            return Ok(0);
        }
        let _gate = self.flush_gate.lock().await;

        let pending = self.sink.pending();
        let elapsed = self.last_flush.lock().elapsed();
        if !force && (pending == 0 || (pending < self.batch_size && elapsed < self.interval)) {
            return Ok(self.sink.len() - pending);
        }

        let snapshot = self.sink.snapshot();
        let bytes = encode_log_records(&snapshot)?;
        self.blobs
            .put(&trajectory_key(&self.trajectory_id, "logs.parquet"), bytes)
            .await?;
        self.sink.mark_flushed(snapshot.len());
        *self.last_flush.lock() = Instant::now();
        Ok(snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_store::{decode_log_records, MemoryBlobStore};
    use serde_json::Value;

    #[tokio::test]
    async fn forced_flush_persists_all_records() {
        let sink = LogSink::new(50);
        let blobs = Arc::new(MemoryBlobStore::new());
        let flusher = LogFlusher::new(sink.clone(), blobs.clone(), "t1", 5, 50);

        sink.info("loop", "a", "one", Value::Null);
        sink.info("loop", "b", "two", Value::Null);
        let flushed = flusher.flush(true).await.unwrap();
        assert_eq!(flushed, 2);

        let bytes = blobs
            .get("trajectories/t1/logs.parquet")
            .await
            .unwrap()
            .expect("logs blob written");
        let records = decode_log_records(bytes).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "a");
    }

    #[tokio::test]
    async fn unforced_flush_waits_for_batch_or_interval() {
        let sink = LogSink::new(50);
        let blobs = Arc::new(MemoryBlobStore::new());
        // Long interval, large batch: an early unforced flush is a no-op.
        let flusher = LogFlusher::new(sink.clone(), blobs.clone(), "t1", 3600, 50);

        sink.info("loop", "a", "one", Value::Null);
        flusher.flush(false).await.unwrap();
        assert!(blobs.get("trajectories/t1/logs.parquet").await.unwrap().is_none());

        // Batch threshold reached: unforced flush writes.
        for i in 0..50 {
            sink.info("loop", "bulk", format!("r{i}"), Value::Null);
        }
        flusher.flush(false).await.unwrap();
        assert!(blobs.get("trajectories/t1/logs.parquet").await.unwrap().is_some());
    }
}
