//! Append-only job event log, decoupled from its persistence target.
//!
//! `NullJobLogSink` discards (tests); `NdjsonFileSink` appends one JSON
//! object per line to a file, the shape a local/single-node deployment
//! wants without pulling in an actual storage engine.

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct JobLogRecord {
    pub timestamp: u64,
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    pub event: JobEvent,
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum JobEvent {
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "url.processing")]
    UrlProcessing,
    #[serde(rename = "url.success")]
    UrlSuccess,
    #[serde(rename = "url.failed")]
    UrlFailed,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum JobLogError {
    #[error("failed to append job log record: {0}")]
    Io(String),
}

#[async_trait]
pub trait JobLogSink: Send + Sync {
    async fn append(&self, record: JobLogRecord) -> Result<(), JobLogError>;
}

/// Discards every record. The default for embedders that don't want a
/// persisted job history.
pub struct NullJobLogSink;

#[async_trait]
impl JobLogSink for NullJobLogSink {
    async fn append(&self, _record: JobLogRecord) -> Result<(), JobLogError> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file shared across jobs, guarded
/// by a mutex since writes interleave across job tasks.
pub struct NdjsonFileSink {
    file: Mutex<File>,
}

impl NdjsonFileSink {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl JobLogSink for NdjsonFileSink {
    async fn append(&self, record: JobLogRecord) -> Result<(), JobLogError> {
        let mut line = serde_json::to_vec(&record).map_err(|e| JobLogError::Io(e.to_string()))?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(|e| JobLogError::Io(e.to_string()))
    }
}

pub type SharedJobLogSink = Arc<dyn JobLogSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_sink_discards_without_error() {
        let sink = NullJobLogSink;
        let record = JobLogRecord {
            timestamp: 0,
            job_id: Uuid::nil(),
            event: JobEvent::JobStarted,
            fields: serde_json::json!({}),
        };
        assert!(sink.append(record).await.is_ok());
    }

    #[tokio::test]
    async fn ndjson_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.ndjson");
        let sink = NdjsonFileSink::open(&path).await.unwrap();

        sink.append(JobLogRecord {
            timestamp: 1,
            job_id: Uuid::nil(),
            event: JobEvent::JobStarted,
            fields: serde_json::json!({"mode": "list"}),
        })
        .await
        .unwrap();
        sink.append(JobLogRecord { timestamp: 2, job_id: Uuid::nil(), event: JobEvent::JobCompleted, fields: serde_json::json!({}) })
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("job.started"));
        assert!(lines[1].contains("job.completed"));
    }
}
