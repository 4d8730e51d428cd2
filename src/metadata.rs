//! Run metadata and per-trigger record persistence.
//!
//! Every [`AcquisitionRecord`] is handed to a [`MetadataStore`]. The default
//! [`JsonlStore`] appends one JSON object per line to
//! `logs/acquisition.jsonl` and keeps `logs/run.json` describing the run as a
//! whole: deployment name, host, software version, the resolved settings and,
//! once the run ends, its termination reason.
//!
//! [`MemoryStore`] keeps records in memory and is what the tests use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::Settings;
use crate::core::AcquisitionRecord;
use crate::error::{AppResult, TerminationReason};

/// File name of the record log inside `logs/`.
pub const RECORD_FILE: &str = "acquisition.jsonl";
/// File name of the run description inside `logs/`.
pub const RUN_FILE: &str = "run.json";

/// Run-level description written at start and rewritten at stop.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub deployment: String,
    pub run_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub hostname: String,
    pub software_version: String,
    pub trigger_count: u64,
    pub termination_reason: Option<TerminationReason>,
    pub settings: Settings,
}

impl RunMetadata {
    pub fn new(settings: &Settings, run_id: Uuid, start_time: DateTime<Utc>) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            deployment: settings.application.name.clone(),
            run_id,
            start_time,
            end_time: None,
            hostname,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            trigger_count: 0,
            termination_reason: None,
            settings: settings.clone(),
        }
    }

    /// Fill in the end-of-run fields.
    pub fn finish(&mut self, trigger_count: u64, reason: Option<TerminationReason>) {
        self.end_time = Some(Utc::now());
        self.trigger_count = trigger_count;
        self.termination_reason = reason;
    }
}

/// Destination for records and run metadata.
#[async_trait]
pub trait MetadataStore: Send {
    async fn write_record(&mut self, record: &AcquisitionRecord) -> AppResult<()>;

    async fn write_run_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()>;

    async fn flush(&mut self) -> AppResult<()>;
}

/// JSON-lines store under a run's `logs/` directory.
pub struct JsonlStore {
    logs_dir: PathBuf,
    records: BufWriter<File>,
}

impl JsonlStore {
    /// Open (append) the record log in `logs_dir`.
    pub async fn open(logs_dir: impl AsRef<Path>) -> AppResult<Self> {
        let logs_dir = logs_dir.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join(RECORD_FILE))
            .await?;
        debug!(path = %logs_dir.join(RECORD_FILE).display(), "Opened record log");
        Ok(Self {
            logs_dir,
            records: BufWriter::new(file),
        })
    }

    pub fn record_path(&self) -> PathBuf {
        self.logs_dir.join(RECORD_FILE)
    }

    pub fn run_path(&self) -> PathBuf {
        self.logs_dir.join(RUN_FILE)
    }
}

#[async_trait]
impl MetadataStore for JsonlStore {
    async fn write_record(&mut self, record: &AcquisitionRecord) -> AppResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.records.write_all(&line).await?;
        // One record per cycle; flushing keeps the log usable after a power cut
        self.records.flush().await?;
        Ok(())
    }

    async fn write_run_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(self.run_path(), json).await?;
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        self.records.flush().await?;
        self.records.get_mut().sync_all().await?;
        Ok(())
    }
}

/// In-memory store. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<Vec<AcquisitionRecord>>>,
    run: Arc<Mutex<Option<RunMetadata>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AcquisitionRecord> {
        self.records.lock().await.clone()
    }

    pub async fn run_metadata(&self) -> Option<RunMetadata> {
        self.run.lock().await.clone()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn write_record(&mut self, record: &AcquisitionRecord) -> AppResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn write_run_metadata(&mut self, metadata: &RunMetadata) -> AppResult<()> {
        *self.run.lock().await = Some(metadata.clone());
        Ok(())
    }

    async fn flush(&mut self) -> AppResult<()> {
        Ok(())
    }
}
