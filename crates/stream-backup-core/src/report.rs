use crate::error::BackupError;
use crate::model::UploadStats;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const STATUS_OK: &str = "ok";
pub const STATUS_FAILED: &str = "failed";

/// Outcome of one (deployment, provider) run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub ts: String,
    pub deployment: String,
    pub provider: String,
    pub status: String,
    pub error_kind: String,
    pub message: String,
    pub bytes: u64,
    pub parts: u32,
    pub sha256: String,
    pub object_key: String,
}

impl RunRecord {
    pub fn from_outcome(
        deployment: &str,
        provider: &str,
        outcome: &Result<UploadStats, BackupError>,
    ) -> Self {
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        match outcome {
            Ok(stats) => Self {
                ts,
                deployment: deployment.to_string(),
                provider: provider.to_string(),
                status: STATUS_OK.to_string(),
                error_kind: String::new(),
                message: String::new(),
                bytes: stats.bytes,
                parts: stats.parts,
                sha256: stats.sha256.clone(),
                object_key: stats.object_key.clone(),
            },
            Err(err) => Self {
                ts,
                deployment: deployment.to_string(),
                provider: provider.to_string(),
                status: STATUS_FAILED.to_string(),
                error_kind: err.kind().to_string(),
                message: err.to_string(),
                bytes: 0,
                parts: 0,
                sha256: String::new(),
                object_key: String::new(),
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == STATUS_OK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    AllSucceeded,
    Partial,
    AllFailed,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub records: Vec<RunRecord>,
}

impl RunSummary {
    pub fn push(&mut self, record: RunRecord) {
        self.records.push(record);
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunRecord> {
        self.records.iter().filter(|r| !r.succeeded())
    }

    pub fn status(&self) -> RunStatus {
        let failed = self.failures().count();
        if failed == 0 && !self.records.is_empty() {
            RunStatus::AllSucceeded
        } else if failed < self.records.len() {
            RunStatus::Partial
        } else {
            RunStatus::AllFailed
        }
    }
}

/// Header row, in `RunRecord` field order.
const COLUMNS: [&str; 10] = [
    "ts",
    "deployment",
    "provider",
    "status",
    "error_kind",
    "message",
    "bytes",
    "parts",
    "sha256",
    "object_key",
];

/// The header is written once by `ensure_initialized`, never by serde.
fn tsv_writer<W: Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(inner)
}

/// Tab-separated report file, one row per run record.
pub struct ReportStore {
    path: PathBuf,
}

impl ReportStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create report directory: {}", parent.display()))?;
        }
        let file = File::create(&self.path)
            .with_context(|| format!("failed to create report: {}", self.path.display()))?;
        let mut writer = tsv_writer(file);
        writer.write_record(COLUMNS).context("failed to write report header")?;
        writer.flush().context("failed to flush report header")?;
        Ok(())
    }

    pub fn read_records(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_path(&self.path)
            .with_context(|| format!("failed to read report: {}", self.path.display()))?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: RunRecord = result.context("failed to parse report row")?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn append_records(&self, records: &[RunRecord]) -> Result<()> {
        self.ensure_initialized()?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open report: {}", self.path.display()))?;
        let mut writer = tsv_writer(file);
        for record in records {
            writer.serialize(record).context("failed to append report record")?;
        }
        writer.flush().context("failed to flush report")?;
        Ok(())
    }
}
