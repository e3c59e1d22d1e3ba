use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const FINISHED_STATUS: &str = "FINISHED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(rename = "id")]
    pub cluster_id: String,
    #[serde(default)]
    pub replica_set_name: String,
}

/// `{ "date": "..." }` wrapper used by the backup service for timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateField {
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    #[serde(default)]
    pub created: Option<DateField>,
}

impl SnapshotRecord {
    pub fn created_timestamp(&self) -> Option<&str> {
        self.created.as_ref()?.date.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub status_name: Option<String>,
}

impl RestoreJob {
    /// The job's canonical status URL, the first of its links.
    pub fn status_url(&self) -> Option<&str> {
        self.links.first().map(|link| link.href.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Finished,
    Broken,
    Killed,
    Other(String),
    /// The status response carried no job entry.
    Unknown,
}

impl JobStatus {
    pub fn parse(name: &str) -> Self {
        match name {
            "IN_PROGRESS" => Self::InProgress,
            FINISHED_STATUS => Self::Finished,
            "BROKEN" => Self::Broken,
            "KILLED" => Self::Killed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Terminal statuses that will never become ready.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Broken | Self::Killed)
    }

    pub fn name(&self) -> &str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Finished => FINISHED_STATUS,
            Self::Broken => "BROKEN",
            Self::Killed => "KILLED",
            Self::Other(name) => name,
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub url: Option<String>,
}

/// One entry of the restore-job listing fetched once a job is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreJobListingEntry {
    #[serde(default)]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub timestamp: Option<DateField>,
}

impl RestoreJobListingEntry {
    pub fn delivery_url(&self) -> Option<&str> {
        self.delivery.as_ref()?.url.as_deref()
    }

    pub fn timestamp_date(&self) -> Option<&str> {
        self.timestamp.as_ref()?.date.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDescriptor {
    pub download_url: String,
    pub destination_key: String,
    pub content_type: String,
}

impl UploadDescriptor {
    pub const DEFAULT_CONTENT_TYPE: &'static str = "application/x-gzip";

    pub fn new(download_url: impl Into<String>, destination_key: impl Into<String>) -> Self {
        Self {
            download_url: download_url.into(),
            destination_key: destination_key.into(),
            content_type: Self::DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

/// Destination object key for a replica set's backup taken at `timestamp`.
pub fn destination_key(replica_set_name: &str, timestamp: &str) -> String {
    format!("backup_{replica_set_name}_{timestamp}.tar.gz")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStats {
    pub object_key: String,
    pub bytes: u64,
    pub parts: u32,
    pub duration: Duration,
    pub sha256: String,
}

impl UploadStats {
    pub fn bytes_per_sec(&self) -> u64 {
        let millis = self.duration.as_millis().max(1) as u64;
        self.bytes.saturating_mul(1000) / millis
    }
}

/// A destination capable of receiving one relayed backup.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, descriptor: &UploadDescriptor) -> Result<UploadStats>;
}
