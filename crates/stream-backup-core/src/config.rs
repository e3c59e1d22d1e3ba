use crate::error::BackupError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const MIB: usize = 1024 * 1024;
/// Smallest part size accepted by S3-style multipart uploads (except the last part).
pub const MIN_PART_SIZE_MIB: usize = 5;
/// Largest part size S3-style multipart uploads accept (5 GiB).
pub const MAX_PART_SIZE_MIB: usize = 5 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    pub deployments: Option<BTreeMap<String, DeploymentConfig>>,
    /// provider name -> instance name -> provider-specific settings
    pub providers: Option<BTreeMap<String, BTreeMap<String, toml::Value>>>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub replica_set_name: String,
    #[serde(default)]
    pub provider_instances: Vec<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub api_prefix: String,
    pub poll_interval_secs: u64,
    pub poll_max_ticks: u32,
    pub request_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://cloud.mongodb.com".to_string(),
            api_prefix: "/api/public/v1.0".to_string(),
            poll_interval_secs: 1,
            poll_max_ticks: 300,
            request_timeout_secs: 60,
        }
    }
}

impl ApiSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct UploadSettings {
    pub part_size_mib: usize,
    pub concurrent_parts: usize,
    pub retries: u32,
    pub retry_wait_ms: u64,
    pub read_timeout_secs: u64,
    pub content_type: String,
    pub acl: Option<String>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            part_size_mib: 10,
            concurrent_parts: 10,
            retries: 5,
            retry_wait_ms: 1000,
            read_timeout_secs: 10,
            content_type: "application/x-gzip".to_string(),
            acl: None,
        }
    }
}

impl UploadSettings {
    pub fn part_size_bytes(&self) -> usize {
        self.part_size_mib.saturating_mul(MIB)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config: {}", path.as_ref().display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to parse config: {}", path.as_ref().display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(contents)?;
        cfg.validate_settings()?;
        Ok(cfg)
    }

    /// Rejects numeric settings the pipeline cannot run with.
    pub fn validate_settings(&self) -> Result<(), BackupError> {
        let upload = &self.upload;
        if upload.part_size_mib < MIN_PART_SIZE_MIB {
            return Err(BackupError::InvalidConfig(format!(
                "upload.part_size_mib must be at least {MIN_PART_SIZE_MIB}, got {}",
                upload.part_size_mib
            )));
        }
        if upload.part_size_mib > MAX_PART_SIZE_MIB {
            return Err(BackupError::InvalidConfig(format!(
                "upload.part_size_mib must be at most {MAX_PART_SIZE_MIB}, got {}",
                upload.part_size_mib
            )));
        }
        if upload.concurrent_parts == 0 {
            return Err(BackupError::InvalidConfig(
                "upload.concurrent_parts must be positive".to_string(),
            ));
        }
        if upload.retries == 0 {
            return Err(BackupError::InvalidConfig(
                "upload.retries must be positive".to_string(),
            ));
        }
        if self.api.poll_max_ticks == 0 {
            return Err(BackupError::InvalidConfig(
                "api.poll_max_ticks must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
