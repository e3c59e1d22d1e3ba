//! Provider instances: one configured upload target each.

use crate::relay::{validate_descriptor, MultipartSink, StreamingUploader, UploadEvent, UploadOptions};
use crate::s3::{AwsProviderConfig, S3Sink};
use crate::source::open_download;
use async_trait::async_trait;
use std::sync::Arc;
use stream_backup_core::config::UploadSettings;
use stream_backup_core::model::{UploadDescriptor, UploadStats, Uploader};
use stream_backup_core::plan::ProviderInstance;
use stream_backup_core::{BackupError, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info};

const PROGRESS_LOG_STEP: u64 = 64 * 1024 * 1024;

pub enum Provider {
    Aws(StreamProvider<S3Sink>),
}

impl Provider {
    /// Checks an instance's settings without contacting the provider.
    pub fn validate_instance(instance: &ProviderInstance) -> Result<()> {
        let name = instance.reference.to_string();
        match instance.reference.provider.as_str() {
            "aws" => AwsProviderConfig::from_value(&instance.settings)
                .map(|_| ())
                .map_err(|err| BackupError::InvalidConfig(format!("{name}: {err}"))),
            other => Err(unsupported(other, &name)),
        }
    }

    pub async fn from_instance(instance: &ProviderInstance, upload: &UploadSettings) -> Result<Self> {
        let name = instance.reference.to_string();
        match instance.reference.provider.as_str() {
            "aws" => {
                let config = AwsProviderConfig::from_value(&instance.settings)
                    .map_err(|err| BackupError::InvalidConfig(format!("{name}: {err}")))?;
                let sink = S3Sink::new(config, upload.acl.as_deref()).await;
                info!(provider = %name, bucket = sink.bucket(), "initialized provider");
                Ok(Provider::Aws(StreamProvider::new(name, sink, UploadOptions::from(upload))?))
            }
            other => Err(unsupported(other, &name)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Provider::Aws(inner) => inner.name(),
        }
    }
}

fn unsupported(provider: &str, reference: &str) -> BackupError {
    BackupError::InvalidConfig(format!(
        "provider {provider:?} is not supported (referenced by {reference})"
    ))
}

#[async_trait]
impl Uploader for Provider {
    async fn upload(&self, descriptor: &UploadDescriptor) -> Result<UploadStats> {
        match self {
            Provider::Aws(inner) => inner.upload(descriptor).await,
        }
    }
}

/// Downloads an artifact and relays it into a multipart sink.
pub struct StreamProvider<S> {
    name: String,
    http: reqwest::Client,
    sink: Arc<S>,
    options: UploadOptions,
}

impl<S: MultipartSink> StreamProvider<S> {
    pub fn new(name: impl Into<String>, sink: S, options: UploadOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| BackupError::InvalidConfig(format!("failed to build http client: {err}")))?;
        Ok(Self {
            name: name.into(),
            http,
            sink: Arc::new(sink),
            options,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<S: MultipartSink> Uploader for StreamProvider<S> {
    async fn upload(&self, descriptor: &UploadDescriptor) -> Result<UploadStats> {
        let url = validate_descriptor(descriptor)?;
        info!(provider = %self.name, key = %descriptor.destination_key, "relaying artifact");
        let source = open_download(&self.http, url).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(log_progress(self.name.clone(), rx));
        let uploader = StreamingUploader::new(Arc::clone(&self.sink), self.options.clone()).with_progress(tx);
        uploader
            .relay(source, &descriptor.destination_key, &descriptor.content_type)
            .await
    }
}

async fn log_progress(provider: String, mut events: UnboundedReceiver<UploadEvent>) {
    let mut next_mark = PROGRESS_LOG_STEP;
    while let Some(event) = events.recv().await {
        match event {
            UploadEvent::BytesRead { total, .. } if total >= next_mark => {
                info!(%provider, bytes = total, "download progress");
                next_mark = (total / PROGRESS_LOG_STEP + 1) * PROGRESS_LOG_STEP;
            }
            UploadEvent::PartUploaded { part_number, bytes } => {
                debug!(%provider, part = part_number, bytes, "part stored");
            }
            _ => {}
        }
    }
}
