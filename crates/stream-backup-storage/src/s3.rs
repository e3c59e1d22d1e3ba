use crate::relay::{CompletedPart, MultipartSink};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, ObjectCannedAcl};
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use stream_backup_core::{BackupError, Result};
use tracing::debug;

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Settings of one `[providers.aws.<instance>]` table.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct AwsProviderConfig {
    pub access_key_id: String,
    pub secret_key: String,
    pub s3_bucket_name: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

impl fmt::Debug for AwsProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsProviderConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &"<redacted>")
            .field("s3_bucket_name", &self.s3_bucket_name)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl AwsProviderConfig {
    pub fn from_value(value: &toml::Value) -> Result<Self> {
        let mut config: Self = value
            .clone()
            .try_into()
            .map_err(|err| BackupError::InvalidConfig(format!("invalid aws provider settings: {err}")))?;
        config.s3_bucket_name = config
            .s3_bucket_name
            .trim_start_matches("s3://")
            .trim_end_matches('/')
            .to_string();
        if config.s3_bucket_name.is_empty() {
            return Err(BackupError::InvalidConfig("s3_bucket_name is empty".to_string()));
        }
        if config.access_key_id.is_empty() || config.secret_key.is_empty() {
            return Err(BackupError::InvalidConfig(
                "access_key_id and secret_key are required".to_string(),
            ));
        }
        Ok(config)
    }
}

/// Multipart sink backed by one S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: Client,
    bucket: String,
    acl: Option<ObjectCannedAcl>,
}

impl S3Sink {
    pub async fn new(config: AwsProviderConfig, acl: Option<&str>) -> Self {
        let creds = Credentials::new(
            config.access_key_id,
            config.secret_key,
            None,
            None,
            "stream-backup",
        );
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(SharedCredentialsProvider::new(creds));
        if let Some(endpoint) = config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();
        Self {
            client: Client::from_conf(s3_config),
            bucket: config.s3_bucket_name,
            acl: acl.map(ObjectCannedAcl::from),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl MultipartSink for S3Sink {
    async fn create_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .set_acl(self.acl.clone())
            .send()
            .await
            .map_err(|err| sdk_error("create multipart upload", err))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| BackupError::transport(format!("no upload id returned for {key}")))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error("upload part", err))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BackupError::transport(format!("no etag returned for part {part_number}")))
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|part| {
                        aws_sdk_s3::types::CompletedPart::builder()
                            .part_number(part.part_number)
                            .e_tag(&part.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| sdk_error("complete multipart upload", err))?;
        debug!(bucket = %self.bucket, key, parts = parts.len(), "completed multipart upload");
        Ok(())
    }
}

fn sdk_error<E>(action: &str, err: SdkError<E, HttpResponse>) -> BackupError
where
    E: std::error::Error + 'static,
{
    let message = format!("{action} failed: {}", DisplayErrorContext(&err));
    match err.raw_response().map(|response| response.status().as_u16()) {
        Some(status) => BackupError::status(status, message),
        None => BackupError::transport(message),
    }
}
