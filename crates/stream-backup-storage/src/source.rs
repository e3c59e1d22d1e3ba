use bytes::Bytes;
use futures_util::Stream;
use reqwest::Url;
use std::pin::Pin;
use stream_backup_core::{BackupError, Result};
use tracing::debug;

pub type ByteSource = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

const ERROR_BODY_LIMIT: usize = 200;

/// Starts the artifact download and hands back its body as a byte stream.
pub async fn open_download(http: &reqwest::Client, url: Url) -> Result<ByteSource> {
    let response = http
        .get(url.clone())
        .send()
        .await
        .map_err(|err| BackupError::transport(format!("download request to {url} failed: {err}")))?;
    let status = response.status();
    if status.as_u16() >= 300 {
        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        return Err(BackupError::status(status.as_u16(), format!("download of {url} refused: {body}")));
    }
    debug!(%url, content_length = ?response.content_length(), "download started");
    Ok(Box::pin(response.bytes_stream()))
}
