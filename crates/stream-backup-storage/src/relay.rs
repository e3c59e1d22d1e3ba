use crate::chunk::{Part, PartChunker};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_backup_core::config::UploadSettings;
use stream_backup_core::model::{UploadDescriptor, UploadStats};
use stream_backup_core::{BackupError, Result};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub e_tag: String,
    pub bytes: u64,
}

/// Object-store side of a multipart upload.
#[async_trait]
pub trait MultipartSink: Send + Sync + 'static {
    /// Starts an upload and returns its upload id.
    async fn create_upload(&self, key: &str, content_type: &str) -> Result<String>;

    /// Uploads one part and returns its ETag.
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<String>;

    /// Assembles the object from `parts`, which are in part-number order.
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[CompletedPart]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    pub part_size: usize,
    pub concurrent_parts: usize,
    /// Attempts per part, including the first.
    pub retries: u32,
    pub retry_wait: Duration,
    /// Longest silence tolerated from the download stream.
    pub read_timeout: Option<Duration>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self::from(&UploadSettings::default())
    }
}

impl From<&UploadSettings> for UploadOptions {
    fn from(settings: &UploadSettings) -> Self {
        Self {
            part_size: settings.part_size_bytes(),
            concurrent_parts: settings.concurrent_parts.max(1),
            retries: settings.retries.max(1),
            retry_wait: settings.retry_wait(),
            read_timeout: Some(settings.read_timeout()).filter(|t| !t.is_zero()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    BytesRead { bytes: usize, total: u64 },
    PartUploaded { part_number: i32, bytes: u64 },
    PartRetry { part_number: i32, attempt: u32, error: String },
}

/// Checks a descriptor before any network activity.
pub fn validate_descriptor(descriptor: &UploadDescriptor) -> Result<Url> {
    let url = Url::parse(&descriptor.download_url).map_err(|err| {
        BackupError::InvalidInput(format!("invalid download url {:?}: {err}", descriptor.download_url))
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(BackupError::InvalidInput(format!(
            "download url {:?} is not an http(s) url",
            descriptor.download_url
        )));
    }
    if descriptor.destination_key.is_empty() {
        return Err(BackupError::InvalidInput("destination key is empty".to_string()));
    }
    Ok(url)
}

/// Relays a byte stream into a multipart upload.
///
/// At most `concurrent_parts` parts are in flight; the source is not read
/// again until a slot frees up, so memory stays near
/// `part_size * (concurrent_parts + 1)` whatever the artifact size. A part
/// that exhausts its attempts fails the whole upload. Parts already stored are
/// left for the backend to expire.
pub struct StreamingUploader<S> {
    sink: Arc<S>,
    options: UploadOptions,
    progress: Option<UnboundedSender<UploadEvent>>,
}

impl<S: MultipartSink> StreamingUploader<S> {
    pub fn new(sink: Arc<S>, options: UploadOptions) -> Self {
        Self {
            sink,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: UnboundedSender<UploadEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn relay<St, E>(&self, mut source: St, key: &str, content_type: &str) -> Result<UploadStats>
    where
        St: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        if key.is_empty() {
            return Err(BackupError::InvalidInput("destination key is empty".to_string()));
        }
        let started = Instant::now();
        let upload_id = self.sink.create_upload(key, content_type).await?;
        info!(key, %upload_id, "multipart upload started");

        let mut chunker = PartChunker::new(self.options.part_size);
        let mut in_flight = JoinSet::new();
        let mut completed = Vec::new();

        while let Some(chunk) = self.next_chunk(&mut source).await? {
            for part in chunker.push(&chunk) {
                self.admit(&mut in_flight, &mut completed, key, &upload_id, part)
                    .await?;
            }
            self.emit(UploadEvent::BytesRead {
                bytes: chunk.len(),
                total: chunker.bytes_read(),
            });
        }

        let bytes = chunker.bytes_read();
        let (last, sha256) = chunker.finish();
        if let Some(part) = last {
            self.admit(&mut in_flight, &mut completed, key, &upload_id, part)
                .await?;
        }
        while let Some(joined) = in_flight.join_next().await {
            completed.push(flatten(joined)?);
        }

        completed.sort_by_key(|part| part.part_number);
        self.sink.complete_upload(key, &upload_id, &completed).await?;

        let stats = UploadStats {
            object_key: key.to_string(),
            bytes,
            parts: completed.len() as u32,
            duration: started.elapsed(),
            sha256,
        };
        info!(
            key,
            bytes = stats.bytes,
            parts = stats.parts,
            elapsed_ms = stats.duration.as_millis() as u64,
            bytes_per_sec = stats.bytes_per_sec(),
            "multipart upload completed"
        );
        Ok(stats)
    }

    async fn next_chunk<St, E>(&self, source: &mut St) -> Result<Option<Bytes>>
    where
        St: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let next = match self.options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, source.next())
                .await
                .map_err(|_| BackupError::transport(format!("download stalled for {limit:?}")))?,
            None => source.next().await,
        };
        next.transpose()
            .map_err(|err| BackupError::transport(format!("download stream failed: {err}")))
    }

    async fn admit(
        &self,
        in_flight: &mut JoinSet<Result<CompletedPart>>,
        completed: &mut Vec<CompletedPart>,
        key: &str,
        upload_id: &str,
        part: Part,
    ) -> Result<()> {
        while in_flight.len() >= self.options.concurrent_parts {
            match in_flight.join_next().await {
                Some(joined) => completed.push(flatten(joined)?),
                None => break,
            }
        }
        debug!(part = part.number, bytes = part.len(), "queueing part");
        in_flight.spawn(upload_part_with_retry(
            Arc::clone(&self.sink),
            key.to_string(),
            upload_id.to_string(),
            part,
            self.options.retries,
            self.options.retry_wait,
            self.progress.clone(),
        ));
        Ok(())
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

async fn upload_part_with_retry<S: MultipartSink>(
    sink: Arc<S>,
    key: String,
    upload_id: String,
    part: Part,
    attempts: u32,
    retry_wait: Duration,
    progress: Option<UnboundedSender<UploadEvent>>,
) -> Result<CompletedPart> {
    let bytes = part.len() as u64;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sink
            .upload_part(&key, &upload_id, part.number, part.data.clone())
            .await
        {
            Ok(e_tag) => {
                debug!(part = part.number, attempt, "uploaded part");
                if let Some(progress) = &progress {
                    let _ = progress.send(UploadEvent::PartUploaded {
                        part_number: part.number,
                        bytes,
                    });
                }
                return Ok(CompletedPart {
                    part_number: part.number,
                    e_tag,
                    bytes,
                });
            }
            Err(err) if attempt < attempts => {
                warn!(part = part.number, attempt, attempts, error = %err, "part upload failed; retrying");
                if let Some(progress) = &progress {
                    let _ = progress.send(UploadEvent::PartRetry {
                        part_number: part.number,
                        attempt,
                        error: err.to_string(),
                    });
                }
                tokio::time::sleep(retry_wait).await;
            }
            Err(err) => {
                return Err(BackupError::UploadPartFailure {
                    part_number: part.number,
                    attempts: attempt,
                    message: err.to_string(),
                });
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<CompletedPart>, JoinError>) -> Result<CompletedPart> {
    joined.map_err(|err| BackupError::Task(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const MIB: usize = 1024 * 1024;

    #[derive(Default)]
    struct FakeSink {
        created: Mutex<Vec<String>>,
        uploaded: Mutex<Vec<(i32, usize)>>,
        completed: Mutex<Option<Vec<CompletedPart>>>,
        failures: Mutex<HashMap<i32, u32>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        /// Parts with a lower number take longer, so they finish out of order.
        reverse_latency: bool,
    }

    impl FakeSink {
        fn failing(part_number: i32, times: u32) -> Self {
            let sink = Self::default();
            sink.failures.lock().unwrap().insert(part_number, times);
            sink
        }
    }

    #[async_trait]
    impl MultipartSink for FakeSink {
        async fn create_upload(&self, key: &str, _content_type: &str) -> Result<String> {
            self.created.lock().unwrap().push(key.to_string());
            Ok("upload-1".to_string())
        }

        async fn upload_part(&self, _key: &str, upload_id: &str, part_number: i32, body: Bytes) -> Result<String> {
            assert_eq!(upload_id, "upload-1");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = if self.reverse_latency {
                100 - part_number as u64
            } else {
                10
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackupError::status(500, "internal error"));
                }
            }
            drop(failures);
            self.uploaded.lock().unwrap().push((part_number, body.len()));
            Ok(format!("etag-{part_number}"))
        }

        async fn complete_upload(&self, _key: &str, _upload_id: &str, parts: &[CompletedPart]) -> Result<()> {
            *self.completed.lock().unwrap() = Some(parts.to_vec());
            Ok(())
        }
    }

    fn options(part_size: usize, concurrent_parts: usize, retries: u32) -> UploadOptions {
        UploadOptions {
            part_size,
            concurrent_parts,
            retries,
            retry_wait: Duration::from_millis(50),
            read_timeout: Some(Duration::from_secs(10)),
        }
    }

    fn source(data: &[u8], feed: usize) -> impl Stream<Item = std::result::Result<Bytes, io::Error>> + Unpin {
        let chunks: Vec<_> = data
            .chunks(feed)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    #[tokio::test(start_paused = true)]
    async fn relays_twenty_five_mib_as_three_parts() {
        let data: Vec<u8> = (0..25 * MIB).map(|i| (i % 253) as u8).collect();
        let sink = Arc::new(FakeSink::default());
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10 * MIB, 10, 5));

        let stats = uploader
            .relay(source(&data, 256 * 1024), "backup_rs0_x.tar.gz", "application/x-gzip")
            .await
            .unwrap();

        assert_eq!(stats.parts, 3);
        assert_eq!(stats.bytes, 25 * MIB as u64);
        assert_eq!(stats.sha256, format!("{:x}", Sha256::digest(&data)));
        let completed = sink.completed.lock().unwrap().clone().unwrap();
        let sizes: Vec<_> = completed.iter().map(|p| p.bytes).collect();
        assert_eq!(sizes, vec![10 * MIB as u64, 10 * MIB as u64, 5 * MIB as u64]);
        assert_eq!(sizes.iter().sum::<u64>(), stats.bytes);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_parts_stay_within_window() {
        let data = vec![7u8; 100];
        let sink = Arc::new(FakeSink::default());
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 2, 1));
        let stats = uploader.relay(source(&data, 5), "k", "t").await.unwrap();
        assert_eq!(stats.parts, 10);
        assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_parts_are_sorted_by_number() {
        let data = vec![1u8; 50];
        let sink = Arc::new(FakeSink {
            reverse_latency: true,
            ..Default::default()
        });
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 5, 1));
        uploader.relay(source(&data, 50), "k", "t").await.unwrap();

        let finish_order: Vec<_> = sink.uploaded.lock().unwrap().iter().map(|(n, _)| *n).collect();
        assert_eq!(finish_order, vec![5, 4, 3, 2, 1]);
        let numbers: Vec<_> = sink
            .completed
            .lock()
            .unwrap()
            .clone()
            .unwrap()
            .iter()
            .map(|p| p.part_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_parts_and_reports_progress() {
        let data = vec![3u8; 30];
        let sink = Arc::new(FakeSink::failing(2, 2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 3, 5)).with_progress(tx);
        let stats = uploader.relay(source(&data, 30), "k", "t").await.unwrap();
        assert_eq!(stats.parts, 3);
        drop(uploader);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let retries = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::PartRetry { part_number: 2, .. }))
            .count();
        assert_eq!(retries, 2);
        assert!(events.contains(&UploadEvent::BytesRead { bytes: 30, total: 30 }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, UploadEvent::PartUploaded { .. }))
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_part_fails_upload_without_completing() {
        let data = vec![3u8; 30];
        let sink = Arc::new(FakeSink::failing(1, u32::MAX));
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 3, 3));
        let err = uploader.relay(source(&data, 30), "k", "t").await.unwrap_err();
        assert_eq!(
            err,
            BackupError::UploadPartFailure {
                part_number: 1,
                attempts: 3,
                message: "bad status code 500: internal error".to_string(),
            }
        );
        assert!(sink.completed.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_download_fails() {
        let sink = Arc::new(FakeSink::default());
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 3, 3));
        let stalled = stream::pending::<std::result::Result<Bytes, io::Error>>();
        let err = uploader.relay(stalled, "k", "t").await.unwrap_err();
        assert_eq!(err.kind(), stream_backup_core::ErrorKind::Remote);
        assert!(err.to_string().contains("stalled"));
    }

    #[tokio::test(start_paused = true)]
    async fn download_error_fails_upload() {
        let sink = Arc::new(FakeSink::default());
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 3, 3));
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"0123456789abc")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ]);
        let err = uploader.relay(broken, "k", "t").await.unwrap_err();
        assert!(err.to_string().contains("reset by peer"));
        assert!(sink.completed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_key_is_rejected_before_creating_upload() {
        let sink = Arc::new(FakeSink::default());
        let uploader = StreamingUploader::new(Arc::clone(&sink), options(10, 3, 3));
        let err = uploader.relay(source(b"abc", 3), "", "t").await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidInput(_)));
        assert!(sink.created.lock().unwrap().is_empty());
    }

    #[test]
    fn validates_descriptors() {
        let ok = UploadDescriptor::new("https://x/y", "backup.tar.gz");
        assert!(validate_descriptor(&ok).is_ok());
        for bad in ["not-a-url", "ftp://x/y", ""] {
            let descriptor = UploadDescriptor::new(bad, "backup.tar.gz");
            assert!(matches!(
                validate_descriptor(&descriptor),
                Err(BackupError::InvalidInput(_))
            ));
        }
        let no_key = UploadDescriptor::new("https://x/y", "");
        assert!(matches!(validate_descriptor(&no_key), Err(BackupError::InvalidInput(_))));
    }

    #[test]
    fn options_follow_settings() {
        let options = UploadOptions::default();
        assert_eq!(options.part_size, 10 * MIB);
        assert_eq!(options.concurrent_parts, 10);
        assert_eq!(options.retries, 5);
        assert_eq!(options.read_timeout, Some(Duration::from_secs(10)));
    }
}
