//! Scripted in-memory [`BackupApi`] and a one-shot local HTTP server for
//! unit tests.

use crate::api::BackupApi;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use stream_backup_core::model::{
    ClusterSummary, JobStatus, Link, RestoreJob, RestoreJobListingEntry, SnapshotRecord,
};
use stream_backup_core::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct FakeApi {
    clusters: Result<Vec<ClusterSummary>>,
    snapshots: Result<Vec<SnapshotRecord>>,
    restore_job: Result<RestoreJob>,
    statuses: Mutex<VecDeque<Result<JobStatus>>>,
    listing: Result<Vec<RestoreJobListingEntry>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            clusters: Ok(Vec::new()),
            snapshots: Ok(Vec::new()),
            restore_job: Ok(RestoreJob {
                id: Some("job1".to_string()),
                links: vec![Link {
                    href: "https://api/jobs/1".to_string(),
                }],
                status_name: None,
            }),
            statuses: Mutex::new(VecDeque::new()),
            listing: Ok(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeApi {
    pub fn with_clusters(mut self, clusters: Result<Vec<ClusterSummary>>) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Result<Vec<SnapshotRecord>>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_restore_job(mut self, job: Result<RestoreJob>) -> Self {
        self.restore_job = job;
        self
    }

    /// Status responses in order; once exhausted the job stays `IN_PROGRESS`.
    pub fn with_statuses(self, statuses: Vec<Result<JobStatus>>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_listing(mut self, listing: Result<Vec<RestoreJobListingEntry>>) -> Self {
        self.listing = listing;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn status_queries(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with("job_status"))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BackupApi for FakeApi {
    async fn list_clusters(&self, group_id: &str) -> Result<Vec<ClusterSummary>> {
        self.record(format!("list_clusters:{group_id}"));
        self.clusters.clone()
    }

    async fn list_snapshots(&self, group_id: &str, cluster_id: &str) -> Result<Vec<SnapshotRecord>> {
        self.record(format!("list_snapshots:{group_id}:{cluster_id}"));
        self.snapshots.clone()
    }

    async fn create_restore_job(
        &self,
        group_id: &str,
        cluster_id: &str,
        snapshot_id: &str,
    ) -> Result<RestoreJob> {
        self.record(format!("create_restore_job:{group_id}:{cluster_id}:{snapshot_id}"));
        self.restore_job.clone()
    }

    async fn job_status(&self, status_url: &str) -> Result<JobStatus> {
        self.record(format!("job_status:{status_url}"));
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(JobStatus::InProgress))
    }

    async fn list_restore_jobs(
        &self,
        group_id: &str,
        cluster_id: &str,
    ) -> Result<Vec<RestoreJobListingEntry>> {
        self.record(format!("list_restore_jobs:{group_id}:{cluster_id}"));
        self.listing.clone()
    }
}

/// Serves one canned HTTP response per accepted connection, in order, and
/// hands back the raw request heads it received.
pub async fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let mut requests = Vec::with_capacity(responses.len());
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            requests.push(String::from_utf8_lossy(&head).into_owned());
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        requests
    });
    (base_url, handle)
}

/// A `Connection: close` response with the given status line tail.
pub fn response(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}
