use crate::auth::{new_cnonce, Credentials, DigestChallenge};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use stream_backup_core::config::{ApiSettings, DeploymentConfig};
use stream_backup_core::model::{
    ClusterSummary, JobStatus, RestoreJob, RestoreJobListingEntry, SnapshotRecord,
};
use stream_backup_core::{BackupError, Result};
use tracing::debug;

/// Responses with a status at or above this are stage failures.
pub const BAD_REQUEST_STATUS_CODE_FLOOR: u16 = 300;
const MAX_ERROR_BODY: usize = 512;

/// Calls the pipeline makes against the backup-management service.
#[async_trait]
pub trait BackupApi: Send + Sync {
    async fn list_clusters(&self, group_id: &str) -> Result<Vec<ClusterSummary>>;

    async fn list_snapshots(&self, group_id: &str, cluster_id: &str) -> Result<Vec<SnapshotRecord>>;

    async fn create_restore_job(
        &self,
        group_id: &str,
        cluster_id: &str,
        snapshot_id: &str,
    ) -> Result<RestoreJob>;

    async fn job_status(&self, status_url: &str) -> Result<JobStatus>;

    async fn list_restore_jobs(
        &self,
        group_id: &str,
        cluster_id: &str,
    ) -> Result<Vec<RestoreJobListingEntry>>;
}

#[derive(Debug, Deserialize)]
struct Results<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Digest-authenticated JSON client for the cloud backup-management API.
#[derive(Debug, Clone)]
pub struct CloudManagerClient {
    http: Client,
    base: String,
    credentials: Credentials,
}

impl CloudManagerClient {
    pub fn new(deployment: &DeploymentConfig, settings: &ApiSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|err| BackupError::InvalidConfig(format!("failed to build HTTP client: {err}")))?;
        let base_url = deployment.base_url.as_deref().unwrap_or(&settings.base_url);
        Ok(Self {
            http,
            base: join_base(base_url, &settings.api_prefix),
            credentials: Credentials {
                username: deployment.username.clone(),
                password: deployment.api_key.clone(),
            },
        })
    }

    fn group_url(&self, group_id: &str, rest: &str) -> String {
        format!("{}/groups/{group_id}{rest}", self.base)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let body = self.send(Method::GET, url, None).await?;
        decode(body)
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
        let parsed = Url::parse(url)
            .map_err(|err| BackupError::InvalidInput(format!("invalid request url {url:?}: {err}")))?;
        debug!(%method, url, "backup api request");

        let mut response = self.request(method.clone(), &parsed, body, None).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .find_map(DigestChallenge::parse);
            if let Some(challenge) = challenge {
                let uri = request_uri(&parsed);
                let authorization =
                    challenge.authorization(&self.credentials, method.as_str(), &uri, 1, &new_cnonce());
                response = self.request(method, &parsed, body, Some(authorization)).await?;
            }
        }

        let status = response.status().as_u16();
        if status >= BAD_REQUEST_STATUS_CODE_FLOOR {
            let text = response.text().await.unwrap_or_default();
            return Err(BackupError::status(status, truncate(&text)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| BackupError::transport(format!("invalid response body from {url}: {err}")))
    }

    async fn request(
        &self,
        method: Method,
        url: &Url,
        body: Option<&Value>,
        authorization: Option<String>,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .request(method, url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        builder.send().await.map_err(BackupError::transport)
    }
}

#[async_trait]
impl BackupApi for CloudManagerClient {
    async fn list_clusters(&self, group_id: &str) -> Result<Vec<ClusterSummary>> {
        let listing: Results<ClusterSummary> = self.get(&self.group_url(group_id, "/clusters")).await?;
        Ok(listing.results)
    }

    async fn list_snapshots(&self, group_id: &str, cluster_id: &str) -> Result<Vec<SnapshotRecord>> {
        let url = self.group_url(group_id, &format!("/clusters/{cluster_id}/snapshots"));
        let listing: Results<SnapshotRecord> = self.get(&url).await?;
        Ok(listing.results)
    }

    async fn create_restore_job(
        &self,
        group_id: &str,
        cluster_id: &str,
        snapshot_id: &str,
    ) -> Result<RestoreJob> {
        let url = self.group_url(group_id, &format!("/clusters/{cluster_id}/restoreJobs"));
        let body = serde_json::json!({ "snapshotId": snapshot_id });
        let response = self.send(Method::POST, &url, Some(&body)).await?;
        decode(response)
    }

    async fn job_status(&self, status_url: &str) -> Result<JobStatus> {
        let listing: Results<RestoreJob> = self.get(status_url).await?;
        Ok(status_of(&listing.results))
    }

    async fn list_restore_jobs(
        &self,
        group_id: &str,
        cluster_id: &str,
    ) -> Result<Vec<RestoreJobListingEntry>> {
        let url = self.group_url(group_id, &format!("/clusters/{cluster_id}/restoreJobs"));
        let listing: Results<RestoreJobListingEntry> = self.get(&url).await?;
        Ok(listing.results)
    }
}

fn status_of(jobs: &[RestoreJob]) -> JobStatus {
    jobs.first()
        .and_then(|job| job.status_name.as_deref())
        .map(JobStatus::parse)
        .unwrap_or(JobStatus::Unknown)
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|err| BackupError::transport(format!("unexpected response shape: {err}")))
}

fn join_base(base_url: &str, prefix: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{prefix}")
    }
}

/// The request-target the digest response is computed over.
fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.trim().to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", text[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{response, serve};

    fn client(base_url: Option<&str>) -> CloudManagerClient {
        let deployment = DeploymentConfig {
            username: "ops".to_string(),
            api_key: "key".to_string(),
            base_url: base_url.map(str::to_string),
            ..Default::default()
        };
        CloudManagerClient::new(&deployment, &ApiSettings::default()).unwrap()
    }

    #[test]
    fn builds_group_scoped_urls() {
        let api = client(None);
        assert_eq!(
            api.group_url("g1", "/clusters"),
            "https://cloud.mongodb.com/api/public/v1.0/groups/g1/clusters"
        );
        let api = client(Some("http://localhost:8080/"));
        assert_eq!(
            api.group_url("g1", "/clusters/c1/snapshots"),
            "http://localhost:8080/api/public/v1.0/groups/g1/clusters/c1/snapshots"
        );
    }

    #[test]
    fn request_uri_keeps_query() {
        let url = Url::parse("https://host/api/jobs/1?pretty=true").unwrap();
        assert_eq!(request_uri(&url), "/api/jobs/1?pretty=true");
    }

    #[test]
    fn decodes_listing_payloads() {
        let body = serde_json::json!({
            "results": [
                { "delivery": { "url": "https://x/y" }, "timestamp": { "date": "2021-06-01" } }
            ],
            "totalCount": 1
        });
        let listing: Results<RestoreJobListingEntry> = decode(body).unwrap();
        assert_eq!(listing.results[0].delivery_url(), Some("https://x/y"));

        let empty: Results<SnapshotRecord> = decode(serde_json::json!({})).unwrap();
        assert!(empty.results.is_empty());
    }

    #[test]
    fn status_comes_from_first_result() {
        let jobs: Vec<RestoreJob> =
            serde_json::from_value(serde_json::json!([{ "statusName": "FINISHED" }, { "statusName": "IN_PROGRESS" }]))
                .unwrap();
        assert_eq!(status_of(&jobs), JobStatus::Finished);
        assert_eq!(status_of(&[]), JobStatus::Unknown);
    }

    #[tokio::test]
    async fn rejects_malformed_status_url_before_sending() {
        let err = client(None).job_status("terribly bad url").await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn answers_digest_challenge_once() {
        let challenge = response(
            "401 Unauthorized",
            &[("WWW-Authenticate", r#"Digest realm="MMS Public API", nonce="abc", qop="auth""#)],
            "",
        );
        let ok = response(
            "200 OK",
            &[("Content-Type", "application/json")],
            r#"{"results":[{"clusterName":"c1","id":"cid1","replicaSetName":"rs0"}]}"#,
        );
        let (base_url, server) = serve(vec![challenge, ok]).await;

        let clusters = client(Some(base_url.as_str())).list_clusters("g1").await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].cluster_id, "cid1");

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].to_ascii_lowercase().contains("authorization:"));
        let resent = requests[1].to_ascii_lowercase();
        assert!(resent.contains("authorization: digest"), "request: {resent}");
        assert!(resent.contains(r#"username="ops""#));
        assert!(resent.contains(r#"uri="/api/public/v1.0/groups/g1/clusters""#));
    }

    #[tokio::test]
    async fn server_error_becomes_remote_status() {
        let (base_url, server) = serve(vec![response("500 Internal Server Error", &[], "boom")]).await;

        let err = client(Some(base_url.as_str())).list_clusters("g1").await.unwrap_err();
        assert!(
            matches!(err, BackupError::Remote { status: Some(500), ref message } if message == "boom"),
            "got {err:?}"
        );
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_without_digest_challenge_is_not_retried() {
        let denied = response("401 Unauthorized", &[("WWW-Authenticate", r#"Basic realm="x""#)], "denied");
        let (base_url, server) = serve(vec![denied]).await;

        let err = client(Some(base_url.as_str())).list_clusters("g1").await.unwrap_err();
        assert!(matches!(err, BackupError::Remote { status: Some(401), .. }), "got {err:?}");
        assert_eq!(err.kind(), stream_backup_core::ErrorKind::Remote);
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[test]
    fn truncates_long_error_bodies() {
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        assert!(truncate(&long).ends_with("..."));
        assert_eq!(truncate(" short "), "short");
    }
}
