use crate::api::BackupApi;
use crate::poll::{PollOptions, ReadinessPoller};
use stream_backup_core::config::DeploymentConfig;
use stream_backup_core::model::{
    destination_key, ClusterSummary, RestoreJob, SnapshotRecord, UploadDescriptor,
};
use stream_backup_core::select::select_max_by;
use stream_backup_core::{BackupError, Result};
use tracing::{debug, info};

/// Per-run state. The cluster id is resolved once, before snapshots are listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineContext {
    pub group_id: String,
    pub replica_set_name: String,
    cluster_id: Option<String>,
}

impl PipelineContext {
    pub fn new(settings: &DeploymentConfig) -> Self {
        Self {
            group_id: settings.group_id.clone(),
            replica_set_name: settings.replica_set_name.clone(),
            cluster_id: None,
        }
    }

    pub fn cluster_id(&self) -> Option<&str> {
        self.cluster_id.as_deref()
    }

    fn record_cluster_id(&mut self, cluster_id: String) -> Result<()> {
        if let Some(existing) = &self.cluster_id {
            return Err(BackupError::InvalidConfig(format!(
                "cluster id already resolved to {existing}"
            )));
        }
        self.cluster_id = Some(cluster_id);
        Ok(())
    }

    fn require_cluster_id(&self) -> Result<&str> {
        self.cluster_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BackupError::InvalidConfig("cluster id has not been resolved".to_string()))
    }
}

/// Drives one deployment from cluster lookup to a downloadable delivery.
pub struct Orchestrator<A> {
    name: String,
    settings: DeploymentConfig,
    api: A,
    poll: PollOptions,
    content_type: String,
}

impl<A: BackupApi> Orchestrator<A> {
    pub fn new(name: impl Into<String>, settings: DeploymentConfig, api: A, poll: PollOptions) -> Self {
        Self {
            name: name.into(),
            settings,
            api,
            poll,
            content_type: UploadDescriptor::DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &DeploymentConfig {
        &self.settings
    }

    /// Runs every stage in order against a fresh context, stopping at the first failure.
    pub async fn resolve_delivery(&self) -> Result<UploadDescriptor> {
        let mut ctx = PipelineContext::new(&self.settings);
        let clusters = self.list_clusters(&ctx).await?;
        self.find_cluster(&mut ctx, &clusters)?;
        let snapshots = self.list_snapshots(&ctx).await?;
        let job = self.restore_latest_snapshot(&ctx, &snapshots).await?;
        self.await_delivery(&ctx, &job).await
    }

    pub async fn list_clusters(&self, ctx: &PipelineContext) -> Result<Vec<ClusterSummary>> {
        if ctx.group_id.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "deployment {} has no group_id",
                self.name
            )));
        }
        info!(deployment = %self.name, group_id = %ctx.group_id, "1. listing clusters");
        self.api.list_clusters(&ctx.group_id).await
    }

    pub fn find_cluster(&self, ctx: &mut PipelineContext, clusters: &[ClusterSummary]) -> Result<()> {
        if ctx.replica_set_name.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "deployment {} has no replica_set_name",
                self.name
            )));
        }
        if clusters.is_empty() {
            return Err(BackupError::NotFound(format!(
                "group {} has no clusters",
                ctx.group_id
            )));
        }
        debug!(deployment = %self.name, clusters = clusters.len(), "2. resolving cluster");
        let cluster = clusters
            .iter()
            .find(|c| c.replica_set_name == ctx.replica_set_name)
            .ok_or_else(|| {
                BackupError::NotFound(format!(
                    "no cluster with replica set {}",
                    ctx.replica_set_name
                ))
            })?;
        ctx.record_cluster_id(cluster.cluster_id.clone())
    }

    pub async fn list_snapshots(&self, ctx: &PipelineContext) -> Result<Vec<SnapshotRecord>> {
        let cluster_id = ctx.require_cluster_id()?;
        info!(deployment = %self.name, cluster_id, "3. listing snapshots");
        self.api.list_snapshots(&ctx.group_id, cluster_id).await
    }

    pub async fn restore_latest_snapshot(
        &self,
        ctx: &PipelineContext,
        snapshots: &[SnapshotRecord],
    ) -> Result<RestoreJob> {
        let cluster_id = ctx.require_cluster_id()?;
        let latest = select_max_by(snapshots, SnapshotRecord::created_timestamp).ok_or_else(|| {
            BackupError::NoSnapshotsAvailable(if snapshots.is_empty() {
                format!("cluster {cluster_id} has no snapshots")
            } else {
                format!(
                    "none of the {} snapshot(s) of cluster {cluster_id} has a creation date",
                    snapshots.len()
                )
            })
        })?;
        info!(
            deployment = %self.name,
            snapshot_id = %latest.id,
            created = latest.created_timestamp().unwrap_or_default(),
            "4. creating restore job for latest snapshot"
        );
        self.api
            .create_restore_job(&ctx.group_id, cluster_id, &latest.id)
            .await
    }

    pub async fn await_delivery(&self, ctx: &PipelineContext, job: &RestoreJob) -> Result<UploadDescriptor> {
        let cluster_id = ctx.require_cluster_id()?;
        let status_url = job.status_url().ok_or_else(|| {
            BackupError::transport("restore job response carried no status link")
        })?;
        info!(
            deployment = %self.name,
            max_ticks = self.poll.max_ticks,
            "5. polling restore job until ready"
        );
        let ticks = ReadinessPoller::new(self.poll).run(&self.api, status_url).await?;
        info!(deployment = %self.name, ticks, "restore job ready");

        let listing = self.api.list_restore_jobs(&ctx.group_id, cluster_id).await?;
        let latest = select_max_by(&listing, |entry| entry.timestamp_date()).ok_or_else(|| {
            BackupError::NoSnapshotsAvailable(format!(
                "no restore jobs with a timestamp among {} listed",
                listing.len()
            ))
        })?;
        let download_url = latest.delivery_url().filter(|url| !url.is_empty()).ok_or_else(|| {
            BackupError::NoSnapshotsAvailable("latest restore job has no delivery url".to_string())
        })?;
        let timestamp = latest.timestamp_date().unwrap_or_default();

        let descriptor = UploadDescriptor {
            download_url: download_url.to_string(),
            destination_key: destination_key(&ctx.replica_set_name, timestamp),
            content_type: self.content_type.clone(),
        };
        debug!(deployment = %self.name, key = %descriptor.destination_key, "resolved delivery");
        Ok(descriptor)
    }
}
