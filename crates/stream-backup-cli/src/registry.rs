//! Drives every planned (deployment, provider) pair, one at a time.

use std::collections::BTreeMap;
use stream_backup_core::config::UploadSettings;
use stream_backup_core::model::{UploadStats, Uploader};
use stream_backup_core::plan::{Plan, PlannedDeployment, ProviderRef};
use stream_backup_core::report::{RunRecord, RunSummary};
use stream_backup_core::{BackupError, Result};
use stream_backup_service::{BackupApi, Orchestrator, PollOptions};
use stream_backup_storage::Provider;
use tracing::{error, info};

struct DeploymentRun<A> {
    orchestrator: Orchestrator<A>,
    providers: Vec<ProviderRef>,
}

pub struct Registry<A, U> {
    deployments: Vec<DeploymentRun<A>>,
    providers: BTreeMap<ProviderRef, U>,
}

impl<A: BackupApi, U: Uploader> Registry<A, U> {
    /// Pairs each planned deployment with an API handle from `make_api` and
    /// checks that every provider it references has an initialized handle.
    pub fn new<F>(
        plan: &Plan,
        providers: BTreeMap<ProviderRef, U>,
        mut make_api: F,
        poll: PollOptions,
        content_type: &str,
    ) -> Result<Self>
    where
        F: FnMut(&PlannedDeployment) -> Result<A>,
    {
        let mut deployments = Vec::with_capacity(plan.deployments.len());
        for planned in &plan.deployments {
            if let Some(missing) = planned.providers.iter().find(|r| !providers.contains_key(*r)) {
                return Err(BackupError::InvalidConfig(format!(
                    "provider instance {missing} used by {} was not initialized",
                    planned.name
                )));
            }
            let api = make_api(planned)?;
            deployments.push(DeploymentRun {
                orchestrator: Orchestrator::new(planned.name.clone(), planned.settings.clone(), api, poll)
                    .with_content_type(content_type),
                providers: planned.providers.clone(),
            });
        }
        Ok(Self {
            deployments,
            providers,
        })
    }

    pub fn pairs(&self) -> usize {
        self.deployments.iter().map(|d| d.providers.len()).sum()
    }

    /// Runs every pair to completion. A failed pair is recorded and the
    /// remaining pairs still run.
    pub async fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for deployment in &self.deployments {
            let name = deployment.orchestrator.name();
            info!(deployment = name, providers = deployment.providers.len(), "backing up deployment");
            for reference in &deployment.providers {
                let provider = reference.to_string();
                let outcome = self.run_pair(deployment, reference).await;
                match &outcome {
                    Ok(stats) => info!(
                        deployment = name,
                        %provider,
                        key = %stats.object_key,
                        bytes = stats.bytes,
                        "backup stored"
                    ),
                    Err(err) => error!(deployment = name, %provider, kind = %err.kind(), error = %err, "backup failed"),
                }
                summary.push(RunRecord::from_outcome(name, &provider, &outcome));
            }
        }
        summary
    }

    async fn run_pair(&self, deployment: &DeploymentRun<A>, reference: &ProviderRef) -> Result<UploadStats> {
        let uploader = self
            .providers
            .get(reference)
            .ok_or_else(|| BackupError::NotFound(format!("provider instance {reference}")))?;
        let descriptor = deployment.orchestrator.resolve_delivery().await?;
        uploader.upload(&descriptor).await
    }
}

/// Initializes one handle per distinct provider instance in the plan.
pub async fn init_providers(plan: &Plan, upload: &UploadSettings) -> Result<BTreeMap<ProviderRef, Provider>> {
    let mut providers = BTreeMap::new();
    for instance in &plan.providers {
        let provider = Provider::from_instance(instance, upload).await?;
        providers.insert(instance.reference.clone(), provider);
    }
    Ok(providers)
}
