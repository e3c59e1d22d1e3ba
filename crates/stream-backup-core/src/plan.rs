//! Validated view of the configuration: which deployments run, and which
//! provider instances they need initialized.

use crate::config::{Config, DeploymentConfig};
use crate::error::{BackupError, Result};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// `<provider>.<instance>` reference, e.g. `aws.firstAwsProviderInstance`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderRef {
    pub provider: String,
    pub instance: String,
}

impl ProviderRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let (provider, instance) = reference.split_once('.').ok_or_else(|| {
            BackupError::InvalidConfig(format!("provider instance reference {reference:?} is invalid"))
        })?;
        if provider.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "provider instance reference {reference:?} has no provider name"
            )));
        }
        if instance.is_empty() {
            return Err(BackupError::InvalidConfig(format!(
                "provider instance reference {reference:?} has no instance name"
            )));
        }
        Ok(Self {
            provider: provider.to_string(),
            instance: instance.to_string(),
        })
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.instance)
    }
}

#[derive(Debug, Clone)]
pub struct PlannedDeployment {
    pub name: String,
    pub settings: DeploymentConfig,
    pub providers: Vec<ProviderRef>,
}

#[derive(Debug, Clone)]
pub struct ProviderInstance {
    pub reference: ProviderRef,
    pub settings: toml::Value,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub deployments: Vec<PlannedDeployment>,
    /// One entry per distinct referenced instance, in first-referenced order.
    pub providers: Vec<ProviderInstance>,
}

impl Plan {
    pub fn from_config(config: &Config) -> Result<Self> {
        let providers_section = config
            .providers
            .as_ref()
            .ok_or_else(|| BackupError::InvalidConfig("missing [providers] section".to_string()))?;
        let deployments_section = config.deployments.as_ref().ok_or_else(|| {
            BackupError::InvalidConfig("missing [deployments] section".to_string())
        })?;
        if deployments_section.is_empty() {
            return Err(BackupError::InvalidConfig(
                "[deployments] section is empty".to_string(),
            ));
        }

        let mut deployments = Vec::new();
        let mut providers = Vec::new();
        let mut seen = HashSet::new();

        for (name, settings) in deployments_section {
            if settings.provider_instances.is_empty() {
                warn!(deployment = %name, "deployment lists no provider instances; skipping");
                continue;
            }
            let mut refs = Vec::with_capacity(settings.provider_instances.len());
            for reference in &settings.provider_instances {
                let parsed = ProviderRef::parse(reference)?;
                if seen.insert(parsed.clone()) {
                    let instance_settings = providers_section
                        .get(&parsed.provider)
                        .and_then(|instances| instances.get(&parsed.instance))
                        .ok_or_else(|| {
                            BackupError::InvalidConfig(format!(
                                "provider config for {parsed} does not exist"
                            ))
                        })?;
                    providers.push(ProviderInstance {
                        reference: parsed.clone(),
                        settings: instance_settings.clone(),
                    });
                }
                refs.push(parsed);
            }
            deployments.push(PlannedDeployment {
                name: name.clone(),
                settings: settings.clone(),
                providers: refs,
            });
        }

        if deployments.is_empty() {
            return Err(BackupError::InvalidConfig(
                "no deployment lists a provider instance".to_string(),
            ));
        }
        debug!(
            deployments = deployments.len(),
            providers = providers.len(),
            "built backup plan"
        );
        Ok(Self {
            deployments,
            providers,
        })
    }

    /// Restricts the plan to one deployment, keeping only the providers it uses.
    pub fn only(mut self, deployment: &str) -> Result<Self> {
        self.deployments.retain(|d| d.name == deployment);
        let picked = self.deployments.first().ok_or_else(|| {
            BackupError::NotFound(format!("deployment {deployment:?} is not in the plan"))
        })?;
        let used: HashSet<&ProviderRef> = picked.providers.iter().collect();
        self.providers.retain(|p| used.contains(&p.reference));
        Ok(self)
    }
}
