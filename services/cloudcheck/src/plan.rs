//! Instance plan reconstruction.
//!
//! Recreate has no manifest to work from, only the persisted instance record.
//! [`InstancePlanBuilder`] rebuilds an ephemeral [`InstancePlan`] from it:
//! stemcell from the apply-spec, availability zone from its name and stored
//! cloud properties, variables re-resolved through the interpolator.
//!
//! The availability zone deliberately carries no CPI. Resolving one would
//! mean parsing cloud config again; every cloud call goes through the
//! [`CloudFactory`](crate::cloud::CloudFactory) keyed by AZ name instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::model::{DeploymentRecord, InstanceRecord, InstanceState};
use crate::templates::RenderedTemplates;

/// Plan reconstruction errors.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("apply spec has no stemcell")]
    MissingStemcell,

    #[error("invalid stemcell spec: {0}")]
    InvalidStemcell(String),

    #[error("stemcell '{name}/{version}' is not uploaded for CPI '{cpi}'")]
    StemcellNotFound {
        name: String,
        version: String,
        cpi: String,
    },

    #[error("variable interpolation failed")]
    Interpolation(#[source] anyhow::Error),
}

/// Stemcell reference from an apply-spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stemcell {
    pub name: String,
    pub version: String,
    pub os: Option<String>,
}

impl Stemcell {
    /// Parse the `stemcell` section of an apply-spec. Versions may be
    /// written as numbers or strings.
    pub fn parse(spec: Option<&serde_json::Value>) -> Result<Self, PlanError> {
        let spec = spec.filter(|s| !s.is_null()).ok_or(PlanError::MissingStemcell)?;
        let section = spec
            .as_object()
            .ok_or_else(|| PlanError::InvalidStemcell(format!("expected a map, got {spec}")))?;

        let name = section
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PlanError::InvalidStemcell("missing name".to_string()))?;

        let version = match section.get("version") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(PlanError::InvalidStemcell("missing version".to_string())),
        };

        let os = section.get("os").and_then(|v| v.as_str()).map(str::to_string);

        Ok(Self {
            name: name.to_string(),
            version,
            os,
        })
    }
}

/// Availability zone rebuilt from stored data.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityZone {
    pub name: String,
    pub cloud_properties: serde_json::Value,
    /// Always `None` for reconstructed zones.
    pub cpi: Option<String>,
}

/// Re-resolves `((variables))` in a raw spec.
#[async_trait]
pub trait VariablesInterpolator: Send + Sync {
    async fn interpolate(
        &self,
        deployment: &DeploymentRecord,
        raw: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Looks up the cloud-side id of an uploaded stemcell.
#[async_trait]
pub trait StemcellCatalog: Send + Sync {
    /// `Ok(None)` when the stemcell is not uploaded for that CPI.
    async fn cid_for(&self, stemcell: &Stemcell, cpi: Option<&str>)
        -> anyhow::Result<Option<String>>;
}

/// Reserves network addresses for a plan.
#[async_trait]
pub trait IpProvider: Send + Sync {
    /// With `reuse_existing` the addresses already recorded in the apply-spec
    /// are reserved again instead of allocating new ones.
    async fn reserve_ips(&self, plan: &InstancePlan, reuse_existing: bool) -> anyhow::Result<()>;
}

/// A link an instance provides to other jobs; passed through to rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkProviderIntent {
    pub name: String,
    pub link_type: String,
    pub shared: bool,
    pub content: serde_json::Value,
}

/// The slice of a parsed deployment the recovery engine needs.
pub struct DeploymentPlanner {
    pub ip_provider: Arc<dyn IpProvider>,
    pub use_short_dns_addresses: bool,
    pub link_provider_intents: Vec<LinkProviderIntent>,
    /// Numeric DNS group ids keyed by job name, used for short addresses.
    pub dns_group_ids: BTreeMap<String, u32>,
}

/// Builds a [`DeploymentPlanner`] from a stored deployment.
#[async_trait]
pub trait PlannerFactory: Send + Sync {
    async fn create_from_deployment(
        &self,
        deployment: &DeploymentRecord,
    ) -> anyhow::Result<DeploymentPlanner>;
}

/// In-memory instance rebuilt from an instance record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedInstance {
    pub uuid: Uuid,
    pub job: String,
    pub index: u32,
    pub state: InstanceState,
    pub cloud_properties: serde_json::Value,
    pub stemcell: Stemcell,
    pub env: serde_json::Value,
    pub deployment: DeploymentRecord,
    pub availability_zone: Option<AvailabilityZone>,
    /// Apply-spec with variables resolved.
    pub spec: serde_json::Value,
}

/// Desired side of a resurrection plan. There is no manifest entry to point
/// at, so it carries nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredInstance;

/// Request-scoped plan for recreating one instance. Never persisted.
#[derive(Debug, Clone)]
pub struct InstancePlan {
    /// Snapshot of the record when the plan was built.
    pub existing_instance: InstanceRecord,
    pub instance: PlannedInstance,
    pub desired_instance: DesiredInstance,
    pub recreate: bool,
    pub tags: BTreeMap<String, String>,
    /// Filled in by the provisioner once the new VM is up.
    pub rendered_templates: Option<RenderedTemplates>,
}

impl InstancePlan {
    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.instance.job, self.instance.uuid)
    }

    pub fn availability_zone_name(&self) -> Option<&str> {
        self.instance
            .availability_zone
            .as_ref()
            .map(|az| az.name.as_str())
    }

    /// `networks` section of the resolved spec.
    pub fn network_settings(&self) -> serde_json::Value {
        self.instance
            .spec
            .get("networks")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Zone cloud properties overlaid with the instance's own.
    pub fn cloud_properties(&self) -> serde_json::Value {
        let mut merged = self
            .instance
            .availability_zone
            .as_ref()
            .and_then(|az| az.cloud_properties.as_object().cloned())
            .unwrap_or_default();

        if let Some(own) = self.instance.cloud_properties.as_object() {
            merged.extend(own.clone());
        }
        serde_json::Value::Object(merged)
    }
}

/// Rebuilds resurrection plans from instance records.
pub struct InstancePlanBuilder {
    interpolator: Arc<dyn VariablesInterpolator>,
}

impl InstancePlanBuilder {
    pub fn new(interpolator: Arc<dyn VariablesInterpolator>) -> Self {
        Self { interpolator }
    }

    /// Build a `recreate` plan carrying the deployment's tags.
    ///
    /// The record's spec and env must already have been validated.
    pub async fn resurrection_plan(&self, record: &InstanceRecord) -> Result<InstancePlan, PlanError> {
        let raw_spec = record.spec.clone().unwrap_or_else(|| serde_json::json!({}));
        let stemcell = Stemcell::parse(raw_spec.get("stemcell"))?;

        let availability_zone = record.availability_zone.as_ref().map(|name| AvailabilityZone {
            name: name.clone(),
            cloud_properties: record.cloud_properties.clone(),
            cpi: None,
        });

        let spec = self
            .interpolator
            .interpolate(&record.deployment, &raw_spec)
            .await
            .map_err(PlanError::Interpolation)?;

        debug!(
            instance = %record.name(),
            stemcell = %format!("{}/{}", stemcell.name, stemcell.version),
            az = ?record.availability_zone,
            "Rebuilt instance plan"
        );

        Ok(InstancePlan {
            existing_instance: record.clone(),
            instance: PlannedInstance {
                uuid: record.uuid,
                job: record.job.clone(),
                index: record.index,
                state: record.state,
                cloud_properties: record.cloud_properties.clone(),
                stemcell,
                env: record.vm_env.clone().unwrap_or_else(|| serde_json::json!({})),
                deployment: record.deployment.clone(),
                availability_zone,
                spec,
            },
            desired_instance: DesiredInstance,
            recreate: true,
            tags: record.deployment.tags.clone(),
            rendered_templates: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{self, PassthroughInterpolator};
    use rstest::rstest;

    #[rstest]
    #[case(serde_json::json!({"name": "ubuntu", "version": "1.5"}), "1.5")]
    #[case(serde_json::json!({"name": "ubuntu", "version": 621}), "621")]
    fn test_stemcell_parse(#[case] spec: serde_json::Value, #[case] version: &str) {
        let stemcell = Stemcell::parse(Some(&spec)).unwrap();
        assert_eq!(stemcell.name, "ubuntu");
        assert_eq!(stemcell.version, version);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(serde_json::Value::Null))]
    fn test_stemcell_missing(#[case] spec: Option<serde_json::Value>) {
        assert!(matches!(
            Stemcell::parse(spec.as_ref()),
            Err(PlanError::MissingStemcell)
        ));
    }

    #[rstest]
    #[case(serde_json::json!("ubuntu/1"))]
    #[case(serde_json::json!({"version": "1"}))]
    #[case(serde_json::json!({"name": "ubuntu"}))]
    fn test_stemcell_invalid(#[case] spec: serde_json::Value) {
        assert!(matches!(
            Stemcell::parse(Some(&spec)),
            Err(PlanError::InvalidStemcell(_))
        ));
    }

    #[tokio::test]
    async fn test_resurrection_plan() {
        let mut record = fakes::instance_record();
        record.deployment.tags.insert("team".to_string(), "infra".to_string());
        record.cloud_properties = serde_json::json!({"instance_type": "m5.large"});

        let builder = InstancePlanBuilder::new(Arc::new(PassthroughInterpolator));
        let plan = builder.resurrection_plan(&record).await.unwrap();

        assert!(plan.recreate);
        assert_eq!(plan.desired_instance, DesiredInstance);
        assert_eq!(plan.tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(plan.instance.stemcell.name, "ubuntu-jammy");

        let az = plan.instance.availability_zone.as_ref().unwrap();
        assert_eq!(az.name, "z1");
        assert_eq!(az.cpi, None);
        assert_eq!(
            plan.cloud_properties(),
            serde_json::json!({"instance_type": "m5.large"})
        );
        assert_eq!(plan.network_settings()["a"]["ip"], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_resurrection_plan_without_stemcell() {
        let mut record = fakes::instance_record();
        record.spec = Some(serde_json::json!({"networks": {}}));

        let builder = InstancePlanBuilder::new(Arc::new(PassthroughInterpolator));
        assert!(matches!(
            builder.resurrection_plan(&record).await,
            Err(PlanError::MissingStemcell)
        ));
    }
}
