//! Persisted records the recovery engine reads and mutates.
//!
//! Storage itself belongs to the surrounding system and is reached through
//! [`InstanceStore`]. Recovery never creates or removes an instance record;
//! it only swaps the VM attached to one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_id::AgentId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Desired lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Started,
    Stopped,
    Detached,
}

/// The deployment an instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,

    /// Tags propagated to every VM created for the deployment.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Cloud-side VM attached to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Cloud id assigned by the CPI.
    pub cid: String,

    /// CPI that created the VM; `None` means the default cloud.
    pub cpi: Option<String>,

    pub agent_id: AgentId,

    /// Environment the VM was created with.
    pub env: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

/// A persistent disk known to the director.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentDisk {
    pub disk_cid: String,

    /// Managed disks are owned by the instance; unmanaged ones are only
    /// attached on request and never handed to the provisioner.
    pub managed: bool,

    pub active: bool,
}

/// Rendered job templates uploaded for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedTemplatesArchive {
    pub blob_id: String,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted identity and state of one workload slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub uuid: Uuid,
    pub job: String,
    pub index: u32,
    pub deployment: DeploymentRecord,

    pub availability_zone: Option<String>,

    #[serde(default)]
    pub cloud_properties: serde_json::Value,

    pub state: InstanceState,

    /// Last apply-spec sent to the agent. Must be a JSON object.
    pub spec: Option<serde_json::Value>,

    /// VM environment. Must be a JSON object.
    pub vm_env: Option<serde_json::Value>,

    pub active_vm: Option<VmRecord>,

    #[serde(default)]
    pub persistent_disks: Vec<PersistentDisk>,

    #[serde(default)]
    pub rendered_templates_archives: Vec<RenderedTemplatesArchive>,

    /// False while an update is in flight or after one failed.
    pub update_completed: bool,
}

impl InstanceRecord {
    /// `job/uuid`, the name used in logs and agent handles.
    pub fn name(&self) -> String {
        format!("{}/{}", self.job, self.uuid)
    }

    pub fn vm_cid(&self) -> Option<&str> {
        self.active_vm.as_ref().map(|vm| vm.cid.as_str())
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.active_vm.as_ref().map(|vm| vm.agent_id)
    }

    /// The active managed disk, if any.
    pub fn managed_persistent_disk_cid(&self) -> Option<&str> {
        self.persistent_disks
            .iter()
            .find(|disk| disk.managed && disk.active)
            .map(|disk| disk.disk_cid.as_str())
    }

    /// Most recently persisted templates archive.
    pub fn latest_rendered_templates_archive(&self) -> Option<&RenderedTemplatesArchive> {
        self.rendered_templates_archives
            .iter()
            .max_by_key(|archive| archive.created_at)
    }

    /// The `update` section of the apply-spec, if present and non-null.
    pub fn update_section(&self) -> Option<&serde_json::Value> {
        self.spec
            .as_ref()
            .and_then(|spec| spec.get("update"))
            .filter(|update| !update.is_null())
    }
}

/// Storage for instance and VM records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Latest persisted state of an instance, if it still exists.
    async fn get_instance(&self, uuid: Uuid) -> anyhow::Result<Option<InstanceRecord>>;

    /// Persist the current state of an instance record.
    async fn update_instance(&self, instance: &InstanceRecord) -> anyhow::Result<()>;

    /// Record a newly created VM for an instance.
    async fn insert_vm(&self, instance_uuid: Uuid, vm: &VmRecord) -> anyhow::Result<()>;

    /// Destroy a VM record.
    async fn delete_vm(&self, vm: &VmRecord) -> anyhow::Result<()>;
}

/// Clear an instance's VM reference and destroy the VM record.
///
/// Returns the detached VM, or `None` if nothing was attached.
pub async fn detach_active_vm(
    store: &dyn InstanceStore,
    instance: &mut InstanceRecord,
) -> anyhow::Result<Option<VmRecord>> {
    let Some(vm) = instance.active_vm.take() else {
        return Ok(None);
    };

    store.update_instance(instance).await?;
    store.delete_vm(&vm).await?;
    Ok(Some(vm))
}
