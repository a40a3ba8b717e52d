//! VM provisioning.
//!
//! [`VmCreator::create_for_instance_plan`] takes a resurrection plan to a
//! running, agent-reachable VM with its disks attached and its initial spec
//! applied:
//!
//! 1. reserve the plan's addresses
//! 2. resolve the cloud for the plan's zone and the stemcell for that cloud
//! 3. create the VM under a fresh agent id and record it
//! 4. tag it, attach disks, wait for the agent, mount disks
//! 5. render templates, apply the initial spec, record the new spec
//!
//! If anything after step 3 fails the new VM is deleted again, unless
//! unreachable VMs are kept for debugging.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use keel_id::AgentId;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::agent::AgentClientPool;
use crate::cloud::{Cloud, CloudError, CloudFactory, CreateVmRequest};
use crate::dns::{dns_record_name, DnsError};
use crate::error::{RecoveryError, RecoveryResult};
use crate::model::{detach_active_vm, InstanceRecord, InstanceStore, VmRecord};
use crate::plan::{InstancePlan, IpProvider, LinkProviderIntent, PlanError, StemcellCatalog};
use crate::templates::{TemplateBlobCache, TemplateError, TemplateRenderer};

/// Renders the `address` an instance is reached at.
#[derive(Debug, Clone)]
pub struct DnsEncoder {
    use_short_dns_addresses: bool,
    root_domain: String,
    group_ids: BTreeMap<String, u32>,
}

impl DnsEncoder {
    pub fn new(
        use_short_dns_addresses: bool,
        root_domain: impl Into<String>,
        group_ids: BTreeMap<String, u32>,
    ) -> Self {
        Self {
            use_short_dns_addresses,
            root_domain: root_domain.into(),
            group_ids,
        }
    }

    /// `q-m<index>s0.q-g<group>.<root>` when short addresses are enabled and
    /// the job has a group id, otherwise the uuid record name on `network`.
    pub fn encode_instance(&self, plan: &InstancePlan, network: &str) -> Result<String, DnsError> {
        let instance = &plan.instance;

        if self.use_short_dns_addresses {
            if let Some(group) = self.group_ids.get(&instance.job) {
                return Ok(format!(
                    "q-m{}s0.q-g{group}.{}",
                    instance.index, self.root_domain
                ));
            }
            debug!(job = %instance.job, "No DNS group id, falling back to long address");
        }

        dns_record_name(
            &instance.uuid.to_string(),
            &instance.job,
            network,
            &instance.deployment.name,
            &self.root_domain,
        )
    }
}

/// Per-call provisioning inputs.
pub struct ProvisionRequest<'a> {
    pub ip_provider: &'a dyn IpProvider,
    /// Existing managed disks to attach to the new VM.
    pub disk_cids: Vec<String>,
    pub tags: &'a BTreeMap<String, String>,
    /// Reuse the addresses recorded in the apply-spec.
    pub use_existing: bool,
    pub template_cache: &'a TemplateBlobCache,
    pub dns_encoder: &'a DnsEncoder,
    pub link_provider_intents: &'a [LinkProviderIntent],
}

/// Creates VMs for instance plans.
pub struct VmCreator {
    clouds: Arc<dyn CloudFactory>,
    stemcells: Arc<dyn StemcellCatalog>,
    store: Arc<dyn InstanceStore>,
    agents: Arc<AgentClientPool>,
    renderer: Arc<dyn TemplateRenderer>,
    keep_unreachable_vms: bool,
}

impl VmCreator {
    pub fn new(
        clouds: Arc<dyn CloudFactory>,
        stemcells: Arc<dyn StemcellCatalog>,
        store: Arc<dyn InstanceStore>,
        agents: Arc<AgentClientPool>,
        renderer: Arc<dyn TemplateRenderer>,
        keep_unreachable_vms: bool,
    ) -> Self {
        Self {
            clouds,
            stemcells,
            store,
            agents,
            renderer,
            keep_unreachable_vms,
        }
    }

    /// Create, record and bootstrap a VM for `plan`, attaching it to
    /// `instance`. On return the plan carries its rendered templates and
    /// `instance.spec` holds the spec the agent accepted.
    #[instrument(skip_all, fields(instance = %instance.name()))]
    pub async fn create_for_instance_plan(
        &self,
        instance: &mut InstanceRecord,
        plan: &mut InstancePlan,
        request: ProvisionRequest<'_>,
    ) -> RecoveryResult<()> {
        request
            .ip_provider
            .reserve_ips(plan, request.use_existing)
            .await
            .map_err(RecoveryError::Deployment)?;

        let (cloud, cpi) = self.clouds.get_for_az(plan.availability_zone_name())?;
        let stemcell = &plan.instance.stemcell;
        let stemcell_cid = self
            .stemcells
            .cid_for(stemcell, cpi.as_deref())
            .await
            .map_err(RecoveryError::Deployment)?
            .ok_or_else(|| PlanError::StemcellNotFound {
                name: stemcell.name.clone(),
                version: stemcell.version.clone(),
                cpi: cpi.clone().unwrap_or_else(|| "default".to_string()),
            })?;

        let agent_id = AgentId::new();
        let create = CreateVmRequest {
            agent_id,
            stemcell_cid,
            cloud_properties: plan.cloud_properties(),
            networks: plan.network_settings(),
            disk_cids: request.disk_cids.clone(),
            env: plan.instance.env.clone(),
        };
        let vm_cid = cloud.create_vm(&create).await?;
        info!(vm_cid = %vm_cid, agent_id = %agent_id, cpi = ?cpi, "Created VM");

        let vm = VmRecord {
            cid: vm_cid.clone(),
            cpi,
            agent_id,
            env: create.env,
            created_at: Utc::now(),
        };

        if let Err(e) = self.bootstrap(instance, plan, &request, cloud.as_ref(), vm).await {
            self.discard(instance, cloud.as_ref(), &vm_cid).await;
            return Err(e);
        }
        Ok(())
    }

    async fn bootstrap(
        &self,
        instance: &mut InstanceRecord,
        plan: &mut InstancePlan,
        request: &ProvisionRequest<'_>,
        cloud: &dyn Cloud,
        vm: VmRecord,
    ) -> RecoveryResult<()> {
        self.store
            .insert_vm(instance.uuid, &vm)
            .await
            .map_err(RecoveryError::Store)?;
        instance.active_vm = Some(vm.clone());
        self.store
            .update_instance(instance)
            .await
            .map_err(RecoveryError::Store)?;

        let mut metadata = request.tags.clone();
        metadata.insert("deployment".to_string(), instance.deployment.name.clone());
        metadata.insert("job".to_string(), instance.job.clone());
        metadata.insert("index".to_string(), instance.index.to_string());
        metadata.insert("id".to_string(), instance.uuid.to_string());
        cloud.set_vm_metadata(&vm.cid, &metadata).await?;

        for disk_cid in &request.disk_cids {
            cloud.attach_disk(&vm.cid, disk_cid).await?;
            debug!(vm_cid = %vm.cid, disk_cid = %disk_cid, "Attached disk");
        }

        let agent = self.agents.client(vm.agent_id, &instance.name()).await;
        agent.wait_until_ready().await?;

        if !request.disk_cids.is_empty() {
            let associations: Vec<Value> = request
                .disk_cids
                .iter()
                .map(|cid| json!({"name": cid, "cid": cid}))
                .collect();
            agent
                .update_settings(&json!({"disk_associations": associations}))
                .await?;
            for disk_cid in &request.disk_cids {
                agent.mount_disk(disk_cid).await?;
            }
        }

        let rendered = self
            .renderer
            .render(plan, request.template_cache, request.link_provider_intents)
            .await
            .map_err(TemplateError::Render)?;
        plan.rendered_templates = Some(rendered);

        let default_network = plan
            .network_settings()
            .as_object()
            .and_then(|networks| networks.keys().next().cloned())
            .unwrap_or_else(|| "default".to_string());
        let address = Value::String(request.dns_encoder.encode_instance(plan, &default_network)?);

        let mut resolved = plan.instance.spec.clone();
        set_field(&mut resolved, "address", address.clone());
        agent.apply(&resolved).await?;

        // Dynamic networks only learn their address from the agent.
        let reported_networks = agent.get_state().await?.networks;

        // Variable references stay unresolved in the stored spec.
        let mut stored = plan
            .existing_instance
            .spec
            .clone()
            .unwrap_or_else(|| json!({}));
        set_field(&mut stored, "address", address);
        if let Some(networks) = reported_networks {
            set_field(&mut resolved, "networks", networks.clone());
            set_field(&mut stored, "networks", networks);
        }

        plan.instance.spec = resolved;
        instance.spec = Some(stored);
        self.store
            .update_instance(instance)
            .await
            .map_err(RecoveryError::Store)?;
        Ok(())
    }

    /// Throw away a VM whose bootstrap failed.
    async fn discard(&self, instance: &mut InstanceRecord, cloud: &dyn Cloud, vm_cid: &str) {
        if self.keep_unreachable_vms {
            warn!(vm_cid, "Keeping unreachable VM for debugging");
            return;
        }

        match cloud.delete_vm(vm_cid).await {
            Ok(()) | Err(CloudError::VmNotFound(_)) => {
                info!(vm_cid, "Deleted VM after failed bootstrap");
            }
            Err(e) => {
                error!(vm_cid, error = ?e, "Failed to delete VM after failed bootstrap");
                return;
            }
        }

        if instance.vm_cid() == Some(vm_cid) {
            if let Err(e) = detach_active_vm(self.store.as_ref(), instance).await {
                error!(vm_cid, error = %e, "Failed to detach VM after failed bootstrap");
            }
        }
    }
}

fn set_field(spec: &mut Value, key: &str, value: Value) {
    if let Some(fields) = spec.as_object_mut() {
        fields.insert(key.to_string(), value);
    }
}
