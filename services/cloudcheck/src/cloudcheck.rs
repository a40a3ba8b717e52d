//! Recovery orchestrator.
//!
//! [`Cloudcheck`] resolves one detected problem on one instance at a time.
//! Every operation holds the instance's update lease for its whole duration,
//! so two resolutions never act on the same instance at once. Under the lease
//! the record is reloaded from the store; the caller's copy is overwritten
//! with the state the operation worked on.
//!
//! Agent timeouts and cancellation are reported as [`ProblemError`]s where
//! the operator can act on them; infrastructure failures pass through with
//! their own error types. Nothing is rolled back: a recreate that fails after
//! teardown leaves the instance without a VM.
//!
//! [`ProblemError`]: crate::error::ProblemError

use std::sync::Arc;

use keel_reconcile::UpdateConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentClientPool, AgentConnector, AgentError, AgentOptions};
use crate::cloud::CloudFactory;
use crate::config::CloudcheckConfig;
use crate::convergence::StateApplier;
use crate::dns::{DnsManager, DnsPropagator};
use crate::error::{problem, RecoveryError, RecoveryResult};
use crate::model::{detach_active_vm, InstanceRecord, InstanceStore, VmRecord};
use crate::plan::{InstancePlanBuilder, PlannerFactory, StemcellCatalog, VariablesInterpolator};
use crate::task::TaskContext;
use crate::templates::{
    Blobstore, RenderedJobTemplatesCleaner, RenderedTemplatesPersister, TemplateBlobCache,
    TemplateRenderer,
};
use crate::update_lock::InstanceUpdateLocks;
use crate::vm::{DnsEncoder, ProvisionRequest, VmCreator, VmDeleter};

/// A resolution an operator (or the resurrector) picked for a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Ignore,
    RebootVm,
    DeleteVm,
    DeleteVmReference,
    RecreateVm,
    RecreateVmWithoutWait,
}

/// External systems the orchestrator drives.
pub struct CloudcheckDeps {
    pub clouds: Arc<dyn CloudFactory>,
    pub agents: Arc<dyn AgentConnector>,
    pub store: Arc<dyn InstanceStore>,
    pub planners: Arc<dyn PlannerFactory>,
    pub interpolator: Arc<dyn VariablesInterpolator>,
    pub stemcells: Arc<dyn StemcellCatalog>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub blobstore: Arc<dyn Blobstore>,
    /// Record store serving the deployment's DNS zone.
    pub authoritative_dns: Arc<dyn DnsManager>,
    /// Director-local DNS records pushed to agents.
    pub local_dns: Arc<dyn DnsManager>,
}

/// Resolves cloudcheck problems for one task.
pub struct Cloudcheck {
    config: CloudcheckConfig,
    task: TaskContext,
    clouds: Arc<dyn CloudFactory>,
    store: Arc<dyn InstanceStore>,
    planners: Arc<dyn PlannerFactory>,
    blobstore: Arc<dyn Blobstore>,
    agents: Arc<AgentClientPool>,
    plan_builder: InstancePlanBuilder,
    deleter: VmDeleter,
    creator: VmCreator,
    dns: DnsPropagator,
    persister: RenderedTemplatesPersister,
    cleaner: RenderedJobTemplatesCleaner,
    update_locks: Arc<InstanceUpdateLocks>,
}

impl Cloudcheck {
    /// `update_locks` must be shared with every other task that may update
    /// the same instances.
    pub fn new(
        deps: CloudcheckDeps,
        config: CloudcheckConfig,
        task: TaskContext,
        update_locks: Arc<InstanceUpdateLocks>,
    ) -> Self {
        let agents = Arc::new(AgentClientPool::new(
            deps.agents,
            AgentOptions::new(config.agent_timeout, config.agent_get_state_retries),
            task.cancel.clone(),
        ));

        Self {
            plan_builder: InstancePlanBuilder::new(deps.interpolator),
            deleter: VmDeleter::new(
                deps.clouds.clone(),
                deps.store.clone(),
                config.enable_virtual_delete_vms,
            ),
            creator: VmCreator::new(
                deps.clouds.clone(),
                deps.stemcells,
                deps.store.clone(),
                agents.clone(),
                deps.renderer,
                config.keep_unreachable_vms,
            ),
            dns: DnsPropagator::new(
                deps.authoritative_dns,
                deps.local_dns,
                config.root_domain.clone(),
            ),
            persister: RenderedTemplatesPersister::new(deps.blobstore.clone(), deps.store.clone()),
            cleaner: RenderedJobTemplatesCleaner::new(deps.blobstore.clone(), deps.store.clone()),
            clouds: deps.clouds,
            store: deps.store,
            planners: deps.planners,
            blobstore: deps.blobstore,
            agents,
            config,
            task,
            update_locks,
        }
    }

    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    pub fn config(&self) -> &CloudcheckConfig {
        &self.config
    }

    /// Number of agents this orchestrator has connected to.
    pub async fn cached_agent_clients(&self) -> usize {
        self.agents.cached_clients().await
    }

    /// Carry out `resolution` on `instance`.
    pub async fn apply_resolution(
        &self,
        instance: &mut InstanceRecord,
        resolution: Resolution,
    ) -> RecoveryResult<()> {
        match resolution {
            Resolution::Ignore => {
                debug!(instance = %instance.name(), "Ignoring problem");
                Ok(())
            }
            Resolution::RebootVm => self.reboot_vm(instance).await,
            Resolution::DeleteVm => self.delete_vm(instance).await,
            Resolution::DeleteVmReference => self.delete_vm_reference(instance).await,
            Resolution::RecreateVm => self.recreate_vm(instance, true).await,
            Resolution::RecreateVmWithoutWait => self.recreate_vm_without_wait(instance).await,
        }
    }

    /// Reboot the VM through its cloud and wait for the agent to answer.
    #[instrument(skip_all, fields(task = %self.task.id, instance = %instance.name()))]
    pub async fn reboot_vm(&self, instance: &InstanceRecord) -> RecoveryResult<()> {
        let _lease = self.update_locks.acquire(instance.uuid).await;
        let mut instance = instance.clone();
        self.reload(&mut instance).await?;

        let vm = attached_vm(&instance)?;
        let cloud = self.clouds.get(vm.cpi.as_deref())?;
        cloud.reboot_vm(&vm.cid).await?;
        info!(vm_cid = %vm.cid, "Rebooted VM, waiting for agent");

        let agent = self.agents.client(vm.agent_id, &instance.name()).await;
        match agent.wait_until_ready().await {
            Ok(()) => {
                info!(vm_cid = %vm.cid, "Agent is back");
                Ok(())
            }
            Err(AgentError::Timeout { .. }) => Err(problem("Agent still unresponsive after reboot")),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the VM, unless the agent still reports persistent disks.
    #[instrument(skip_all, fields(task = %self.task.id, instance = %instance.name()))]
    pub async fn delete_vm(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        let _lease = self.update_locks.acquire(instance.uuid).await;
        self.reload(instance).await?;

        let vm = attached_vm(instance)?.clone();
        let agent = self.agents.client(vm.agent_id, &instance.name()).await;

        let disks = match agent.list_disk().await {
            Ok(disks) => disks,
            Err(AgentError::Timeout { .. }) => {
                return Err(problem(format!("VM '{}' is not responding", vm.cid)));
            }
            Err(e) => return Err(e.into()),
        };

        if !disks.is_empty() {
            warn!(vm_cid = %vm.cid, disks = ?disks, "Refusing to delete VM with persistent disks");
            return Err(problem("VM has persistent disk attached"));
        }

        self.deleter.delete_for_instance(instance).await
    }

    /// Forget the VM without touching the cloud. No VM attached is a no-op.
    #[instrument(skip_all, fields(task = %self.task.id, instance = %instance.name()))]
    pub async fn delete_vm_reference(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        let _lease = self.update_locks.acquire(instance.uuid).await;
        self.reload(instance).await?;

        match detach_active_vm(self.store.as_ref(), instance)
            .await
            .map_err(RecoveryError::Store)?
        {
            Some(vm) => info!(vm_cid = %vm.cid, "Deleted VM reference"),
            None => debug!("No VM reference to delete"),
        }
        Ok(())
    }

    /// Delete the VM after checking the instance's stored metadata is intact.
    #[instrument(skip_all, fields(task = %self.task.id, instance = %instance.name()))]
    pub async fn delete_vm_from_cloud(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        let _lease = self.update_locks.acquire(instance.uuid).await;
        self.reload(instance).await?;
        self.delete_vm_from_cloud_locked(instance).await
    }

    pub async fn recreate_vm_without_wait(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        self.recreate_vm(instance, false).await
    }

    /// Replace the instance's VM with a new one built from its stored
    /// record, optionally waiting for its jobs to run.
    #[instrument(skip_all, fields(task = %self.task.id, instance = %instance.name(), wait_for_running = wait_for_running))]
    pub async fn recreate_vm(
        &self,
        instance: &mut InstanceRecord,
        wait_for_running: bool,
    ) -> RecoveryResult<()> {
        let _lease = self.update_locks.acquire(instance.uuid).await;
        self.reload(instance).await?;

        info!("Recreating VM");
        self.delete_vm_from_cloud_locked(instance).await?;

        instance.update_completed = false;
        self.store
            .update_instance(instance)
            .await
            .map_err(RecoveryError::Store)?;

        let planner = self
            .planners
            .create_from_deployment(&instance.deployment)
            .await
            .map_err(RecoveryError::Deployment)?;
        let dns_encoder = DnsEncoder::new(
            planner.use_short_dns_addresses,
            self.config.root_domain.clone(),
            planner.dns_group_ids.clone(),
        );
        let mut plan = self.plan_builder.resurrection_plan(instance).await?;

        let template_cache = TemplateBlobCache::new(self.blobstore.clone());
        let tags = plan.tags.clone();
        let request = ProvisionRequest {
            ip_provider: planner.ip_provider.as_ref(),
            disk_cids: instance
                .managed_persistent_disk_cid()
                .map(str::to_string)
                .into_iter()
                .collect(),
            tags: &tags,
            use_existing: true,
            template_cache: &template_cache,
            dns_encoder: &dns_encoder,
            link_provider_intents: &planner.link_provider_intents,
        };
        self.creator
            .create_for_instance_plan(instance, &mut plan, request)
            .await?;

        self.dns.propagate(instance).await?;

        self.persister.persist(instance, &plan).await?;

        let update_config = instance
            .update_section()
            .map(UpdateConfig::from_json)
            .transpose()?;

        let agent_id = attached_vm(instance)?.agent_id;
        let agent = self.agents.client(agent_id, &instance.name()).await;
        StateApplier::new(&plan, &agent, &self.cleaner)
            .apply(instance, update_config.as_ref(), wait_for_running)
            .await?;

        instance.update_completed = true;
        self.store
            .update_instance(instance)
            .await
            .map_err(RecoveryError::Store)?;

        info!(vm_cid = ?instance.vm_cid(), "Recreated VM");
        Ok(())
    }

    /// Replace `instance` with its latest stored state. Must be called with
    /// the instance's lease held.
    async fn reload(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        let current = self
            .store
            .get_instance(instance.uuid)
            .await
            .map_err(RecoveryError::Store)?
            .ok_or_else(|| problem(format!("Instance '{}' no longer exists", instance.name())))?;
        *instance = current;
        Ok(())
    }

    async fn delete_vm_from_cloud_locked(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        debug!(vm_cid = ?instance.vm_cid(), "Deleting VM from cloud");
        validate_spec(instance)?;
        validate_env(instance)?;
        self.deleter.delete_for_instance(instance).await
    }
}

fn attached_vm(instance: &InstanceRecord) -> RecoveryResult<&VmRecord> {
    instance
        .active_vm
        .as_ref()
        .ok_or_else(|| problem("Instance has no VM attached"))
}

fn validate_spec(instance: &InstanceRecord) -> RecoveryResult<()> {
    match &instance.spec {
        None | Some(serde_json::Value::Null) => Err(problem("Unable to look up VM apply spec")),
        Some(spec) if !spec.is_object() => Err(problem("Invalid apply spec format")),
        Some(_) => Ok(()),
    }
}

fn validate_env(instance: &InstanceRecord) -> RecoveryResult<()> {
    match &instance.vm_env {
        Some(env) if env.is_object() => Ok(()),
        _ => Err(problem("Invalid VM environment format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes;
    use rstest::rstest;

    #[rstest]
    #[case(None, "Unable to look up VM apply spec")]
    #[case(Some(serde_json::Value::Null), "Unable to look up VM apply spec")]
    #[case(Some(serde_json::json!(["networks"])), "Invalid apply spec format")]
    #[case(Some(serde_json::json!("spec")), "Invalid apply spec format")]
    fn test_validate_spec(#[case] spec: Option<serde_json::Value>, #[case] message: &str) {
        let mut instance = fakes::instance_record();
        instance.spec = spec;
        let err = validate_spec(&instance).unwrap_err();
        assert_eq!(err.as_problem().unwrap().message(), message);
    }

    #[rstest]
    #[case(None)]
    #[case(Some(serde_json::Value::Null))]
    #[case(Some(serde_json::json!(["bosh"])))]
    fn test_validate_env(#[case] env: Option<serde_json::Value>) {
        let mut instance = fakes::instance_record();
        instance.vm_env = env;
        let err = validate_env(&instance).unwrap_err();
        assert_eq!(err.as_problem().unwrap().message(), "Invalid VM environment format");
    }

    #[test]
    fn test_resolution_names() {
        let resolution: Resolution = serde_json::from_str("\"recreate_vm_without_wait\"").unwrap();
        assert_eq!(resolution, Resolution::RecreateVmWithoutWait);
        assert_eq!(
            serde_json::to_string(&Resolution::DeleteVmReference).unwrap(),
            "\"delete_vm_reference\""
        );
    }
}
