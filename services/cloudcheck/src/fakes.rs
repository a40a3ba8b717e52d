//! In-memory collaborators.
//!
//! One implementation per collaborator trait, each recording the calls it
//! receives. Used by the tests in this crate and available to embedders for
//! dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use keel_id::AgentId;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentConnector, AgentError, AgentState};
use crate::cloud::{Cloud, CloudError, CreateVmRequest};
use crate::dns::{DnsManager, DnsRecordSet};
use crate::model::{DeploymentRecord, InstanceRecord, InstanceState, InstanceStore, VmRecord};
use crate::plan::{
    DeploymentPlanner, InstancePlan, IpProvider, LinkProviderIntent, PlannerFactory, Stemcell,
    StemcellCatalog, VariablesInterpolator,
};
use crate::templates::{Blobstore, RenderedTemplates, TemplateBlobCache, TemplateRenderer};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An instance of job `worker`, index 0, in deployment `d1` and zone `z1`,
/// with VM `vm-1` attached and one network `a` at `10.0.0.5`.
pub fn instance_record() -> InstanceRecord {
    InstanceRecord {
        uuid: Uuid::new_v4(),
        job: "worker".to_string(),
        index: 0,
        deployment: DeploymentRecord {
            name: "d1".to_string(),
            tags: BTreeMap::new(),
        },
        availability_zone: Some("z1".to_string()),
        cloud_properties: json!({}),
        state: InstanceState::Started,
        spec: Some(json!({
            "stemcell": {"name": "ubuntu-jammy", "version": "1.200"},
            "networks": {"a": {"ip": "10.0.0.5"}},
        })),
        vm_env: Some(json!({})),
        active_vm: Some(VmRecord {
            cid: "vm-1".to_string(),
            cpi: None,
            agent_id: AgentId::new(),
            env: json!({}),
            created_at: Utc::now(),
        }),
        persistent_disks: vec![],
        rendered_templates_archives: vec![],
        update_completed: true,
    }
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

/// A call received by [`FakeCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    RebootVm(String),
    CreateVm(String),
    DeleteVm(String),
    AttachDisk { vm_cid: String, disk_cid: String },
    SetVmMetadata(String),
}

#[derive(Default)]
struct FakeCloudState {
    vms: BTreeSet<String>,
    calls: Vec<CloudCall>,
    created: Vec<CreateVmRequest>,
    metadata: HashMap<String, BTreeMap<String, String>>,
    next_vm: u32,
    failing: HashSet<&'static str>,
}

/// A cloud holding a set of VM cids.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeCloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, cid: &str) -> Self {
        self.add_vm(cid);
        self
    }

    pub fn add_vm(&self, cid: &str) {
        lock(&self.state).vms.insert(cid.to_string());
    }

    /// Drop a VM behind the engine's back.
    pub fn remove_vm(&self, cid: &str) {
        lock(&self.state).vms.remove(cid);
    }

    pub fn has(&self, cid: &str) -> bool {
        lock(&self.state).vms.contains(cid)
    }

    /// Make every call to `method` fail with a driver error.
    pub fn fail(&self, method: &'static str) {
        lock(&self.state).failing.insert(method);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.state).calls.clone()
    }

    pub fn reboots(&self) -> Vec<String> {
        self.calls_matching(|call| match call {
            CloudCall::RebootVm(cid) => Some(cid.clone()),
            _ => None,
        })
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls_matching(|call| match call {
            CloudCall::DeleteVm(cid) => Some(cid.clone()),
            _ => None,
        })
    }

    pub fn created(&self) -> Vec<CreateVmRequest> {
        lock(&self.state).created.clone()
    }

    pub fn metadata(&self, cid: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.state).metadata.get(cid).cloned()
    }

    fn calls_matching(&self, pick: impl Fn(&CloudCall) -> Option<String>) -> Vec<String> {
        lock(&self.state).calls.iter().filter_map(pick).collect()
    }

    fn record(&self, method: &'static str, call: CloudCall) -> Result<(), CloudError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.failing.contains(method) {
            return Err(CloudError::Driver {
                method,
                source: anyhow!("injected {method} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn reboot_vm(&self, vm_cid: &str) -> Result<(), CloudError> {
        self.record("reboot_vm", CloudCall::RebootVm(vm_cid.to_string()))?;
        if !self.has(vm_cid) {
            return Err(CloudError::VmNotFound(vm_cid.to_string()));
        }
        Ok(())
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<String, CloudError> {
        self.record("create_vm", CloudCall::CreateVm(request.agent_id.to_string()))?;
        let mut state = lock(&self.state);
        state.next_vm += 1;
        let cid = format!("vm-new-{}", state.next_vm);
        state.vms.insert(cid.clone());
        state.created.push(request.clone());
        Ok(cid)
    }

    async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError> {
        self.record("delete_vm", CloudCall::DeleteVm(vm_cid.to_string()))?;
        if !lock(&self.state).vms.remove(vm_cid) {
            return Err(CloudError::VmNotFound(vm_cid.to_string()));
        }
        Ok(())
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError> {
        self.record(
            "attach_disk",
            CloudCall::AttachDisk {
                vm_cid: vm_cid.to_string(),
                disk_cid: disk_cid.to_string(),
            },
        )?;
        if !self.has(vm_cid) {
            return Err(CloudError::VmNotFound(vm_cid.to_string()));
        }
        Ok(())
    }

    async fn set_vm_metadata(
        &self,
        vm_cid: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), CloudError> {
        self.record("set_vm_metadata", CloudCall::SetVmMetadata(vm_cid.to_string()))?;
        lock(&self.state)
            .metadata
            .insert(vm_cid.to_string(), metadata.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A call received by [`FakeAgent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Ping,
    ListDisk,
    GetState,
    Apply(Value),
    UpdateSettings(Value),
    MountDisk(String),
    RunScript(String),
    Start,
}

/// How a [`FakeAgent`] answers.
#[derive(Debug, Clone, Default)]
pub struct AgentBehavior {
    /// Methods that never answer.
    pub hung: HashSet<&'static str>,
    pub disks: Vec<String>,
    /// Job states handed out by successive `get_state` calls; the last one
    /// repeats. Empty means `running`.
    pub job_states: VecDeque<String>,
    pub networks: Option<Value>,
    /// Methods that fail with an RPC error.
    pub failing: HashSet<&'static str>,
}

impl AgentBehavior {
    pub fn hang(mut self, method: &'static str) -> Self {
        self.hung.insert(method);
        self
    }

    pub fn fail(mut self, method: &'static str) -> Self {
        self.failing.insert(method);
        self
    }

    pub fn disks(mut self, disks: &[&str]) -> Self {
        self.disks = disks.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn job_states(mut self, states: &[&str]) -> Self {
        self.job_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn networks(mut self, networks: Value) -> Self {
        self.networks = Some(networks);
        self
    }
}

/// A scriptable agent.
pub struct FakeAgent {
    agent_id: AgentId,
    behavior: Mutex<AgentBehavior>,
    calls: Mutex<Vec<AgentCall>>,
}

impl FakeAgent {
    pub fn new(agent_id: AgentId) -> Self {
        Self::with_behavior(agent_id, AgentBehavior::default())
    }

    pub fn with_behavior(agent_id: AgentId, behavior: AgentBehavior) -> Self {
        Self {
            agent_id,
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: AgentBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        lock(&self.calls).clone()
    }

    pub fn applied(&self) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::Apply(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::RunScript(script) => Some(script),
                _ => None,
            })
            .collect()
    }

    /// Record the call, then hang or fail as configured.
    async fn answer(&self, method: &'static str, call: AgentCall) -> Result<(), AgentError> {
        lock(&self.calls).push(call);

        let (hung, failing) = {
            let behavior = lock(&self.behavior);
            (
                behavior.hung.contains(method),
                behavior.failing.contains(method),
            )
        };

        if hung {
            std::future::pending::<()>().await;
        }
        if failing {
            return Err(AgentError::Rpc {
                agent_id: self.agent_id,
                method,
                message: format!("injected {method} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn ping(&self) -> Result<(), AgentError> {
        self.answer("ping", AgentCall::Ping).await
    }

    async fn list_disk(&self) -> Result<Vec<String>, AgentError> {
        self.answer("list_disk", AgentCall::ListDisk).await?;
        Ok(lock(&self.behavior).disks.clone())
    }

    async fn get_state(&self) -> Result<AgentState, AgentError> {
        self.answer("get_state", AgentCall::GetState).await?;

        let mut behavior = lock(&self.behavior);
        let job_state = if behavior.job_states.len() > 1 {
            behavior.job_states.pop_front()
        } else {
            behavior.job_states.front().cloned()
        };

        Ok(AgentState {
            job_state: job_state.unwrap_or_else(|| "running".to_string()),
            networks: behavior.networks.clone(),
        })
    }

    async fn apply(&self, spec: &Value) -> Result<(), AgentError> {
        self.answer("apply", AgentCall::Apply(spec.clone())).await
    }

    async fn update_settings(&self, settings: &Value) -> Result<(), AgentError> {
        self.answer("update_settings", AgentCall::UpdateSettings(settings.clone()))
            .await
    }

    async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
        self.answer("mount_disk", AgentCall::MountDisk(disk_cid.to_string()))
            .await
    }

    async fn run_script(&self, script: &str) -> Result<(), AgentError> {
        self.answer("run_script", AgentCall::RunScript(script.to_string()))
            .await
    }

    async fn start(&self) -> Result<(), AgentError> {
        self.answer("start", AgentCall::Start).await
    }
}

/// Hands out [`FakeAgent`]s. Agents not registered up front are created on
/// connect with the connector's fresh-agent behavior.
#[derive(Default)]
pub struct FakeAgentConnector {
    agents: Mutex<HashMap<AgentId, Arc<FakeAgent>>>,
    fresh: Mutex<AgentBehavior>,
    connects: Mutex<Vec<(AgentId, String)>>,
}

impl FakeAgentConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: AgentId, behavior: AgentBehavior) -> Arc<FakeAgent> {
        let agent = Arc::new(FakeAgent::with_behavior(agent_id, behavior));
        lock(&self.agents).insert(agent_id, agent.clone());
        agent
    }

    /// Behavior for agents first seen on connect, such as those of newly
    /// provisioned VMs.
    pub fn set_fresh_behavior(&self, behavior: AgentBehavior) {
        *lock(&self.fresh) = behavior;
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<Arc<FakeAgent>> {
        lock(&self.agents).get(&agent_id).cloned()
    }

    /// Every connect, in order, with the instance name it was made for.
    pub fn connects(&self) -> Vec<(AgentId, String)> {
        lock(&self.connects).clone()
    }
}

impl AgentConnector for FakeAgentConnector {
    fn connect(&self, agent_id: AgentId, instance_name: &str) -> Arc<dyn AgentClient> {
        lock(&self.connects).push((agent_id, instance_name.to_string()));

        let fresh = lock(&self.fresh).clone();
        lock(&self.agents)
            .entry(agent_id)
            .or_insert_with(|| Arc::new(FakeAgent::with_behavior(agent_id, fresh)))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

/// Records every update and flush.
#[derive(Default)]
pub struct RecordingDnsManager {
    updates: Mutex<Vec<DnsRecordSet>>,
    flushes: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingDnsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager whose updates always fail.
    pub fn failing() -> Self {
        let manager = Self::default();
        manager.failing.store(true, Ordering::SeqCst);
        manager
    }

    pub fn updates(&self) -> Vec<DnsRecordSet> {
        lock(&self.updates).clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsManager for RecordingDnsManager {
    async fn update_dns_record_for_instance(
        &self,
        instance: &InstanceRecord,
        records: &DnsRecordSet,
    ) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("dns backend rejected records for {}", instance.name());
        }
        lock(&self.updates).push(records.clone());
        Ok(())
    }

    async fn flush_dns_cache(&self) -> anyhow::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blobstore
// ---------------------------------------------------------------------------

/// Blobs in a map, ids handed out sequentially.
#[derive(Default)]
pub struct MemoryBlobstore {
    blobs: Mutex<HashMap<String, Bytes>>,
    next_id: AtomicU64,
    gets: AtomicUsize,
    fail_creates: AtomicBool,
}

impl MemoryBlobstore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create` fail.
    pub fn fail_creates(&self) {
        self.fail_creates.store(true, Ordering::SeqCst);
    }

    pub fn contains(&self, blob_id: &str) -> bool {
        lock(&self.blobs).contains_key(blob_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.blobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Blobstore for MemoryBlobstore {
    async fn create(&self, contents: Bytes) -> anyhow::Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("blobstore is read-only");
        }
        let id = format!("blob-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        lock(&self.blobs).insert(id.clone(), contents);
        Ok(id)
    }

    async fn get(&self, blob_id: &str) -> anyhow::Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        lock(&self.blobs)
            .get(blob_id)
            .cloned()
            .ok_or_else(|| anyhow!("blob '{blob_id}' not found"))
    }

    async fn delete(&self, blob_id: &str) -> anyhow::Result<()> {
        lock(&self.blobs)
            .remove(blob_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("blob '{blob_id}' not found"))
    }
}

// ---------------------------------------------------------------------------
// Instance store
// ---------------------------------------------------------------------------

/// Instance and VM records in maps.
#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: Mutex<HashMap<Uuid, InstanceRecord>>,
    vms: Mutex<HashMap<String, (Uuid, VmRecord)>>,
    instance_updates: AtomicUsize,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an instance and its VM record.
    pub fn with_instance(self, instance: &InstanceRecord) -> Self {
        self.put_instance(instance);
        if let Some(vm) = &instance.active_vm {
            lock(&self.vms).insert(vm.cid.clone(), (instance.uuid, vm.clone()));
        }
        self
    }

    /// Overwrite an instance record without counting it as an update.
    pub fn put_instance(&self, instance: &InstanceRecord) {
        lock(&self.instances).insert(instance.uuid, instance.clone());
    }

    /// Last persisted state of an instance.
    pub fn instance(&self, uuid: Uuid) -> Option<InstanceRecord> {
        lock(&self.instances).get(&uuid).cloned()
    }

    pub fn vm(&self, cid: &str) -> Option<VmRecord> {
        lock(&self.vms).get(cid).map(|(_, vm)| vm.clone())
    }

    pub fn vm_cids(&self) -> BTreeSet<String> {
        lock(&self.vms).keys().cloned().collect()
    }

    pub fn instance_updates(&self) -> usize {
        self.instance_updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn get_instance(&self, uuid: Uuid) -> anyhow::Result<Option<InstanceRecord>> {
        Ok(self.instance(uuid))
    }

    async fn update_instance(&self, instance: &InstanceRecord) -> anyhow::Result<()> {
        self.instance_updates.fetch_add(1, Ordering::SeqCst);
        lock(&self.instances).insert(instance.uuid, instance.clone());
        Ok(())
    }

    async fn insert_vm(&self, instance_uuid: Uuid, vm: &VmRecord) -> anyhow::Result<()> {
        let mut vms = lock(&self.vms);
        if vms.contains_key(&vm.cid) {
            anyhow::bail!("VM record '{}' already exists", vm.cid);
        }
        vms.insert(vm.cid.clone(), (instance_uuid, vm.clone()));
        Ok(())
    }

    async fn delete_vm(&self, vm: &VmRecord) -> anyhow::Result<()> {
        lock(&self.vms).remove(&vm.cid);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Returns the spec unchanged.
pub struct PassthroughInterpolator;

#[async_trait]
impl VariablesInterpolator for PassthroughInterpolator {
    async fn interpolate(&self, _deployment: &DeploymentRecord, raw: &Value) -> anyhow::Result<Value> {
        Ok(raw.clone())
    }
}

/// Fails every interpolation.
pub struct FailingInterpolator;

#[async_trait]
impl VariablesInterpolator for FailingInterpolator {
    async fn interpolate(&self, deployment: &DeploymentRecord, _raw: &Value) -> anyhow::Result<Value> {
        anyhow::bail!("config server unreachable for deployment '{}'", deployment.name)
    }
}

/// Resolves `((name))` string values from a fixed table.
#[derive(Default)]
pub struct StaticInterpolator {
    variables: HashMap<String, String>,
}

impl StaticInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables.insert(name.to_string(), value.to_string());
        self
    }

    fn resolve(&self, value: &Value) -> anyhow::Result<Value> {
        match value {
            Value::String(raw) => match raw.strip_prefix("((").and_then(|r| r.strip_suffix("))")) {
                Some(name) => self
                    .variables
                    .get(name)
                    .map(|resolved| Value::String(resolved.clone()))
                    .ok_or_else(|| anyhow!("variable '{name}' is not defined")),
                None => Ok(value.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<anyhow::Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, field)| Ok((key.clone(), self.resolve(field)?)))
                .collect::<anyhow::Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

#[async_trait]
impl VariablesInterpolator for StaticInterpolator {
    async fn interpolate(&self, _deployment: &DeploymentRecord, raw: &Value) -> anyhow::Result<Value> {
        self.resolve(raw)
    }
}

/// Uploaded stemcells keyed by name and version, shared by every CPI.
#[derive(Default)]
pub struct StaticStemcellCatalog {
    cids: HashMap<(String, String), String>,
    lookups: Mutex<Vec<Option<String>>>,
}

impl StaticStemcellCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stemcell(mut self, name: &str, version: &str, cid: &str) -> Self {
        self.cids
            .insert((name.to_string(), version.to_string()), cid.to_string());
        self
    }

    /// CPI names asked for, in order.
    pub fn lookups(&self) -> Vec<Option<String>> {
        lock(&self.lookups).clone()
    }
}

#[async_trait]
impl StemcellCatalog for StaticStemcellCatalog {
    async fn cid_for(&self, stemcell: &Stemcell, cpi: Option<&str>) -> anyhow::Result<Option<String>> {
        lock(&self.lookups).push(cpi.map(str::to_string));
        Ok(self
            .cids
            .get(&(stemcell.name.clone(), stemcell.version.clone()))
            .cloned())
    }
}

/// Records reservations.
#[derive(Default)]
pub struct RecordingIpProvider {
    reservations: Mutex<Vec<(String, bool)>>,
    failing: AtomicBool,
}

impl RecordingIpProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// `(instance name, reuse_existing)` per reservation.
    pub fn reservations(&self) -> Vec<(String, bool)> {
        lock(&self.reservations).clone()
    }
}

#[async_trait]
impl IpProvider for RecordingIpProvider {
    async fn reserve_ips(&self, plan: &InstancePlan, reuse_existing: bool) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("no addresses left for {}", plan.instance_name());
        }
        lock(&self.reservations).push((plan.instance_name(), reuse_existing));
        Ok(())
    }
}

/// Builds the same planner for every deployment.
pub struct StaticPlannerFactory {
    ip_provider: Arc<RecordingIpProvider>,
    use_short_dns_addresses: bool,
    dns_group_ids: BTreeMap<String, u32>,
    link_provider_intents: Vec<LinkProviderIntent>,
}

impl StaticPlannerFactory {
    pub fn new(ip_provider: Arc<RecordingIpProvider>) -> Self {
        Self {
            ip_provider,
            use_short_dns_addresses: false,
            dns_group_ids: BTreeMap::new(),
            link_provider_intents: Vec::new(),
        }
    }

    pub fn with_short_dns(mut self, dns_group_ids: BTreeMap<String, u32>) -> Self {
        self.use_short_dns_addresses = true;
        self.dns_group_ids = dns_group_ids;
        self
    }

    pub fn with_link(mut self, link: LinkProviderIntent) -> Self {
        self.link_provider_intents.push(link);
        self
    }
}

#[async_trait]
impl PlannerFactory for StaticPlannerFactory {
    async fn create_from_deployment(
        &self,
        _deployment: &DeploymentRecord,
    ) -> anyhow::Result<DeploymentPlanner> {
        Ok(DeploymentPlanner {
            ip_provider: self.ip_provider.clone(),
            use_short_dns_addresses: self.use_short_dns_addresses,
            link_provider_intents: self.link_provider_intents.clone(),
            dns_group_ids: self.dns_group_ids.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Renders one file per job holding the resolved spec.
///
/// Job template blobs listed under `templates` in the spec
/// (`[{"name": ..., "blobstore_id": ...}]`) are fetched through the cache;
/// each job's file also lists the link names it was rendered with.
#[derive(Default)]
pub struct FakeRenderer {
    renders: AtomicUsize,
    failing: AtomicBool,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemplateRenderer for FakeRenderer {
    async fn render(
        &self,
        plan: &InstancePlan,
        cache: &TemplateBlobCache,
        links: &[LinkProviderIntent],
    ) -> anyhow::Result<RenderedTemplates> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("template error in {}", plan.instance_name());
        }

        let spec = &plan.instance.spec;
        let link_names: Vec<&str> = links.iter().map(|link| link.name.as_str()).collect();
        let mut rendered = RenderedTemplates::default();

        let templates = spec
            .get("templates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for template in &templates {
            let name = template
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("template without name"))?;
            let blob_id = template
                .get("blobstore_id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("template '{name}' without blobstore_id"))?;
            let blob = cache.download_blob(blob_id).await?;

            let files = BTreeMap::from([
                ("bin/run".to_string(), String::from_utf8_lossy(&blob).into_owned()),
                ("config/links".to_string(), link_names.join(",")),
            ]);
            rendered.jobs.insert(name.to_string(), files);
        }

        if rendered.jobs.is_empty() {
            let files = BTreeMap::from([
                ("config/spec.json".to_string(), spec.to_string()),
                ("config/links".to_string(), link_names.join(",")),
            ]);
            rendered.jobs.insert(plan.instance.job.clone(), files);
        }

        Ok(rendered)
    }
}
