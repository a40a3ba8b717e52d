//! Shared fixture for the recovery integration tests.
//!
//! A [`World`] wires a [`Cloudcheck`] to in-memory collaborators around one
//! instance: job `worker`, index 0, deployment `d1`, zone `z1`, VM `vm-1`,
//! network `a` at `10.0.0.5`.
//!
//! Operations reload the instance from the store, so [`World::cloudcheck`]
//! first writes `world.instance` back as the stored record.

#![allow(dead_code)]

use std::sync::Arc;

use keel_cloudcheck::cloud::StaticCloudFactory;
use keel_cloudcheck::fakes::{
    self, AgentBehavior, FakeAgent, FakeAgentConnector, FakeCloud, FakeRenderer, MemoryBlobstore,
    MemoryInstanceStore, PassthroughInterpolator, RecordingDnsManager, RecordingIpProvider,
    StaticPlannerFactory, StaticStemcellCatalog,
};
use keel_cloudcheck::plan::VariablesInterpolator;
use keel_cloudcheck::{
    Cloudcheck, CloudcheckConfig, CloudcheckDeps, InstanceRecord, InstanceUpdateLocks, RecoveryError,
    TaskContext,
};

pub const STEMCELL_CID: &str = "stemcell-ubuntu-jammy-1.200";

pub struct World {
    pub cloud: Arc<FakeCloud>,
    pub clouds: Arc<StaticCloudFactory>,
    pub connector: Arc<FakeAgentConnector>,
    pub store: Arc<MemoryInstanceStore>,
    pub stemcells: Arc<StaticStemcellCatalog>,
    pub ip_provider: Arc<RecordingIpProvider>,
    pub planners: Arc<StaticPlannerFactory>,
    pub interpolator: Arc<dyn VariablesInterpolator>,
    pub renderer: Arc<FakeRenderer>,
    pub blobstore: Arc<MemoryBlobstore>,
    pub authoritative_dns: Arc<RecordingDnsManager>,
    pub local_dns: Arc<RecordingDnsManager>,
    pub update_locks: Arc<InstanceUpdateLocks>,
    pub config: CloudcheckConfig,
    pub instance: InstanceRecord,
    pub agent: Arc<FakeAgent>,
}

impl World {
    pub fn new() -> Self {
        Self::with_vm("vm-1")
    }

    /// Same world, with the instance's VM named `vm_cid`.
    pub fn with_vm(vm_cid: &str) -> Self {
        let config = CloudcheckConfig {
            log_level: "debug".to_string(),
            ..CloudcheckConfig::default()
        };
        keel_cloudcheck::telemetry::init_from_config(&config);

        let mut instance = fakes::instance_record();
        if let Some(vm) = instance.active_vm.as_mut() {
            vm.cid = vm_cid.to_string();
        }

        let cloud = Arc::new(FakeCloud::new().with_vm(vm_cid));
        let connector = Arc::new(FakeAgentConnector::new());
        let agent = connector.register(
            instance.agent_id().expect("fixture has a VM"),
            AgentBehavior::default(),
        );
        let ip_provider = Arc::new(RecordingIpProvider::new());

        Self {
            clouds: Arc::new(StaticCloudFactory::new().with_cloud("default", cloud.clone())),
            cloud,
            connector,
            store: Arc::new(MemoryInstanceStore::new().with_instance(&instance)),
            stemcells: Arc::new(
                StaticStemcellCatalog::new().with_stemcell("ubuntu-jammy", "1.200", STEMCELL_CID),
            ),
            planners: Arc::new(StaticPlannerFactory::new(ip_provider.clone())),
            ip_provider,
            interpolator: Arc::new(PassthroughInterpolator),
            renderer: Arc::new(FakeRenderer::new()),
            blobstore: Arc::new(MemoryBlobstore::new()),
            authoritative_dns: Arc::new(RecordingDnsManager::new()),
            local_dns: Arc::new(RecordingDnsManager::new()),
            update_locks: Arc::new(InstanceUpdateLocks::new()),
            config,
            instance,
            agent,
        }
    }

    pub fn cloudcheck(&self) -> Cloudcheck {
        self.cloudcheck_for(TaskContext::detached())
    }

    pub fn cloudcheck_for(&self, task: TaskContext) -> Cloudcheck {
        self.store.put_instance(&self.instance);
        Cloudcheck::new(
            CloudcheckDeps {
                clouds: self.clouds.clone(),
                agents: self.connector.clone(),
                store: self.store.clone(),
                planners: self.planners.clone(),
                interpolator: self.interpolator.clone(),
                stemcells: self.stemcells.clone(),
                renderer: self.renderer.clone(),
                blobstore: self.blobstore.clone(),
                authoritative_dns: self.authoritative_dns.clone(),
                local_dns: self.local_dns.clone(),
            },
            self.config.clone(),
            task,
            self.update_locks.clone(),
        )
    }

    /// A second instance of the same job on its own VM, already stored.
    pub fn sibling(&self, vm_cid: &str) -> InstanceRecord {
        let mut sibling = fakes::instance_record();
        sibling.index = 1;
        if let Some(vm) = sibling.active_vm.as_mut() {
            vm.cid = vm_cid.to_string();
            self.connector.register(vm.agent_id, AgentBehavior::default());
        }
        self.cloud.add_vm(vm_cid);
        self.store.put_instance(&sibling);
        sibling
    }
}

pub fn problem_message(err: &RecoveryError) -> &str {
    err.as_problem()
        .map(|problem| problem.message())
        .unwrap_or_else(|| panic!("expected a problem error, got {err:?}"))
}
