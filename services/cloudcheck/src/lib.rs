//! keel cloudcheck
//!
//! Resolution side of the cloudcheck workflow: once a scan has found an
//! instance whose VM is unresponsive, missing, stray or carrying a corrupt
//! apply-spec, the operations here put it right again.
//!
//! ## Operations
//!
//! - **reboot**: reboot through the cloud, then wait for the agent
//! - **delete**: delete the VM, refusing if the agent still reports disks
//! - **delete reference**: forget the VM without touching the cloud
//! - **delete from cloud**: validate stored metadata, then delete
//! - **recreate**: tear down, rebuild the plan from the stored record,
//!   provision, advertise DNS, persist templates, converge
//!
//! ## Collaborators
//!
//! Every external system sits behind a trait so tests (and the surrounding
//! director) inject their own implementations:
//!
//! ```text
//! Cloudcheck
//! ├── CloudFactory ── Cloud          (per-CPI driver)
//! ├── AgentClientPool ── AgentConnector ── AgentClient
//! ├── VmDeleter / VmCreator
//! ├── DnsPropagator ── DnsManager x2
//! ├── RenderedTemplatesPersister / RenderedJobTemplatesCleaner ── Blobstore
//! ├── StateApplier
//! └── InstanceUpdateLocks            (shared across tasks)
//! ```

pub mod agent;
pub mod cloud;
pub mod cloudcheck;
pub mod config;
pub mod convergence;
pub mod dns;
pub mod error;
pub mod fakes;
pub mod model;
pub mod plan;
pub mod task;
pub mod telemetry;
pub mod templates;
pub mod update_lock;
pub mod vm;

pub use cloudcheck::{Cloudcheck, CloudcheckDeps, Resolution};
pub use config::CloudcheckConfig;
pub use error::{ProblemError, RecoveryError, RecoveryResult};
pub use model::{DeploymentRecord, InstanceRecord, InstanceState, InstanceStore, VmRecord};
pub use task::{CancelSignal, TaskContext};
pub use update_lock::{InstanceUpdateLease, InstanceUpdateLocks};
