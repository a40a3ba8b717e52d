//! Cloud backend interface and resolver.
//!
//! A [`Cloud`] is one CPI driver. The [`CloudFactory`] picks the driver for a
//! VM by its recorded CPI name, or for a new VM by availability zone.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use keel_id::AgentId;
use thiserror::Error;

/// Cloud errors.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The VM does not exist (already deleted, or never did).
    #[error("VM '{0}' not found")]
    VmNotFound(String),

    #[error("no cloud configured for CPI '{0}'")]
    UnknownCpi(String),

    #[error("no default cloud configured")]
    NoDefaultCloud,

    /// The driver rejected or failed the call.
    #[error("{method} failed")]
    Driver {
        method: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Everything a CPI needs to create a VM.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateVmRequest {
    pub agent_id: AgentId,
    pub stemcell_cid: String,
    pub cloud_properties: serde_json::Value,
    pub networks: serde_json::Value,
    /// Existing disks the VM should be placed next to.
    pub disk_cids: Vec<String>,
    pub env: serde_json::Value,
}

/// A CPI driver.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn reboot_vm(&self, vm_cid: &str) -> Result<(), CloudError>;

    /// Create a VM and return its cloud id.
    async fn create_vm(&self, request: &CreateVmRequest) -> Result<String, CloudError>;

    /// Delete a VM. Returns [`CloudError::VmNotFound`] if it is already gone.
    async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError>;

    /// Tag a VM with deployment metadata.
    async fn set_vm_metadata(
        &self,
        vm_cid: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), CloudError>;
}

/// Resolves CPI drivers.
pub trait CloudFactory: Send + Sync {
    /// Driver for a CPI name; `None` selects the default cloud.
    fn get(&self, cpi: Option<&str>) -> Result<Arc<dyn Cloud>, CloudError>;

    /// CPI name serving an availability zone; `None` for the default cloud.
    fn cpi_for_az(&self, az: Option<&str>) -> Option<String>;

    /// Driver and CPI name for an availability zone.
    fn get_for_az(&self, az: Option<&str>) -> Result<(Arc<dyn Cloud>, Option<String>), CloudError> {
        let cpi = self.cpi_for_az(az);
        let cloud = self.get(cpi.as_deref())?;
        Ok((cloud, cpi))
    }
}

/// A fixed set of named clouds plus an AZ → CPI table.
#[derive(Default)]
pub struct StaticCloudFactory {
    default_cpi: Option<String>,
    clouds: HashMap<String, Arc<dyn Cloud>>,
    az_cpis: HashMap<String, String>,
}

impl StaticCloudFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cloud. The first one registered becomes the default.
    pub fn with_cloud(mut self, cpi: impl Into<String>, cloud: Arc<dyn Cloud>) -> Self {
        let cpi = cpi.into();
        if self.default_cpi.is_none() {
            self.default_cpi = Some(cpi.clone());
        }
        self.clouds.insert(cpi, cloud);
        self
    }

    /// Route an availability zone to a registered CPI.
    pub fn with_az(mut self, az: impl Into<String>, cpi: impl Into<String>) -> Self {
        self.az_cpis.insert(az.into(), cpi.into());
        self
    }
}

impl CloudFactory for StaticCloudFactory {
    fn get(&self, cpi: Option<&str>) -> Result<Arc<dyn Cloud>, CloudError> {
        let name = match cpi.filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => self.default_cpi.as_deref().ok_or(CloudError::NoDefaultCloud)?,
        };

        self.clouds
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::UnknownCpi(name.to_string()))
    }

    fn cpi_for_az(&self, az: Option<&str>) -> Option<String> {
        az.and_then(|az| self.az_cpis.get(az)).cloned()
    }
}
