//! VM decommissioning.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cloud::{CloudError, CloudFactory};
use crate::error::{RecoveryError, RecoveryResult};
use crate::model::{detach_active_vm, InstanceRecord, InstanceStore};

/// Deletes VMs from the cloud and detaches them from their instance.
///
/// The VM reference is only cleared once the cloud side is gone, so a failed
/// delete leaves the instance exactly as it was.
pub struct VmDeleter {
    clouds: Arc<dyn CloudFactory>,
    store: Arc<dyn InstanceStore>,
    enable_virtual_delete_vms: bool,
}

impl VmDeleter {
    pub fn new(
        clouds: Arc<dyn CloudFactory>,
        store: Arc<dyn InstanceStore>,
        enable_virtual_delete_vms: bool,
    ) -> Self {
        Self {
            clouds,
            store,
            enable_virtual_delete_vms,
        }
    }

    /// Delete the instance's VM, if it has one.
    pub async fn delete_for_instance(&self, instance: &mut InstanceRecord) -> RecoveryResult<()> {
        let Some(vm) = instance.active_vm.as_ref() else {
            debug!(instance = %instance.name(), "No VM to delete");
            return Ok(());
        };

        self.delete_vm_by_cid(&vm.cid, vm.cpi.as_deref()).await?;

        detach_active_vm(self.store.as_ref(), instance)
            .await
            .map_err(RecoveryError::Store)?;
        Ok(())
    }

    /// Delete a VM from its cloud. A VM that is already gone counts as
    /// deleted.
    pub async fn delete_vm_by_cid(&self, vm_cid: &str, cpi: Option<&str>) -> Result<(), CloudError> {
        if self.enable_virtual_delete_vms {
            info!(vm_cid, "Virtual delete enabled, leaving VM in the cloud");
            return Ok(());
        }

        let cloud = self.clouds.get(cpi)?;
        match cloud.delete_vm(vm_cid).await {
            Ok(()) => {
                info!(vm_cid, cpi = ?cpi, "Deleted VM");
                Ok(())
            }
            Err(CloudError::VmNotFound(_)) => {
                warn!(vm_cid, "VM not found in the cloud, treating as deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
