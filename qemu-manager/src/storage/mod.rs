pub mod disks;
pub mod isos;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{VmError, VmResult};
use crate::registry::{Registry, VmRecord};
use crate::vm::VmLocks;

pub use disks::{CreateDiskParams, DiskCatalog, DiskInfo, ImageTool, QemuImg};
pub use isos::IsoCatalog;

/// Enforces that a VM's disk topology only changes while it is stopped.
///
/// Shares the per-VM locks of the lifecycle manager, so an attach cannot
/// interleave with a start of the same VM.
pub struct AttachmentTracker {
    registry: Arc<dyn Registry>,
    locks: Arc<VmLocks>,
}

impl AttachmentTracker {
    pub fn new(registry: Arc<dyn Registry>, locks: Arc<VmLocks>) -> Self {
        Self { registry, locks }
    }

    fn ensure_stopped(vm: &VmRecord, action: &str) -> VmResult<()> {
        if vm.is_running() {
            return Err(VmError::InvalidState(format!(
                "cannot {} disks while VM '{}' is running; stop it first",
                action, vm.name
            )));
        }
        Ok(())
    }

    /// Attach a disk path to a stopped VM. Returns the VM's attachments.
    ///
    /// Attaching a path that is already attached is a no-op.
    #[instrument(skip(self))]
    pub async fn attach(&self, vm_id: Uuid, disk_path: &str) -> VmResult<Vec<String>> {
        let disk_path = require_path(disk_path, "diskPath")?;
        let (_guard, vm) = self.locks.lock_vm(self.registry.as_ref(), vm_id).await?;
        Self::ensure_stopped(&vm, "attach")?;

        let shared_with: Vec<Uuid> = self
            .registry
            .list_attachments()
            .await?
            .into_iter()
            .filter(|a| a.disk_path == disk_path && a.vm_id != vm_id)
            .map(|a| a.vm_id)
            .collect();
        if !shared_with.is_empty() {
            warn!(vm_id = %vm_id, disk_path, ?shared_with, "disk is attached to other VMs as well");
        }

        if self.registry.attach_disk(vm_id, disk_path).await? {
            info!(vm_id = %vm_id, disk_path, "disk attached");
        } else {
            debug!(vm_id = %vm_id, disk_path, "disk already attached");
        }
        Ok(self.registry.vm_disks(vm_id).await?)
    }

    /// Detach a disk path from a stopped VM. Returns the VM's attachments.
    #[instrument(skip(self))]
    pub async fn detach(&self, vm_id: Uuid, disk_path: &str) -> VmResult<Vec<String>> {
        let disk_path = require_path(disk_path, "diskPath")?;
        let (_guard, vm) = self.locks.lock_vm(self.registry.as_ref(), vm_id).await?;
        Self::ensure_stopped(&vm, "detach")?;

        if self.registry.detach_disk(vm_id, disk_path).await? {
            info!(vm_id = %vm_id, disk_path, "disk detached");
        } else {
            debug!(vm_id = %vm_id, disk_path, "disk was not attached");
        }
        Ok(self.registry.vm_disks(vm_id).await?)
    }

    /// Set the mounted ISO. Allowed in any state; takes effect at next start.
    #[instrument(skip(self))]
    pub async fn mount(&self, vm_id: Uuid, iso_path: &str) -> VmResult<VmRecord> {
        let iso_path = require_path(iso_path, "isoPath")?;
        let (_guard, mut vm) = self.locks.lock_vm(self.registry.as_ref(), vm_id).await?;
        vm.iso = Some(iso_path.to_string());
        self.registry.update_vm(&vm).await?;

        if vm.is_running() {
            info!(vm_id = %vm_id, iso_path, "ISO mounted, takes effect at next start");
        } else {
            info!(vm_id = %vm_id, iso_path, "ISO mounted");
        }
        Ok(vm)
    }

    /// Clear the mounted ISO.
    #[instrument(skip(self))]
    pub async fn unmount(&self, vm_id: Uuid) -> VmResult<VmRecord> {
        let (_guard, mut vm) = self.locks.lock_vm(self.registry.as_ref(), vm_id).await?;
        if vm.iso.take().is_some() {
            self.registry.update_vm(&vm).await?;
            info!(vm_id = %vm_id, "ISO unmounted");
        }
        Ok(vm)
    }
}

fn require_path<'a>(path: &'a str, field: &str) -> VmResult<&'a str> {
    let path = path.trim();
    if path.is_empty() {
        return Err(VmError::InvalidArgument(format!("{} must not be empty", field)));
    }
    Ok(path)
}
