use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Attachment, DiskImage, IsoImage, Registry, RegistryError, RegistryResult, VmRecord,
};

/// Current on-disk schema version.
const SCHEMA_VERSION: u32 = 1;

/// Registry contents as serialized to the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Version 0 = files written without this field.
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub vms: HashMap<Uuid, VmRecord>,
    /// Attachment edges in insertion order.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub disks: HashMap<Uuid, DiskImage>,
    #[serde(default)]
    pub isos: HashMap<Uuid, IsoImage>,
}

impl PersistedState {
    /// Read a state file synchronously (used by the `status` subcommand).
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading state file: {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing state file: {}", path.display()))
    }
}

/// [`Registry`] kept in memory and rewritten to a JSON file after every mutation.
///
/// Mutations are applied to a copy of the tables, persisted, and only then
/// swapped in, so a failed write leaves the in-memory view untouched. The
/// write lock is held across the file write so the file always reflects the
/// latest committed mutation.
pub struct StateFileRegistry {
    path: Option<PathBuf>,
    state: RwLock<PersistedState>,
}

impl StateFileRegistry {
    /// Registry without a backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(PersistedState::default()),
        }
    }

    /// Open the registry at `path`, loading it if the file exists.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading state file: {}", path.display()))?;
            let state: PersistedState = serde_json::from_str(&data)
                .with_context(|| format!("parsing state file: {}", path.display()))?;
            if state.schema_version > SCHEMA_VERSION {
                warn!(
                    version = state.schema_version,
                    supported = SCHEMA_VERSION,
                    "state file has a newer schema version, unknown fields will be dropped"
                );
            }
            info!(
                path = %path.display(),
                vms = state.vms.len(),
                disks = state.disks.len(),
                isos = state.isos.len(),
                "loaded registry state"
            );
            state
        } else {
            info!(path = %path.display(), "no state file, starting with an empty registry");
            PersistedState::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
        })
    }

    /// Copy of the current tables.
    pub async fn snapshot(&self) -> PersistedState {
        self.state.read().await.clone()
    }

    /// Apply `f` to a copy of the state, persist it, then commit it.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut PersistedState) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        next.schema_version = SCHEMA_VERSION;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }

    async fn persist(&self, state: &PersistedState) -> RegistryResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let data = serde_json::to_string_pretty(state).context("serializing registry state")?;

        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp state file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming temp state file to: {}", path.display()))?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await.ok();

        debug!(path = %path.display(), "registry state persisted");
        Ok(())
    }
}

#[async_trait]
impl Registry for StateFileRegistry {
    async fn insert_vm(&self, vm: &VmRecord) -> RegistryResult<()> {
        self.mutate(|s| {
            if s.vms.values().any(|v| v.name == vm.name) {
                return Err(RegistryError::Conflict {
                    field: "name",
                    value: vm.name.clone(),
                });
            }
            s.vms.insert(vm.id, vm.clone());
            Ok(())
        })
        .await
    }

    async fn get_vm(&self, id: Uuid) -> RegistryResult<Option<VmRecord>> {
        Ok(self.state.read().await.vms.get(&id).cloned())
    }

    async fn list_vms(&self) -> RegistryResult<Vec<VmRecord>> {
        let mut vms: Vec<VmRecord> = self.state.read().await.vms.values().cloned().collect();
        vms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(vms)
    }

    async fn update_vm(&self, vm: &VmRecord) -> RegistryResult<bool> {
        self.mutate(|s| match s.vms.get_mut(&vm.id) {
            Some(slot) => {
                *slot = vm.clone();
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn delete_vm(&self, id: Uuid) -> RegistryResult<bool> {
        self.mutate(|s| {
            s.attachments.retain(|a| a.vm_id != id);
            Ok(s.vms.remove(&id).is_some())
        })
        .await
    }

    async fn attach_disk(&self, vm_id: Uuid, disk_path: &str) -> RegistryResult<bool> {
        self.mutate(|s| {
            if s
                .attachments
                .iter()
                .any(|a| a.vm_id == vm_id && a.disk_path == disk_path)
            {
                return Ok(false);
            }
            s.attachments.push(Attachment {
                vm_id,
                disk_path: disk_path.to_string(),
                attached_at: Utc::now(),
            });
            Ok(true)
        })
        .await
    }

    async fn detach_disk(&self, vm_id: Uuid, disk_path: &str) -> RegistryResult<bool> {
        self.mutate(|s| {
            let before = s.attachments.len();
            s.attachments
                .retain(|a| !(a.vm_id == vm_id && a.disk_path == disk_path));
            Ok(s.attachments.len() != before)
        })
        .await
    }

    async fn vm_disks(&self, vm_id: Uuid) -> RegistryResult<Vec<String>> {
        Ok(self
            .state
            .read()
            .await
            .attachments
            .iter()
            .filter(|a| a.vm_id == vm_id)
            .map(|a| a.disk_path.clone())
            .collect())
    }

    async fn delete_vm_disks(&self, vm_id: Uuid) -> RegistryResult<()> {
        self.mutate(|s| {
            s.attachments.retain(|a| a.vm_id != vm_id);
            Ok(())
        })
        .await
    }

    async fn list_attachments(&self) -> RegistryResult<Vec<Attachment>> {
        Ok(self.state.read().await.attachments.clone())
    }

    async fn insert_disk(&self, disk: &DiskImage) -> RegistryResult<()> {
        self.mutate(|s| {
            for existing in s.disks.values() {
                if existing.name == disk.name {
                    return Err(RegistryError::Conflict {
                        field: "name",
                        value: disk.name.clone(),
                    });
                }
                if existing.path == disk.path {
                    return Err(RegistryError::Conflict {
                        field: "path",
                        value: disk.path.display().to_string(),
                    });
                }
            }
            s.disks.insert(disk.id, disk.clone());
            Ok(())
        })
        .await
    }

    async fn get_disk(&self, id: Uuid) -> RegistryResult<Option<DiskImage>> {
        Ok(self.state.read().await.disks.get(&id).cloned())
    }

    async fn list_disks(&self) -> RegistryResult<Vec<DiskImage>> {
        let mut disks: Vec<DiskImage> = self.state.read().await.disks.values().cloned().collect();
        disks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(disks)
    }

    async fn update_disk(&self, disk: &DiskImage) -> RegistryResult<bool> {
        self.mutate(|s| match s.disks.get_mut(&disk.id) {
            Some(slot) => {
                *slot = disk.clone();
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    async fn delete_disk(&self, id: Uuid) -> RegistryResult<bool> {
        self.mutate(|s| Ok(s.disks.remove(&id).is_some())).await
    }

    async fn insert_iso(&self, iso: &IsoImage) -> RegistryResult<()> {
        self.mutate(|s| {
            for existing in s.isos.values() {
                if existing.name == iso.name {
                    return Err(RegistryError::Conflict {
                        field: "name",
                        value: iso.name.clone(),
                    });
                }
                if existing.path == iso.path {
                    return Err(RegistryError::Conflict {
                        field: "path",
                        value: iso.path.display().to_string(),
                    });
                }
            }
            s.isos.insert(iso.id, iso.clone());
            Ok(())
        })
        .await
    }

    async fn get_iso(&self, id: Uuid) -> RegistryResult<Option<IsoImage>> {
        Ok(self.state.read().await.isos.get(&id).cloned())
    }

    async fn get_iso_by_path(&self, path: &Path) -> RegistryResult<Option<IsoImage>> {
        Ok(self
            .state
            .read()
            .await
            .isos
            .values()
            .find(|i| i.path == path)
            .cloned())
    }

    async fn list_isos(&self) -> RegistryResult<Vec<IsoImage>> {
        let mut isos: Vec<IsoImage> = self.state.read().await.isos.values().cloned().collect();
        isos.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(isos)
    }

    async fn delete_iso(&self, id: Uuid) -> RegistryResult<bool> {
        self.mutate(|s| Ok(s.isos.remove(&id).is_some())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DiskFormat, DiskStatus, VmStatus};

    fn disk(name: &str, path: &str) -> DiskImage {
        DiskImage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: PathBuf::from(path),
            size_gb: 20,
            format: DiskFormat::Qcow2,
            status: DiskStatus::Ready,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_vm_rejects_duplicate_name() {
        let reg = StateFileRegistry::in_memory();
        reg.insert_vm(&VmRecord::new("alpha", 2, 2048, 5901)).await.unwrap();
        let err = reg
            .insert_vm(&VmRecord::new("alpha", 1, 512, 5902))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { field: "name", .. }));
        assert_eq!(reg.list_vms().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn attachments_keep_order_and_ignore_duplicates() {
        let reg = StateFileRegistry::in_memory();
        let vm = VmRecord::new("alpha", 2, 2048, 5901);
        reg.insert_vm(&vm).await.unwrap();

        assert!(reg.attach_disk(vm.id, "/data/b.qcow2").await.unwrap());
        assert!(reg.attach_disk(vm.id, "/data/a.qcow2").await.unwrap());
        assert!(!reg.attach_disk(vm.id, "/data/b.qcow2").await.unwrap());

        assert_eq!(
            reg.vm_disks(vm.id).await.unwrap(),
            vec!["/data/b.qcow2".to_string(), "/data/a.qcow2".to_string()]
        );

        assert!(reg.detach_disk(vm.id, "/data/b.qcow2").await.unwrap());
        assert!(!reg.detach_disk(vm.id, "/data/b.qcow2").await.unwrap());
        assert_eq!(reg.vm_disks(vm.id).await.unwrap(), vec!["/data/a.qcow2".to_string()]);
    }

    #[tokio::test]
    async fn delete_vm_removes_its_attachments_only() {
        let reg = StateFileRegistry::in_memory();
        let a = VmRecord::new("a", 1, 512, 5901);
        let b = VmRecord::new("b", 1, 512, 5902);
        reg.insert_vm(&a).await.unwrap();
        reg.insert_vm(&b).await.unwrap();
        reg.attach_disk(a.id, "/data/shared.qcow2").await.unwrap();
        reg.attach_disk(b.id, "/data/shared.qcow2").await.unwrap();

        assert!(reg.delete_vm(a.id).await.unwrap());
        assert!(reg.get_vm(a.id).await.unwrap().is_none());
        assert!(reg.vm_disks(a.id).await.unwrap().is_empty());
        assert_eq!(reg.vm_disks(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_vm_reports_false() {
        let reg = StateFileRegistry::in_memory();
        let vm = VmRecord::new("ghost", 1, 512, 5901);
        assert!(!reg.update_vm(&vm).await.unwrap());
    }

    #[tokio::test]
    async fn disk_name_and_path_are_unique() {
        let reg = StateFileRegistry::in_memory();
        reg.insert_disk(&disk("d1", "/data/d1.qcow2")).await.unwrap();

        let err = reg.insert_disk(&disk("d1", "/data/other.qcow2")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { field: "name", .. }));

        let err = reg.insert_disk(&disk("d2", "/data/d1.qcow2")).await.unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { field: "path", .. }));
    }

    #[tokio::test]
    async fn state_file_roundtrips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut vm = VmRecord::new("alpha", 2, 2048, 5907);
        vm.iso = Some("/isos/alpine.iso".into());
        vm.mark_running(1234);
        let d = disk("d1", "/data/d1.qcow2");
        let iso = IsoImage {
            id: Uuid::new_v4(),
            name: "alpine.iso".into(),
            path: PathBuf::from("/isos/alpine.iso"),
            size_bytes: 1024,
            uploaded_at: Utc::now(),
        };

        {
            let reg = StateFileRegistry::open(&path).await.unwrap();
            reg.insert_vm(&vm).await.unwrap();
            reg.attach_disk(vm.id, "/data/d1.qcow2").await.unwrap();
            reg.insert_disk(&d).await.unwrap();
            reg.insert_iso(&iso).await.unwrap();
        }

        let reg = StateFileRegistry::open(&path).await.unwrap();
        let loaded = reg.get_vm(vm.id).await.unwrap().unwrap();
        assert_eq!(loaded, vm);
        assert_eq!(loaded.status, VmStatus::Running);
        assert_eq!(reg.vm_disks(vm.id).await.unwrap(), vec!["/data/d1.qcow2".to_string()]);
        assert_eq!(reg.get_disk(d.id).await.unwrap(), Some(d));
        assert_eq!(
            reg.get_iso_by_path(Path::new("/isos/alpine.iso")).await.unwrap(),
            Some(iso)
        );

        let on_disk = PersistedState::read(&path).unwrap();
        assert_eq!(on_disk.schema_version, SCHEMA_VERSION);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn failed_persist_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the state file should be makes the rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let reg = StateFileRegistry {
            path: Some(path.clone()),
            state: RwLock::new(PersistedState::default()),
        };
        let result = reg.insert_vm(&VmRecord::new("alpha", 1, 512, 5901)).await;
        assert!(matches!(result, Err(RegistryError::Storage(_))));
        assert!(reg.list_vms().await.unwrap().is_empty());
    }

    #[test]
    fn legacy_state_without_schema_version_parses() {
        let json = r#"{"vms": {}, "attachments": []}"#;
        let state: PersistedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.schema_version, 0);
        assert!(state.disks.is_empty());
    }
}
