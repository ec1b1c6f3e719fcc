pub mod state_file;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vm::command::VNC_BASE_PORT;

pub use state_file::{PersistedState, StateFileRegistry};

/// VM lifecycle states. There are no persisted intermediate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped,
    Running,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// A virtual machine as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: Uuid,
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub status: VmStatus,
    /// TCP port of the VNC server; the display offset is derived from it.
    pub vnc_port: u16,
    /// Path of the mounted ISO, realized at next start.
    pub iso: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// OS process id of the hypervisor. Present iff `status == Running`.
    pub pid: Option<u32>,
}

impl VmRecord {
    pub fn new(name: impl Into<String>, cpus: u32, memory_mb: u32, vnc_port: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cpus,
            memory_mb,
            status: VmStatus::Stopped,
            vnc_port,
            iso: None,
            created_at: Utc::now(),
            started_at: None,
            pid: None,
        }
    }

    /// VNC display number passed to `-vnc`.
    pub fn display_offset(&self) -> u16 {
        self.vnc_port.saturating_sub(VNC_BASE_PORT)
    }

    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.status = VmStatus::Running;
        self.started_at = Some(Utc::now());
        self.pid = Some(pid);
    }

    pub fn mark_stopped(&mut self) {
        self.status = VmStatus::Stopped;
        self.pid = None;
    }
}

/// Edge linking a VM to a disk path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub vm_id: Uuid,
    pub disk_path: String,
    pub attached_at: DateTime<Utc>,
}

/// Disk image formats accepted by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vdi,
}

impl DiskFormat {
    pub const ALL: [DiskFormat; 4] = [Self::Qcow2, Self::Raw, Self::Vmdk, Self::Vdi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qcow2 => "qcow2",
            Self::Raw => "raw",
            Self::Vmdk => "vmdk",
            Self::Vdi => "vdi",
        }
    }

    /// Infer the format from a file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        ext.parse().ok()
    }
}

impl std::str::FromStr for DiskFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unsupported disk format '{}' (expected qcow2, raw, vmdk or vdi)", s))
    }
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskStatus {
    Creating,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskImage {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub size_gb: u64,
    pub format: DiskFormat,
    pub status: DiskStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoImage {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Errors from the persistence seam.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A unique column (name or path) already holds this value.
    #[error("{field} '{value}' already exists")]
    Conflict { field: &'static str, value: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Durable store of VMs, attachment edges, disks and ISOs.
///
/// Each call is atomic for the single record it touches. Lookups return
/// `Ok(None)` for unknown ids; `update_*` and `delete_*` return whether a
/// record was affected.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn insert_vm(&self, vm: &VmRecord) -> RegistryResult<()>;
    async fn get_vm(&self, id: Uuid) -> RegistryResult<Option<VmRecord>>;
    /// All VMs, newest first.
    async fn list_vms(&self) -> RegistryResult<Vec<VmRecord>>;
    async fn update_vm(&self, vm: &VmRecord) -> RegistryResult<bool>;
    async fn delete_vm(&self, id: Uuid) -> RegistryResult<bool>;

    /// Insert the (vm, path) edge. Returns `false` if it already existed.
    async fn attach_disk(&self, vm_id: Uuid, disk_path: &str) -> RegistryResult<bool>;
    async fn detach_disk(&self, vm_id: Uuid, disk_path: &str) -> RegistryResult<bool>;
    /// Disk paths attached to a VM, in attachment order.
    async fn vm_disks(&self, vm_id: Uuid) -> RegistryResult<Vec<String>>;
    async fn delete_vm_disks(&self, vm_id: Uuid) -> RegistryResult<()>;
    async fn list_attachments(&self) -> RegistryResult<Vec<Attachment>>;

    async fn insert_disk(&self, disk: &DiskImage) -> RegistryResult<()>;
    async fn get_disk(&self, id: Uuid) -> RegistryResult<Option<DiskImage>>;
    async fn list_disks(&self) -> RegistryResult<Vec<DiskImage>>;
    async fn update_disk(&self, disk: &DiskImage) -> RegistryResult<bool>;
    async fn delete_disk(&self, id: Uuid) -> RegistryResult<bool>;

    async fn insert_iso(&self, iso: &IsoImage) -> RegistryResult<()>;
    async fn get_iso(&self, id: Uuid) -> RegistryResult<Option<IsoImage>>;
    async fn get_iso_by_path(&self, path: &Path) -> RegistryResult<Option<IsoImage>>;
    async fn list_isos(&self) -> RegistryResult<Vec<IsoImage>>;
    async fn delete_iso(&self, id: Uuid) -> RegistryResult<bool>;
}
