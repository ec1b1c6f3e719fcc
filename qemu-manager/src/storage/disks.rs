use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{VmError, VmResult};
use crate::registry::{DiskFormat, DiskImage, DiskStatus, Registry};

const GIB: u64 = 1024 * 1024 * 1024;

/// External disk image tool. Only its exit status and JSON output are used.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Create an image of `size_gb` gigabytes at `path`.
    async fn create(&self, path: &Path, format: DiskFormat, size_gb: u64) -> VmResult<()>;

    /// Image details as reported by the tool.
    async fn info(&self, path: &Path) -> VmResult<serde_json::Value>;
}

/// [`ImageTool`] backed by the `qemu-img` binary.
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `qemu-img` and return its stdout.
    async fn run(&self, args: &[&str]) -> VmResult<Vec<u8>> {
        debug!(binary = %self.binary.display(), args = ?args, "running qemu-img");

        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                VmError::ImageToolFailure(format!("cannot execute {}: {}", self.binary.display(), e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VmError::ImageToolFailure(format!(
                "{} exited with {}: {}",
                args.first().unwrap_or(&""),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ImageTool for QemuImg {
    async fn create(&self, path: &Path, format: DiskFormat, size_gb: u64) -> VmResult<()> {
        let path = path.to_string_lossy();
        let size = format!("{}G", size_gb);
        self.run(&["create", "-f", format.as_str(), &path, &size])
            .await
            .map(|_| ())
    }

    async fn info(&self, path: &Path) -> VmResult<serde_json::Value> {
        let path = path.to_string_lossy();
        let stdout = self.run(&["info", &path, "--output=json"]).await?;
        serde_json::from_slice(&stdout)
            .map_err(|e| VmError::ImageToolFailure(format!("unparseable info output: {}", e)))
    }
}

/// Parameters for creating a disk image.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiskParams {
    pub name: String,
    #[serde(alias = "size")]
    pub size_gb: Option<u64>,
    pub format: Option<String>,
}

/// A disk record with the image tool's view of the file.
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    #[serde(flatten)]
    pub disk: DiskImage,
    /// `None` when the tool could not inspect the file.
    pub details: Option<serde_json::Value>,
}

/// Catalog of disk image files under one directory.
pub struct DiskCatalog {
    registry: Arc<dyn Registry>,
    tool: Arc<dyn ImageTool>,
    dir: PathBuf,
    default_size_gb: u64,
}

impl DiskCatalog {
    pub fn new(
        registry: Arc<dyn Registry>,
        tool: Arc<dyn ImageTool>,
        dir: PathBuf,
        default_size_gb: u64,
    ) -> Self {
        Self {
            registry,
            tool,
            dir,
            default_size_gb,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new image with the image tool.
    ///
    /// The record is inserted as `creating` and ends as `ready`, or as `error`
    /// when the tool fails.
    #[instrument(skip(self, params), fields(name = %params.name))]
    pub async fn create(&self, params: CreateDiskParams) -> VmResult<DiskImage> {
        let name = validate_file_name(&params.name)?;
        let format: DiskFormat = match params.format.as_deref() {
            Some(f) => f.to_ascii_lowercase().parse().map_err(VmError::InvalidArgument)?,
            None => DiskFormat::Qcow2,
        };
        let size_gb = params.size_gb.unwrap_or(self.default_size_gb);
        if size_gb == 0 {
            return Err(VmError::InvalidArgument("size must be at least 1 GB".into()));
        }

        let path = self.dir.join(format!("{}.{}", name, format));
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(VmError::DuplicateName {
                field: "path",
                value: path.display().to_string(),
            });
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating disk directory {}", self.dir.display()))?;

        let mut disk = DiskImage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path,
            size_gb,
            format,
            status: DiskStatus::Creating,
            created_at: Utc::now(),
        };
        self.registry.insert_disk(&disk).await?;

        let result = self.tool.create(&disk.path, format, size_gb).await;
        disk.status = if result.is_ok() {
            DiskStatus::Ready
        } else {
            DiskStatus::Error
        };
        self.registry.update_disk(&disk).await?;

        match result {
            Ok(()) => {
                info!(disk_id = %disk.id, path = %disk.path.display(), size_gb, %format, "disk image created");
                Ok(disk)
            }
            Err(e) => {
                warn!(disk_id = %disk.id, error = %e, "disk image creation failed");
                Err(e)
            }
        }
    }

    /// Register a file that was written into place by an upload.
    #[instrument(skip(self))]
    pub async fn register_upload(&self, name: &str, path: &Path) -> VmResult<DiskImage> {
        let name = validate_file_name(name)?;
        let format = DiskFormat::from_path(path).ok_or_else(|| {
            VmError::InvalidArgument(format!(
                "{}: unsupported disk format (expected .qcow2, .raw, .vmdk or .vdi)",
                path.display()
            ))
        })?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| VmError::InvalidArgument(format!("{}: {}", path.display(), e)))?;

        let disk = DiskImage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: path.to_path_buf(),
            size_gb: meta.len().div_ceil(GIB),
            format,
            status: DiskStatus::Ready,
            created_at: Utc::now(),
        };
        self.registry.insert_disk(&disk).await?;
        info!(disk_id = %disk.id, path = %path.display(), "disk image registered");
        Ok(disk)
    }

    pub async fn list(&self) -> VmResult<Vec<DiskImage>> {
        Ok(self.registry.list_disks().await?)
    }

    pub async fn get(&self, id: Uuid) -> VmResult<DiskImage> {
        self.registry
            .get_disk(id)
            .await?
            .ok_or_else(|| VmError::disk_not_found(id))
    }

    /// Record plus `qemu-img info` output. Tool failures only drop the details.
    pub async fn info(&self, id: Uuid) -> VmResult<DiskInfo> {
        let disk = self.get(id).await?;
        let details = match self.tool.info(&disk.path).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(disk_id = %id, error = %e, "image info unavailable");
                None
            }
        };
        Ok(DiskInfo { disk, details })
    }

    /// Remove the record and its file if present.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> VmResult<()> {
        let disk = self.get(id).await?;

        let path_str = disk.path.to_string_lossy();
        let users: Vec<Uuid> = self
            .registry
            .list_attachments()
            .await?
            .into_iter()
            .filter(|a| a.disk_path == path_str)
            .map(|a| a.vm_id)
            .collect();
        if !users.is_empty() {
            warn!(disk_id = %id, vms = ?users, "deleting a disk that is still attached");
        }

        match tokio::fs::remove_file(&disk.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %disk.path.display(), "disk file already gone");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("removing disk file {}", disk.path.display()))
                    .into())
            }
        }

        self.registry.delete_disk(id).await?;
        info!(disk_id = %id, name = %disk.name, "disk image deleted");
        Ok(())
    }

    /// Register image files in the directory that have no record yet.
    pub async fn scan(&self) -> VmResult<usize> {
        let known: Vec<PathBuf> = self
            .registry
            .list_disks()
            .await?
            .into_iter()
            .map(|d| d.path)
            .collect();

        let mut registered = 0;
        for path in list_files(&self.dir).await? {
            if DiskFormat::from_path(&path).is_none() || known.contains(&path) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.register_upload(name, &path).await {
                Ok(_) => registered += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping disk image during scan"),
            }
        }
        if registered > 0 {
            info!(dir = %self.dir.display(), registered, "registered disk images found on disk");
        }
        Ok(registered)
    }
}

/// Regular files directly under `dir`, sorted. A missing directory is empty.
pub(crate) async fn list_files(dir: &Path) -> VmResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("reading directory {}", dir.display()))
                .into())
        }
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading directory {}", dir.display()))?
    {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Accept names that are safe as a single path component.
pub(crate) fn validate_file_name(name: &str) -> VmResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(VmError::InvalidArgument("name must not be empty".into()));
    }
    if name.len() > 128 {
        return Err(VmError::InvalidArgument("name must be at most 128 characters".into()));
    }
    if name.starts_with('.') {
        return Err(VmError::InvalidArgument("name must not start with '.'".into()));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(VmError::InvalidArgument(format!(
            "name contains invalid character '{}'",
            c
        )));
    }
    Ok(name)
}
