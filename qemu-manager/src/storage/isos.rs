use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::disks::{list_files, validate_file_name};
use crate::error::{VmError, VmResult};
use crate::registry::{IsoImage, Registry};

/// Catalog of installation media. Records are immutable once registered.
pub struct IsoCatalog {
    registry: Arc<dyn Registry>,
    dir: PathBuf,
}

fn is_iso(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("iso"))
}

impl IsoCatalog {
    pub fn new(registry: Arc<dyn Registry>, dir: PathBuf) -> Self {
        Self { registry, dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register an ISO file that was written into place by an upload.
    #[instrument(skip(self))]
    pub async fn register_upload(&self, name: &str, path: &Path) -> VmResult<IsoImage> {
        let name = validate_file_name(name)?;
        if !is_iso(path) {
            return Err(VmError::InvalidArgument(format!(
                "{}: only .iso files are accepted",
                path.display()
            )));
        }
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| VmError::InvalidArgument(format!("{}: {}", path.display(), e)))?;

        let iso = IsoImage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            uploaded_at: Utc::now(),
        };
        self.registry.insert_iso(&iso).await?;
        info!(iso_id = %iso.id, path = %path.display(), size_bytes = iso.size_bytes, "ISO registered");
        Ok(iso)
    }

    pub async fn list(&self) -> VmResult<Vec<IsoImage>> {
        Ok(self.registry.list_isos().await?)
    }

    pub async fn get(&self, id: Uuid) -> VmResult<IsoImage> {
        self.registry
            .get_iso(id)
            .await?
            .ok_or_else(|| VmError::iso_not_found(id))
    }

    /// Remove the record. A file that cannot be removed is only logged.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> VmResult<()> {
        let iso = self.get(id).await?;
        if let Err(e) = tokio::fs::remove_file(&iso.path).await {
            warn!(path = %iso.path.display(), error = %e, "failed to remove ISO file");
        }
        self.registry.delete_iso(id).await?;
        info!(iso_id = %id, name = %iso.name, "ISO deleted");
        Ok(())
    }

    /// Register `*.iso` files in the directory that have no record yet.
    pub async fn scan(&self) -> VmResult<usize> {
        let mut registered = 0;
        for path in list_files(&self.dir).await? {
            if !is_iso(&path) || self.registry.get_iso_by_path(&path).await?.is_some() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match self.register_upload(name, &path).await {
                Ok(_) => registered += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping ISO during scan"),
            }
        }
        if registered > 0 {
            info!(dir = %self.dir.display(), registered, "registered ISO files found on disk");
        }
        Ok(registered)
    }
}
