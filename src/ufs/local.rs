//! Local disk under storage.

use super::{MkdirsOptions, SpaceType, StorageAdapter, UfsStatus};
use crate::acl::AclEntry;
use crate::error::{CanopyError, Result};
use crate::types::Mode;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Under storage over a local directory tree.
///
/// Ownership changes are recorded in logs only; the process usually lacks
/// the privilege to chown.
#[derive(Debug, Default)]
pub struct LocalUfs;

impl LocalUfs {
    pub fn new() -> Self {
        Self
    }
}

fn local_path(path: &str) -> PathBuf {
    PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
}

fn map_io(path: &Path, e: std::io::Error) -> CanopyError {
    if e.kind() == ErrorKind::NotFound {
        CanopyError::NotFound(path.display().to_string())
    } else {
        CanopyError::Ufs(format!("{}: {}", path.display(), e))
    }
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> Mode {
    use std::os::unix::fs::PermissionsExt;
    Mode::new((metadata.permissions().mode() & 0o777) as u16)
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> Mode {
    if metadata.is_dir() {
        Mode::DIRECTORY_DEFAULT
    } else {
        Mode::FILE_DEFAULT
    }
}

async fn parent_exists(path: &Path) -> bool {
    match path.parent() {
        Some(parent) => fs::metadata(parent).await.map(|m| m.is_dir()).unwrap_or(false),
        None => true,
    }
}

#[async_trait]
impl StorageAdapter for LocalUfs {
    fn scheme(&self) -> &str {
        "file"
    }

    fn is_object_storage(&self) -> bool {
        false
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(local_path(path)).await.is_ok())
    }

    async fn get_status(&self, path: &str) -> Result<UfsStatus> {
        let local = local_path(path);
        let metadata = fs::metadata(&local).await.map_err(|e| map_io(&local, e))?;
        let last_modified_ms = metadata
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Ok(UfsStatus {
            name: local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            is_directory: metadata.is_dir(),
            length: if metadata.is_dir() { 0 } else { metadata.len() },
            owner: String::new(),
            group: String::new(),
            mode: mode_of(&metadata),
            last_modified_ms,
            content_hash: if metadata.is_dir() {
                None
            } else {
                Some(format!("{}-{}", metadata.len(), last_modified_ms))
            },
        })
    }

    async fn list_status(&self, path: &str) -> Result<Option<Vec<UfsStatus>>> {
        let local = local_path(path);
        if !fs::metadata(&local).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Ok(None);
        }
        let mut dir = fs::read_dir(&local).await.map_err(|e| map_io(&local, e))?;
        let mut statuses = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(&local, e))? {
            let child = entry.path();
            statuses.push(self.get_status(&child.to_string_lossy()).await?);
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Some(statuses))
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(local_path(path)).await.map(|m| m.is_dir()).unwrap_or(false))
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(local_path(path)).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn create_file(&self, path: &str, length: u64) -> Result<()> {
        let local = local_path(path);
        let file = fs::File::create(&local).await.map_err(|e| map_io(&local, e))?;
        file.set_len(length).await.map_err(|e| map_io(&local, e))
    }

    async fn delete_file(&self, path: &str) -> Result<bool> {
        let local = local_path(path);
        match fs::remove_file(&local).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(&local, e)),
        }
    }

    async fn delete_directory(&self, path: &str, recursive: bool) -> Result<bool> {
        let local = local_path(path);
        let result = if recursive {
            fs::remove_dir_all(&local).await
        } else {
            fs::remove_dir(&local).await
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if !recursive => {
                debug!(path = %local.display(), error = %e, "Directory not removed");
                Ok(false)
            }
            Err(e) => Err(map_io(&local, e)),
        }
    }

    async fn rename_file(&self, src: &str, dst: &str) -> Result<bool> {
        let (src, dst) = (local_path(src), local_path(dst));
        if !fs::metadata(&src).await.map(|m| m.is_file()).unwrap_or(false)
            || fs::metadata(&dst).await.is_ok()
            || !parent_exists(&dst).await
        {
            return Ok(false);
        }
        fs::rename(&src, &dst).await.map_err(|e| map_io(&src, e))?;
        Ok(true)
    }

    async fn rename_directory(&self, src: &str, dst: &str) -> Result<bool> {
        let (src, dst) = (local_path(src), local_path(dst));
        if !fs::metadata(&src).await.map(|m| m.is_dir()).unwrap_or(false)
            || fs::metadata(&dst).await.is_ok()
            || !parent_exists(&dst).await
        {
            return Ok(false);
        }
        fs::rename(&src, &dst).await.map_err(|e| map_io(&src, e))?;
        Ok(true)
    }

    async fn mkdirs(&self, path: &str, options: &MkdirsOptions) -> Result<bool> {
        let local = local_path(path);
        if fs::metadata(&local).await.is_ok() {
            return Ok(false);
        }
        if !options.create_parent && !parent_exists(&local).await {
            return Ok(false);
        }
        fs::create_dir_all(&local).await.map_err(|e| map_io(&local, e))?;
        self.set_mode(path, options.mode).await?;
        Ok(true)
    }

    async fn set_owner(&self, path: &str, owner: &str, group: &str) -> Result<()> {
        debug!(path, owner, group, "Ignoring ownership change on local storage");
        Ok(())
    }

    #[cfg(unix)]
    async fn set_mode(&self, path: &str, mode: Mode) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let local = local_path(path);
        fs::set_permissions(&local, std::fs::Permissions::from_mode(mode.bits() as u32))
            .await
            .map_err(|e| map_io(&local, e))
    }

    #[cfg(not(unix))]
    async fn set_mode(&self, path: &str, mode: Mode) -> Result<()> {
        debug!(path, mode = %mode, "Ignoring mode change on local storage");
        Ok(())
    }

    async fn set_acl_entries(&self, path: &str, entries: &[AclEntry]) -> Result<()> {
        debug!(path, entries = entries.len(), "Local storage does not keep ACLs");
        Ok(())
    }

    async fn get_space(&self, path: &str, _space: SpaceType) -> Result<u64> {
        Err(CanopyError::Ufs(format!(
            "Space reporting is not supported for {}",
            path
        )))
    }
}
