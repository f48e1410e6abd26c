//! Mount table.
//!
//! Maps namespace path prefixes to under storage locations. The root mount
//! always exists with [`ROOT_MOUNT_ID`] and is created from configuration
//! at startup; every other mount is journaled.

use crate::error::{CanopyError, Result};
use crate::journal::{JournalContext, JournalEntry};
use crate::path::{join_ufs_path, NamespacePath};
use crate::types::{MountId, ROOT_MOUNT_ID};
use crate::ufs::{StorageAdapter, UfsManager};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Options of a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Reject namespace writes below the mount.
    pub read_only: bool,
    /// Visible to every user.
    pub shared: bool,
    /// Adapter-specific properties.
    pub properties: BTreeMap<String, String>,
}

/// A mount table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    /// Namespace path of the mount point.
    pub path: String,
    /// Under storage URI the mount point maps to.
    pub ufs_uri: String,
    pub mount_id: MountId,
    pub options: MountOptions,
}

/// Where a namespace path lives in under storage.
#[derive(Clone)]
pub struct Resolution {
    pub mount_id: MountId,
    /// Namespace path of the covering mount point.
    pub mount_path: NamespacePath,
    /// Full under storage path.
    pub ufs_path: String,
    /// Under storage URI of the mount point.
    pub mount_ufs_uri: String,
    pub read_only: bool,
    pub shared: bool,
    pub ufs: Arc<dyn StorageAdapter>,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("mount_id", &self.mount_id)
            .field("mount_path", &self.mount_path)
            .field("ufs_path", &self.ufs_path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// The set of mounts, keyed by namespace path.
pub struct MountTable {
    mounts: RwLock<BTreeMap<NamespacePath, MountInfo>>,
    ufs_manager: Arc<UfsManager>,
}

impl MountTable {
    /// Create a table holding only the root mount.
    pub fn new(ufs_manager: Arc<UfsManager>, root_ufs_uri: &str, root_options: MountOptions) -> Result<Self> {
        ufs_manager.add_mount(ROOT_MOUNT_ID, root_ufs_uri, &root_options)?;
        let mut mounts = BTreeMap::new();
        mounts.insert(
            NamespacePath::root(),
            MountInfo {
                path: NamespacePath::root().to_string(),
                ufs_uri: root_ufs_uri.to_string(),
                mount_id: ROOT_MOUNT_ID,
                options: root_options,
            },
        );
        info!(ufs = root_ufs_uri, "Initialized root mount");
        Ok(Self {
            mounts: RwLock::new(mounts),
            ufs_manager,
        })
    }

    pub fn ufs_manager(&self) -> &Arc<UfsManager> {
        &self.ufs_manager
    }

    /// Draw an unused mount id.
    pub fn new_mount_id(&self) -> MountId {
        let used: HashSet<MountId> = self.mounts.read().values().map(|m| m.mount_id).collect();
        let mut rng = rand::thread_rng();
        loop {
            let id: MountId = rng.gen_range(2..i64::MAX as u64);
            if !used.contains(&id) {
                return id;
            }
        }
    }

    fn covering_mount(mounts: &BTreeMap<NamespacePath, MountInfo>, path: &NamespacePath) -> Option<(NamespacePath, MountInfo)> {
        mounts
            .iter()
            .filter(|(mount_path, _)| mount_path.is_prefix_of(path))
            .max_by_key(|(mount_path, _)| mount_path.depth())
            .map(|(p, m)| (p.clone(), m.clone()))
    }

    /// Resolve a namespace path to its under storage location.
    pub fn resolve(&self, path: &NamespacePath) -> Result<Resolution> {
        let (mount_path, info) = Self::covering_mount(&self.mounts.read(), path)
            .ok_or_else(|| CanopyError::MountNotFound(path.to_string()))?;
        let relative = path.strip_prefix(&mount_path).unwrap_or("");
        let ufs = self.ufs_manager.get(info.mount_id)?;
        Ok(Resolution {
            mount_id: info.mount_id,
            mount_path,
            ufs_path: join_ufs_path(&info.ufs_uri, relative),
            mount_ufs_uri: info.ufs_uri,
            read_only: info.options.read_only,
            shared: info.options.shared,
            ufs,
        })
    }

    /// Path of the mount point covering `path`.
    pub fn get_mount_point(&self, path: &NamespacePath) -> Option<NamespacePath> {
        Self::covering_mount(&self.mounts.read(), path).map(|(p, _)| p)
    }

    pub fn is_mount_point(&self, path: &NamespacePath) -> bool {
        self.mounts.read().contains_key(path)
    }

    /// Mounts at or below `path`, excluding the root mount.
    pub fn mounts_under(&self, path: &NamespacePath) -> Vec<MountInfo> {
        self.mounts
            .read()
            .iter()
            .filter(|(p, _)| !p.is_root() && path.is_prefix_of(p))
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn mount_info(&self, path: &NamespacePath) -> Option<MountInfo> {
        self.mounts.read().get(path).cloned()
    }

    pub fn mount_info_by_id(&self, mount_id: MountId) -> Option<MountInfo> {
        self.mounts
            .read()
            .values()
            .find(|m| m.mount_id == mount_id)
            .cloned()
    }

    /// Every mount, sorted by path.
    pub fn mount_points(&self) -> Vec<MountInfo> {
        self.mounts.read().values().cloned().collect()
    }

    /// Fail with access denied when `path` is below a read-only mount.
    pub fn check_under_writable_mount(&self, path: &NamespacePath) -> Result<()> {
        if let Some((mount_path, info)) = Self::covering_mount(&self.mounts.read(), path) {
            if info.options.read_only {
                return Err(CanopyError::AccessDenied(format!(
                    "A write operation on {} under a readonly mount point {} is not allowed",
                    path, mount_path
                )));
            }
        }
        Ok(())
    }

    /// Add a mount and journal it.
    pub fn add(&self, ctx: &mut JournalContext, info: MountInfo) -> Result<()> {
        let path = NamespacePath::new(&info.path)?;
        {
            let mounts = self.mounts.read();
            if mounts.contains_key(&path) {
                return Err(CanopyError::AlreadyExists(format!(
                    "Mount point {} already exists",
                    path
                )));
            }
            for existing in mounts.values() {
                if existing.mount_id == ROOT_MOUNT_ID {
                    continue;
                }
                if ufs_prefix(&existing.ufs_uri, &info.ufs_uri) || ufs_prefix(&info.ufs_uri, &existing.ufs_uri) {
                    return Err(CanopyError::InvalidPath(format!(
                        "Mount point {} overlaps with the under storage {} of mount point {}",
                        info.ufs_uri, existing.ufs_uri, existing.path
                    )));
                }
            }
        }
        self.apply_add(&info)?;
        ctx.append(JournalEntry::AddMountPoint { info });
        Ok(())
    }

    /// Remove a mount and journal it.
    pub fn delete(&self, ctx: &mut JournalContext, path: &NamespacePath) -> Result<MountInfo> {
        if path.is_root() {
            return Err(CanopyError::InvalidPath("Cannot unmount the root mount point".to_string()));
        }
        let info = self
            .mount_info(path)
            .ok_or_else(|| CanopyError::MountNotFound(path.to_string()))?;
        if self.mounts_under(path).len() > 1 {
            return Err(CanopyError::InvalidPath(format!(
                "Cannot unmount {} because it contains nested mount points",
                path
            )));
        }
        self.apply_delete(path);
        ctx.append(JournalEntry::DeleteMountPoint {
            path: path.to_string(),
        });
        Ok(info)
    }

    /// Replace the options of a mount and journal it.
    pub fn update(&self, ctx: &mut JournalContext, path: &NamespacePath, options: MountOptions) -> Result<()> {
        if !self.is_mount_point(path) {
            return Err(CanopyError::MountNotFound(path.to_string()));
        }
        self.apply_update(path, options.clone());
        ctx.append(JournalEntry::UpdateMountPoint {
            path: path.to_string(),
            options,
        });
        Ok(())
    }

    /// Apply a replayed mount entry; other entries are ignored.
    pub fn apply(&self, entry: &JournalEntry) -> Result<()> {
        match entry {
            JournalEntry::AddMountPoint { info } => self.apply_add(info),
            JournalEntry::DeleteMountPoint { path } => {
                self.apply_delete(&NamespacePath::new(path)?);
                Ok(())
            }
            JournalEntry::UpdateMountPoint { path, options } => {
                self.apply_update(&NamespacePath::new(path)?, options.clone());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn apply_add(&self, info: &MountInfo) -> Result<()> {
        let path = NamespacePath::new(&info.path)?;
        self.ufs_manager.add_mount(info.mount_id, &info.ufs_uri, &info.options)?;
        self.mounts.write().insert(path, info.clone());
        info!(path = %info.path, ufs = %info.ufs_uri, mount_id = info.mount_id, "Added mount point");
        Ok(())
    }

    fn apply_delete(&self, path: &NamespacePath) {
        if let Some(info) = self.mounts.write().remove(path) {
            self.ufs_manager.remove_mount(info.mount_id);
            info!(path = %path, mount_id = info.mount_id, "Removed mount point");
        }
    }

    fn apply_update(&self, path: &NamespacePath, options: MountOptions) {
        if let Some(info) = self.mounts.write().get_mut(path) {
            info.options = options;
            debug!(path = %path, "Updated mount options");
        }
    }
}

/// Whether UFS URI `a` equals `b` or is a directory prefix of it.
fn ufs_prefix(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('/');
    let b = b.trim_end_matches('/');
    a == b || (b.starts_with(a) && b.as_bytes().get(a.len()) == Some(&b'/'))
}
