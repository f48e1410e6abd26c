//! Under file system (UFS) adapters.
//!
//! Every mount is backed by a [`StorageAdapter`]. The namespace master only
//! talks to under storage through this trait; adapters receive full UFS
//! paths (the mount's UFS URI joined with the path below the mount point).
//!
//! Two adapters ship with the crate:
//!
//! - [`MemoryUfs`]: in-memory store, either hierarchical or object-store
//!   flavoured, with failure injection for tests.
//! - [`LocalUfs`]: a directory tree on local disk.

mod absent;
mod local;
mod memory;

pub use absent::AbsentPathCache;
pub use local::LocalUfs;
pub use memory::{MemoryUfs, UfsOperation};

use crate::acl::AclEntry;
use crate::error::{CanopyError, Result};
use crate::mount::MountOptions;
use crate::types::{Mode, MountId};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// URI scheme of the hierarchical in-memory adapter.
pub const MEMORY_SCHEME: &str = "mem://";

/// URI scheme of the object-store flavoured in-memory adapter.
pub const OBJECT_SCHEME: &str = "obj://";

/// Status of a UFS path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfsStatus {
    pub name: String,
    pub is_directory: bool,
    pub length: u64,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub last_modified_ms: i64,
    /// Content hash of files, if the adapter tracks one.
    pub content_hash: Option<String>,
}

impl UfsStatus {
    /// Fingerprint describing the metadata and content of the path.
    pub fn fingerprint(&self) -> String {
        let kind = if self.is_directory { "DIRECTORY" } else { "FILE" };
        format!(
            "TYPE:{} OWNER:{} GROUP:{} MODE:{} CONTENT_HASH:{}",
            kind,
            self.owner,
            self.group,
            self.mode.bits(),
            self.content_hash.as_deref().unwrap_or("_"),
        )
    }
}

/// Options for [`StorageAdapter::mkdirs`].
#[derive(Debug, Clone)]
pub struct MkdirsOptions {
    /// Create missing parents as well.
    pub create_parent: bool,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
}

impl Default for MkdirsOptions {
    fn default() -> Self {
        Self {
            create_parent: true,
            owner: String::new(),
            group: String::new(),
            mode: Mode::DIRECTORY_DEFAULT,
        }
    }
}

/// Space figure reported by [`StorageAdapter::get_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    Total,
    Free,
    Used,
}

/// Access to one under storage system.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Scheme name used in logs.
    fn scheme(&self) -> &str;

    /// Whether the store is an object store (no real directories, no
    /// ownership).
    fn is_object_storage(&self) -> bool;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn get_status(&self, path: &str) -> Result<UfsStatus>;

    /// Direct children of a directory, `None` if the path is not a directory.
    async fn list_status(&self, path: &str) -> Result<Option<Vec<UfsStatus>>>;

    async fn is_directory(&self, path: &str) -> Result<bool>;

    async fn is_file(&self, path: &str) -> Result<bool>;

    /// Create or truncate a file of `length` bytes. Used by persist
    /// workers; the namespace master never writes file content.
    async fn create_file(&self, path: &str, length: u64) -> Result<()>;

    /// Delete a file; `false` if it did not exist.
    async fn delete_file(&self, path: &str) -> Result<bool>;

    /// Delete a directory; `false` if it did not exist or is non-empty and
    /// `recursive` is not set.
    async fn delete_directory(&self, path: &str, recursive: bool) -> Result<bool>;

    /// Rename a file; `false` if the source is missing or the destination
    /// parent does not exist.
    async fn rename_file(&self, src: &str, dst: &str) -> Result<bool>;

    /// Rename a directory.
    async fn rename_directory(&self, src: &str, dst: &str) -> Result<bool>;

    /// Rename a file that was written by the persistence pipeline.
    async fn rename_renamable_file(&self, src: &str, dst: &str) -> Result<bool> {
        self.rename_file(src, dst).await
    }

    /// Create a directory; `false` if it already exists.
    async fn mkdirs(&self, path: &str, options: &MkdirsOptions) -> Result<bool>;

    async fn set_owner(&self, path: &str, owner: &str, group: &str) -> Result<()>;

    async fn set_mode(&self, path: &str, mode: Mode) -> Result<()>;

    async fn set_acl_entries(&self, path: &str, entries: &[AclEntry]) -> Result<()>;

    async fn get_space(&self, path: &str, space: SpaceType) -> Result<u64>;

    /// Fingerprint of the path, empty if it does not exist.
    async fn fingerprint(&self, path: &str) -> Result<String> {
        match self.get_status(path).await {
            Ok(status) => Ok(status.fingerprint()),
            Err(e) if e.is_not_found() => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

/// Builds adapters for mount URIs.
pub trait UfsFactory: Send + Sync {
    fn create(&self, uri: &str, options: &MountOptions) -> Result<Arc<dyn StorageAdapter>>;
}

/// Factory mapping `mem://` and `obj://` URIs to shared in-memory stores
/// and absolute paths (or `file://` URIs) to local disk.
pub struct DefaultUfsFactory {
    memory: Arc<MemoryUfs>,
    object: Arc<MemoryUfs>,
}

impl DefaultUfsFactory {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(MemoryUfs::new()),
            object: Arc::new(MemoryUfs::object_store()),
        }
    }

    /// The store behind `mem://` URIs.
    pub fn memory(&self) -> Arc<MemoryUfs> {
        self.memory.clone()
    }

    /// The store behind `obj://` URIs.
    pub fn object(&self) -> Arc<MemoryUfs> {
        self.object.clone()
    }
}

impl Default for DefaultUfsFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl UfsFactory for DefaultUfsFactory {
    fn create(&self, uri: &str, _options: &MountOptions) -> Result<Arc<dyn StorageAdapter>> {
        if uri.starts_with(MEMORY_SCHEME) {
            Ok(self.memory.clone())
        } else if uri.starts_with(OBJECT_SCHEME) {
            Ok(self.object.clone())
        } else if uri.starts_with("file://") || uri.starts_with('/') {
            Ok(Arc::new(LocalUfs::new()))
        } else {
            Err(CanopyError::InvalidArgument(format!(
                "No under storage adapter for {}",
                uri
            )))
        }
    }
}

/// Adapters of the active mounts, keyed by mount id.
pub struct UfsManager {
    factory: Arc<dyn UfsFactory>,
    clients: RwLock<HashMap<MountId, Arc<dyn StorageAdapter>>>,
}

impl UfsManager {
    pub fn new(factory: Arc<dyn UfsFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Build and register the adapter of a mount.
    pub fn add_mount(
        &self,
        mount_id: MountId,
        uri: &str,
        options: &MountOptions,
    ) -> Result<Arc<dyn StorageAdapter>> {
        let ufs = self.factory.create(uri, options)?;
        self.clients.write().insert(mount_id, ufs.clone());
        info!(mount_id, uri, "Registered under storage client");
        Ok(ufs)
    }

    pub fn remove_mount(&self, mount_id: MountId) {
        if self.clients.write().remove(&mount_id).is_some() {
            debug!(mount_id, "Removed under storage client");
        }
    }

    pub fn get(&self, mount_id: MountId) -> Result<Arc<dyn StorageAdapter>> {
        self.clients
            .read()
            .get(&mount_id)
            .cloned()
            .ok_or_else(|| CanopyError::MountNotFound(format!("mount id {}", mount_id)))
    }
}
