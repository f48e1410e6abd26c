//! Inode model.
//!
//! An [`Inode`] carries the attributes shared by files and directories and a
//! tagged [`InodeKind`] with the variant-specific part.

use crate::acl::{DefaultAcl, ExtendedAcl};
use crate::error::{CanopyError, Result};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A namespace node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    pub parent_id: InodeId,
    pub name: String,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub acl: ExtendedAcl,
    pub persistence_state: PersistenceState,
    pub pinned: bool,
    pub ttl: i64,
    pub ttl_action: TtlAction,
    pub creation_time_ms: i64,
    pub last_modification_time_ms: i64,
    pub last_access_time_ms: i64,
    pub xattr: HashMap<String, Vec<u8>>,
    pub ufs_fingerprint: String,
    pub kind: InodeKind,
}

/// Variant-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InodeKind {
    File(FileAttributes),
    Directory(DirectoryAttributes),
}

/// Attributes of a file inode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Block ids in file order.
    pub block_ids: Vec<BlockId>,
    /// Block size in bytes.
    pub block_size_bytes: u64,
    /// Length in bytes, [`LENGTH_UNKNOWN`] until completed.
    pub length: i64,
    /// Whether the file has been completed.
    pub completed: bool,
    /// Container the block ids are drawn from.
    pub block_container_id: ContainerId,
    /// Temporary under storage path of an in-flight persist job.
    pub temp_ufs_path: Option<String>,
    /// Id of the in-flight persist job, [`INVALID_JOB_ID`] if none.
    pub persist_job_id: JobId,
}

/// Attributes of a directory inode.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DirectoryAttributes {
    /// Children keyed by name.
    pub children: BTreeMap<String, InodeId>,
    /// Whether this directory is a mount point.
    pub mount_point: bool,
    /// Whether the direct children were loaded from under storage.
    pub direct_children_loaded: bool,
    /// Default ACL inherited by new children.
    pub default_acl: DefaultAcl,
}

/// Fields needed to create a new inode.
#[derive(Debug, Clone)]
pub struct NewInode {
    pub name: String,
    pub parent_id: InodeId,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub persistence_state: PersistenceState,
    pub ttl: i64,
    pub ttl_action: TtlAction,
    pub xattr: HashMap<String, Vec<u8>>,
    pub time_ms: i64,
}

impl Inode {
    fn from_new(id: InodeId, new: NewInode, kind: InodeKind) -> Self {
        Self {
            id,
            parent_id: new.parent_id,
            name: new.name,
            owner: new.owner,
            group: new.group,
            mode: new.mode,
            acl: ExtendedAcl::default(),
            persistence_state: new.persistence_state,
            pinned: false,
            ttl: new.ttl,
            ttl_action: new.ttl_action,
            creation_time_ms: new.time_ms,
            last_modification_time_ms: new.time_ms,
            last_access_time_ms: new.time_ms,
            xattr: new.xattr,
            ufs_fingerprint: INVALID_UFS_FINGERPRINT.to_string(),
            kind,
        }
    }

    /// Create a new directory inode.
    pub fn new_directory(id: InodeId, new: NewInode) -> Self {
        Self::from_new(id, new, InodeKind::Directory(DirectoryAttributes::default()))
    }

    /// Create a new, incomplete file inode.
    pub fn new_file(id: InodeId, new: NewInode, block_size_bytes: u64, container: ContainerId) -> Self {
        Self::from_new(
            id,
            new,
            InodeKind::File(FileAttributes {
                block_ids: Vec::new(),
                block_size_bytes,
                length: LENGTH_UNKNOWN,
                completed: false,
                block_container_id: container,
                temp_ufs_path: None,
                persist_job_id: INVALID_JOB_ID,
            }),
        )
    }

    /// Create the root directory.
    pub fn root(owner: &str, group: &str, mode: Mode) -> Self {
        let now = now_ms();
        let mut root = Self::new_directory(
            ROOT_INODE_ID,
            NewInode {
                name: String::new(),
                parent_id: ROOT_INODE_ID,
                owner: owner.to_string(),
                group: group.to_string(),
                mode,
                persistence_state: PersistenceState::Persisted,
                ttl: NO_TTL,
                ttl_action: TtlAction::Delete,
                xattr: HashMap::new(),
                time_ms: now,
            },
        );
        if let InodeKind::Directory(dir) = &mut root.kind {
            dir.mount_point = true;
        }
        root
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, InodeKind::File(_))
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub fn is_persisted(&self) -> bool {
        self.persistence_state == PersistenceState::Persisted
    }

    /// Whether this directory is a mount point.
    pub fn is_mount_point(&self) -> bool {
        match &self.kind {
            InodeKind::Directory(dir) => dir.mount_point,
            InodeKind::File(_) => false,
        }
    }

    /// File attributes, or an error naming `path` if this is a directory.
    pub fn as_file(&self, path: &str) -> Result<&FileAttributes> {
        match &self.kind {
            InodeKind::File(file) => Ok(file),
            InodeKind::Directory(_) => Err(CanopyError::NotAFile(path.to_string())),
        }
    }

    /// Directory attributes, or an error naming `path` if this is a file.
    pub fn as_directory(&self, path: &str) -> Result<&DirectoryAttributes> {
        match &self.kind {
            InodeKind::Directory(dir) => Ok(dir),
            InodeKind::File(_) => Err(CanopyError::NotADirectory(path.to_string())),
        }
    }

    /// Number of direct children; zero for files.
    pub fn child_count(&self) -> usize {
        match &self.kind {
            InodeKind::Directory(dir) => dir.children.len(),
            InodeKind::File(_) => 0,
        }
    }

    /// Whether the file is completed; directories count as complete.
    pub fn is_completed(&self) -> bool {
        match &self.kind {
            InodeKind::File(file) => file.completed,
            InodeKind::Directory(_) => true,
        }
    }

    /// Block ids of a file; empty for directories.
    pub fn block_ids(&self) -> &[BlockId] {
        match &self.kind {
            InodeKind::File(file) => &file.block_ids,
            InodeKind::Directory(_) => &[],
        }
    }

    /// Length of a file; zero for directories.
    pub fn length(&self) -> i64 {
        match &self.kind {
            InodeKind::File(file) => file.length,
            InodeKind::Directory(_) => 0,
        }
    }
}

/// Externally visible description of an inode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: InodeId,
    pub path: String,
    pub name: String,
    pub is_directory: bool,
    pub owner: String,
    pub group: String,
    pub mode: Mode,
    pub length: i64,
    pub block_size_bytes: u64,
    pub block_ids: Vec<BlockId>,
    pub completed: bool,
    pub persistence_state: PersistenceState,
    pub pinned: bool,
    pub ttl: i64,
    pub ttl_action: TtlAction,
    pub mount_point: bool,
    pub mount_id: MountId,
    pub ufs_path: String,
    pub ufs_fingerprint: String,
    pub creation_time_ms: i64,
    pub last_modification_time_ms: i64,
    pub xattr: HashMap<String, Vec<u8>>,
}

impl FileInfo {
    /// Build from an inode and its resolved location.
    pub fn from_inode(inode: &Inode, path: &str, mount_id: MountId, ufs_path: String) -> Self {
        let (length, block_size_bytes, block_ids, completed) = match &inode.kind {
            InodeKind::File(file) => (
                file.length,
                file.block_size_bytes,
                file.block_ids.clone(),
                file.completed,
            ),
            InodeKind::Directory(_) => (0, 0, Vec::new(), true),
        };
        Self {
            id: inode.id,
            path: path.to_string(),
            name: inode.name.clone(),
            is_directory: inode.is_directory(),
            owner: inode.owner.clone(),
            group: inode.group.clone(),
            mode: inode.mode,
            length,
            block_size_bytes,
            block_ids,
            completed,
            persistence_state: inode.persistence_state,
            pinned: inode.pinned,
            ttl: inode.ttl,
            ttl_action: inode.ttl_action,
            mount_point: inode.is_mount_point(),
            mount_id,
            ufs_path,
            ufs_fingerprint: inode.ufs_fingerprint.clone(),
            creation_time_ms: inode.creation_time_ms,
            last_modification_time_ms: inode.last_modification_time_ms,
            xattr: inode.xattr.clone(),
        }
    }
}
